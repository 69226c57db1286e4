//! Launcher-wide name publishing.
//!
//! Maps a service name to a port string so that independently launched jobs
//! can find each other. Shared by every process group the launcher manages.

use serde::Serialize;

use crate::error::NameError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedName {
    pub service: String,
    pub port: String,
}

/// Published services in publication order.
#[derive(Debug, Default, Serialize)]
pub struct NameService {
    entries: Vec<PublishedName>,
}

impl NameService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&mut self, service: &str, port: &str) -> Result<(), NameError> {
        if self.entries.iter().any(|e| e.service == service) {
            return Err(NameError::AlreadyPublished(service.to_string()));
        }
        self.entries.push(PublishedName {
            service: service.to_string(),
            port: port.to_string(),
        });
        tracing::debug!(service, port, "Published name");
        Ok(())
    }

    pub fn unpublish(&mut self, service: &str) -> Result<(), NameError> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.service == service)
            .ok_or_else(|| NameError::NotFound(service.to_string()))?;
        self.entries.remove(idx);
        tracing::debug!(service, "Unpublished name");
        Ok(())
    }

    pub fn lookup(&self, service: &str) -> Result<&str, NameError> {
        self.entries
            .iter()
            .find(|e| e.service == service)
            .map(|e| e.port.as_str())
            .ok_or_else(|| NameError::NotFound(service.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
