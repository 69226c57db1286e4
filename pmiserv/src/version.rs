//! Version information for pmiserv.

use crate::wire::ProtocolVersion;

/// pmiserv version from Cargo.toml
pub const PMISERV_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported at startup.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub pmiserv: &'static str,
    /// Wire protocol revisions the server speaks.
    pub protocols: Vec<ProtocolVersion>,
    /// Hostname the KVS names are derived from, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            pmiserv: PMISERV_VERSION,
            protocols: vec![ProtocolVersion::V1, ProtocolVersion::V2],
            hostname: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hostname(mut self, hostname: String) -> Self {
        self.hostname = Some(hostname);
        self
    }
}
