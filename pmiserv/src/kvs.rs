//! Per-job key-value namespace.
//!
//! Pairs are kept in insertion order so the full contents can be replayed to
//! late joiners in publication order. Over-length keys and values are
//! truncated (never rejected) to `KEY_MAX - 1` / `VAL_MAX - 1` bytes.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Serialize;

use crate::error::KvsError;
use crate::group::Pgid;

/// Namespace name buffer size, terminator included.
pub const KVSNAME_MAX: usize = 256;
/// Key buffer size, terminator included.
pub const KEY_MAX: usize = 64;
/// Value buffer size, terminator included.
pub const VAL_MAX: usize = 1024;

/// Hostname share of the namespace name; the rest is the fixed prefix and ids.
const HOSTNAME_MAX: usize = KVSNAME_MAX - 40;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KvsPair {
    pub key: String,
    pub value: String,
}

/// One job's namespace.
#[derive(Debug, Serialize)]
pub struct Kvs {
    name: String,
    pairs: Vec<KvsPair>,
    /// Reject repeated keys instead of appending them.
    strict: bool,
}

impl Kvs {
    /// Create a namespace named `kvs_<pid>_<pgid>_<rand>_<hostname>`.
    ///
    /// The random part is seeded from wall-clock microseconds, so names are
    /// unique by convention only.
    pub fn create(pid: u32, pgid: Pgid, strict: bool) -> Result<Self, KvsError> {
        let hostname = local_hostname()?;
        let rnd = StdRng::seed_from_u64(clock_seed()).gen_range(0..=i32::MAX);
        let name = generate_name(pid, pgid, rnd, &hostname);
        tracing::debug!(kvsname = %name, strict, "Created KVS namespace");
        Ok(Self::with_name(name, strict))
    }

    /// Create a namespace with an explicit name, truncated to `KVSNAME_MAX - 1`.
    pub fn with_name(name: impl Into<String>, strict: bool) -> Self {
        let mut name = name.into();
        truncate_in_place(&mut name, KVSNAME_MAX);
        Self {
            name,
            pairs: Vec::new(),
            strict,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Append a pair. In strict mode a repeated key fails and leaves the
    /// store unchanged.
    pub fn put(&mut self, key: &str, value: &str) -> Result<(), KvsError> {
        let key = truncate(key, KEY_MAX);
        let value = truncate(value, VAL_MAX);

        if self.strict && self.pairs.iter().any(|p| p.key == key) {
            return Err(KvsError::DuplicateKey(key.to_string()));
        }

        self.pairs.try_reserve(1)?;
        self.pairs.push(KvsPair {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    /// Value of the first pair with this key, in insertion order.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = truncate(key, KEY_MAX);
        self.pairs
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs
            .iter()
            .map(|p| (p.key.as_str(), p.value.as_str()))
    }

    /// Pairs appended after the first `count`.
    pub fn pairs_since(&self, count: usize) -> &[KvsPair] {
        self.pairs.get(count..).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Longest prefix of `s` that fits a C buffer of `size` bytes (one byte is the
/// terminator), cut back to a char boundary.
fn truncate(s: &str, size: usize) -> &str {
    let max = size.saturating_sub(1);
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn truncate_in_place(s: &mut String, size: usize) {
    let len = truncate(s, size).len();
    s.truncate(len);
}

fn generate_name(pid: u32, pgid: Pgid, rnd: i32, hostname: &str) -> String {
    let hostname = truncate(hostname, HOSTNAME_MAX);
    let mut name = format!("kvs_{pid}_{pgid}_{rnd}_{hostname}");
    truncate_in_place(&mut name, KVSNAME_MAX);
    name
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Name of this host, as embedded in KVS names.
#[cfg(unix)]
pub fn local_hostname() -> Result<String, KvsError> {
    let name = nix::unistd::gethostname()
        .map_err(|e| KvsError::HostnameUnavailable(e.to_string()))?;
    Ok(name.to_string_lossy().into_owned())
}

/// Name of this host, as embedded in KVS names.
#[cfg(not(unix))]
pub fn local_hostname() -> Result<String, KvsError> {
    std::env::var("COMPUTERNAME")
        .map_err(|e| KvsError::HostnameUnavailable(e.to_string()))
}
