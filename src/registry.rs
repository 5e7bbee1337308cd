/// Trusted access point registry.
///
/// Maps each known-good SSID to the one BSSID allowed to advertise it.
/// Loaded once at startup and shared read-only for the life of the process.
/// An SSID that is not in the registry carries no trust assertion: it is
/// neither trusted nor suspicious.
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::RegistryError;
use crate::protocol::{MacAddr, MAX_SSID_LEN};

/// A known-good `(SSID, BSSID)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedAccessPoint {
    pub ssid: String,
    pub bssid: MacAddr,
}

/// Registry file record: `{"SSID": "...", "BSSID": "..."}` per line.
#[derive(Deserialize)]
struct RawRecord {
    #[serde(rename = "SSID")]
    ssid: String,
    #[serde(rename = "BSSID")]
    bssid: String,
}

#[derive(Debug, Default, Clone)]
pub struct TrustedRegistry {
    entries: HashMap<String, MacAddr>,
}

impl TrustedRegistry {
    /// Build from already-parsed entries.
    ///
    /// The first entry for an SSID wins; a conflicting duplicate is logged.
    pub fn from_entries(entries: impl IntoIterator<Item = TrustedAccessPoint>) -> Self {
        let mut registry = Self::default();
        for ap in entries {
            registry.insert(ap);
        }
        registry
    }

    fn insert(&mut self, ap: TrustedAccessPoint) {
        match self.entries.entry(ap.ssid) {
            Entry::Vacant(slot) => {
                slot.insert(ap.bssid);
            }
            Entry::Occupied(slot) => {
                if *slot.get() != ap.bssid {
                    log::warn!(
                        "Registry: '{}' already trusted as {}, ignoring {}",
                        slot.key(),
                        slot.get(),
                        ap.bssid
                    );
                }
            }
        }
    }

    /// Parse line-delimited JSON records. Blank lines are skipped; any other
    /// bad line rejects the whole registry.
    pub fn parse(text: &str) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record_err = |reason: String| RegistryError::Record {
                line: idx + 1,
                reason,
            };
            let raw: RawRecord = serde_json::from_str(line).map_err(|e| record_err(e.to_string()))?;
            if raw.ssid.len() > MAX_SSID_LEN {
                return Err(record_err(format!("SSID '{}' longer than 32 bytes", raw.ssid)));
            }
            let bssid = raw
                .bssid
                .parse()
                .map_err(|_| record_err(format!("invalid BSSID '{}'", raw.bssid)))?;
            registry.insert(TrustedAccessPoint {
                ssid: raw.ssid,
                bssid,
            });
        }
        Ok(registry)
    }

    /// Read and parse a registry file.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let text = fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::parse(&text)?;
        log::info!("Registry loaded: {} trusted networks from {}", registry.len(), path.display());
        Ok(registry)
    }

    /// Trusted BSSID for an SSID, if the SSID is known.
    pub fn lookup(&self, ssid: &str) -> Option<MacAddr> {
        self.entries.get(ssid).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
