/// Data model shared by the sensor feeds, the incident store and the alert sink.
///
/// Store records are newline-delimited JSON (NDJSON), tagged by `"type"`,
/// in the same spirit as the firmware's device messages. SSIDs keep the
/// firmware's bounded `heapless` representation so untrusted input can never
/// grow past the 802.11 limit.
use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Maximum length for SSID strings (32 bytes + headroom, as on the device)
pub type NameString = heapless::String<33>;

/// Longest SSID an 802.11 network can advertise.
pub const MAX_SSID_LEN: usize = 32;

/// A 6-byte hardware address (BSSID or station MAC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    /// "AA:BB:CC:DD:EE:FF"
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mac = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        )
    }
}

/// Returned when text is not a 6-octet MAC address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidMac;

impl fmt::Display for InvalidMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid MAC address")
    }
}

impl std::error::Error for InvalidMac {}

impl FromStr for MacAddr {
    type Err = InvalidMac;

    /// Accepts `:` or `-` separated octets, any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut bytes = [0u8; 6];
        let mut count = 0;
        for part in s.split(|c| c == ':' || c == '-') {
            if count == 6 || part.len() != 2 {
                return Err(InvalidMac);
            }
            bytes[count] = u8::from_str_radix(part, 16).map_err(|_| InvalidMac)?;
            count += 1;
        }
        if count != 6 {
            return Err(InvalidMac);
        }
        Ok(Self(bytes))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An access point reported by the serial Wi-Fi scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedAccessPoint {
    pub ssid: NameString,
    pub bssid: MacAddr,
    /// dBm; `None` when the sensor sent something that is not a number.
    pub rssi: Option<i8>,
    pub observed_at: DateTime<Utc>,
}

/// A deauthentication attack reported over a BLE advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeauthClaim {
    pub detected_at: DateTime<Utc>,
    pub malicious_mac: MacAddr,
    pub attacked_ssid: NameString,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    EvilTwin,
    DeauthAttack,
}

impl IncidentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentKind::EvilTwin => "evil_twin",
            IncidentKind::DeauthAttack => "deauth_attack",
        }
    }
}

impl fmt::Display for IncidentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic incident key: hex SHA-256 over the kind and the fields that
/// distinguish one incident from another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// `evil_twin|<ssid>|<observed bssid>`
    pub fn evil_twin(ssid: &str, observed_bssid: &MacAddr) -> Self {
        Self::digest(&[
            IncidentKind::EvilTwin.as_str(),
            ssid,
            &observed_bssid.to_string(),
        ])
    }

    /// `deauth_attack|<malicious mac>|<attacked ssid>|<detectedAt>`
    pub fn deauth_attack(malicious_mac: &MacAddr, attacked_ssid: &str, detected_at: &DateTime<Utc>) -> Self {
        Self::digest(&[
            IncidentKind::DeauthAttack.as_str(),
            &malicious_mac.to_string(),
            attacked_ssid,
            &detected_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        ])
    }

    fn digest(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                hasher.update(b"|");
            }
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = InvalidFingerprint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(InvalidFingerprint)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidFingerprint;

impl fmt::Display for InvalidFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("fingerprint must be 64 hex digits")
    }
}

impl std::error::Error for InvalidFingerprint {}

/// What an incident was raised from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IncidentPayload {
    EvilTwin {
        observed: ObservedAccessPoint,
        trusted_bssid: MacAddr,
    },
    DeauthAttack(DeauthClaim),
}

/// A correlated security incident.
#[derive(Debug, Clone, PartialEq)]
pub struct Incident {
    pub fingerprint: Fingerprint,
    pub first_seen: DateTime<Utc>,
    pub payload: IncidentPayload,
}

impl Incident {
    pub fn evil_twin(observed: ObservedAccessPoint, trusted_bssid: MacAddr) -> Self {
        Self {
            fingerprint: Fingerprint::evil_twin(&observed.ssid, &observed.bssid),
            first_seen: observed.observed_at,
            payload: IncidentPayload::EvilTwin {
                observed,
                trusted_bssid,
            },
        }
    }

    pub fn deauth_attack(claim: DeauthClaim) -> Self {
        Self {
            fingerprint: Fingerprint::deauth_attack(
                &claim.malicious_mac,
                &claim.attacked_ssid,
                &claim.detected_at,
            ),
            first_seen: claim.detected_at,
            payload: IncidentPayload::DeauthAttack(claim),
        }
    }

    pub fn kind(&self) -> IncidentKind {
        match self.payload {
            IncidentPayload::EvilTwin { .. } => IncidentKind::EvilTwin,
            IncidentPayload::DeauthAttack(_) => IncidentKind::DeauthAttack,
        }
    }
}

/// Persistent marker that an incident was decided and handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub fingerprint: Fingerprint,
    pub kind: IncidentKind,
    pub dispatched_at: DateTime<Utc>,
    /// Whether the sink acknowledged the alert
    pub delivered: bool,
}

/// One line of the incident store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    Observation(ObservedAccessPoint),
    DeauthClaim(DeauthClaim),
    IncidentDispatched(DispatchRecord),
    IncidentCleared {
        fingerprint: Fingerprint,
        cleared_at: DateTime<Utc>,
    },
    /// The correlator has processed every event before `offset`
    Checkpoint { offset: u64 },
}

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
