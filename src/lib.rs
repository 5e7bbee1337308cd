//! AirHound WIDS: wireless intrusion detection correlator.
//!
//! The `wids` layer of the AirHound toolkit. Two sensors feed it: a Wi-Fi
//! scanner reporting access points as text lines over serial, and a BLE
//! receiver relaying deauthentication reports as JSON inside manufacturer
//! advertisement data. Every sensor record lands in an append-only incident
//! store; a correlator compares access points against a registry of trusted
//! `(SSID, BSSID)` pairs and raises evil-twin and deauth incidents. Each
//! incident is alerted at most once: a sink that keeps failing leaves it
//! recorded as undelivered rather than retried forever.
//!
//! Modules, bottom up:
//! - `scanner`: line normalization and advertisement decoding (pure, no I/O)
//! - `protocol`: records and the store's NDJSON event format
//! - `registry`: trusted access points
//! - `store`: append-only event log and dispatched set
//! - `dispatch`: alerts, notification sinks, retry with backoff
//! - `correlator`: incident decisions
//! - `comm`: line reassembly and supervised device feeds
//! - `config`, `error`, `shutdown`: ambient plumbing shared by the above

pub mod comm;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod scanner;
pub mod shutdown;
pub mod store;
