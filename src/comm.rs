/// Sensor transport: line reassembly and supervised device feeds.
///
/// Both sensors hand us newline-delimited text over a device node: the
/// Wi-Fi scanner over UART, the BLE receiver as hex advertisement dumps.
/// Each feed runs in its own thread, reconnects with backoff when the
/// device goes away, and talks to the rest of the system only through
/// [`IncidentStore::append`].
use std::fs::File;
use std::io::{self, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};

use crate::config::BackoffConfig;
use crate::error::{DeviceUnavailable, MalformedInput, StoreError};
use crate::protocol::StoreEvent;
use crate::scanner;
use crate::shutdown::Shutdown;
use crate::store::IncidentStore;

/// Longest line accepted from a feed
pub const MAX_LINE_LEN: usize = 512;

// ── Line reassembly ────────────────────────────────────────────────────

/// Line reader state machine.
/// Accumulates bytes until a newline is found, then yields the line.
/// A line longer than [`MAX_LINE_LEN`] is dropped up to its newline.
pub struct LineReader {
    buf: [u8; MAX_LINE_LEN],
    pos: usize,
    discarding: bool,
}

impl LineReader {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_LINE_LEN],
            pos: 0,
            discarding: false,
        }
    }

    /// Feed a byte into the reader. Returns a complete line (without newline)
    /// when one is detected.
    pub fn feed(&mut self, byte: u8) -> Option<&[u8]> {
        if byte == b'\n' || byte == b'\r' {
            if self.discarding {
                self.discarding = false;
                self.pos = 0;
                None
            } else if self.pos > 0 {
                let line = &self.buf[..self.pos];
                self.pos = 0;
                Some(line)
            } else {
                None
            }
        } else if self.discarding {
            None
        } else if self.pos < self.buf.len() {
            self.buf[self.pos] = byte;
            self.pos += 1;
            None
        } else {
            log::debug!("Line longer than {} bytes dropped", MAX_LINE_LEN);
            self.discarding = true;
            self.pos = 0;
            None
        }
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

// ── Feeds ──────────────────────────────────────────────────────────────

/// A sensor connection that can be (re)opened.
pub trait Feed: Send {
    fn name(&self) -> &str;

    fn open(&mut self) -> Result<Box<dyn Read + Send>, DeviceUnavailable>;
}

/// A device node or FIFO read as a plain byte stream.
///
/// A serial feed puts its tty into raw mode at the configured baud with
/// `stty` on every connect. Devices that are not ttys (FIFOs, files) are
/// read as they are.
pub struct DeviceFeed {
    name: String,
    path: PathBuf,
    baud: Option<u32>,
}

impl DeviceFeed {
    pub fn new(name: &str, path: &Path) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            baud: None,
        }
    }

    /// A UART device read at `baud`, 8N1 raw.
    pub fn serial(name: &str, path: &Path, baud: u32) -> Self {
        Self {
            baud: Some(baud),
            ..Self::new(name, path)
        }
    }

    pub fn baud(&self) -> Option<u32> {
        self.baud
    }

    fn configure_line(&self, baud: u32) {
        let status = Command::new("stty")
            .arg("-F")
            .arg(&self.path)
            .args([baud.to_string().as_str(), "raw", "-echo", "cs8", "-cstopb", "-parenb"])
            .status();
        match status {
            Ok(status) if status.success() => {
                log::info!("{}: configured for {} at {} baud", self.name, self.path.display(), baud);
            }
            Ok(status) => {
                log::warn!("{}: stty on {} exited with {}, reading as is", self.name, self.path.display(), status);
            }
            Err(e) => {
                log::warn!("{}: could not run stty for {}: {}, reading as is", self.name, self.path.display(), e);
            }
        }
    }
}

impl Feed for DeviceFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<Box<dyn Read + Send>, DeviceUnavailable> {
        let file = File::open(&self.path).map_err(|source| DeviceUnavailable {
            device: self.path.clone(),
            source,
        })?;
        if let Some(baud) = self.baud {
            self.configure_line(baud);
        }
        Ok(Box::new(file))
    }
}

/// How one connected session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The handler or shutdown asked to stop
    Stopped,
    /// Device reported end of stream (unplugged, FIFO writer gone)
    Eof,
    Failed(io::Error),
}

/// Read lines from `reader` until it ends or `on_line` breaks.
/// Returns how the session ended and how many lines were delivered.
pub fn pump<R, F>(mut reader: R, shutdown: &Shutdown, on_line: &mut F) -> (SessionEnd, u64)
where
    R: Read,
    F: FnMut(&[u8]) -> ControlFlow<()>,
{
    let mut lines = LineReader::new();
    let mut chunk = [0u8; 256];
    let mut delivered = 0u64;

    loop {
        if shutdown.is_requested() {
            return (SessionEnd::Stopped, delivered);
        }
        let n = match reader.read(&mut chunk) {
            Ok(0) => return (SessionEnd::Eof, delivered),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (SessionEnd::Failed(e), delivered),
        };
        for &byte in &chunk[..n] {
            if let Some(line) = lines.feed(byte) {
                delivered += 1;
                if on_line(line).is_break() {
                    return (SessionEnd::Stopped, delivered);
                }
            }
        }
    }
}

/// Keep a feed connected until shutdown, reconnecting with backoff.
///
/// Device errors never end the loop; only shutdown or a `Break` from
/// `on_line` does. The backoff resets after a session that delivered data.
pub fn supervise<F>(feed: &mut dyn Feed, shutdown: &Shutdown, backoff: &BackoffConfig, mut on_line: F)
where
    F: FnMut(&[u8]) -> ControlFlow<()>,
{
    let mut failures = 0u32;

    while !shutdown.is_requested() {
        match feed.open() {
            Ok(reader) => {
                log::info!("{}: connected", feed.name());
                let (end, delivered) = pump(reader, shutdown, &mut on_line);
                if delivered > 0 {
                    failures = 0;
                }
                match end {
                    SessionEnd::Stopped => break,
                    SessionEnd::Eof => log::warn!("{}: device closed the stream", feed.name()),
                    SessionEnd::Failed(e) => log::warn!("{}: read error: {}", feed.name(), e),
                }
            }
            Err(e) => log::warn!("{}: {}", feed.name(), e),
        }

        failures = failures.saturating_add(1);
        let delay = backoff.delay_for_attempt(failures);
        log::info!("{}: reconnecting in {:?}", feed.name(), delay);
        if !shutdown.sleep(delay) {
            break;
        }
    }

    log::info!("{}: feed stopped", feed.name());
}

// ── Ingestion ──────────────────────────────────────────────────────────

/// Normalize one scanner line and append it. Malformed lines are dropped
/// (`Ok(None)`); only store failures are returned.
pub fn ingest_ap_line(store: &IncidentStore, raw: &[u8], now: DateTime<Utc>) -> Result<Option<u64>, StoreError> {
    match scanner::normalize_line(raw, now) {
        Ok(ap) => {
            log::debug!("AP {} {} rssi={:?}", ap.ssid, ap.bssid, ap.rssi);
            store.append(StoreEvent::Observation(ap)).map(Some)
        }
        Err(MalformedInput::NotUtf8) => {
            log::debug!("Dropped non-text line (raw bytes): {}", hex::encode(raw));
            Ok(None)
        }
        Err(e) => {
            log::debug!("Dropped line ({}): {}", e, String::from_utf8_lossy(raw));
            Ok(None)
        }
    }
}

/// Decode one advertisement feed line and append every claim it carries.
/// Returns the number of claims stored.
pub fn ingest_adv_line(store: &IncidentStore, raw: &[u8]) -> Result<usize, StoreError> {
    let ad_data = match scanner::parse_adv_line(raw) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::debug!("Dropped advertisement line ({}): {}", e, String::from_utf8_lossy(raw));
            return Ok(0);
        }
    };

    let mut stored = 0;
    for claim in scanner::claims_in(&ad_data) {
        match claim {
            Ok(claim) => {
                log::info!(
                    "Deauth claim: {} attacking '{}' at {}",
                    claim.malicious_mac,
                    claim.attacked_ssid,
                    claim.detected_at
                );
                store.append(StoreEvent::DeauthClaim(claim))?;
                stored += 1;
            }
            Err(e) => log::debug!("Ignored manufacturer data: {}", e),
        }
    }
    Ok(stored)
}

/// Map a store result to loop control. A store failure stops the whole
/// daemon; a closed store just ends this feed.
fn store_flow<T>(feed: &str, result: Result<T, StoreError>, shutdown: &Shutdown) -> ControlFlow<()> {
    match result {
        Ok(_) => ControlFlow::Continue(()),
        Err(StoreError::Closed) => ControlFlow::Break(()),
        Err(e) => {
            log::error!("{}: {}; shutting down", feed, e);
            shutdown.fail();
            ControlFlow::Break(())
        }
    }
}

/// Serial Wi-Fi scanner thread body.
pub fn run_ap_feed(feed: &mut dyn Feed, store: &IncidentStore, shutdown: &Shutdown, backoff: &BackoffConfig) {
    let name = feed.name().to_string();
    supervise(feed, shutdown, backoff, |line| {
        store_flow(&name, ingest_ap_line(store, line, Utc::now()), shutdown)
    });
}

/// BLE advertisement receiver thread body.
pub fn run_adv_feed(feed: &mut dyn Feed, store: &IncidentStore, shutdown: &Shutdown, backoff: &BackoffConfig) {
    let name = feed.name().to_string();
    supervise(feed, shutdown, backoff, |line| store_flow(&name, ingest_adv_line(store, line), shutdown));
}
