//! Incident store: append-only event log plus the set of dispatched incidents.
//!
//! Every observation, deauth claim and dispatch decision is one NDJSON line.
//! Replaying the file on startup rebuilds the dispatched set, so a restarted
//! correlator never alerts twice.
//!
//! # Retention
//!
//! Offsets are positions in the log and only ever grow. Only events at or
//! after the consumer's last checkpoint are kept in memory: [`IncidentStore::commit`]
//! appends a checkpoint and releases everything before it, and replay does
//! the same as it streams the file.
//!
//! # Concurrency
//!
//! A single mutex serializes every operation. Producers append concurrently;
//! each producer's own events keep their submission order.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::thread;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::config::BackoffConfig;
use crate::error::StoreError;
use crate::protocol::{DispatchRecord, Fingerprint, IncidentKind, StoreEvent};

type LogWriter = Box<dyn Write + Send>;

struct Inner {
    /// `None` for a purely in-memory store
    writer: Option<LogWriter>,
    /// Unreleased events; the front one has offset `base`
    events: VecDeque<StoreEvent>,
    base: u64,
    dispatched: HashMap<Fingerprint, DispatchRecord>,
    /// Offset of the latest clear per fingerprint
    cleared: HashMap<Fingerprint, u64>,
    checkpoint: Option<u64>,
    /// A failed write may have left a partial line behind
    torn: bool,
    closed: bool,
}

impl Inner {
    fn new(writer: Option<LogWriter>) -> Self {
        Self {
            writer,
            events: VecDeque::new(),
            base: 0,
            dispatched: HashMap::new(),
            cleared: HashMap::new(),
            checkpoint: None,
            torn: false,
            closed: false,
        }
    }

    fn next_offset(&self) -> u64 {
        self.base + self.events.len() as u64
    }

    /// Add an event to the in-memory log and return its offset.
    fn apply(&mut self, event: StoreEvent) -> u64 {
        let offset = self.next_offset();
        let mut release_before = None;
        match &event {
            StoreEvent::IncidentDispatched(record) => {
                self.dispatched.insert(record.fingerprint.clone(), record.clone());
            }
            StoreEvent::IncidentCleared { fingerprint, .. } => {
                self.dispatched.remove(fingerprint);
                self.cleared.insert(fingerprint.clone(), offset);
            }
            StoreEvent::Checkpoint { offset: processed } => {
                self.checkpoint = Some(*processed);
                release_before = Some(*processed);
            }
            StoreEvent::Observation(_) | StoreEvent::DeauthClaim(_) => {}
        }
        self.events.push_back(event);
        if let Some(before) = release_before {
            self.release(before);
        }
        offset
    }

    /// Drop events with offsets below `before` from memory.
    fn release(&mut self, before: u64) {
        while self.base < before {
            if self.events.pop_front().is_none() {
                break;
            }
            self.base += 1;
        }
    }

    /// Write one line, retrying with backoff. After a failed attempt the
    /// next write starts with a newline so the torn bytes end up on a line
    /// of their own.
    fn write_line(&mut self, line: &str, retry: &BackoffConfig) -> Result<(), StoreError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };

        let mut last_error = None;
        for attempt in 0..retry.attempts() {
            let delay = retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                thread::sleep(delay);
            }

            let mut buf = String::with_capacity(line.len() + 2);
            if self.torn {
                buf.push('\n');
            }
            buf.push_str(line);
            buf.push('\n');

            match writer.write_all(buf.as_bytes()).and_then(|()| writer.flush()) {
                Ok(()) => {
                    self.torn = false;
                    if attempt > 0 {
                        log::info!("Store write recovered after {} retries", attempt);
                    }
                    return Ok(());
                }
                Err(e) => {
                    self.torn = true;
                    log::warn!("Store write attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(StoreError::WriteFailed {
            attempts: retry.attempts(),
            source: last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no write attempted")),
        })
    }

    fn append(&mut self, event: StoreEvent, retry: &BackoffConfig) -> Result<u64, StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        let line = serde_json::to_string(&event)?;
        self.write_line(&line, retry)?;
        Ok(self.apply(event))
    }
}

pub struct IncidentStore {
    inner: Mutex<Inner>,
    write_retry: BackoffConfig,
}

impl IncidentStore {
    /// A store that keeps everything in memory.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner::new(None)),
            write_retry: BackoffConfig::immediate(1),
        }
    }

    /// A store that writes every event to `writer` (nothing is replayed).
    pub fn with_writer(writer: impl Write + Send + 'static, write_retry: BackoffConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::new(Some(Box::new(writer)))),
            write_retry,
        }
    }

    /// Open (or create) a store file and replay it line by line.
    ///
    /// Lines that are not UTF-8 or do not parse, typically a write torn by a
    /// crash, are skipped with a warning.
    pub fn open(path: &Path, write_retry: BackoffConfig) -> Result<Self, StoreError> {
        let mut inner = Inner::new(None);

        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for (idx, line) in reader.split(b'\n').enumerate() {
                match decode_line(&line?) {
                    Ok(Some(event)) => {
                        inner.apply(event);
                    }
                    Ok(None) => {}
                    Err(reason) => {
                        log::warn!("Store {}: skipping unreadable line {}: {}", path.display(), idx + 1, reason);
                    }
                }
            }
        }

        // Writes go straight to the file; every line is complete once written
        let mut file = OpenOptions::new().create(true).read(true).append(true).open(path)?;
        if ends_without_newline(&mut file)? {
            file.write_all(b"\n")?;
        }

        log::info!(
            "Store {}: replayed {} events ({} pending), {} dispatched incidents",
            path.display(),
            inner.next_offset(),
            inner.events.len(),
            inner.dispatched.len()
        );

        inner.writer = Some(Box::new(file));
        Ok(Self {
            inner: Mutex::new(inner),
            write_retry,
        })
    }

    /// Append an event and return its offset.
    ///
    /// Write failures are retried; `WriteFailed` means the event is lost and
    /// the caller should treat the store as broken.
    pub fn append(&self, event: StoreEvent) -> Result<u64, StoreError> {
        self.inner.lock().append(event, &self.write_retry)
    }

    /// Lazily iterate events from `offset` up to the current end of the log.
    /// Released events are skipped.
    pub fn read_since(&self, offset: u64) -> ReadSince<'_> {
        let inner = self.inner.lock();
        ReadSince {
            store: self,
            next: offset.max(inner.base),
            end: inner.next_offset(),
        }
    }

    /// Record that the consumer has processed every event before `offset`
    /// and release those events from memory. A checkpoint never moves back.
    pub fn commit(&self, offset: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let offset = offset.min(inner.next_offset());
        if inner.checkpoint.is_some_and(|current| current >= offset) {
            return Ok(());
        }
        inner.append(StoreEvent::Checkpoint { offset }, &self.write_retry)?;
        Ok(())
    }

    /// Offset the consumer should resume from.
    pub fn checkpoint(&self) -> Option<u64> {
        self.inner.lock().checkpoint
    }

    /// Number of events held in memory.
    pub fn retained(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Record that an incident was decided. Returns `false` (and writes
    /// nothing) if the fingerprint is already dispatched.
    pub fn mark_dispatched(&self, record: DispatchRecord) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if inner.dispatched.contains_key(&record.fingerprint) {
            return Ok(false);
        }
        inner.append(StoreEvent::IncidentDispatched(record), &self.write_retry)?;
        Ok(true)
    }

    /// Forget a dispatched incident so it may alert again. Returns `false`
    /// if the fingerprint was not dispatched.
    pub fn clear(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if !inner.dispatched.contains_key(fingerprint) {
            return Ok(false);
        }
        inner.append(
            StoreEvent::IncidentCleared {
                fingerprint: fingerprint.clone(),
                cleared_at: Utc::now(),
            },
            &self.write_retry,
        )?;
        Ok(true)
    }

    pub fn is_dispatched(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.lock().dispatched.contains_key(fingerprint)
    }

    /// Offset of the most recent clear of `fingerprint`, if it was ever cleared.
    /// Events before this offset were already handled before the clear.
    pub fn last_cleared(&self, fingerprint: &Fingerprint) -> Option<u64> {
        self.inner.lock().cleared.get(fingerprint).copied()
    }

    /// All currently dispatched incidents, oldest first.
    pub fn dispatched(&self) -> Vec<DispatchRecord> {
        let mut records: Vec<_> = self.inner.lock().dispatched.values().cloned().collect();
        records.sort_by(|a, b| {
            a.dispatched_at
                .cmp(&b.dispatched_at)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        records
    }

    /// Dispatched incidents of `kind` decided before `cutoff`.
    pub fn dispatched_before(&self, kind: IncidentKind, cutoff: DateTime<Utc>) -> Vec<Fingerprint> {
        self.dispatched()
            .into_iter()
            .filter(|r| r.kind == kind && r.dispatched_at < cutoff)
            .map(|r| r.fingerprint)
            .collect()
    }

    /// Number of events ever appended, released ones included.
    pub fn len(&self) -> u64 {
        self.inner.lock().next_offset()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush and stop accepting writes. Waits for any in-flight append.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        if let Some(mut writer) = inner.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    fn get(&self, offset: u64) -> Option<StoreEvent> {
        let inner = self.inner.lock();
        offset
            .checked_sub(inner.base)
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| inner.events.get(i).cloned())
    }
}

/// Cursor over a fixed range of the log. Takes the lock once per item.
pub struct ReadSince<'a> {
    store: &'a IncidentStore,
    next: u64,
    end: u64,
}

impl ReadSince<'_> {
    /// Offset the next call to `next()` would return; resume from here.
    pub fn next_offset(&self) -> u64 {
        self.next
    }
}

impl Iterator for ReadSince<'_> {
    type Item = (u64, StoreEvent);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let offset = self.next;
        let event = self.store.get(offset)?;
        self.next += 1;
        Some((offset, event))
    }
}

/// One raw log line: `Ok(None)` for a blank line, `Err` with the reason for
/// anything unreadable.
fn decode_line(raw: &[u8]) -> Result<Option<StoreEvent>, String> {
    let text = std::str::from_utf8(raw).map_err(|e| e.to_string())?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text).map(Some).map_err(|e| e.to_string())
}

fn ends_without_newline(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
