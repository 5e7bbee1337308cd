/// Correlation engine.
///
/// Walks the incident store from its last position, turns observations and
/// deauth claims into incidents, and hands each new incident to the
/// dispatcher at most once. Delivery may still fail after every retry; the
/// incident is then recorded as undelivered and not alerted again.
/// Decisions and the processed position are persisted in the store, so a
/// restarted correlator resumes from its checkpoint and stays silent about
/// anything it already reported.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::ClearPolicy;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::StoreError;
use crate::protocol::{DispatchRecord, Incident, IncidentKind, ObservedAccessPoint, StoreEvent};
use crate::registry::TrustedRegistry;
use crate::shutdown::Shutdown;
use crate::store::IncidentStore;

/// Counters for one correlation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Events fully processed
    pub scanned: u64,
    /// Incidents dispatched
    pub incidents: u64,
    /// Incidents already dispatched earlier
    pub skipped_duplicates: u64,
    /// Dispatch records cleared by TTL
    pub cleared: u64,
}

pub struct Correlator {
    registry: Arc<TrustedRegistry>,
    store: Arc<IncidentStore>,
    dispatcher: Dispatcher,
    policy: ClearPolicy,
    /// Next store offset to examine
    offset: u64,
}

impl Correlator {
    pub fn new(
        registry: Arc<TrustedRegistry>,
        store: Arc<IncidentStore>,
        dispatcher: Dispatcher,
        policy: ClearPolicy,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            offset: store.checkpoint().unwrap_or(0),
            policy,
            store,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Evil-twin incident for an observation, if its SSID is trusted under
    /// a different BSSID.
    pub fn check_observation(&self, observed: ObservedAccessPoint) -> Option<Incident> {
        let trusted = self.registry.lookup(&observed.ssid)?;
        if trusted == observed.bssid {
            return None;
        }
        Some(Incident::evil_twin(observed, trusted))
    }

    /// Process every event appended since the previous pass.
    ///
    /// Stops early on shutdown; an incident whose dispatch was cancelled is
    /// picked up again by the next pass or the next run. A pass that handled
    /// sensor events commits its position so the store can release them.
    pub fn run_pass(&mut self, shutdown: &Shutdown) -> Result<PassSummary, StoreError> {
        let mut summary = PassSummary {
            cleared: self.expire_dispatched()?,
            ..PassSummary::default()
        };

        let store = Arc::clone(&self.store);
        let mut saw_sensor_events = false;
        for (offset, event) in store.read_since(self.offset) {
            if shutdown.is_requested() {
                break;
            }

            let incident = match event {
                StoreEvent::Observation(observed) => {
                    saw_sensor_events = true;
                    self.check_observation(observed)
                }
                StoreEvent::DeauthClaim(claim) => {
                    saw_sensor_events = true;
                    Some(Incident::deauth_attack(claim))
                }
                StoreEvent::IncidentDispatched(_) | StoreEvent::IncidentCleared { .. } | StoreEvent::Checkpoint { .. } => {
                    None
                }
            };

            if let Some(incident) = incident {
                let stale = store
                    .last_cleared(&incident.fingerprint)
                    .is_some_and(|cleared| offset < cleared);
                if stale || store.is_dispatched(&incident.fingerprint) {
                    summary.skipped_duplicates += 1;
                } else {
                    let outcome = self.dispatcher.dispatch(&incident, shutdown);
                    if !outcome.is_complete() {
                        break;
                    }
                    store.mark_dispatched(DispatchRecord {
                        fingerprint: incident.fingerprint.clone(),
                        kind: incident.kind(),
                        dispatched_at: Utc::now(),
                        delivered: matches!(outcome, DispatchOutcome::Delivered { .. }),
                    })?;
                    summary.incidents += 1;
                }
            }

            summary.scanned += 1;
            self.offset = offset + 1;
        }

        if saw_sensor_events {
            store.commit(self.offset)?;
        }
        Ok(summary)
    }

    /// Run passes every `interval` until shutdown. A store failure is fatal
    /// and fails the whole daemon.
    pub fn run(&mut self, interval: Duration, shutdown: &Shutdown) {
        log::info!("Correlator started (interval {:?}, {} trusted APs)", interval, self.registry.len());

        while !shutdown.is_requested() {
            match self.run_pass(shutdown) {
                Ok(summary) => {
                    if summary.incidents > 0 || summary.cleared > 0 {
                        log::info!(
                            "Pass: scanned {}, {} new incidents, {} duplicates, {} cleared",
                            summary.scanned,
                            summary.incidents,
                            summary.skipped_duplicates,
                            summary.cleared
                        );
                    } else {
                        log::debug!("Pass: scanned {}, nothing new", summary.scanned);
                    }
                }
                Err(StoreError::Closed) => break,
                Err(e) => {
                    log::error!("Correlator: {}; shutting down", e);
                    shutdown.fail();
                    break;
                }
            }
            shutdown.sleep(interval);
        }

        log::info!("Correlator stopped at offset {}", self.offset);
    }

    /// Re-arm deauth incidents whose dispatch is older than the TTL.
    fn expire_dispatched(&self) -> Result<u64, StoreError> {
        let ClearPolicy::AfterTtl(ttl) = self.policy else {
            return Ok(0);
        };
        let Some(cutoff) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return Ok(0);
        };

        let mut cleared = 0;
        for fingerprint in self.store.dispatched_before(IncidentKind::DeauthAttack, cutoff) {
            if self.store.clear(&fingerprint)? {
                log::info!("Deauth incident {} re-armed after {:?}", fingerprint.short(), ttl);
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}
