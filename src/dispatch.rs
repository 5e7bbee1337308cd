/// Alert dispatch: turns incidents into alerts and delivers them to a sink
/// with bounded exponential backoff.
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::config::BackoffConfig;
use crate::error::NotifyError;
use crate::protocol::{Fingerprint, Incident, IncidentPayload};
use crate::shutdown::Shutdown;

/// Attempts kept in the in-memory history
const HISTORY_LEN: usize = 256;

/// Outbound notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub title: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn for_incident(incident: &Incident, now: DateTime<Utc>) -> Self {
        let mut body = String::new();
        let title = match &incident.payload {
            IncidentPayload::EvilTwin {
                observed,
                trusted_bssid,
            } => {
                let _ = writeln!(
                    body,
                    "Access point \"{}\" seen with BSSID {}, trusted BSSID is {}.",
                    observed.ssid, observed.bssid, trusted_bssid
                );
                let _ = writeln!(body, "Kind: {}", incident.kind());
                let _ = writeln!(body, "SSID: {}", observed.ssid);
                let _ = writeln!(body, "Observed BSSID: {}", observed.bssid);
                let _ = writeln!(body, "Trusted BSSID: {}", trusted_bssid);
                match observed.rssi {
                    Some(rssi) => {
                        let _ = writeln!(body, "RSSI: {} dBm", rssi);
                    }
                    None => body.push_str("RSSI: unknown\n"),
                }
                "Evil twin access point detected"
            }
            IncidentPayload::DeauthAttack(claim) => {
                let _ = writeln!(
                    body,
                    "{} is sending deauthentication frames to \"{}\".",
                    claim.malicious_mac, claim.attacked_ssid
                );
                let _ = writeln!(body, "Kind: {}", incident.kind());
                let _ = writeln!(body, "Attacked SSID: {}", claim.attacked_ssid);
                let _ = writeln!(body, "Attacker MAC: {}", claim.malicious_mac);
                "Deauthentication attack detected"
            }
        };
        let _ = writeln!(
            body,
            "Detected at: {}",
            incident.first_seen.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let _ = writeln!(body, "Fingerprint: {}", incident.fingerprint);
        let _ = write!(body, "Timestamp: {}", now.format("%Y-%m-%d %H:%M:%S"));

        Self {
            title: title.to_string(),
            body,
            timestamp: now,
        }
    }
}

// ── Sinks ──────────────────────────────────────────────────────────────

/// Notification sink.
pub trait Notifier: Send {
    fn name(&self) -> &str;

    fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// POSTs alerts as JSON to a webhook endpoint.
pub struct WebhookNotifier {
    client: reqwest::blocking::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("airhound-wids/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NotifyError::Permanent(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(alert).send().map_err(|e| {
            if e.is_builder() {
                NotifyError::Permanent(e.to_string())
            } else {
                NotifyError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error()
            && status != reqwest::StatusCode::REQUEST_TIMEOUT
            && status != reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            Err(NotifyError::Permanent(format!("webhook returned {}", status)))
        } else {
            Err(NotifyError::Transient(format!("webhook returned {}", status)))
        }
    }
}

/// Writes alerts to the log. Used when no webhook is configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        log::warn!("ALERT {}\n{}", alert.title, alert.body);
        Ok(())
    }
}

// ── Dispatcher ─────────────────────────────────────────────────────────

/// Result of handing one incident to the sink.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Delivered { attempts: u32 },
    /// Retries exhausted or the sink refused permanently
    Undelivered { attempts: u32, reason: NotifyError },
    /// Shutdown interrupted the retry loop
    Cancelled,
}

impl DispatchOutcome {
    /// Whether the incident has been decided and must not be sent again.
    pub fn is_complete(&self) -> bool {
        !matches!(self, DispatchOutcome::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchAttempt {
    pub fingerprint: Fingerprint,
    /// 1-indexed
    pub attempt: u32,
    pub attempted_at: DateTime<Utc>,
    pub outcome: Result<(), NotifyError>,
}

pub struct Dispatcher {
    notifier: Box<dyn Notifier>,
    backoff: BackoffConfig,
    history: VecDeque<DispatchAttempt>,
}

impl Dispatcher {
    pub fn new(notifier: Box<dyn Notifier>, backoff: BackoffConfig) -> Self {
        Self {
            notifier,
            backoff,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    /// Deliver an alert for `incident`, retrying transient failures.
    pub fn dispatch(&mut self, incident: &Incident, shutdown: &Shutdown) -> DispatchOutcome {
        let alert = Alert::for_incident(incident, Utc::now());
        let max_attempts = self.backoff.attempts();
        let mut reason = NotifyError::Transient("no attempt made".to_string());

        for attempt in 0..max_attempts {
            if !shutdown.sleep(self.backoff.delay_for_attempt(attempt)) {
                log::info!("Dispatch of {} cancelled by shutdown", incident.fingerprint.short());
                return DispatchOutcome::Cancelled;
            }

            let result = self.notifier.notify(&alert);
            self.record(&incident.fingerprint, attempt + 1, result.clone());

            match result {
                Ok(()) => {
                    log::info!(
                        "{} alert {} delivered via {} (attempt {})",
                        incident.kind(),
                        incident.fingerprint.short(),
                        self.notifier.name(),
                        attempt + 1
                    );
                    return DispatchOutcome::Delivered { attempts: attempt + 1 };
                }
                Err(e) if e.is_transient() => {
                    log::warn!(
                        "{} attempt {}/{} for {} failed: {}",
                        self.notifier.name(),
                        attempt + 1,
                        max_attempts,
                        incident.fingerprint.short(),
                        e
                    );
                    reason = e;
                }
                Err(e) => {
                    log::error!("Alert {} undelivered: {}", incident.fingerprint.short(), e);
                    return DispatchOutcome::Undelivered {
                        attempts: attempt + 1,
                        reason: e,
                    };
                }
            }
        }

        log::error!(
            "Alert {} undelivered after {} attempts: {}",
            incident.fingerprint.short(),
            max_attempts,
            reason
        );
        DispatchOutcome::Undelivered {
            attempts: max_attempts,
            reason,
        }
    }

    /// Recent delivery attempts, oldest first.
    pub fn attempts(&self) -> impl Iterator<Item = &DispatchAttempt> {
        self.history.iter()
    }

    fn record(&mut self, fingerprint: &Fingerprint, attempt: u32, outcome: Result<(), NotifyError>) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(DispatchAttempt {
            fingerprint: fingerprint.clone(),
            attempt,
            attempted_at: Utc::now(),
            outcome,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::{mpsc, Arc};
    use std::thread;

    use chrono::TimeZone;
    use parking_lot::Mutex;

    use crate::protocol::{DeauthClaim, MacAddr, ObservedAccessPoint};

    /// Replays a script of results, then succeeds.
    struct ScriptedNotifier {
        script: Mutex<VecDeque<Result<(), NotifyError>>>,
        sent: Arc<Mutex<Vec<Alert>>>,
    }

    impl ScriptedNotifier {
        fn new(script: Vec<Result<(), NotifyError>>) -> (Self, Arc<Mutex<Vec<Alert>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let notifier = Self {
                script: Mutex::new(script.into()),
                sent: sent.clone(),
            };
            (notifier, sent)
        }
    }

    impl Notifier for ScriptedNotifier {
        fn name(&self) -> &str {
            "scripted"
        }

        fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
            self.sent.lock().push(alert.clone());
            self.script.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap()
    }

    fn evil_twin() -> Incident {
        let observed = ObservedAccessPoint {
            ssid: "Cafe-WiFi".try_into().unwrap(),
            bssid: "AA:BB:CC:99:88:77".parse().unwrap(),
            rssi: Some(-40),
            observed_at: t0(),
        };
        Incident::evil_twin(observed, "AA:BB:CC:11:22:33".parse().unwrap())
    }

    fn deauth() -> Incident {
        Incident::deauth_attack(DeauthClaim {
            detected_at: t0(),
            malicious_mac: MacAddr::new([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]),
            attacked_ssid: "Cafe-WiFi".try_into().unwrap(),
        })
    }

    fn transient() -> NotifyError {
        NotifyError::Transient("503".to_string())
    }

    // ── Alert ───────────────────────────────────────────────────────

    #[test]
    fn evil_twin_alert_names_both_bssids() {
        let alert = Alert::for_incident(&evil_twin(), t0());
        assert_eq!(alert.title, "Evil twin access point detected");
        assert!(alert.body.contains("Observed BSSID: AA:BB:CC:99:88:77"));
        assert!(alert.body.contains("Trusted BSSID: AA:BB:CC:11:22:33"));
        assert!(alert.body.contains("RSSI: -40 dBm"));
        assert!(alert.body.ends_with("Timestamp: 2024-01-01 12:30:00"));
    }

    #[test]
    fn unknown_rssi_is_spelled_out() {
        let mut incident = evil_twin();
        if let IncidentPayload::EvilTwin { observed, .. } = &mut incident.payload {
            observed.rssi = None;
        }
        assert!(Alert::for_incident(&incident, t0()).body.contains("RSSI: unknown"));
    }

    #[test]
    fn deauth_alert_names_attacker() {
        let alert = Alert::for_incident(&deauth(), t0());
        assert_eq!(alert.title, "Deauthentication attack detected");
        assert!(alert.body.contains("Attacker MAC: DE:AD:BE:EF:00:01"));
        assert!(alert.body.contains("Detected at: 2024-01-01T12:30:00Z"));
    }

    #[test]
    fn alert_serializes_with_iso_timestamp() {
        let json = serde_json::to_string(&Alert::for_incident(&deauth(), t0())).unwrap();
        assert!(json.contains(r#""title":"Deauthentication attack detected""#));
        assert!(json.contains(r#""timestamp":"2024-01-01T12:30:00Z""#));
    }

    // ── Retry ───────────────────────────────────────────────────────

    #[test]
    fn transient_failures_are_retried_until_delivered() {
        let (notifier, sent) = ScriptedNotifier::new(vec![Err(transient()), Err(transient()), Err(transient())]);
        let mut dispatcher = Dispatcher::new(Box::new(notifier), BackoffConfig::immediate(5));

        let outcome = dispatcher.dispatch(&deauth(), &Shutdown::new());

        assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 4 });
        assert_eq!(sent.lock().len(), 4);
        let attempts: Vec<u32> = dispatcher.attempts().map(|a| a.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3, 4]);
        assert!(dispatcher.attempts().last().unwrap().outcome.is_ok());
    }

    #[test]
    fn exhausted_retries_are_undelivered() {
        let (notifier, sent) = ScriptedNotifier::new(vec![Err(transient()); 10]);
        let mut dispatcher = Dispatcher::new(Box::new(notifier), BackoffConfig::immediate(3));

        let outcome = dispatcher.dispatch(&evil_twin(), &Shutdown::new());

        assert_eq!(
            outcome,
            DispatchOutcome::Undelivered {
                attempts: 3,
                reason: transient()
            }
        );
        assert!(outcome.is_complete());
        assert_eq!(sent.lock().len(), 3);
    }

    #[test]
    fn permanent_failure_stops_immediately() {
        let refused = NotifyError::Permanent("404".to_string());
        let (notifier, sent) = ScriptedNotifier::new(vec![Err(refused.clone())]);
        let mut dispatcher = Dispatcher::new(Box::new(notifier), BackoffConfig::immediate(5));

        let outcome = dispatcher.dispatch(&evil_twin(), &Shutdown::new());

        assert_eq!(
            outcome,
            DispatchOutcome::Undelivered {
                attempts: 1,
                reason: refused
            }
        );
        assert_eq!(sent.lock().len(), 1);
    }

    #[test]
    fn shutdown_cancels_backoff_sleep() {
        let (notifier, sent) = ScriptedNotifier::new(vec![Err(transient()); 10]);
        let backoff = BackoffConfig::new(Duration::from_secs(60), Duration::from_secs(60), 5);
        let mut dispatcher = Dispatcher::new(Box::new(notifier), backoff);
        let shutdown = Shutdown::new();

        let stopper = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stopper.request();
        });
        let outcome = dispatcher.dispatch(&deauth(), &shutdown);
        handle.join().unwrap();

        assert_eq!(outcome, DispatchOutcome::Cancelled);
        assert!(!outcome.is_complete());
        assert_eq!(sent.lock().len(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let (notifier, _) = ScriptedNotifier::new(Vec::new());
        let mut dispatcher = Dispatcher::new(Box::new(notifier), BackoffConfig::immediate(1));
        for _ in 0..HISTORY_LEN + 10 {
            dispatcher.dispatch(&deauth(), &Shutdown::new());
        }
        assert_eq!(dispatcher.attempts().count(), HISTORY_LEN);
    }

    // ── Webhook ─────────────────────────────────────────────────────

    /// One-shot HTTP server answering with `status`. Sends the request body back.
    fn serve_once(status: &'static str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        let _ = tx.send(text[end + 4..].to_string());
                        break;
                    }
                }
            }
            let response = format!("HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status);
            stream.write_all(response.as_bytes()).unwrap();
        });
        (url, rx)
    }

    #[test]
    fn webhook_posts_alert_json() {
        let (url, body) = serve_once("204 No Content");
        let notifier = WebhookNotifier::new(&url, Duration::from_secs(5)).unwrap();
        let alert = Alert::for_incident(&evil_twin(), t0());

        assert_eq!(notifier.notify(&alert), Ok(()));
        let received: serde_json::Value = serde_json::from_str(&body.recv().unwrap()).unwrap();
        assert_eq!(received["title"], "Evil twin access point detected");
    }

    #[test]
    fn webhook_server_error_is_transient() {
        let (url, _body) = serve_once("503 Service Unavailable");
        let notifier = WebhookNotifier::new(&url, Duration::from_secs(5)).unwrap();
        let err = notifier.notify(&Alert::for_incident(&deauth(), t0())).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn webhook_client_error_is_permanent() {
        let (url, _body) = serve_once("404 Not Found");
        let notifier = WebhookNotifier::new(&url, Duration::from_secs(5)).unwrap();
        let err = notifier.notify(&Alert::for_incident(&deauth(), t0())).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn webhook_connection_refused_is_transient() {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let notifier = WebhookNotifier::new(&format!("http://127.0.0.1:{}/hook", port), Duration::from_secs(2)).unwrap();
        let err = notifier.notify(&Alert::for_incident(&deauth(), t0())).unwrap_err();
        assert!(err.is_transient());
    }
}
