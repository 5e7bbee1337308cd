/// Runtime configuration for the correlator daemon.
///
/// Plain structs with defaults; the binary fills them from CLI flags and
/// environment variables.
use std::path::PathBuf;
use std::time::Duration;

/// Default correlation pass interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// UART speed of the Wi-Fi scanner (8N1)
pub const SERIAL_BAUD: u32 = 115_200;

/// Exponential backoff schedule.
///
/// Used for dispatch retries, store write retries and device reconnects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: u32,
}

impl BackoffConfig {
    pub const fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            max_attempts,
        }
    }

    /// Alert delivery: 500ms, 1s, 2s, 4s between 5 attempts.
    pub const fn dispatch() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 5)
    }

    /// Store writes: short and few, a stuck disk is escalated quickly.
    pub const fn store_write() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(1), 3)
    }

    /// Device reconnect: `max_attempts` is unused, reconnects never give up.
    pub const fn reconnect() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), u32::MAX)
    }

    /// No waiting at all. For tests.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, max_attempts)
    }

    /// Delay to wait before attempt `attempt` (0-indexed). Attempt 0 never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exp);
        // f64::min drops NaN, so 0 * inf still lands on the cap
        let capped = scaled.min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(capped.max(0.0).round() as u64)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::dispatch()
    }
}

/// When a dispatched deauth incident may alert again.
///
/// Evil-twin incidents are never re-armed automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClearPolicy {
    /// Only an operator `ack` clears an incident.
    #[default]
    Manual,
    /// Deauth incidents are cleared this long after dispatch.
    AfterTtl(Duration),
}

/// Full daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Serial device the Wi-Fi scanner writes to
    pub serial_device: PathBuf,
    pub serial_baud: u32,
    /// Line feed of hex advertisement dumps from the BLE receiver
    pub adv_feed: Option<PathBuf>,
    /// NDJSON `{"SSID","BSSID"}` records
    pub registry_path: PathBuf,
    /// Incident store log
    pub store_path: PathBuf,
    pub correlation_interval: Duration,
    /// Webhook endpoint; alerts are only logged when unset
    pub webhook_url: Option<String>,
    pub webhook_timeout: Duration,
    pub dispatch_backoff: BackoffConfig,
    pub reconnect_backoff: BackoffConfig,
    pub store_write_retry: BackoffConfig,
    pub clear_policy: ClearPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial_device: PathBuf::from("/dev/serial0"),
            serial_baud: SERIAL_BAUD,
            adv_feed: None,
            registry_path: PathBuf::from("legitimate_aps.json"),
            store_path: PathBuf::from("incidents.ndjson"),
            correlation_interval: DEFAULT_INTERVAL,
            webhook_url: None,
            webhook_timeout: Duration::from_secs(10),
            dispatch_backoff: BackoffConfig::dispatch(),
            reconnect_backoff: BackoffConfig::reconnect(),
            store_write_retry: BackoffConfig::store_write(),
            clear_policy: ClearPolicy::Manual,
        }
    }
}
