//! AirHound WIDS daemon
//!
//! Thread-based: one thread per sensor feed plus the correlator, all sharing
//! the incident store. Ctrl-C or SIGTERM stops the correlator, then the store
//! is flushed and closed.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};

use airhound_wids::comm::{self, DeviceFeed};
use airhound_wids::config::{self, BackoffConfig, ClearPolicy, Config};
use airhound_wids::correlator::Correlator;
use airhound_wids::dispatch::{Dispatcher, LogNotifier, Notifier, WebhookNotifier};
use airhound_wids::protocol::{Fingerprint, VERSION};
use airhound_wids::registry::TrustedRegistry;
use airhound_wids::shutdown::Shutdown;
use airhound_wids::store::IncidentStore;

#[derive(Parser)]
#[command(name = "airhound-wids")]
#[command(version)]
#[command(about = "Evil-twin and deauthentication correlator for AirHound sensors", long_about = None)]
struct Cli {
    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args)]
struct Options {
    /// Serial device the Wi-Fi scanner writes to
    #[arg(long, env = "AIRHOUND_SERIAL_DEVICE", default_value = "/dev/serial0")]
    serial_device: PathBuf,

    /// UART speed of the scanner
    #[arg(long, env = "AIRHOUND_SERIAL_BAUD", default_value_t = config::SERIAL_BAUD)]
    serial_baud: u32,

    /// Line feed of hex advertisement dumps from the BLE receiver
    #[arg(long, env = "AIRHOUND_ADV_FEED")]
    adv_feed: Option<PathBuf>,

    /// Trusted access points, one {"SSID","BSSID"} record per line
    #[arg(long, env = "AIRHOUND_REGISTRY", default_value = "legitimate_aps.json")]
    registry: PathBuf,

    /// Incident store log
    #[arg(long, env = "AIRHOUND_STORE", default_value = "incidents.ndjson")]
    store: PathBuf,

    /// Seconds between correlation passes
    #[arg(
        long,
        env = "AIRHOUND_INTERVAL_SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    interval_secs: u64,

    /// Webhook receiving alerts as JSON; alerts are logged when unset
    #[arg(long, env = "AIRHOUND_WEBHOOK_URL")]
    webhook_url: Option<String>,

    #[arg(long, env = "AIRHOUND_WEBHOOK_TIMEOUT_SECS", default_value_t = 10)]
    webhook_timeout_secs: u64,

    /// Delivery attempts per alert
    #[arg(long, env = "AIRHOUND_DISPATCH_ATTEMPTS", default_value_t = 5)]
    dispatch_attempts: u32,

    /// Re-arm deauth incidents this many seconds after dispatch
    #[arg(long, env = "AIRHOUND_CLEAR_AFTER_SECS")]
    clear_after_secs: Option<u64>,
}

impl Options {
    fn config(&self) -> Config {
        let defaults = Config::default();
        let dispatch = BackoffConfig::dispatch();
        Config {
            serial_device: self.serial_device.clone(),
            serial_baud: self.serial_baud,
            adv_feed: self.adv_feed.clone(),
            registry_path: self.registry.clone(),
            store_path: self.store.clone(),
            correlation_interval: Duration::from_secs(self.interval_secs),
            webhook_url: self.webhook_url.clone(),
            webhook_timeout: Duration::from_secs(self.webhook_timeout_secs),
            dispatch_backoff: BackoffConfig {
                max_attempts: self.dispatch_attempts,
                ..dispatch
            },
            clear_policy: self
                .clear_after_secs
                .map_or(ClearPolicy::Manual, |secs| ClearPolicy::AfterTtl(Duration::from_secs(secs))),
            ..defaults
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default)
    Run,
    /// Acknowledge an incident so it may alert again. Run while the daemon is stopped.
    Ack { fingerprint: Fingerprint },
    /// List dispatched incidents
    Incidents,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.options.config();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config),
        Command::Ack { fingerprint } => ack(&config, &fingerprint),
        Command::Incidents => list_incidents(&config),
    }
}

fn open_store(config: &Config) -> anyhow::Result<IncidentStore> {
    IncidentStore::open(&config.store_path, config.store_write_retry)
        .with_context(|| format!("opening incident store {}", config.store_path.display()))
}

fn run(config: Config) -> anyhow::Result<()> {
    log::info!("AirHound WIDS v{} starting", VERSION);

    let registry = Arc::new(TrustedRegistry::load(&config.registry_path)?);
    let store = Arc::new(open_store(&config)?);
    log::info!(
        "Store {}: {} events, {} incidents dispatched",
        config.store_path.display(),
        store.len(),
        store.dispatched().len()
    );

    let notifier: Box<dyn Notifier> = match &config.webhook_url {
        Some(url) => Box::new(WebhookNotifier::new(url, config.webhook_timeout)?),
        None => {
            log::warn!("No webhook configured, alerts are written to the log only");
            Box::new(LogNotifier)
        }
    };
    let dispatcher = Dispatcher::new(notifier, config.dispatch_backoff);

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            log::info!("Shutdown requested");
            shutdown.request();
        })
        .context("installing signal handler")?;
    }

    // ── Serial scanner thread ────────────────────────────────────────

    {
        let store = Arc::clone(&store);
        let shutdown = shutdown.clone();
        let backoff = config.reconnect_backoff;
        let mut feed = DeviceFeed::serial("serial", &config.serial_device, config.serial_baud);
        thread::Builder::new()
            .name("serial".into())
            .spawn(move || comm::run_ap_feed(&mut feed, &store, &shutdown, &backoff))?;
        log::info!(
            "Serial thread spawned ({} at {} baud)",
            config.serial_device.display(),
            config.serial_baud
        );
    }

    // ── Advertisement thread ─────────────────────────────────────────

    if let Some(path) = &config.adv_feed {
        let store = Arc::clone(&store);
        let shutdown = shutdown.clone();
        let backoff = config.reconnect_backoff;
        let mut feed = DeviceFeed::new("adv", path);
        thread::Builder::new()
            .name("adv".into())
            .spawn(move || comm::run_adv_feed(&mut feed, &store, &shutdown, &backoff))?;
        log::info!("Advertisement thread spawned ({})", path.display());
    } else {
        log::info!("No advertisement feed configured, deauth reports disabled");
    }

    // ── Correlator thread ────────────────────────────────────────────

    let correlator = {
        let mut correlator = Correlator::new(registry, Arc::clone(&store), dispatcher, config.clear_policy);
        let shutdown = shutdown.clone();
        let interval = config.correlation_interval;
        thread::Builder::new()
            .name("correlator".into())
            .spawn(move || correlator.run(interval, &shutdown))?
    };

    correlator
        .join()
        .map_err(|_| anyhow!("correlator thread panicked"))?;

    // Feeds blocked on a device read end on their next append
    shutdown.request();
    store.close().context("closing incident store")?;

    if shutdown.has_failed() {
        bail!("stopped after an unrecoverable store failure");
    }
    log::info!("Stopped cleanly");
    Ok(())
}

fn ack(config: &Config, fingerprint: &Fingerprint) -> anyhow::Result<()> {
    let store = open_store(config)?;
    if store.clear(fingerprint)? {
        println!("Cleared {}", fingerprint);
    } else {
        println!("{} is not a dispatched incident", fingerprint);
    }
    store.close()?;
    Ok(())
}

fn list_incidents(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    for record in store.dispatched() {
        println!(
            "{}  {:<13}  {:<11}  {}",
            record.dispatched_at.to_rfc3339(),
            record.kind.as_str(),
            if record.delivered { "delivered" } else { "undelivered" },
            record.fingerprint
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_is_rejected() {
        assert!(Cli::try_parse_from(["airhound-wids", "--interval-secs", "0"]).is_err());
    }

    #[test]
    fn flags_reach_the_config() {
        let cli = Cli::try_parse_from(["airhound-wids", "--interval-secs", "3", "--serial-baud", "9600", "incidents"])
            .unwrap();
        let config = cli.options.config();
        assert_eq!(config.correlation_interval, Duration::from_secs(3));
        assert_eq!(config.serial_baud, 9600);
        assert!(matches!(cli.command, Some(Command::Incidents)));
    }
}
