use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use owlmon::client::{MULTICAST_GROUP, MULTICAST_PORT};
use owlmon::{ClientConfig, ClientError, OwlClient, Telemetry};
use std::fmt::Display;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

/// Listen for OWL Intuition multicast telemetry and print decoded readings
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Multicast group the hub broadcasts to
    #[arg(long, env = "OWLMON_GROUP", default_value_t = MULTICAST_GROUP)]
    group: Ipv4Addr,

    /// Listen for unicast datagrams instead of joining the group
    #[arg(long)]
    unicast: bool,

    /// UDP port to listen on
    #[arg(long, env = "OWLMON_PORT", default_value_t = MULTICAST_PORT)]
    port: u16,

    /// Local interface address used for the multicast membership
    #[arg(long, env = "OWLMON_INTERFACE", default_value_t = Ipv4Addr::UNSPECIFIED)]
    interface: Ipv4Addr,

    /// Channels to decode, comma separated
    #[arg(long, env = "OWLMON_CHANNELS", value_delimiter = ',', default_value = "0,1,2")]
    channels: Vec<u32>,

    /// Watchdog timeout in seconds. If no datagram arrives in this window, or a
    /// receive fails, the socket is closed and re-bound after the cooldown.
    /// Keep it well above the hub's broadcast interval.
    #[arg(long, env = "OWLMON_WATCHDOG", default_value_t = 300)]
    watchdog: u64,

    /// Cooldown pause between restarts in seconds
    #[arg(long, env = "OWLMON_COOLDOWN", default_value_t = 5)]
    cooldown: u64,

    /// Log filter, overrides RUST_LOG (e.g. "debug" or "owlmon=trace")
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            group: (!self.unicast).then_some(self.group),
            port: self.port,
            interface: self.interface,
            ..ClientConfig::default()
        }
    }
}

fn init_tracing(filter: Option<&str>) -> Result<()> {
    let filter = match filter {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid log filter '{directives}'"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref())?;

    let config = args.client_config();
    tracing::info!(
        group = ?config.group,
        port = config.port,
        channels = ?args.channels,
        watchdog = args.watchdog,
        cooldown = args.cooldown,
        "Starting OWL listener"
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<Telemetry>();

    //
    // Receive + watchdog task
    //
    let listener = tokio::spawn(listen(
        OwlClient::new(config),
        args.channels.clone(),
        Duration::from_secs(args.watchdog),
        Duration::from_secs(args.cooldown),
        tx,
    ));

    //
    // Reporting loop
    //
    loop {
        tokio::select! {
            telemetry = rx.recv() => match telemetry {
                Some(telemetry) => report(&telemetry),
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    // Dropping the client inside the task releases the socket.
    listener.abort();
    listener_outcome(listener.await)
}

/// Cancellation is the normal shutdown path; a panic in the task is not.
fn listener_outcome(result: std::result::Result<(), JoinError>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => {
            tracing::error!(error = %e, "Listener task failed");
            Err(anyhow::Error::new(e).context("listener task failed"))
        }
    }
}

/// Receive datagrams forever, reopening the socket whenever the watchdog
/// expires or a receive fails. Returns once the reporting side hangs up.
async fn listen(
    mut client: OwlClient,
    channels: Vec<u32>,
    watchdog: Duration,
    cooldown: Duration,
    tx: mpsc::UnboundedSender<Telemetry>,
) {
    let mut restart_counter: u64 = 0;

    loop {
        if let Err(e) = client.initialise_socket().await {
            tracing::error!(error = %e, "Failed to open telemetry socket");
            sleep(cooldown).await;
            continue;
        }

        {
            let mut datagrams = std::pin::pin!(client.datagrams(watchdog));
            while let Some(item) = datagrams.next().await {
                match item {
                    Ok(datagram) => {
                        if tx.send(datagram.decode(&channels)).is_err() {
                            return;
                        }
                    }
                    Err(ClientError::Timeout(elapsed)) => {
                        restart_counter += 1;
                        tracing::warn!(
                            ?elapsed,
                            restart = restart_counter,
                            "Watchdog: no datagrams, reopening socket"
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Receive failed, reopening socket");
                        break;
                    }
                }
            }
        }

        client.destroy_socket();
        sleep(cooldown).await;
    }
}

fn or_dash<T: Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn report(telemetry: &Telemetry) {
    let health = &telemetry.health;
    if !health.is_empty() {
        let id = health
            .mac_address()
            .or_else(|| health.device_id.clone())
            .unwrap_or_default();
        println!(
            "📡 {id} via {}: updated={} rssi={} lqi={} battery={}%",
            telemetry.source,
            or_dash(health.last_update),
            or_dash(health.signal_strength),
            or_dash(health.link_quality),
            or_dash(health.battery_level),
        );
    }

    for reading in telemetry.readings.values() {
        match (reading.current, reading.total_current) {
            (Some(current), Some(total)) => println!(
                "  channel {}: {:.2} W, {:.2} Wh today",
                reading.channel, current, total
            ),
            _ => println!("  channel {}: no data", reading.channel),
        }
    }

    if telemetry.populated().count() > 1 {
        println!("  total: {:.2} W", telemetry.total_power());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["owlmon"]).unwrap();
        assert_eq!(args.channels, vec![0, 1, 2]);
        assert_eq!(args.watchdog, 300);
        assert_eq!(args.cooldown, 5);

        let config = args.client_config();
        assert_eq!(config.group, Some(MULTICAST_GROUP));
        assert_eq!(config.port, MULTICAST_PORT);
    }

    #[test]
    fn test_args_unicast_skips_group() {
        let args =
            Args::try_parse_from(["owlmon", "--unicast", "--channels", "1,3", "--watchdog", "900"])
                .unwrap();
        assert_eq!(args.channels, vec![1, 3]);
        assert_eq!(args.watchdog, 900);
        assert_eq!(args.client_config().group, None);
    }

    #[tokio::test]
    async fn test_listener_cancelled_is_clean_exit() {
        let task = tokio::spawn(async { sleep(Duration::from_secs(60)).await });
        task.abort();
        assert!(listener_outcome(task.await).is_ok());
    }

    #[tokio::test]
    async fn test_listener_panic_is_reported() {
        let task = tokio::spawn(async {
            let closed = true;
            if closed {
                panic!("socket closed under the listener");
            }
        });
        let result = listener_outcome(task.await);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("listener task failed"));
    }

    #[tokio::test]
    async fn test_listener_finished_is_clean_exit() {
        let task = tokio::spawn(async {});
        assert!(listener_outcome(task.await).is_ok());
    }
}
