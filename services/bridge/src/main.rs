// Bridge daemon entry point.
mod observability;

use anyhow::{Context, Result};
use std::future::Future;
use std::time::Duration;
use trestle_bridge::{PubSubBridge, QueueBridge, Watchable};
use trestle_common::BridgeConfig;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    observability::init_tracing();

    let config = BridgeConfig::from_env_or_yaml(None).context("load bridge config")?;
    let kinds = BridgeKinds::from_env().context("select bridge kind")?;

    let mut supervised: Vec<Box<dyn Watchable>> = Vec::new();
    if kinds.pubsub {
        let mut bridge = PubSubBridge::new(config.clone());
        bridge.start().await.context("start pubsub bridge")?;
        tracing::info!(
            inbound = bridge.inbound_addr().unwrap_or("?"),
            outbound = bridge.outbound_addr().unwrap_or("?"),
            "pubsub bridge ready"
        );
        supervised.push(Box::new(bridge));
    }
    if kinds.queue {
        let mut bridge = QueueBridge::new(config.clone());
        bridge.start().await.context("start queue bridge")?;
        tracing::info!(
            inbound = bridge.inbound_addr().unwrap_or("?"),
            outbound = bridge.outbound_addr().unwrap_or("?"),
            "queue bridge ready"
        );
        supervised.push(Box::new(bridge));
    }

    // Park here until the shutdown signal fires.
    shutdown.await;

    for bridge in supervised.iter_mut() {
        if !bridge.stop(STOP_TIMEOUT).await {
            tracing::warn!(name = bridge.name(), "bridge did not stop in time");
        }
    }
    tracing::info!("bridge daemon stopped");
    Ok(())
}

/// Which bridge kinds this process runs, from `TRESTLE_BRIDGE_KIND`
/// (`pubsub`, `queue`, or `both`; default `pubsub`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BridgeKinds {
    pubsub: bool,
    queue: bool,
}

impl BridgeKinds {
    fn from_env() -> Result<Self> {
        let raw = std::env::var("TRESTLE_BRIDGE_KIND").unwrap_or_else(|_| "pubsub".to_string());
        Self::parse(&raw)
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pubsub" => Ok(Self {
                pubsub: true,
                queue: false,
            }),
            "queue" => Ok(Self {
                pubsub: false,
                queue: true,
            }),
            "both" => Ok(Self {
                pubsub: true,
                queue: true,
            }),
            other => anyhow::bail!("unknown bridge kind: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing_covers_all_modes() {
        assert_eq!(
            BridgeKinds::parse("pubsub").expect("pubsub"),
            BridgeKinds {
                pubsub: true,
                queue: false
            }
        );
        assert_eq!(
            BridgeKinds::parse("QUEUE").expect("queue"),
            BridgeKinds {
                pubsub: false,
                queue: true
            }
        );
        assert_eq!(
            BridgeKinds::parse(" both ").expect("both"),
            BridgeKinds {
                pubsub: true,
                queue: true
            }
        );
        assert!(BridgeKinds::parse("neither").is_err());
    }

    #[tokio::test]
    async fn daemon_starts_and_stops_with_the_shutdown_future() {
        // Immediate shutdown: the run must come back cleanly after starting.
        run_with_shutdown(async {}).await.expect("clean run");
    }
}
