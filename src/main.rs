use anyhow::Context;
use hookrelay::http_server::{self, ServerState};
use hookrelay::{cache_invalidator, EventBroker, Poller, PollerConfig, RelayConfig, StatefulPoller};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hookrelay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env().context("reading relay configuration")?;
    let cancel = CancellationToken::new();

    // Optional upstream poller that clears the cache dir on change.
    let poll_config = PollerConfig::from_env().context("reading poller configuration")?;
    let poller = match poll_config.cache_dir.clone() {
        Some(cache_dir) if !poll_config.targets.is_empty() => {
            let poller = Poller::github(&poll_config).context("building GitHub client")?;
            let stateful =
                StatefulPoller::new(poller, &poll_config.state_path, cache_invalidator(cache_dir));
            Some(stateful.start_async(cancel.clone()))
        }
        _ => None,
    };

    let state = ServerState::new(EventBroker::new(), &config);
    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;
    tracing::info!(public_url = %config.public_url(), "hookrelay {}", http_server::VERSION);

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
        }
        shutdown.cancel();
    });

    http_server::serve(listener, state, cancel.clone())
        .await
        .context("relay server")?;

    cancel.cancel();
    if let Some(handle) = poller {
        let _ = handle.await;
    }
    Ok(())
}
