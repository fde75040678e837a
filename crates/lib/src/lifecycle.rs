//! Process lifecycle: connect and subscribe once, run until SIGINT/SIGTERM, then unsubscribe,
//! disconnect within the grace period, and let in-flight messages finish.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::channels::{Channel, ChannelError, MqttChannel};
use crate::config::Config;
use crate::llm::GenerationError;
use crate::pipeline::{self, Pipeline};

/// Buffered deliveries between the channel event loop and the dispatcher.
const INBOUND_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("failed to connect to broker: {0}")]
    Connect(#[source] ChannelError),
    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: ChannelError,
    },
    #[error("failed to build generation client: {0}")]
    Generation(#[from] GenerationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting down",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

fn enter(state: LifecycleState) {
    log::info!("lifecycle: {}", state);
}

/// Run the bridge with the MQTT channel and HTTP/shell pipeline until a termination signal.
pub async fn run(config: Config) -> Result<(), LifecycleError> {
    let config = Arc::new(config);
    config.log_summary();
    let channel =
        MqttChannel::new(&config.broker, config.credentials()).map_err(LifecycleError::Connect)?;
    let pipeline = Arc::new(Pipeline::from_config(&config)?);
    run_until(&config, &channel, pipeline, shutdown_signal()).await
}

/// Drive the lifecycle on any channel; `shutdown` completing starts teardown.
/// Only connect and subscribe failures are returned. Teardown failures are logged.
pub async fn run_until<C, F>(
    config: &Config,
    channel: &C,
    pipeline: Arc<Pipeline>,
    shutdown: F,
) -> Result<(), LifecycleError>
where
    C: Channel + ?Sized,
    F: Future<Output = ()>,
{
    enter(LifecycleState::Starting);
    let topic = config.broker.topic.as_str();
    let grace = config.broker.disconnect_grace();

    channel.connect().await.map_err(LifecycleError::Connect)?;
    log::info!("connected to broker via {} channel", channel.id());

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    if let Err(source) = channel.subscribe(topic, inbound_tx).await {
        if let Err(e) = channel.disconnect(grace).await {
            log::debug!("disconnect after failed subscribe: {}", e);
        }
        return Err(LifecycleError::Subscribe {
            topic: topic.to_string(),
            source,
        });
    }
    log::info!("subscribed to topic: {}", topic);

    let dispatcher = tokio::spawn(pipeline::run_dispatcher(
        pipeline,
        inbound_rx,
        config.pipeline.max_concurrency,
    ));

    enter(LifecycleState::Running);
    log::info!("waiting for messages; press Ctrl+C to stop");
    shutdown.await;

    enter(LifecycleState::ShuttingDown);
    match channel.unsubscribe(topic, grace).await {
        Ok(()) => log::info!("unsubscribed from topic: {}", topic),
        Err(e) => log::warn!("error unsubscribing from topic {}: {}", topic, e),
    }
    match channel.disconnect(grace).await {
        Ok(()) => log::info!("disconnected from broker"),
        Err(e) => log::warn!("error disconnecting from broker: {}", e),
    }

    let drain = config.pipeline.drain_timeout();
    if tokio::time::timeout(drain, dispatcher).await.is_err() {
        log::warn!("in-flight messages still running after {:?}; exiting anyway", drain);
    }
    enter(LifecycleState::Stopped);
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}
