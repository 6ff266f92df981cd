//! Bootstrap utilities for binaries embedding the bus.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bus::{BusError, IntegrationEventBus, Transport};
use crate::config::{Config, TransportType, LOG_ENV_VAR};
use crate::handlers::HandlerResolver;

/// Initialize tracing with the `EVENTBUS_LOG` environment variable.
///
/// Defaults to "info" level if EVENTBUS_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the transport selected by configuration.
pub async fn init_transport(config: &Config) -> Result<Arc<dyn Transport>, BusError> {
    match config.transport.transport_type {
        TransportType::Channel => {
            let broker = crate::bus::ChannelBroker::new();
            let transport = broker.transport(
                &config.bus.service_name,
                config.transport.channel_config(),
            );
            info!(transport = "channel", service = %config.bus.service_name, "Transport initialized");
            Ok(Arc::new(transport))
        }
        TransportType::SnsSqs => {
            #[cfg(feature = "sns-sqs")]
            {
                let sns_sqs_config = config.transport.sns_sqs_config(&config.bus.service_name);
                let transport = crate::bus::SnsSqsTransport::new(sns_sqs_config).await?;
                info!(transport = "sns-sqs", service = %config.bus.service_name, "Transport initialized");
                Ok(Arc::new(transport))
            }

            #[cfg(not(feature = "sns-sqs"))]
            {
                Err(BusError::Provisioning(
                    "SNS/SQS support requires the 'sns-sqs' feature. Rebuild with --features sns-sqs"
                        .to_string(),
                ))
            }
        }
    }
}

/// Build a bus from configuration with the given handler resolver.
pub async fn init_event_bus(
    config: &Config,
    resolver: Arc<dyn HandlerResolver>,
) -> Result<IntegrationEventBus, BusError> {
    let transport = init_transport(config).await?;
    Ok(
        IntegrationEventBus::new(transport, resolver, config.bus.consumer_config())
            .with_publish_timeout(config.bus.publish_timeout()),
    )
}

/// Start the bus, block until Ctrl+C, then shut it down gracefully.
pub async fn run_until_shutdown(bus: &IntegrationEventBus) -> Result<(), Box<dyn std::error::Error>> {
    bus.start().await?;
    info!("Event bus running, press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    bus.stop().await?;
    Ok(())
}
