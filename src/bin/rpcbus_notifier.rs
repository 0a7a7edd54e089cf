//! rpcbus-notifier: Notification consumer
//!
//! Drains the durable notification queue and hands each message to the
//! configured mail transport. Failed deliveries are requeued.
//!
//! ## Configuration
//! - `--config <path>` or RPCBUS_CONFIG: YAML config file
//! - RPCBUS__AMQP__URL: Broker URL (default: amqp://localhost:5672)
//! - RPCBUS__NOTIFICATION__TRANSPORT__TYPE: `log` (default) or `webhook`
//! - RPCBUS__NOTIFICATION__TRANSPORT__URL: Mail relay endpoint (webhook only)
//! - RPCBUS_LOG: Log filter (default: info)

use std::sync::Arc;

use tracing::info;

use rpcbus::config::Config;
use rpcbus::notify::transport::from_settings;
use rpcbus::notify::{MailTransport, NotificationConsumer, NotificationConsumerConfig};
use rpcbus::utils::bootstrap::{
    init_tracing, parse_config_path, run_with_reconnect, shutdown_signal,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(parse_config_path().as_deref())?;
    let transport: Arc<dyn MailTransport> =
        Arc::from(from_settings(&config.notification.transport)?);
    let consumer_config = NotificationConsumerConfig::from(&config.notification);
    let shutdown = shutdown_signal();

    info!(
        queue = %consumer_config.queue,
        transport = transport.name(),
        "rpcbus-notifier starting"
    );

    run_with_reconnect(&config.amqp, shutdown, |connection, shutdown| {
        let transport = transport.clone();
        let consumer_config = consumer_config.clone();
        async move {
            let channel = connection.open("notification-consumer").await?;
            NotificationConsumer::new(Arc::new(channel), transport, consumer_config)
                .run(shutdown)
                .await
        }
    })
    .await?;

    info!("rpcbus-notifier stopped");
    Ok(())
}
