//! Broker connection management.
//!
//! Connects to RabbitMQ with a fixed number of attempts and a fixed delay
//! between them. Exhausting the attempts is fatal for the worker.

use crate::config::{BrokerSettings, ConnectSettings};
use crate::error::{ProvisionError, Result};
use lapin::options::{BasicConsumeOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Run `connect` up to `attempts` times, sleeping `delay` after each failure
/// except the last.
pub async fn connect_with_retry<T, E, F, Fut>(
    attempts: u32,
    delay: Duration,
    mut connect: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let mut last_error = String::from("no connection attempt made");

    for attempt in 1..=attempts {
        match connect(attempt).await {
            Ok(connection) => {
                if attempt > 1 {
                    info!(attempt, attempts, "Broker connection succeeded after retry");
                }
                return Ok(connection);
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt < attempts {
                    warn!(
                        attempt,
                        attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %last_error,
                        "Broker connection failed, retrying"
                    );
                    sleep(delay).await;
                } else {
                    warn!(attempt, attempts, error = %last_error, "Broker connection failed");
                }
            }
        }
    }

    Err(ProvisionError::BrokerUnavailable {
        attempts,
        last_error,
    })
}

/// AMQP URI for the configured broker
#[must_use]
pub fn amqp_uri(settings: &BrokerSettings) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: settings.username.clone(),
                password: settings.password.clone(),
            },
            host: settings.host.clone(),
            port: settings.port,
        },
        vhost: settings.vhost.clone(),
        ..Default::default()
    }
}

/// Options for the match queue: not durable, not exclusive, kept when unused
#[must_use]
pub fn queue_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: false,
        exclusive: false,
        auto_delete: false,
        ..Default::default()
    }
}

/// Connection properties that run lapin's I/O and internal tasks on the
/// current tokio runtime instead of its own threads. Must be called from
/// within a runtime.
#[must_use]
pub fn connection_properties() -> ConnectionProperties {
    ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio)
}

/// Open connection and channel with the match queue declared
pub struct BrokerConnection {
    connection: Connection,
    channel: Channel,
    queue: String,
}

impl BrokerConnection {
    /// Connect with retry, open a channel and declare the queue
    pub async fn establish(broker: &BrokerSettings, connect: &ConnectSettings) -> Result<Self> {
        info!(
            host = %broker.host,
            port = broker.port,
            vhost = %broker.vhost,
            "Connecting to broker"
        );

        let uri = amqp_uri(broker);
        let properties = connection_properties();
        let connection = connect_with_retry(connect.attempts, connect.delay(), |_| {
            Connection::connect_uri(uri.clone(), properties.clone())
        })
        .await?;
        info!("✅ Connected to broker");

        let channel = connection.create_channel().await?;
        let queue = channel
            .queue_declare(&broker.queue, queue_options(), FieldTable::default())
            .await?;
        info!(
            queue = %broker.queue,
            messages = queue.message_count(),
            consumers = queue.consumer_count(),
            "Declared match queue"
        );

        Ok(Self {
            connection,
            channel,
            queue: broker.queue.clone(),
        })
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Subscribe with auto-ack; deliveries are acknowledged on receipt
    pub async fn consume(&self, consumer_tag: &str) -> Result<Consumer> {
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        info!(queue = %self.queue, consumer_tag, "Consuming match requests");
        Ok(consumer)
    }

    pub async fn close(self) -> Result<()> {
        self.channel.close(200, "shutting down").await?;
        self.connection.close(200, "shutting down").await?;
        info!("Broker connection closed");
        Ok(())
    }
}
