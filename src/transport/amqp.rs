// src/transport/amqp.rs

//! AMQP bus implementation using `lapin`.
//!
//! This module implements the [`BusConnection`]/[`BusChannel`] seam against
//! an AMQP 0-9-1 broker (RabbitMQ).
//!
//! ## Connection behavior
//!
//! Connection to the broker is **lazy** - it happens on the first
//! `create_channel()` call. The connection is shared: if it is found dead on
//! a later call, a fresh connection is established first, so publishers and
//! subscribers recover from connection loss simply by asking for a new
//! channel.
//!
//! ## Consume behavior
//!
//! Each `consume()` spawns a pump task that forwards the lapin consumer
//! stream into the returned receiver. When the stream errors or ends (channel
//! or connection fault), the pump drops the sender; the receiver closing is
//! the fault signal the subscriber reacts to.
//!
//! ## Publish behavior
//!
//! Messages are published persistent (delivery mode 2) and mandatory, with
//! an empty routing key - the exchanges this crate declares are fanout, so
//! routing keys carry no information.

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        BasicRejectOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    ExchangeKind,
};

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::domain::{
    //
    BusChannel,
    BusConnection,
    ChannelPtr,
    ConnectionPtr,
    Delivery,
    QueueOptions,
};
use crate::{log_debug, log_error, log_info, Error, Result};

/// Create a lazily-connecting AMQP bus connection for the given broker URI.
///
/// No network traffic happens here; the first channel request connects.
pub fn create_amqp_connection(uri: impl Into<String>) -> ConnectionPtr {
    // ---
    Arc::new(AmqpConnection {
        uri: uri.into(),
        inner: Mutex::new(None),
    })
}

/// Shared, self-recovering connection to an AMQP broker.
struct AmqpConnection {
    // ---
    uri: String,
    inner: Mutex<Option<Connection>>,
}

#[async_trait::async_trait]
impl BusConnection for AmqpConnection {
    // ---
    async fn create_channel(&self) -> Result<ChannelPtr> {
        let mut inner = self.inner.lock().await;

        let reconnect = match inner.as_ref() {
            Some(connection) => !connection.status().connected(),
            None => true,
        };

        if reconnect {
            log_info!("connecting to AMQP broker at {}", self.uri);

            let connection = Connection::connect(&self.uri, ConnectionProperties::default())
                .await
                .map_err(|e| {
                    let msg = format!("amqp: connection failed: {e}");
                    log_error!("{msg}");
                    Error::Broker(msg)
                })?;

            log_info!("connected to AMQP broker");
            *inner = Some(connection);
        }

        let connection = inner
            .as_ref()
            .ok_or_else(|| Error::Broker("amqp: connection unavailable".to_owned()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::Broker(format!("amqp: channel creation failed: {e}")))?;

        Ok(Arc::new(AmqpChannel {
            channel,
            pumps: Mutex::new(Vec::new()),
        }))
    }
}

struct AmqpChannel {
    // ---
    channel: Channel,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl BusChannel for AmqpChannel {
    // ---
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        // ---
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("amqp: exchange declare '{name}' failed: {e}")))?;

        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        // ---
        let declare = QueueDeclareOptions {
            passive: false,
            durable: options.durable,
            exclusive: false,
            auto_delete: options.auto_delete,
            nowait: false,
        };

        let mut arguments = FieldTable::default();
        if let Some(dead_letter) = options.dead_letter {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dead_letter.exchange.into()),
            );
            arguments.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(dead_letter.routing_key.into()),
            );
        }

        self.channel
            .queue_declare(name, declare, arguments)
            .await
            .map_err(|e| Error::Broker(format!("amqp: queue declare '{name}' failed: {e}")))?;

        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()> {
        // ---
        self.channel
            .queue_bind(
                queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                Error::Broker(format!("amqp: bind '{queue}' to '{exchange}' failed: {e}"))
            })?;

        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        // ---
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| Error::Broker(format!("amqp: basic.qos failed: {e}")))?;

        Ok(())
    }

    async fn publish(&self, exchange: &str, body: &[u8]) -> Result<()> {
        // ---
        let options = BasicPublishOptions {
            mandatory: true,
            ..BasicPublishOptions::default()
        };

        // Delivery mode 2 marks the message persistent.
        self.channel
            .basic_publish(
                exchange,
                "",
                options,
                body,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| Error::Broker(format!("amqp: publish to '{exchange}' failed: {e}")))?;

        log_debug!("published {} bytes to exchange '{}'", body.len(), exchange);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        // ---
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                // no_ack stays false: acknowledgements are manual.
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("amqp: consume on '{queue}' failed: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = queue.to_owned();

        let pump = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(attempt) = consumer.next().await {
                match attempt {
                    Ok(delivery) => {
                        let forwarded = tx.send(Delivery {
                            body: Bytes::from(delivery.data),
                            redelivered: delivery.redelivered,
                            tag: delivery.delivery_tag,
                        });

                        if forwarded.is_err() {
                            // Receiver dropped; the subscriber moved on.
                            return;
                        }
                    }
                    Err(e) => {
                        log_error!("amqp: consumer stream error on '{queue}': {e}");
                        break;
                    }
                }
            }
            // Dropping tx here signals the fault to the subscriber.
        });

        self.pumps.lock().await.push(pump);

        Ok(rx)
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        // ---
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| Error::Broker(format!("amqp: ack failed: {e}")))
    }

    async fn nack_requeue(&self, tag: u64) -> Result<()> {
        // ---
        let options = BasicNackOptions {
            requeue: true,
            ..BasicNackOptions::default()
        };

        self.channel
            .basic_nack(tag, options)
            .await
            .map_err(|e| Error::Broker(format!("amqp: nack failed: {e}")))
    }

    async fn reject(&self, tag: u64) -> Result<()> {
        // ---
        let options = BasicRejectOptions { requeue: false };

        self.channel
            .basic_reject(tag, options)
            .await
            .map_err(|e| Error::Broker(format!("amqp: reject failed: {e}")))
    }

    async fn close(&self) -> Result<()> {
        // ---
        for pump in self.pumps.lock().await.drain(..) {
            pump.abort();
        }

        self.channel
            .close(200, "closing")
            .await
            .map_err(|e| Error::Broker(format!("amqp: channel close failed: {e}")))
    }
}
