//! [`Messenger`] implementation on top of an MQTT broker.

use crate::bridge::{InboundMessage, Messenger};
use crate::config::BrokerConfig;
use crate::error::{Result, TuyaError};
use futures_core::Stream;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::RngCore;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, SubscribeFilter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{Duration, sleep};

const REQUEST_CAPACITY: usize = 64;
const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Smallest number of filters per replayed SUBSCRIBE
const SUBSCRIBE_BATCH: usize = 16;

/// Broker connection shared by the bridge.
///
/// Subscriptions are remembered and replayed after every reconnect, since
/// the broker session is not persistent.
#[derive(Clone)]
pub struct MqttMessenger {
    client: AsyncClient,
    filters: Arc<Mutex<Vec<String>>>,
    connected: Arc<AtomicBool>,
}

impl MqttMessenger {
    /// Creates the client and the stream of inbound messages.
    ///
    /// The stream also drives the connection: nothing is sent or received
    /// until it is polled.
    pub fn connect(
        config: &BrokerConfig,
    ) -> (Self, impl Stream<Item = InboundMessage> + Send + 'static) {
        let client_id = config.client_id.clone().unwrap_or_else(|| {
            let mut suffix = [0u8; 4];
            rand::rng().fill_bytes(&mut suffix);
            format!("tuya2mqtt-{}", hex::encode(suffix))
        });

        let mut options = MqttOptions::new(client_id, &config.hostname, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive.max(5)));
        if let Some(user) = &config.username {
            options.set_credentials(user, config.password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let messenger = Self {
            client: client.clone(),
            filters: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(false)),
        };

        let filters = messenger.filters.clone();
        let connected = messenger.connected.clone();
        let host = format!("{}:{}", config.hostname, config.port);
        let inbound = async_stream::stream! {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        debug!("Received {} bytes on {}", publish.payload.len(), publish.topic);
                        yield InboundMessage {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        };
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to broker {}", host);
                        connected.store(true, Ordering::SeqCst);
                        // The request queue is only drained by this loop, so the
                        // replay must fit in half of it
                        let current = filters.lock().clone();
                        let batch = current
                            .len()
                            .div_ceil(REQUEST_CAPACITY / 2)
                            .max(SUBSCRIBE_BATCH);
                        for chunk in current.chunks(batch) {
                            let request = chunk
                                .iter()
                                .map(|f| SubscribeFilter::new(f.clone(), QoS::AtMostOnce));
                            if let Err(e) = client.try_subscribe_many(request) {
                                warn!("Subscribing to {} filters failed: {}", chunk.len(), e);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if connected.swap(false, Ordering::SeqCst) {
                            warn!("Broker connection lost: {}", e);
                        } else {
                            warn!("Broker {} unreachable: {}", host, e);
                        }
                        sleep(RETRY_DELAY).await;
                    }
                }
            }
        };

        (messenger, inbound)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Messenger for MqttMessenger {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .await
            .map_err(|e| TuyaError::Messaging(e.to_string()))
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        {
            let mut filters = self.filters.lock();
            if filters.iter().any(|f| f == filter) {
                return Ok(());
            }
            filters.push(filter.to_string());
        }
        // Otherwise the next ConnAck subscribes it
        if self.is_connected() {
            self.client
                .try_subscribe(filter, QoS::AtMostOnce)
                .map_err(|e| TuyaError::Messaging(e.to_string()))?;
        }
        Ok(())
    }
}
