//! MQTT-backed broker client.
//!
//! Queues map to topics. MQTT does not carry broker message ids, so decoded
//! messages arrive without one and the runtime assigns them on receipt.
//! Connection problems are retried with a fixed gap a bounded number of
//! times before surfacing a fatal error.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{MessageClient, MessageClientFactory, MqError, ReceiveCallback, ReceiveWindow};
use crate::codec;
use crate::config::BrokerConfig;

const CONNECT_RETRY_GAP: Duration = Duration::from_secs(3);
const MAX_CONNECT_RETRIES: usize = 10;
/// How long the receive loop stays quiet before logging a heartbeat.
const QUIET_QUEUE_PERIOD: Duration = Duration::from_secs(15);

pub struct MqttMessageClient {
    client: AsyncClient,
    /// Claimed by whichever role drives this connection: the publish driver
    /// task or the receive loop. A client serves exactly one role.
    connection: Mutex<Option<EventLoop>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttMessageClient {
    pub fn new(config: &BrokerConfig) -> Self {
        // unique suffix so sender and receiver connections do not evict
        // each other off the broker
        let client_id = format!("{}-{}", config.client_id, Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        let (client, connection) = AsyncClient::new(options, 50);
        Self {
            client,
            connection: Mutex::new(Some(connection)),
            driver: Mutex::new(None),
        }
    }

    /// One fresh client (and so one fresh connection) per task role.
    pub fn factory(config: &BrokerConfig) -> MessageClientFactory {
        let config = config.clone();
        Arc::new(move || Arc::new(MqttMessageClient::new(&config)) as Arc<dyn MessageClient>)
    }

    /// Publish-role connections are driven by a background task; spawned on
    /// first use.
    fn ensure_driver(&self) {
        let mut driver = self.driver.lock().expect("mqtt driver slot poisoned");
        if driver.is_some() {
            return;
        }
        let Some(mut connection) = self
            .connection
            .lock()
            .expect("mqtt connection slot poisoned")
            .take()
        else {
            return;
        };
        *driver = Some(tokio::spawn(async move {
            let mut failures = 0usize;
            loop {
                match connection.poll().await {
                    Ok(_) => failures = 0,
                    Err(err) => {
                        failures += 1;
                        if failures >= MAX_CONNECT_RETRIES {
                            error!(
                                "giving up on broker connection after {failures} attempts: {err}"
                            );
                            return;
                        }
                        warn!(
                            "broker connection error, retrying in {}s: {err}",
                            CONNECT_RETRY_GAP.as_secs()
                        );
                        tokio::time::sleep(CONNECT_RETRY_GAP).await;
                    }
                }
            }
        }));
    }
}

#[async_trait]
impl MessageClient for MqttMessageClient {
    async fn send(&self, queue_name: &str, message: &str) -> Result<(), MqError> {
        self.ensure_driver();
        self.client
            .publish(queue_name, QoS::AtLeastOnce, false, message.to_string())
            .await
            .map_err(|err| MqError::Publish(err.to_string()))
    }

    async fn receive_blocking(
        &self,
        queue_name: &str,
        window: Arc<ReceiveWindow>,
        on_receive: ReceiveCallback,
    ) -> Result<(), MqError> {
        let Some(mut connection) = self
            .connection
            .lock()
            .expect("mqtt connection slot poisoned")
            .take()
        else {
            return Err(MqError::Receive(
                "client connection is already claimed by another role".to_string(),
            ));
        };
        self.client
            .subscribe(queue_name, QoS::AtLeastOnce)
            .await
            .map_err(|err| MqError::Receive(err.to_string()))?;
        let mut failures = 0usize;
        let mut last_traffic = Instant::now();
        loop {
            window.ready().await;
            match connection.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    failures = 0;
                    last_traffic = Instant::now();
                    let payload = String::from_utf8_lossy(&publish.payload);
                    // broker message ids are not a thing in MQTT; the
                    // runtime assigns one on receipt
                    match codec::decode(None, &payload) {
                        Ok(message) => on_receive(message),
                        Err(err) => warn!(topic = %publish.topic, "failed to decode message: {err}"),
                    }
                }
                Ok(_) => {
                    if last_traffic.elapsed() >= QUIET_QUEUE_PERIOD {
                        debug!(
                            "queue {queue_name} has been quiet for the last {}s",
                            QUIET_QUEUE_PERIOD.as_secs()
                        );
                        last_traffic = Instant::now();
                    }
                }
                Err(err) => {
                    failures += 1;
                    if failures >= MAX_CONNECT_RETRIES {
                        return Err(MqError::ConnectExhausted { attempts: failures });
                    }
                    warn!(
                        "broker receive error, retrying in {}s: {err}",
                        CONNECT_RETRY_GAP.as_secs()
                    );
                    tokio::time::sleep(CONNECT_RETRY_GAP).await;
                }
            }
        }
    }
}
