//! MQTT transport for remote commands.
//!
//! Publishes are cut into `buffer_size` fragments before dispatch so
//! handlers see the same fragment stream regardless of message size.

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CommandRouter, Fragment};
use crate::backoff::{retry, BackoffPolicy};
use crate::config::{Endpoint, MqttConfig};
use crate::error::{NodeError, Result};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 16;

/// Split one publish into router fragments; only the first carries the topic
pub fn fragment_publish<'a>(topic: &'a str, payload: &'a [u8], buffer_size: usize) -> Vec<Fragment<'a>> {
    if payload.is_empty() {
        return vec![Fragment::whole(topic, payload)];
    }

    let buffer_size = buffer_size.max(1);
    payload
        .chunks(buffer_size)
        .enumerate()
        .map(|(i, chunk)| Fragment {
            topic: if i == 0 { topic } else { "" },
            payload: chunk,
            offset: i * buffer_size,
            total: payload.len(),
        })
        .collect()
}

/// Poll until the broker answers the connect request
async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                return Ok(());
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return Err(NodeError::Network(format!("broker refused session: {:?}", ack.code)));
            }
            Ok(_) => {}
            Err(e) => return Err(NodeError::Network(format!("MQTT broker unreachable: {}", e))),
        }
    }
}

/// Broker session feeding a [`CommandRouter`]
pub struct MqttChannel {
    client: AsyncClient,
    eventloop: EventLoop,
    router: CommandRouter,
    buffer_size: usize,
    policy: BackoffPolicy,
}

impl MqttChannel {
    pub fn new(config: &MqttConfig, endpoint: &Endpoint, router: CommandRouter) -> Self {
        let mut options = MqttOptions::new(config.client_id.clone(), endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        Self {
            client,
            eventloop,
            router,
            buffer_size: config.buffer_size,
            policy: BackoffPolicy::new(
                config.connect_attempts,
                Duration::from_millis(config.backoff_initial_ms),
                Duration::from_millis(config.backoff_max_ms),
            ),
        }
    }

    /// Wait for the broker's ConnAck, retrying with backoff
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Network`] once the attempt budget is spent.
    pub async fn connect(&mut self) -> Result<()> {
        let eventloop = Mutex::new(&mut self.eventloop);
        let eventloop = &eventloop;
        retry(&self.policy, "MQTT connect", move || async move {
            let mut eventloop = eventloop.lock().await;
            wait_for_connack(&mut eventloop).await
        })
        .await?;

        info!("Connected to MQTT broker");
        Ok(())
    }

    fn subscribe_all(&self) -> Result<()> {
        for topic in self.router.topics() {
            self.client
                .try_subscribe(topic, QoS::AtMostOnce)
                .map_err(|e| NodeError::Network(format!("subscribe {} failed: {}", topic, e)))?;
            info!("Subscribed to {}", topic);
        }
        Ok(())
    }

    fn handle_publish(&mut self, topic: &str, payload: &[u8]) {
        debug!("Publish on {} ({} bytes)", topic, payload.len());
        for fragment in fragment_publish(topic, payload, self.buffer_size) {
            self.router.dispatch(&fragment);
        }
    }

    /// Connect, subscribe and dispatch commands until the process exits
    ///
    /// # Errors
    ///
    /// Returns the connect error; once connected, connection drops are
    /// logged and the event loop reconnects on its own.
    pub async fn run(mut self) -> Result<()> {
        self.connect().await?;
        self.subscribe_all()?;

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.handle_publish(&publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Reconnected to MQTT broker");
                    if let Err(e) = self.subscribe_all() {
                        warn!("{}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT connection error: {}", e);
                    tokio::time::sleep(self.policy.initial).await;
                }
            }
        }
    }
}
