use crate::command::Command;
use crate::config::ConfigUpdate;
use crate::coordinator::IngestRequest;
use crate::prelude::*;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, Publish, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// Message {{{
/// An inbound message, topic relative to the namespace (`S1/data`,
/// `broadcast/data`, ...).
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Data(IngestRequest),
    Command(Command),
    Config(ConfigUpdate),
}

#[derive(Deserialize)]
struct DataMessage {
    #[serde(alias = "sensor")]
    sensor_id: String,
    #[serde(alias = "payload")]
    data: serde_json::Value,
    timestamp: Option<String>,
    site_id: Option<String>,
}

impl Message {
    pub fn to_inbound(&self, site_id: &str) -> Result<Inbound> {
        let parts: Vec<&str> = self.topic.split('/').collect();

        match parts[..] {
            ["broadcast", "data"] => Ok(Inbound::Data(self.to_ingest(site_id)?)),
            [site, "data"] if site == site_id => Ok(Inbound::Data(self.to_ingest(site_id)?)),
            [site, "command"] if site == site_id => Ok(Inbound::Command(
                serde_json::from_str(&self.payload).map_err(|err| anyhow!("bad command {:?}: {}", self.payload, err))?,
            )),
            [site, "config"] if site == site_id => Ok(Inbound::Config(
                serde_json::from_str(&self.payload).map_err(|err| anyhow!("bad config update {:?}: {}", self.payload, err))?,
            )),
            _ => bail!("unhandled topic {}", self.topic),
        }
    }

    fn to_ingest(&self, site_id: &str) -> Result<IngestRequest> {
        let m: DataMessage = serde_json::from_str(&self.payload)
            .map_err(|err| anyhow!("bad data message on {}: {}", self.topic, err))?;

        Ok(IngestRequest {
            site_id: m.site_id.unwrap_or_else(|| site_id.to_string()),
            sensor_id: m.sensor_id,
            data: m.data,
            timestamp: m.timestamp,
        })
    }
} // }}}

// Topics {{{
pub fn telemetry_topic(site_id: &str, sensor_id: &str) -> String {
    format!("{}/telemetry/{}", site_id, sensor_id)
}

pub fn heartbeat_topic(site_id: &str) -> String {
    format!("{}/heartbeat", site_id)
}

fn subscriptions(namespace: &str, site_id: &str) -> Vec<String> {
    vec![
        format!("{}/{}/data", namespace, site_id),
        format!("{}/{}/command", namespace, site_id),
        format!("{}/{}/config", namespace, site_id),
        format!("{}/broadcast/data", namespace),
    ]
} // }}}

/// The outbound half of the bridge, as the coordinator sees it.
pub trait Publisher: Send + Sync {
    /// Fire-and-forget. `topic` is relative to the namespace. Returns false
    /// straight away, without queueing, when there is no live session.
    fn publish(&self, topic: &str, payload: &str) -> bool;

    fn is_connected(&self) -> bool;
}

pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
    namespace: String,
    site_id: String,
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
    connected: AtomicBool,
}

impl Mqtt {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Self {
        let c = config.mqtt();
        let site_id = config.site_id();

        let mut options = MqttOptions::new(format!("solar-gateway-{}", site_id), c.host(), c.port());

        let will = LastWill {
            topic: format!("{}/{}/status", c.namespace(), site_id),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        let (client, eventloop) = AsyncClient::new(options, 64);

        Self {
            namespace: c.namespace().to_string(),
            site_id,
            config,
            channels,
            client,
            eventloop: Mutex::new(Some(eventloop)),
            connected: AtomicBool::new(false),
        }
    }

    /// Drives the session until shutdown. rumqttc reconnects on the next poll
    /// after an error; we only wait `reconnect_delay` between attempts.
    pub async fn start(&self) -> Result<()> {
        let c = self.config.mqtt();

        if !c.enabled() {
            info!("mqtt disabled, skipping");
            return Ok(());
        }

        let mut eventloop = self
            .eventloop
            .lock()
            .map_err(|_| anyhow!("mqtt eventloop lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("mqtt already started"))?;

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let mut shutdown = self.channels.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = eventloop.poll() => {
                    if let Err(err) = self.handle_event(event).await {
                        self.connected.store(false, Ordering::Release);
                        error!("mqtt: {}", err);
                        info!("reconnecting in {}s", c.reconnect_delay.as_secs());
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = tokio::time::sleep(c.reconnect_delay) => {}
                        }
                    }
                }
            }
        }

        self.disconnect(&mut eventloop).await;
        info!("MQTT loop exiting");

        Ok(())
    }

    async fn handle_event(&self, event: Result<Event, rumqttc::ConnectionError>) -> Result<()> {
        match event? {
            Event::Incoming(Incoming::ConnAck(_)) => {
                info!("mqtt connected");
                self.connected.store(true, Ordering::Release);
                self.setup()?;
            }
            Event::Incoming(Incoming::Publish(publish)) => {
                self.handle_message(publish).await?;
            }
            Event::Incoming(Incoming::Disconnect) => {
                warn!("mqtt broker closed the session");
                self.connected.store(false, Ordering::Release);
            }
            _ => {} // keepalives, acks
        }

        Ok(())
    }

    // runs on every ConnAck: subscriptions do not survive a clean session
    fn setup(&self) -> Result<()> {
        self.client
            .try_publish(self.status_topic(), QoS::AtLeastOnce, true, "online")?;

        for topic in subscriptions(&self.namespace, &self.site_id) {
            debug!("subscribing to {}", topic);
            self.client.try_subscribe(topic, QoS::AtLeastOnce)?;
        }

        Ok(())
    }

    // mqtt -> coordinator
    async fn handle_message(&self, publish: Publish) -> Result<()> {
        let Some(topic) = publish
            .topic
            .strip_prefix(self.namespace.as_str())
            .and_then(|t| t.strip_prefix('/'))
        else {
            warn!("ignoring message on {}", publish.topic);
            return Ok(());
        };

        let payload = match String::from_utf8(publish.payload.to_vec()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("ignoring non-UTF-8 message on {}: {}", publish.topic, err);
                return Ok(());
            }
        };

        let message = Message {
            topic: topic.to_string(),
            retain: publish.retain,
            payload,
        };
        debug!("RX: {:?}", message);

        // bounded: waits here when the coordinator falls behind
        if self.channels.from_mqtt.send(message).await.is_err() {
            bail!("send(from_mqtt) failed - channel closed?");
        }

        Ok(())
    }

    async fn disconnect(&self, eventloop: &mut EventLoop) {
        if !self.is_connected() {
            return;
        }

        let _ = self
            .client
            .try_publish(self.status_topic(), QoS::AtLeastOnce, true, "offline");
        let _ = self.client.try_disconnect();

        // flush the two requests above
        let flush = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(2), flush).await;

        self.connected.store(false, Ordering::Release);
    }

    fn status_topic(&self) -> String {
        format!("{}/{}/status", self.namespace, self.site_id)
    }
}

impl Publisher for Mqtt {
    fn publish(&self, topic: &str, payload: &str) -> bool {
        if !self.is_connected() {
            debug!("mqtt not connected, not publishing to {}", topic);
            return false;
        }

        let topic = format!("{}/{}", self.namespace, topic);
        match self.client.try_publish(&topic, QoS::AtLeastOnce, false, payload) {
            Ok(()) => {
                trace!("published {} = {}", topic, payload);
                true
            }
            Err(err) => {
                warn!("publish to {} failed: {}", topic, err);
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
