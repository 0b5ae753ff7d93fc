use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct Channels {
    /// pub/sub bridge -> coordinator. Bounded, so a slow coordinator pushes
    /// back on the bridge instead of growing a queue without limit.
    pub from_mqtt: mpsc::Sender<mqtt::Message>,
    pub shutdown: broadcast::Sender<()>,
}

impl Channels {
    pub fn new(inbound_capacity: usize) -> (Self, mpsc::Receiver<mqtt::Message>) {
        let (from_mqtt, from_mqtt_rx) = mpsc::channel(inbound_capacity.max(1));

        let channels = Self {
            from_mqtt,
            shutdown: broadcast::channel(16).0,
        };

        (channels, from_mqtt_rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}
