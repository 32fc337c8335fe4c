use std::sync::Arc;

use chrono::Utc;
use rumqttc::{AsyncClient, QoS};
use tokio::sync::Mutex;
use tracing::debug;

use homectl_common::{types::BindAck, Debouncer, Envelope, NetworkConfig};

/// Identity stamped on every publish so our own echoes can be dropped.
pub fn origin_id(network: &NetworkConfig) -> String {
    network
        .client_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
}

pub fn mqtt_client_id(origin_id: &str) -> String {
    format!("HomeAutomation-{origin_id}")
}

/// Outbound side of the bus: wraps messages in the origin envelope and drops
/// repeats of the same topic and message inside the debounce window.
#[derive(Clone)]
pub struct BusPublisher {
    mqtt: AsyncClient,
    origin_id: Arc<str>,
    recent: Arc<Mutex<Debouncer>>,
}

impl BusPublisher {
    pub fn new(mqtt: AsyncClient, origin_id: &str, debounce_ms: u64) -> Self {
        Self {
            mqtt,
            origin_id: Arc::from(origin_id),
            recent: Arc::new(Mutex::new(Debouncer::new(debounce_ms))),
        }
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    pub fn client(&self) -> &AsyncClient {
        &self.mqtt
    }

    /// Returns whether the message went out.
    pub async fn publish(&self, topic: &str, message: &str, now_ms: u64) -> anyhow::Result<bool> {
        let key = format!("{topic}:{message}");
        if self.recent.lock().await.should_suppress(&key, now_ms) {
            debug!("duplicate publish suppressed: {key}");
            return Ok(false);
        }

        let payload = Envelope::new(&self.origin_id, message).to_json();
        self.mqtt
            .publish(topic, QoS::AtLeastOnce, true, payload)
            .await?;
        Ok(true)
    }

    /// Answers a vendor bind request. Sent bare, without the envelope.
    pub async fn ack_bind(&self, topic: &str, message_id: &str) -> anyhow::Result<()> {
        let ack = BindAck::new(message_id.to_string(), Utc::now().timestamp());
        let payload = serde_json::to_vec(&ack)?;
        self.mqtt
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}
