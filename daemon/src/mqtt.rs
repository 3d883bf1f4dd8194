//! The Home-Assistant-facing MQTT surface: retained discovery configs,
//! retained state, availability, and entity removal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use rumqttc::{AsyncClient, ClientError, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use enbridge::devices::Device;
use enbridge::eep::{EntityMeta, StateMap};

use crate::config::Config;

pub const AVAILABILITY_ONLINE: &str = "online";
pub const AVAILABILITY_OFFLINE: &str = "offline";

pub fn state_topic(device_id: &str) -> String {
    format!("enocean/{device_id}/state")
}

pub fn availability_topic(device_id: &str) -> String {
    format!("enocean/{device_id}/availability")
}

pub fn discovery_topic(component: &str, device_id: &str, shortcut: &str) -> String {
    format!("homeassistant/{component}/{device_id}_{shortcut}/config")
}

/// What the dispatcher needs from the broker side, as a trait so the
/// pipeline is testable without a broker.
#[async_trait]
pub trait StatePublisher {
    fn is_connected(&self) -> bool;
    async fn publish_discovery(
        &self,
        device: &Device,
        shortcut: &str,
        meta: &EntityMeta,
    ) -> Result<(), ClientError>;
    async fn publish_state(&self, device_id: &str, state: &StateMap) -> Result<(), ClientError>;
    async fn publish_availability(&self, device_id: &str, online: bool)
    -> Result<(), ClientError>;
    async fn remove_entity(
        &self,
        device_id: &str,
        component: &str,
        shortcut: &str,
    ) -> Result<(), ClientError>;
}

#[derive(Serialize)]
struct DiscoveryPayload<'a> {
    name: String,
    unique_id: String,
    state_topic: String,
    value_template: String,
    availability_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_on: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_off: Option<u8>,
    device: DeviceBlock<'a>,
}

#[derive(Serialize)]
struct DeviceBlock<'a> {
    identifiers: [String; 1],
    name: &'a str,
    manufacturer: &'a str,
    model: &'a str,
}

fn discovery_payload<'a>(
    device: &'a Device,
    shortcut: &str,
    meta: &'a EntityMeta,
) -> DiscoveryPayload<'a> {
    let entity_name = meta.name.clone().unwrap_or_else(|| shortcut.to_string());
    let binary = meta.component == "binary_sensor";
    DiscoveryPayload {
        name: format!("{} {entity_name}", device.name),
        unique_id: format!("enocean_{}_{shortcut}", device.id),
        state_topic: state_topic(&device.id),
        value_template: format!("{{{{ value_json.{shortcut} }}}}"),
        availability_topic: availability_topic(&device.id),
        device_class: meta.device_class.as_deref(),
        unit_of_measurement: meta.unit.as_deref(),
        icon: meta.icon.as_deref(),
        state_class: meta.state_class.as_deref(),
        payload_on: binary.then_some(1),
        payload_off: binary.then_some(0),
        device: DeviceBlock {
            identifiers: [format!("enocean_{}", device.id)],
            name: &device.name,
            manufacturer: &device.manufacturer,
            model: &device.eep,
        },
    }
}

#[derive(Clone)]
pub struct MqttBridge {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl MqttBridge {
    /// Connect and spawn the event-loop task. rumqttc reconnects by itself
    /// as long as the loop keeps polling.
    pub fn start(task_tracker: &TaskTracker, config: &Config, shutdown: CancellationToken) -> Self {
        let mut options =
            MqttOptions::new("enbridge", config.mqtt_host.as_str(), config.mqtt_port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(password)) = (&config.mqtt_user, &config.mqtt_password) {
            options.set_credentials(user.as_str(), password.as_str());
        }
        info!(
            "connecting to MQTT broker at {}:{}",
            config.mqtt_host, config.mqtt_port
        );
        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let connected = Arc::new(AtomicBool::new(false));
        let flag = connected.clone();
        task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("MQTT event loop exiting...");
                        return;
                    }
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("connected to MQTT broker");
                            flag.store(true, Ordering::Relaxed);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if flag.swap(false, Ordering::Relaxed) {
                                error!("MQTT connection lost: {e}");
                            }
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        });
        MqttBridge { client, connected }
    }
}

#[async_trait]
impl StatePublisher for MqttBridge {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn publish_discovery(
        &self,
        device: &Device,
        shortcut: &str,
        meta: &EntityMeta,
    ) -> Result<(), ClientError> {
        let topic = discovery_topic(&meta.component, &device.id, shortcut);
        let payload =
            serde_json::to_vec(&discovery_payload(device, shortcut, meta)).expect("serializes");
        debug!("publishing discovery config to {topic}");
        self.client.publish(topic, QoS::AtLeastOnce, true, payload).await
    }

    async fn publish_state(&self, device_id: &str, state: &StateMap) -> Result<(), ClientError> {
        let payload = serde_json::to_vec(state).expect("state map serializes");
        self.client
            .publish(state_topic(device_id), QoS::AtLeastOnce, true, payload)
            .await
    }

    async fn publish_availability(
        &self,
        device_id: &str,
        online: bool,
    ) -> Result<(), ClientError> {
        let payload = if online {
            AVAILABILITY_ONLINE
        } else {
            AVAILABILITY_OFFLINE
        };
        self.client
            .publish(availability_topic(device_id), QoS::AtLeastOnce, true, payload)
            .await
    }

    /// An empty retained payload deletes the entity from Home Assistant.
    async fn remove_entity(
        &self,
        device_id: &str,
        component: &str,
        shortcut: &str,
    ) -> Result<(), ClientError> {
        self.client
            .publish(
                discovery_topic(component, device_id, shortcut),
                QoS::AtLeastOnce,
                true,
                [],
            )
            .await
    }
}
