//! Telegram classification and the decode-and-publish pipeline.
//!
//! Every RADIO_ERP1 packet lands here. Teach-in frames from unknown
//! senders drive auto-learn and the confirmation reply; anything from an
//! already-learned device, LRN bit clear or not, is decoded against its
//! profile, persisted, and published retained.

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};

use enbridge::devices::{Device, DeviceRegistry, PENDING_EEP, RegistryError};
use enbridge::eep::{EepLibrary, StateMap, StateValue, decode};
use enbridge::esp3::{Esp3Packet, parse_sender_id};
use enbridge::gateway::GatewayLink;
use enbridge::states::StateStore;
use enbridge::transport::TransportError;

use crate::mqtt::StatePublisher;

/// Reply channel for teach-in confirmations. The gateway link implements
/// it; tests record the calls instead.
#[async_trait]
pub trait TeachInPort {
    /// Returns false when no response could be sent (e.g. base id still
    /// unknown), which is not an error.
    async fn send_teach_in_response(
        &mut self,
        destination: [u8; 4],
        func: u8,
        ty: u8,
    ) -> Result<bool, TransportError>;
}

#[async_trait]
impl TeachInPort for GatewayLink {
    async fn send_teach_in_response(
        &mut self,
        destination: [u8; 4],
        func: u8,
        ty: u8,
    ) -> Result<bool, TransportError> {
        let Some(base_id) = self.base_id() else {
            warn!("can't answer teach-in, gateway base id unknown");
            return Ok(false);
        };
        self.send(&Esp3Packet::teach_in_response(base_id, destination, func, ty))
            .await?;
        Ok(true)
    }
}

/// The shared context of the pipeline: profile library, device registry,
/// state store and broker surface, passed around explicitly.
pub struct Dispatcher<P: StatePublisher> {
    pub eep: EepLibrary,
    pub registry: DeviceRegistry,
    pub states: StateStore,
    pub mqtt: P,
}

impl<P: StatePublisher + Sync + Send> Dispatcher<P> {
    pub fn new(eep: EepLibrary, registry: DeviceRegistry, states: StateStore, mqtt: P) -> Self {
        Dispatcher {
            eep,
            registry,
            states,
            mqtt,
        }
    }

    pub async fn handle_radio<T: TeachInPort + Send>(&mut self, packet: &Esp3Packet, port: &mut T) {
        let Some(sender_id) = packet.sender_id() else {
            debug!("radio telegram without sender id, dropping");
            return;
        };
        let rssi = packet.rssi_dbm();

        let known = self.registry.get(&sender_id);
        if known.is_some_and(|device| !device.enabled) {
            debug!("device {sender_id} is disabled, dropping telegram");
            return;
        }
        // a pending entry still needs its profile learned
        let learned = known.is_some_and(|device| device.eep != PENDING_EEP);

        // an already-learned device is treated as data even with the LRN
        // bit clear; only unknown or pending senders enter the learn path
        if !learned {
            if packet.is_teach_in() {
                self.handle_teach_in(packet, &sender_id, port).await;
            } else {
                info!(
                    "telegram from unknown device {sender_id} (rorg {:02x}, rssi {} dBm), not configured",
                    packet.rorg().unwrap_or(0),
                    rssi.unwrap_or(0),
                );
            }
            return;
        }

        self.handle_data(packet, &sender_id, rssi).await;
    }

    async fn handle_teach_in<T: TeachInPort + Send>(
        &mut self,
        packet: &Esp3Packet,
        sender_id: &str,
        port: &mut T,
    ) {
        let Some((func, ty)) = packet.teach_in_func_type() else {
            return;
        };
        let eep = packet.teach_in_eep().expect("teach-in frames carry an EEP");

        let Some(profile) = self.eep.get(&eep) else {
            warn!("teach-in from {sender_id} announces profile {eep}, which isn't in the library");
            return;
        };

        info!(
            "teach-in from {sender_id}: learning {eep} ({})",
            profile.type_title
        );
        let manufacturer = if profile.manufacturer.is_empty() {
            "EnOcean"
        } else {
            &profile.manufacturer
        };
        if let Err(e) = self
            .registry
            .add(sender_id, &profile.type_title, &eep, manufacturer)
            .await
        {
            warn!("couldn't store device {sender_id}: {e}");
            return;
        }

        let device = self
            .registry
            .get(sender_id)
            .cloned()
            .expect("device was just added");
        self.publish_discovery(&device).await;
        self.respond_teach_in(port, sender_id, func, ty).await;
    }

    async fn respond_teach_in<T: TeachInPort + Send>(
        &self,
        port: &mut T,
        sender_id: &str,
        func: u8,
        ty: u8,
    ) {
        let Some(destination) = parse_sender_id(sender_id) else {
            warn!("sender id {sender_id} isn't a valid address");
            return;
        };
        match port.send_teach_in_response(destination, func, ty).await {
            Ok(true) => info!("teach-in response sent to {sender_id}"),
            Ok(false) => {}
            Err(e) => warn!("failed to send teach-in response to {sender_id}: {e}"),
        }
    }

    async fn handle_data(&mut self, packet: &Esp3Packet, sender_id: &str, rssi: Option<i32>) {
        // count the contact before decoding; decode failures still prove
        // the device is alive
        self.registry.update_last_seen(sender_id, rssi);

        let device = self
            .registry
            .get(sender_id)
            .expect("known device checked by caller");
        let Some(profile) = self.eep.get(&device.eep) else {
            warn!(
                "device {sender_id} references profile {}, which isn't loaded",
                device.eep
            );
            return;
        };

        let mut state = match decode(&packet.data, &profile) {
            Ok(state) if state.is_empty() => {
                debug!("telegram from {sender_id} matched no case in {}", device.eep);
                return;
            }
            Ok(state) => state,
            Err(e) => {
                warn!("failed to decode telegram from {sender_id}: {e}");
                return;
            }
        };

        if let Some(rssi) = rssi {
            state.insert("rssi".to_string(), StateValue::Int(rssi as i64));
        }
        state.insert(
            "last_seen".to_string(),
            StateValue::Text(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        );
        debug!("decoded state from {sender_id}: {state:?}");

        if let Err(e) = self.states.save_state(sender_id, state.clone()).await {
            warn!("couldn't persist state for {sender_id}: {e}");
        }

        if !self.mqtt.is_connected() {
            debug!("MQTT not connected, state for {sender_id} kept for the next restore");
            return;
        }
        if let Err(e) = self.mqtt.publish_state(sender_id, &state).await {
            warn!("couldn't publish state for {sender_id}: {e}");
            return;
        }
        if let Err(e) = self.mqtt.publish_availability(sender_id, true).await {
            warn!("couldn't publish availability for {sender_id}: {e}");
        }
    }

    /// Admin-surface removal: clear the retained discovery configs and
    /// availability, drop the stored state, then delete the registry
    /// entry.
    pub async fn remove_device(&mut self, id: &str) -> Result<Device, RegistryError> {
        if let Some(device) = self.registry.get(id).cloned()
            && let Some(profile) = self.eep.get(&device.eep)
        {
            for (shortcut, meta) in profile.entities() {
                if let Err(e) = self.mqtt.remove_entity(id, &meta.component, &shortcut).await {
                    warn!("couldn't clear discovery for {id}/{shortcut}: {e}");
                }
            }
            if let Err(e) = self.mqtt.publish_availability(id, false).await {
                warn!("couldn't publish offline availability for {id}: {e}");
            }
        }
        if let Err(e) = self.states.remove(id).await {
            warn!("couldn't drop stored state for {id}: {e}");
        }
        self.registry.remove(id).await
    }

    /// Retained discovery configs plus `online` for one device.
    pub async fn publish_discovery(&self, device: &Device) {
        let Some(profile) = self.eep.get(&device.eep) else {
            warn!(
                "no profile {} for device {}, skipping discovery",
                device.eep, device.id
            );
            return;
        };
        for (shortcut, meta) in profile.entities() {
            if let Err(e) = self.mqtt.publish_discovery(device, &shortcut, &meta).await {
                warn!("couldn't publish discovery for {}/{shortcut}: {e}", device.id);
                return;
            }
        }
        if let Err(e) = self.mqtt.publish_availability(&device.id, true).await {
            warn!("couldn't publish availability for {}: {e}", device.id);
        }
    }
}

/// Republish stored states after a restart: one retained state and one
/// `online` per device. Returns how many devices were restored.
pub async fn restore_snapshot<P: StatePublisher + Sync>(
    snapshot: &[(String, StateMap)],
    mqtt: &P,
) -> usize {
    let mut restored = 0;
    for (device_id, state) in snapshot {
        if let Err(e) = mqtt.publish_state(device_id, state).await {
            warn!("couldn't restore state for {device_id}: {e}");
            continue;
        }
        if let Err(e) = mqtt.publish_availability(device_id, true).await {
            warn!("couldn't restore availability for {device_id}: {e}");
            continue;
        }
        restored += 1;
    }
    restored
}

#[cfg(test)]
mod tests {
    use super::*;
    use enbridge::eep::EepProfile;
    use enbridge::esp3::PacketType;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Published {
        Discovery { device_id: String, shortcut: String },
        State { device_id: String, state: StateMap },
        Availability { device_id: String, online: bool },
        Removed { device_id: String, shortcut: String },
    }

    #[derive(Clone)]
    struct RecordingPublisher {
        connected: bool,
        events: Arc<Mutex<Vec<Published>>>,
    }

    impl RecordingPublisher {
        fn new(connected: bool) -> Self {
            RecordingPublisher {
                connected,
                events: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn events(&self) -> Vec<Published> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatePublisher for RecordingPublisher {
        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn publish_discovery(
            &self,
            device: &Device,
            shortcut: &str,
            _meta: &enbridge::eep::EntityMeta,
        ) -> Result<(), rumqttc::ClientError> {
            self.events.lock().unwrap().push(Published::Discovery {
                device_id: device.id.clone(),
                shortcut: shortcut.to_string(),
            });
            Ok(())
        }

        async fn publish_state(
            &self,
            device_id: &str,
            state: &StateMap,
        ) -> Result<(), rumqttc::ClientError> {
            self.events.lock().unwrap().push(Published::State {
                device_id: device_id.to_string(),
                state: state.clone(),
            });
            Ok(())
        }

        async fn publish_availability(
            &self,
            device_id: &str,
            online: bool,
        ) -> Result<(), rumqttc::ClientError> {
            self.events.lock().unwrap().push(Published::Availability {
                device_id: device_id.to_string(),
                online,
            });
            Ok(())
        }

        async fn remove_entity(
            &self,
            device_id: &str,
            _component: &str,
            shortcut: &str,
        ) -> Result<(), rumqttc::ClientError> {
            self.events.lock().unwrap().push(Published::Removed {
                device_id: device_id.to_string(),
                shortcut: shortcut.to_string(),
            });
            Ok(())
        }
    }

    struct RecordingPort {
        responses: Vec<([u8; 4], u8, u8)>,
    }

    #[async_trait]
    impl TeachInPort for RecordingPort {
        async fn send_teach_in_response(
            &mut self,
            destination: [u8; 4],
            func: u8,
            ty: u8,
        ) -> Result<bool, TransportError> {
            self.responses.push((destination, func, ty));
            Ok(true)
        }
    }

    fn a5_02_05() -> EepProfile {
        serde_json::from_value(serde_json::json!({
            "eep": "A5-02-05",
            "rorg_number": "0xA5",
            "type_title": "Temperature Sensor",
            "manufacturer": "EnOcean",
            "objects": { "preDefined": ["TMP"] },
            "case": [{
                "datafield": [{
                    "shortcut": "TMP",
                    "bitoffs": 24,
                    "bitsize": 8,
                    "value": { "-": [40, { "*": [{ "var": "value" }, 0.3137254901960784] }] },
                    "decimals": 1,
                }],
            }],
        }))
        .unwrap()
    }

    fn f6_02_01() -> EepProfile {
        serde_json::from_value(serde_json::json!({
            "eep": "F6-02-01",
            "rorg_number": "0xF6",
            "type_title": "Rocker Switch",
            "objects": {
                "BI": { "name": "Rocker B1", "component": "binary_sensor" },
            },
            "case": [
                { "data": "0x30", "datafield": [{ "shortcut": "BI", "value": 1 }] },
                { "data": "0x00", "status": "0x20", "datafield": [{ "shortcut": "BI", "value": 0 }] },
            ],
        }))
        .unwrap()
    }

    async fn dispatcher(
        dir: &tempfile::TempDir,
        connected: bool,
    ) -> Dispatcher<RecordingPublisher> {
        let registry = DeviceRegistry::open(dir.path().join("devices.json"))
            .await
            .unwrap();
        let states = StateStore::open(dir.path().join("last_states.json"))
            .await
            .unwrap();
        Dispatcher::new(
            EepLibrary::from_profiles([a5_02_05(), f6_02_01()]),
            registry,
            states,
            RecordingPublisher::new(connected),
        )
    }

    fn teach_in_packet() -> Esp3Packet {
        Esp3Packet::new(
            PacketType::RadioErp1,
            vec![0xA5, 0x08, 0x28, 0x46, 0x80, 0x01, 0x94, 0xE0, 0xCB, 0x00],
            vec![0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0x3C, 0x00],
        )
    }

    fn temperature_packet() -> Esp3Packet {
        Esp3Packet::new(
            PacketType::RadioErp1,
            vec![0xA5, 0x00, 0x00, 0x55, 0x08, 0x01, 0x94, 0xE0, 0xCB, 0x00],
            vec![0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0x3C, 0x00],
        )
    }

    fn rps_packet(code: u8, status: u8) -> Esp3Packet {
        Esp3Packet::new(
            PacketType::RadioErp1,
            vec![0xF6, code, 0x00, 0x2A, 0x8B, 0xFD, status],
            vec![0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0x2E, 0x00],
        )
    }

    #[tokio::test]
    async fn test_auto_learn_adds_device_and_responds() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = dispatcher(&dir, true).await;
        let mut port = RecordingPort { responses: vec![] };

        dispatcher.handle_radio(&teach_in_packet(), &mut port).await;

        let device = dispatcher.registry.get("0194e0cb").expect("device learned");
        assert_eq!(device.eep, "A5-02-05");
        assert_eq!(device.name, "Temperature Sensor");
        assert!(device.enabled);
        assert_eq!(port.responses, vec![([0x01, 0x94, 0xE0, 0xCB], 0x02, 0x05)]);

        let events = dispatcher.mqtt.events();
        // discovery for TMP + the two synthetic entities, then online
        let discovery: Vec<&Published> = events
            .iter()
            .filter(|e| matches!(e, Published::Discovery { .. }))
            .collect();
        assert_eq!(discovery.len(), 3);
        assert!(events.contains(&Published::Availability {
            device_id: "0194e0cb".to_string(),
            online: true,
        }));
    }

    #[tokio::test]
    async fn test_learned_device_teach_in_frame_is_treated_as_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = dispatcher(&dir, true).await;
        let mut port = RecordingPort { responses: vec![] };

        // first teach-in learns the device and gets the one confirmation
        dispatcher.handle_radio(&teach_in_packet(), &mut port).await;
        assert_eq!(port.responses.len(), 1);
        let created = dispatcher.registry.get("0194e0cb").unwrap().created_at;
        dispatcher.mqtt.events.lock().unwrap().clear();

        // replayed LRN=0 frames bypass teach-in: no further responses, no
        // registry rewrite, decoded like any other telegram
        for _ in 0..3 {
            dispatcher.handle_radio(&teach_in_packet(), &mut port).await;
        }

        assert_eq!(port.responses.len(), 1);
        assert_eq!(dispatcher.registry.len(), 1);
        assert_eq!(dispatcher.registry.get("0194e0cb").unwrap().created_at, created);
        // DB1 = 0x46 = 70 -> 40 - 70 * 80/255 = 18.0, published as data
        let stored = dispatcher.states.get("0194e0cb").expect("decoded as data");
        assert_eq!(stored.get("TMP"), Some(&StateValue::Int(18)));
        assert!(dispatcher
            .mqtt
            .events()
            .iter()
            .any(|e| matches!(e, Published::State { device_id, .. } if device_id == "0194e0cb")));
    }

    #[tokio::test]
    async fn test_teach_in_for_unknown_profile_is_logged_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = dispatcher(&dir, true).await;
        let mut port = RecordingPort { responses: vec![] };

        // FUNC 0x3F TYPE 0x7F isn't in the library
        let packet = Esp3Packet::new(
            PacketType::RadioErp1,
            vec![0xA5, 0xFF, 0xFB, 0x46, 0x80, 0x01, 0x94, 0xE0, 0xCB, 0x00],
            vec![0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0x3C, 0x00],
        );
        dispatcher.handle_radio(&packet, &mut port).await;

        assert!(dispatcher.registry.is_empty());
        assert!(port.responses.is_empty());
        assert!(dispatcher.mqtt.events().is_empty());
    }

    #[tokio::test]
    async fn test_pending_device_is_filled_in_by_teach_in() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = dispatcher(&dir, true).await;
        dispatcher
            .registry
            .add("0194e0cb", "Device 0194e0cb", PENDING_EEP, "EnOcean")
            .await
            .unwrap();
        let mut port = RecordingPort { responses: vec![] };

        dispatcher.handle_radio(&teach_in_packet(), &mut port).await;

        let device = dispatcher.registry.get("0194e0cb").unwrap();
        assert_eq!(device.eep, "A5-02-05");
        assert_eq!(port.responses.len(), 1);
    }

    #[tokio::test]
    async fn test_data_telegram_decodes_persists_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = dispatcher(&dir, true).await;
        dispatcher
            .registry
            .add("0194e0cb", "Office sensor", "A5-02-05", "EnOcean")
            .await
            .unwrap();
        let mut port = RecordingPort { responses: vec![] };

        dispatcher.handle_radio(&temperature_packet(), &mut port).await;

        // no teach-in activity on a data frame
        assert!(port.responses.is_empty());

        let stored = dispatcher.states.get("0194e0cb").expect("state persisted");
        assert_eq!(stored.get("TMP"), Some(&StateValue::Float(13.3)));
        assert_eq!(stored.get("rssi"), Some(&StateValue::Int(-60)));
        assert!(matches!(stored.get("last_seen"), Some(StateValue::Text(_))));

        let events = dispatcher.mqtt.events();
        assert!(matches!(
            &events[0],
            Published::State { device_id, state }
                if device_id == "0194e0cb" && state.get("TMP") == Some(&StateValue::Float(13.3))
        ));
        assert_eq!(
            events[1],
            Published::Availability {
                device_id: "0194e0cb".to_string(),
                online: true,
            }
        );

        let device = dispatcher.registry.get("0194e0cb").unwrap();
        assert_eq!(device.rssi, Some(-60));
        assert!(device.last_seen.is_some());
    }

    #[tokio::test]
    async fn test_rps_press_then_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = dispatcher(&dir, true).await;
        dispatcher
            .registry
            .add("002a8bfd", "Hall switch", "F6-02-01", "EnOcean")
            .await
            .unwrap();
        let mut port = RecordingPort { responses: vec![] };

        dispatcher.handle_radio(&rps_packet(0x30, 0x30), &mut port).await;
        dispatcher.handle_radio(&rps_packet(0x00, 0x20), &mut port).await;

        let states: Vec<StateValue> = dispatcher
            .mqtt
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Published::State { state, .. } => state.get("BI").cloned(),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![StateValue::Int(1), StateValue::Int(0)]);
    }

    #[tokio::test]
    async fn test_unknown_device_produces_no_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = dispatcher(&dir, true).await;
        let mut port = RecordingPort { responses: vec![] };

        let packet = Esp3Packet::new(
            PacketType::RadioErp1,
            vec![0xF6, 0x30, 0xAA, 0xBB, 0xCC, 0xDD, 0x30],
            vec![0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0x2E, 0x00],
        );
        dispatcher.handle_radio(&packet, &mut port).await;

        assert!(dispatcher.mqtt.events().is_empty());
        assert!(dispatcher.registry.is_empty());
        assert!(dispatcher.states.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_device_never_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = dispatcher(&dir, true).await;
        dispatcher
            .registry
            .add("0194e0cb", "Office sensor", "A5-02-05", "EnOcean")
            .await
            .unwrap();
        dispatcher
            .registry
            .update(
                "0194e0cb",
                enbridge::devices::DeviceUpdate {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let mut port = RecordingPort { responses: vec![] };

        dispatcher.handle_radio(&temperature_packet(), &mut port).await;
        dispatcher.handle_radio(&teach_in_packet(), &mut port).await;

        assert!(dispatcher.mqtt.events().is_empty());
        assert!(port.responses.is_empty());
        assert!(dispatcher.states.is_empty());
        // last seen isn't refreshed either, the telegrams were dropped
        assert!(dispatcher.registry.get("0194e0cb").unwrap().last_seen.is_none());
    }

    #[tokio::test]
    async fn test_no_case_match_still_updates_last_seen() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = dispatcher(&dir, true).await;
        dispatcher
            .registry
            .add("002a8bfd", "Hall switch", "F6-02-01", "EnOcean")
            .await
            .unwrap();
        let mut port = RecordingPort { responses: vec![] };

        // data byte 0x70 matches no case of the profile
        dispatcher.handle_radio(&rps_packet(0x70, 0x30), &mut port).await;

        assert!(dispatcher.mqtt.events().is_empty());
        assert!(dispatcher.states.is_empty());
        assert!(dispatcher.registry.get("002a8bfd").unwrap().last_seen.is_some());
    }

    #[tokio::test]
    async fn test_remove_device_clears_entities_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = dispatcher(&dir, true).await;
        dispatcher
            .registry
            .add("0194e0cb", "Office sensor", "A5-02-05", "EnOcean")
            .await
            .unwrap();
        let mut port = RecordingPort { responses: vec![] };
        dispatcher.handle_radio(&temperature_packet(), &mut port).await;

        dispatcher.remove_device("0194e0cb").await.unwrap();

        assert!(dispatcher.registry.is_empty());
        assert!(dispatcher.states.is_empty());
        let events = dispatcher.mqtt.events();
        let removed: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                Published::Removed { shortcut, .. } => Some(shortcut.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(removed, ["TMP", "rssi", "last_seen"]);
        assert!(events.contains(&Published::Availability {
            device_id: "0194e0cb".to_string(),
            online: false,
        }));
        assert!(matches!(
            dispatcher.remove_device("0194e0cb").await,
            Err(RegistryError::NoSuchDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_restore_snapshot_publishes_state_and_availability() {
        let publisher = RecordingPublisher::new(true);
        let mut state = StateMap::new();
        state.insert("TMP".to_string(), StateValue::Float(13.3));
        let snapshot = vec![
            ("0194e0cb".to_string(), state.clone()),
            ("002a8bfd".to_string(), state),
        ];

        let restored = restore_snapshot(&snapshot, &publisher).await;

        assert_eq!(restored, 2);
        let events = publisher.events();
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], Published::State { device_id, .. } if device_id == "0194e0cb"));
        assert_eq!(
            events[1],
            Published::Availability {
                device_id: "0194e0cb".to_string(),
                online: true,
            }
        );
        assert!(matches!(&events[2], Published::State { device_id, .. } if device_id == "002a8bfd"));
    }

    #[tokio::test]
    async fn test_broker_down_still_persists_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = dispatcher(&dir, false).await;
        dispatcher
            .registry
            .add("0194e0cb", "Office sensor", "A5-02-05", "EnOcean")
            .await
            .unwrap();
        let mut port = RecordingPort { responses: vec![] };

        dispatcher.handle_radio(&temperature_packet(), &mut port).await;

        assert!(dispatcher.mqtt.events().is_empty());
        assert!(dispatcher.states.get("0194e0cb").is_some());
    }
}
