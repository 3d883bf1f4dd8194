//! Serde model of the EEP definition files.
//!
//! The files come from an upstream converter and are heterogeneous: numeric
//! fields appear both as hex strings (`"0xA5"`) and as plain numbers, and
//! the `objects` map can carry a `preDefined` list of well-known shortcuts
//! next to fully spelled-out entity definitions. The model keeps the loose
//! spots as raw JSON and normalizes on access.

use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Home-Assistant-facing metadata for one published datapoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EntityMeta {
    pub name: Option<String>,
    #[serde(default = "default_component")]
    pub component: String,
    pub device_class: Option<String>,
    pub unit: Option<String>,
    pub icon: Option<String>,
    pub state_class: Option<String>,
    pub description: Option<String>,
}

fn default_component() -> String {
    "sensor".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Datafield {
    pub shortcut: String,
    pub bitoffs: Option<u32>,
    pub bitsize: Option<u32>,
    #[serde(default)]
    pub invert: bool,
    pub value: Option<Json>,
    pub decimals: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileCase {
    /// Guard on the telegram's data value, hex string or number.
    pub data: Option<Json>,
    /// Guard on the telegram's status byte.
    pub status: Option<Json>,
    #[serde(default)]
    pub datafield: Vec<Datafield>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EepProfile {
    pub eep: String,
    rorg_number: Option<Json>,
    #[serde(default)]
    pub func_number: Option<Json>,
    #[serde(default)]
    pub type_number: Option<Json>,
    #[serde(default)]
    pub type_title: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default)]
    objects: BTreeMap<String, Json>,
    #[serde(default, rename = "case")]
    pub cases: Vec<ProfileCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileSummary {
    pub eep: String,
    pub title: String,
    pub manufacturer: String,
    pub rorg: Option<u8>,
}

impl EepProfile {
    pub fn rorg(&self) -> Option<u8> {
        self.rorg_number
            .as_ref()
            .and_then(json_to_u64)
            .and_then(|v| u8::try_from(v).ok())
    }

    pub fn summary(&self) -> ProfileSummary {
        ProfileSummary {
            eep: self.eep.clone(),
            title: self.type_title.clone(),
            manufacturer: self.manufacturer.clone(),
            rorg: self.rorg(),
        }
    }

    /// All published entities: the declared objects (with `preDefined`
    /// aliases expanded from the built-in table) plus the synthetic `rssi`
    /// and `last_seen` every device gets.
    pub fn entities(&self) -> Vec<(String, EntityMeta)> {
        let mut entities = Vec::new();
        for (shortcut, raw) in &self.objects {
            if shortcut == "preDefined" {
                let Some(names) = raw.as_array() else {
                    warn!("profile {}: preDefined is not a list", self.eep);
                    continue;
                };
                for name in names.iter().filter_map(Json::as_str) {
                    entities.push((name.to_string(), predefined_entity(name)));
                }
                continue;
            }
            match serde_json::from_value::<EntityMeta>(raw.clone()) {
                Ok(meta) => entities.push((shortcut.clone(), meta)),
                Err(e) => warn!("profile {}: bad entity {shortcut}: {e}", self.eep),
            }
        }
        entities.push(("rssi".to_string(), rssi_entity()));
        entities.push(("last_seen".to_string(), last_seen_entity()));
        entities
    }
}

/// Parse the loose numeric values the definition files use: JSON numbers
/// pass through, strings are hex (an optional `0x` prefix is tolerated).
pub(crate) fn json_to_u64(value: &Json) -> Option<u64> {
    match value {
        Json::Number(n) => n.as_u64(),
        Json::String(s) => {
            let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
            u64::from_str_radix(digits, 16).ok()
        }
        _ => None,
    }
}

fn entity(
    name: &str,
    component: &str,
    device_class: Option<&str>,
    unit: Option<&str>,
    state_class: Option<&str>,
) -> EntityMeta {
    EntityMeta {
        name: Some(name.to_string()),
        component: component.to_string(),
        device_class: device_class.map(str::to_string),
        unit: unit.map(str::to_string),
        icon: None,
        state_class: state_class.map(str::to_string),
        description: None,
    }
}

/// The well-known shortcuts the upstream profile source abbreviates.
/// Anything unlisted falls back to a plain sensor named after the shortcut.
fn predefined_entity(shortcut: &str) -> EntityMeta {
    match shortcut {
        "TMP" => entity("Temperature", "sensor", Some("temperature"), Some("°C"), Some("measurement")),
        "HUM" => entity("Humidity", "sensor", Some("humidity"), Some("%"), Some("measurement")),
        "ILL" => entity("Illuminance", "sensor", Some("illuminance"), Some("lx"), Some("measurement")),
        "CO2" => entity("CO2", "sensor", Some("carbon_dioxide"), Some("ppm"), Some("measurement")),
        "SP" => entity("Set point", "sensor", None, None, None),
        "PIR" => entity("Motion", "binary_sensor", Some("motion"), None, None),
        "OCC" => entity("Occupancy", "binary_sensor", Some("occupancy"), None, None),
        "CO" => entity("Contact", "binary_sensor", Some("opening"), None, None),
        "BAT" => entity("Battery low", "binary_sensor", Some("battery"), None, None),
        other => entity(other, "sensor", None, None, None),
    }
}

fn rssi_entity() -> EntityMeta {
    entity("RSSI", "sensor", Some("signal_strength"), Some("dBm"), Some("measurement"))
}

fn last_seen_entity() -> EntityMeta {
    entity("Last seen", "sensor", Some("timestamp"), None, None)
}
