//! Profile-driven decoding of radio telegrams.
//!
//! The input is the raw RADIO_ERP1 data slice, RORG at index 0, sender id
//! and status at the tail. A profile contributes an ordered list of cases
//! (guarded on the telegram's data value and status byte) whose datafields
//! either extract bitfields or pass literal values through. Extracted
//! values run through a small formula tree evaluated with IEEE-754 doubles.

use std::collections::BTreeMap;

use bytes::Buf;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;

use crate::esp3::Rorg;

use super::profile::{Datafield, EepProfile, ProfileCase, json_to_u64};

/// A decoded datapoint. Serializes untagged, so the published state map is
/// plain JSON scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Decoded state keyed by shortcut; ordered so the published JSON is
/// stable across runs.
pub type StateMap = BTreeMap<String, StateValue>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("telegram too short to decode ({len} bytes)")]
    TooShort { len: usize },
    #[error("datafield {shortcut} outside the telegram (bitoffs {bitoffs}, bitsize {bitsize})")]
    FieldOutOfRange {
        shortcut: String,
        bitoffs: u32,
        bitsize: u32,
    },
}

/// Decode a telegram against a profile. An empty map means no case
/// matched; the caller drops the telegram but still counts the contact.
pub fn decode(data: &[u8], profile: &EepProfile) -> Result<StateMap, DecodeError> {
    if data.len() < 2 {
        return Err(DecodeError::TooShort { len: data.len() });
    }
    let rorg = data[0];
    let status = data[data.len() - 1];

    // RPS and 1BS carry a single data byte; everything else, 4BS included,
    // guards on the big-endian word of DB3..DB0
    let raw: u64 = match Rorg::try_from(rorg) {
        Ok(Rorg::Rps) | Ok(Rorg::Bs1) => data[1] as u64,
        _ => {
            if data.len() < 5 {
                return Err(DecodeError::TooShort { len: data.len() });
            }
            (&data[1..5]).get_u32() as u64
        }
    };

    let Some(matched) = select_case(profile, raw, status) else {
        debug!(
            "no case in {} matches data {raw:#x} status {status:#04x}",
            profile.eep
        );
        return Ok(StateMap::new());
    };

    let mut state = StateMap::new();
    for field in &matched.datafield {
        if let Some(value) = decode_field(field, data)? {
            state.insert(field.shortcut.clone(), value);
        }
    }
    Ok(state)
}

/// First case whose declared guards all hold, in declaration order. A case
/// without guards matches unconditionally.
fn select_case<'a>(profile: &'a EepProfile, raw: u64, status: u8) -> Option<&'a ProfileCase> {
    profile.cases.iter().find(|case| {
        case.data
            .as_ref()
            .is_none_or(|guard| json_to_u64(guard) == Some(raw))
            && case
                .status
                .as_ref()
                .is_none_or(|guard| json_to_u64(guard) == Some(status as u64))
    })
}

fn decode_field(field: &Datafield, data: &[u8]) -> Result<Option<StateValue>, DecodeError> {
    let (Some(bitoffs), Some(bitsize)) = (field.bitoffs, field.bitsize) else {
        // a categorical value declared directly on the case
        return Ok(field.value.as_ref().map(literal_value));
    };

    let mut raw = extract_bits(data, bitoffs, bitsize).ok_or(DecodeError::FieldOutOfRange {
        shortcut: field.shortcut.clone(),
        bitoffs,
        bitsize,
    })?;
    if field.invert && bitsize == 1 {
        raw ^= 1;
    }

    let Some(formula) = &field.value else {
        return Ok(Some(StateValue::Int(raw as i64)));
    };
    let value = match eval_formula(formula, raw as f64) {
        Evaluated::Text(text) => StateValue::Text(text),
        Evaluated::Num(mut number) => {
            if let Some(decimals) = field.decimals {
                number = round_to(number, decimals);
            }
            if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
                StateValue::Int(number as i64)
            } else {
                StateValue::Float(number)
            }
        }
    };
    Ok(Some(value))
}

/// Extract an unsigned bitfield from the telegram viewed as a big-endian
/// bitstream: bit 0 is the most significant bit of byte 0.
pub fn extract_bits(data: &[u8], bitoffs: u32, bitsize: u32) -> Option<u64> {
    if bitsize == 0 || bitsize > 64 {
        return None;
    }
    let end = bitoffs.checked_add(bitsize)?;
    if end as usize > data.len() * 8 {
        return None;
    }
    let mut out = 0u64;
    for bit in bitoffs..end {
        let byte = data[(bit / 8) as usize];
        out = (out << 1) | ((byte >> (7 - bit % 8)) & 1) as u64;
    }
    Some(out)
}

enum Evaluated {
    Num(f64),
    Text(String),
}

/// Walk a formula tree with the raw field value bound to `value`. Unknown
/// operators yield the raw value unchanged; the upstream profile source
/// occasionally carries shapes this evaluator doesn't know, and forward
/// compatibility beats strictness there.
fn eval_formula(node: &Json, raw: f64) -> Evaluated {
    match node {
        Json::Number(n) => Evaluated::Num(n.as_f64().unwrap_or(raw)),
        Json::String(s) => Evaluated::Text(s.clone()),
        Json::Object(map) => {
            if map.contains_key("var") {
                // the only binding profiles use is the raw field value
                return Evaluated::Num(raw);
            }
            let arg_nums = |key: &str| -> Option<Vec<f64>> {
                map.get(key)?
                    .as_array()
                    .map(|args| args.iter().map(|arg| eval_num(arg, raw)).collect())
            };
            if let Some(args) = arg_nums("+") {
                return Evaluated::Num(args.iter().sum());
            }
            if let Some(args) = arg_nums("*") {
                return Evaluated::Num(args.iter().product());
            }
            if let Some(args) = arg_nums("-")
                && let [a, b] = args[..]
            {
                return Evaluated::Num(a - b);
            }
            if let Some(args) = arg_nums("==")
                && let [a, b] = args[..]
            {
                return Evaluated::Num(if a == b { 1.0 } else { 0.0 });
            }
            if let Some(args) = map.get("if").and_then(Json::as_array)
                && let [cond, then_branch, else_branch] = &args[..]
            {
                let branch = if eval_num(cond, raw) != 0.0 {
                    then_branch
                } else {
                    else_branch
                };
                return eval_formula(branch, raw);
            }
            Evaluated::Num(raw)
        }
        _ => Evaluated::Num(raw),
    }
}

fn eval_num(node: &Json, raw: f64) -> f64 {
    match eval_formula(node, raw) {
        Evaluated::Num(number) => number,
        Evaluated::Text(_) => raw,
    }
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Literal case values pass through as declared; the upstream files
/// sometimes quote numbers, so numeric strings are normalized.
fn literal_value(value: &Json) -> StateValue {
    match value {
        Json::Bool(b) => StateValue::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => StateValue::Int(i),
            None => StateValue::Float(n.as_f64().unwrap_or(0.0)),
        },
        Json::String(s) => {
            if let Ok(i) = s.parse::<i64>() {
                StateValue::Int(i)
            } else if let Ok(x) = s.parse::<f64>() {
                StateValue::Float(x)
            } else {
                StateValue::Text(s.clone())
            }
        }
        other => StateValue::Text(other.to_string()),
    }
}
