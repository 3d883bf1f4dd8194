//! ESP3 packet model and serialization.
//!
//! An ESP3 frame on the wire is the sync byte 0x55, a four-byte header
//! `[data_len (u16 BE), opt_len, packet_type]` followed by a CRC8 over those
//! four bytes, then the data and optional sections followed by a CRC8 over
//! both. The full protocol is specified in EnOcean's "Serial Protocol 3"
//! document; only the subset a bridge needs is modeled here.

use crc::{Algorithm, Crc};
use deku::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const SYNC_BYTE: u8 = 0x55;

/// CRC8 as used by ESP3: polynomial 0x07, zero init, no reflection, no
/// final XOR.
pub const CRC8_ESP3_ALG: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x07,
    init: 0x00,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xf4,
    residue: 0x00,
};

pub const CRC8_ESP3: Crc<u8> = Crc::<u8>::new(&CRC8_ESP3_ALG);

// Common commands understood by every ESP3 gateway module.
pub const CO_RD_VERSION: u8 = 0x03;
pub const CO_RD_IDBASE: u8 = 0x08;

/// 4BS teach-in response DB0: EEP supported, sender id stored, teach-in
/// response bits set.
const TEACH_IN_RESPONSE_DB0: u8 = 0xF0;

// Outbound telegrams request 3 subtelegrams and carry 0xFF as the send dBm.
const SUBTEL_SEND: u8 = 0x03;
const DBM_SEND: u8 = 0xFF;

/// RPS status nibbles for T2-style rocker telegrams.
const RPS_STATUS_PRESSED: u8 = 0x30;
const RPS_STATUS_RELEASED: u8 = 0x20;

pub const BROADCAST_ID: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    RadioErp1 = 0x01,
    Response = 0x02,
    RadioSubTel = 0x03,
    Event = 0x04,
    CommonCommand = 0x05,
    SmartAck = 0x06,
    RemoteMan = 0x07,
}

/// Radio telegram families (the first data byte of a RADIO_ERP1 packet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Rorg {
    Rps = 0xF6,
    Bs1 = 0xD5,
    Bs4 = 0xA5,
    Vld = 0xD2,
    Msc = 0xD1,
    Ute = 0xD4,
}

/// The four header bytes after the sync byte, plus their CRC.
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct FrameHeader {
    pub data_len: u16,
    pub opt_len: u8,
    pub packet_type: u8,
    pub crc8h: u8,
}

/// Response payload of CO_RD_IDBASE.
#[derive(Debug, Clone, PartialEq, DekuRead)]
pub struct BaseIdResponse {
    pub return_code: u8,
    pub base_id: [u8; 4],
}

/// Response payload of CO_RD_VERSION.
#[derive(Debug, Clone, PartialEq, DekuRead)]
pub struct VersionResponse {
    pub return_code: u8,
    pub app_version: [u8; 4],
    pub api_version: [u8; 4],
    pub chip_id: [u8; 4],
    pub chip_version: [u8; 4],
    pub app_description: [u8; 16],
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionInfo {
    pub app_version: String,
    pub chip_id: String,
}

impl From<&VersionResponse> for VersionInfo {
    fn from(response: &VersionResponse) -> Self {
        VersionInfo {
            app_version: response
                .app_version
                .iter()
                .map(|b| b.to_string())
                .collect::<Vec<_>>()
                .join("."),
            chip_id: hex::encode(response.chip_id),
        }
    }
}

/// A CRC-checked ESP3 packet. For RADIO_ERP1 the data section is
/// `[RORG, payload.., sender_id(4), status]` and the optional section is
/// `[subtel_num, destination_id(4), dBm, security_level]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Esp3Packet {
    pub packet_type: PacketType,
    pub data: Vec<u8>,
    pub optional: Vec<u8>,
}

impl Esp3Packet {
    pub fn new(packet_type: PacketType, data: Vec<u8>, optional: Vec<u8>) -> Self {
        Esp3Packet {
            packet_type,
            data,
            optional,
        }
    }

    pub fn common_command(command: u8) -> Self {
        Esp3Packet::new(PacketType::CommonCommand, vec![command], Vec::new())
    }

    pub fn read_base_id() -> Self {
        Esp3Packet::common_command(CO_RD_IDBASE)
    }

    pub fn read_version() -> Self {
        Esp3Packet::common_command(CO_RD_VERSION)
    }

    /// A generic outbound radio telegram with addressed optional data.
    pub fn radio_erp1(src: [u8; 4], dst: [u8; 4], rorg: u8, payload: &[u8], status: u8) -> Self {
        let mut data = Vec::with_capacity(payload.len() + 6);
        data.push(rorg);
        data.extend_from_slice(payload);
        data.extend_from_slice(&src);
        data.push(status);
        let mut optional = Vec::with_capacity(7);
        optional.push(SUBTEL_SEND);
        optional.extend_from_slice(&dst);
        optional.push(DBM_SEND);
        optional.push(0x00);
        Esp3Packet::new(PacketType::RadioErp1, data, optional)
    }

    /// An F6 button telegram emulating a rocker press or release.
    pub fn rps_button(src: [u8; 4], dst: [u8; 4], button_code: u8, pressed: bool) -> Self {
        let (code, status) = if pressed {
            (button_code, RPS_STATUS_PRESSED)
        } else {
            (0x00, RPS_STATUS_RELEASED)
        };
        Esp3Packet::radio_erp1(src, dst, Rorg::Rps.into(), &[code], status)
    }

    /// The reply confirming an accepted 4BS teach-in, so the peer device
    /// leaves learn mode. DB3/DB2 echo the learned FUNC and TYPE.
    pub fn teach_in_response(src: [u8; 4], dst: [u8; 4], func: u8, ty: u8) -> Self {
        let db3 = (func << 2) | (ty >> 5);
        let db2 = (ty & 0x1F) << 3;
        Esp3Packet::radio_erp1(
            src,
            dst,
            Rorg::Bs4.into(),
            &[db3, db2, 0x00, TEACH_IN_RESPONSE_DB0],
            0x00,
        )
    }

    /// Serialize the packet as a wire frame, sync byte and CRCs included.
    pub fn frame(&self) -> Vec<u8> {
        let header = FrameHeader {
            data_len: self.data.len() as u16,
            opt_len: self.optional.len() as u8,
            packet_type: self.packet_type.into(),
            crc8h: 0,
        };
        let mut header_bytes = header.to_bytes().expect("fixed-size header serializes");
        header_bytes[4] = CRC8_ESP3.checksum(&header_bytes[..4]);

        let mut frame = Vec::with_capacity(7 + self.data.len() + self.optional.len());
        frame.push(SYNC_BYTE);
        frame.extend_from_slice(&header_bytes);
        frame.extend_from_slice(&self.data);
        frame.extend_from_slice(&self.optional);
        let mut digest = CRC8_ESP3.digest();
        digest.update(&self.data);
        digest.update(&self.optional);
        frame.push(digest.finalize());
        frame
    }

    /// Lowercase hex sender id of a radio telegram.
    pub fn sender_id(&self) -> Option<String> {
        if self.packet_type != PacketType::RadioErp1 || self.data.len() < 6 {
            return None;
        }
        let tail = self.data.len() - 1;
        Some(hex::encode(&self.data[tail - 4..tail]))
    }

    pub fn rorg(&self) -> Option<u8> {
        if self.packet_type != PacketType::RadioErp1 {
            return None;
        }
        self.data.first().copied()
    }

    pub fn status(&self) -> Option<u8> {
        if self.packet_type != PacketType::RadioErp1 {
            return None;
        }
        self.data.last().copied()
    }

    /// Signal strength in dBm (negative), from the sixth optional byte.
    pub fn rssi_dbm(&self) -> Option<i32> {
        if self.packet_type != PacketType::RadioErp1 || self.optional.len() < 6 {
            return None;
        }
        Some(-(self.optional[5] as i32))
    }

    /// 4BS learn bit: DB0.3 cleared marks a teach-in frame.
    pub fn is_teach_in(&self) -> bool {
        self.rorg() == Some(Rorg::Bs4.into())
            && self.data.len() >= 10
            && (self.data[4] >> 3) & 1 == 0
    }

    /// FUNC (6 bits) and TYPE (7 bits) announced by a 4BS teach-in frame.
    pub fn teach_in_func_type(&self) -> Option<(u8, u8)> {
        if !self.is_teach_in() {
            return None;
        }
        let db3 = self.data[1];
        let db2 = self.data[2];
        let func = (db3 >> 2) & 0x3F;
        let ty = ((db3 & 0x03) << 5) | ((db2 >> 3) & 0x1F);
        Some((func, ty))
    }

    /// The EEP code announced by a 4BS teach-in frame, e.g. `A5-02-05`.
    pub fn teach_in_eep(&self) -> Option<String> {
        self.teach_in_func_type()
            .map(|(func, ty)| format!("A5-{func:02X}-{ty:02X}"))
    }
}

/// Parse an 8-char hex sender id back into address bytes.
pub fn parse_sender_id(id: &str) -> Option<[u8; 4]> {
    let bytes = hex::decode(id).ok()?;
    bytes.try_into().ok()
}
