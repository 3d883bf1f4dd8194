//! Gateway link: packet I/O on a transport plus the single-slot
//! command/response exchange and the cached gateway identity.
//!
//! Commands produce exactly one RESPONSE packet. There is no pipelining:
//! the caller writes a command and reads until the first RESPONSE shows up,
//! forwarding any radio telegrams that arrive in between.

use std::time::Duration;

use deku::prelude::*;
use log::{debug, info, warn};
use tokio::time::{Instant, sleep};

use crate::esp3::{BaseIdResponse, Esp3Packet, PacketType, VersionInfo, VersionResponse};
use crate::framer::{Framer, FramerError};
use crate::transport::{Transport, TransportError};

pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long an emulated rocker press is held before the release telegram.
const PRESS_DURATION: Duration = Duration::from_millis(100);

/// Outcome of a command exchange. Radio telegrams that arrived while
/// waiting are handed back so the caller can dispatch them normally.
pub struct CommandExchange {
    pub response: Option<Esp3Packet>,
    pub radio: Vec<Esp3Packet>,
}

pub struct GatewayLink {
    transport: Transport,
    framer: Framer,
    base_id: Option<[u8; 4]>,
    version: Option<VersionInfo>,
}

impl GatewayLink {
    pub fn new(transport: Transport) -> Self {
        GatewayLink {
            transport,
            framer: Framer::new(),
            base_id: None,
            version: None,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    /// The gateway's 32-bit base address, once fetched. Used as the source
    /// of every telegram this bridge originates.
    pub fn base_id(&self) -> Option<[u8; 4]> {
        self.base_id
    }

    pub fn version(&self) -> Option<&VersionInfo> {
        self.version.as_ref()
    }

    /// (Re)open the transport and discard whatever accumulated while the
    /// link was down.
    pub async fn reopen(&mut self) -> Result<(), TransportError> {
        self.framer.reset();
        self.transport.open().await?;
        self.transport.flush_input().await;
        Ok(())
    }

    pub async fn read_packet(&mut self) -> Result<Option<Esp3Packet>, FramerError> {
        self.framer.read_packet(&mut self.transport).await
    }

    pub async fn send(&mut self, packet: &Esp3Packet) -> Result<(), TransportError> {
        self.transport.write_all(&packet.frame()).await
    }

    /// Write a command and wait for its RESPONSE for up to `timeout`.
    pub async fn command(
        &mut self,
        packet: &Esp3Packet,
        timeout: Duration,
    ) -> Result<CommandExchange, TransportError> {
        self.send(packet).await?;
        let deadline = Instant::now() + timeout;
        let mut radio = Vec::new();
        while Instant::now() < deadline {
            match self.read_packet().await {
                Ok(Some(packet)) if packet.packet_type == PacketType::Response => {
                    return Ok(CommandExchange {
                        response: Some(packet),
                        radio,
                    });
                }
                Ok(Some(packet)) if packet.packet_type == PacketType::RadioErp1 => {
                    radio.push(packet);
                }
                Ok(Some(packet)) => {
                    debug!(
                        "ignoring {:?} packet while waiting for a response",
                        packet.packet_type
                    );
                }
                Ok(None) => {}
                Err(FramerError::Transport(e)) => return Err(e),
                Err(e) => warn!("framing error while waiting for a response: {e}"),
            }
        }
        debug!("no response within {timeout:?}");
        Ok(CommandExchange {
            response: None,
            radio,
        })
    }

    /// Fetch and cache the base id via CO_RD_IDBASE. Returns the id (if
    /// any) and the radio telegrams that arrived during the exchange.
    pub async fn fetch_base_id(
        &mut self,
    ) -> Result<(Option<[u8; 4]>, Vec<Esp3Packet>), TransportError> {
        if self.base_id.is_some() {
            return Ok((self.base_id, Vec::new()));
        }
        let exchange = self
            .command(&Esp3Packet::read_base_id(), RESPONSE_TIMEOUT)
            .await?;
        if let Some(response) = &exchange.response {
            match BaseIdResponse::from_bytes((&response.data, 0)) {
                Ok((_, parsed)) if parsed.return_code == 0 => {
                    info!("gateway base id {}", hex::encode(parsed.base_id));
                    self.base_id = Some(parsed.base_id);
                }
                Ok((_, parsed)) => {
                    warn!("CO_RD_IDBASE failed with return code {}", parsed.return_code)
                }
                Err(e) => warn!("malformed CO_RD_IDBASE response: {e}"),
            }
        }
        Ok((self.base_id, exchange.radio))
    }

    /// Fetch and cache version info via CO_RD_VERSION.
    pub async fn fetch_version(
        &mut self,
    ) -> Result<(Option<VersionInfo>, Vec<Esp3Packet>), TransportError> {
        if self.version.is_some() {
            return Ok((self.version.clone(), Vec::new()));
        }
        let exchange = self
            .command(&Esp3Packet::read_version(), RESPONSE_TIMEOUT)
            .await?;
        if let Some(response) = &exchange.response {
            match VersionResponse::from_bytes((&response.data, 0)) {
                Ok((_, parsed)) if parsed.return_code == 0 => {
                    let info = VersionInfo::from(&parsed);
                    info!(
                        "gateway app version {}, chip id {}",
                        info.app_version, info.chip_id
                    );
                    self.version = Some(info);
                }
                Ok((_, parsed)) => {
                    warn!("CO_RD_VERSION failed with return code {}", parsed.return_code)
                }
                Err(e) => warn!("malformed CO_RD_VERSION response: {e}"),
            }
        }
        Ok((self.version.clone(), exchange.radio))
    }

    /// Liveness probe: a READ_VERSION any healthy gateway answers.
    pub async fn send_ping(&mut self) -> Result<(), TransportError> {
        debug!("link idle, sending CO_RD_VERSION keepalive probe");
        self.send(&Esp3Packet::read_version()).await
    }

    /// Emulate a rocker press and release as paired F6 telegrams, sourced
    /// from the gateway base id. Returns false when the base id isn't
    /// known yet.
    pub async fn send_rps_command(
        &mut self,
        destination: [u8; 4],
        button_code: u8,
    ) -> Result<bool, TransportError> {
        let Some(base_id) = self.base_id else {
            warn!("can't send button command, gateway base id unknown");
            return Ok(false);
        };
        self.send(&Esp3Packet::rps_button(base_id, destination, button_code, true))
            .await?;
        sleep(PRESS_DURATION).await;
        self.send(&Esp3Packet::rps_button(base_id, destination, button_code, false))
            .await?;
        Ok(true)
    }
}
