//! The gateway read loop: one task owns the transport end-to-end and
//! drives framing, keepalive probing and reconnects.

use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use enbridge::esp3::PacketType;
use enbridge::framer::FramerError;
use enbridge::gateway::GatewayLink;

use crate::dispatch::Dispatcher;
use crate::mqtt::StatePublisher;

pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// What the loop should do about an idle link.
#[derive(Debug, PartialEq, Eq)]
enum IdleAction {
    Wait,
    Ping,
    Dead,
}

/// Keepalive policy: probe after `PING_INTERVAL` of silence, at most one
/// outstanding probe per `PING_TIMEOUT` window, declare the link dead when
/// the probe window passes without any byte arriving.
fn idle_action(idle: Duration, since_last_ping: Option<Duration>) -> IdleAction {
    if idle > PING_INTERVAL + PING_TIMEOUT {
        IdleAction::Dead
    } else if idle > PING_INTERVAL && since_last_ping.is_none_or(|t| t >= PING_TIMEOUT) {
        IdleAction::Ping
    } else {
        IdleAction::Wait
    }
}

pub fn run_supervisor<P: StatePublisher + Send + Sync + 'static>(
    task_tracker: &TaskTracker,
    mut link: GatewayLink,
    mut dispatcher: Dispatcher<P>,
    shutdown: CancellationToken,
) {
    task_tracker.spawn(async move {
        let mut last_ping: Option<Instant> = None;
        info!("listening for EnOcean telegrams");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if !link.transport().is_open() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(RECONNECT_DELAY) => {}
                }
                match link.reopen().await {
                    Ok(()) => {
                        info!("gateway connection established");
                        last_ping = None;
                        fetch_identity(&mut link, &mut dispatcher).await;
                    }
                    Err(e) => warn!("reconnect failed: {e}"),
                }
                continue;
            }

            // a busy or babbling link can keep the framer reading past a
            // single budget, so the read itself races the shutdown signal
            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = link.read_packet() => read,
            };
            match read {
                Ok(Some(packet)) => {
                    last_ping = None;
                    match packet.packet_type {
                        PacketType::RadioErp1 => {
                            dispatcher.handle_radio(&packet, &mut link).await;
                        }
                        PacketType::Response => {
                            debug!("response outside a command exchange (keepalive reply)");
                        }
                        other => debug!("ignoring {other:?} packet"),
                    }
                }
                Ok(None) => {
                    match idle_action(
                        link.transport().idle(),
                        last_ping.map(|at| at.elapsed()),
                    ) {
                        IdleAction::Wait => {}
                        IdleAction::Ping => {
                            if let Err(e) = link.send_ping().await {
                                warn!("keepalive probe failed: {e}");
                            } else {
                                last_ping = Some(Instant::now());
                            }
                        }
                        IdleAction::Dead => {
                            warn!(
                                "link dead, no data for {:?}; closing",
                                link.transport().idle()
                            );
                            link.transport_mut().close();
                        }
                    }
                }
                Err(FramerError::Transport(e)) => {
                    error!("transport error: {e}");
                    link.transport_mut().close();
                }
                Err(e) => warn!("framing error: {e}"),
            }
        }
        link.transport_mut().close();
        info!("gateway supervisor exiting...");
    });
}

/// Base id and version are fetched once per transport session; radio
/// telegrams that interleave with the exchanges are dispatched normally.
pub async fn fetch_identity<P: StatePublisher + Send + Sync>(
    link: &mut GatewayLink,
    dispatcher: &mut Dispatcher<P>,
) {
    match link.fetch_base_id().await {
        Ok((_, stray)) => {
            for packet in stray {
                dispatcher.handle_radio(&packet, link).await;
            }
        }
        Err(e) => {
            warn!("couldn't fetch gateway base id: {e}");
            return;
        }
    }
    match link.fetch_version().await {
        Ok((_, stray)) => {
            for packet in stray {
                dispatcher.handle_radio(&packet, link).await;
            }
        }
        Err(e) => warn!("couldn't fetch gateway version: {e}"),
    }
}
