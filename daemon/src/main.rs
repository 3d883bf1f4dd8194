mod config;
mod dispatch;
mod error;
mod mqtt;
mod supervisor;

use std::path::PathBuf;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use enbridge::devices::DeviceRegistry;
use enbridge::eep::{EepLibrary, StateMap};
use enbridge::gateway::GatewayLink;
use enbridge::states::StateStore;
use enbridge::transport::{DEFAULT_BAUD, Target, Transport};
use enbridge::util::default_store_path;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::BridgeError;
use crate::mqtt::MqttBridge;
use crate::supervisor::{fetch_identity, run_supervisor};

/// Bundled definitions next to the working directory, `/data/eep` as the
/// user override root (later roots win on duplicate EEP keys).
fn eep_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("eep/definitions"), PathBuf::from("/data/eep")]
}

/// Republish the last known retained state of every enabled device after
/// the restore delay, so Home Assistant shows data right after a restart.
fn run_restore_task(
    task_tracker: &TaskTracker,
    snapshot: Vec<(String, StateMap)>,
    mqtt: MqttBridge,
    delay: Duration,
    shutdown: CancellationToken,
) {
    task_tracker.spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep(delay) => {}
        }
        let restored = dispatch::restore_snapshot(&snapshot, &mqtt).await;
        info!("restored {restored} retained device states");
    });
}

/// Ctrl-C turns into a cancellation every task observes between steps.
fn run_shutdown_task(task_tracker: &TaskTracker, shutdown: CancellationToken) {
    task_tracker.spawn(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(err) = res {
                    warn!("unable to listen for the shutdown signal: {err}");
                }
                info!("shutting down...");
            }
            _ = shutdown.cancelled() => {}
        }
        shutdown.cancel();
    });
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), BridgeError> {
    let config = Config::from_env();
    enbridge::init_logging(config.log_level);
    info!("enbridge starting...");

    let eep = EepLibrary::load(&eep_roots());
    if eep.is_empty() {
        return Err(BridgeError::NoProfiles);
    }
    for summary in eep.list().into_iter().take(5) {
        debug!("  {}: {}", summary.eep, summary.title);
    }

    let registry = DeviceRegistry::open(default_store_path("devices.json")).await?;
    let states = StateStore::open(default_store_path("last_states.json")).await?;

    let task_tracker = TaskTracker::new();
    let shutdown = CancellationToken::new();
    run_shutdown_task(&task_tracker, shutdown.clone());

    let mqtt = MqttBridge::start(&task_tracker, &config, shutdown.clone());
    let mut dispatcher = Dispatcher::new(eep, registry, states, mqtt.clone());

    // retained discovery for everything already learned, so entities exist
    // in Home Assistant before the first telegram arrives
    let known: Vec<_> = dispatcher
        .registry
        .list()
        .into_iter()
        .filter(|device| device.enabled)
        .cloned()
        .collect();
    for device in &known {
        dispatcher.publish_discovery(device).await;
    }

    if config.restore_state {
        let snapshot: Vec<(String, StateMap)> = dispatcher
            .states
            .all()
            .iter()
            .filter(|(id, state)| {
                !state.is_empty()
                    && dispatcher
                        .registry
                        .get(id)
                        .is_some_and(|device| device.enabled)
            })
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect();
        if snapshot.is_empty() {
            info!("no stored device states to restore");
        } else {
            info!(
                "restoring {} device states in {:?}",
                snapshot.len(),
                config.restore_delay
            );
            run_restore_task(
                &task_tracker,
                snapshot,
                mqtt.clone(),
                config.restore_delay,
                shutdown.clone(),
            );
        }
    }

    match &config.serial_port {
        Some(connection) => {
            let target = Target::parse(connection, DEFAULT_BAUD)?;
            let mut link = GatewayLink::new(Transport::new(target));
            match link.reopen().await {
                Ok(()) => fetch_identity(&mut link, &mut dispatcher).await,
                Err(e) => warn!("couldn't open gateway connection: {e}; retrying in background"),
            }
            run_supervisor(&task_tracker, link, dispatcher, shutdown.clone());
        }
        None => warn!("SERIAL_PORT not configured, running without a gateway connection"),
    }

    task_tracker.close();
    task_tracker.wait().await;
    info!("see you around");
    Ok(())
}
