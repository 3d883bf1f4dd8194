use thiserror::Error;

use enbridge::devices::RegistryError;
use enbridge::states::StateStoreError;
use enbridge::transport::TransportError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("device registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("state store error: {0}")]
    StateStore(#[from] StateStoreError),
    #[error("no EEP profiles could be loaded, check the definition directories")]
    NoProfiles,
}
