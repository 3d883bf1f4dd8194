//! Persistent last-known decoded state per device.
//!
//! Written on every successful decode and read once at startup so retained
//! MQTT state can be republished after a restart, even when the broker was
//! down while telegrams arrived.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::info;
use thiserror::Error;
use tokio::fs;

use crate::eep::StateMap;
use crate::util::write_json_atomic;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("couldn't read state file: {0}")]
    ReadFileError(tokio::io::Error),
    #[error("couldn't write state file: {0}")]
    WriteFileError(tokio::io::Error),
    #[error("couldn't parse state file: {0}")]
    ParseError(serde_json::Error),
}

pub struct StateStore {
    path: PathBuf,
    states: HashMap<String, StateMap>,
}

impl StateStore {
    /// Load the store, starting empty if the file doesn't exist yet.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let path = path.as_ref().to_path_buf();
        let states: HashMap<String, StateMap> = match fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).map_err(StateStoreError::ParseError)?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StateStoreError::ReadFileError(e)),
        };
        info!(
            "loaded {} stored device states from {}",
            states.len(),
            path.display()
        );
        Ok(StateStore { path, states })
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&StateMap> {
        self.states.get(id)
    }

    pub fn all(&self) -> &HashMap<String, StateMap> {
        &self.states
    }

    pub async fn save_state(&mut self, id: &str, state: StateMap) -> Result<(), StateStoreError> {
        self.states.insert(id.to_string(), state);
        write_json_atomic(&self.path, &self.states)
            .await
            .map_err(StateStoreError::WriteFileError)
    }

    pub async fn remove(&mut self, id: &str) -> Result<(), StateStoreError> {
        if self.states.remove(id).is_some() {
            write_json_atomic(&self.path, &self.states)
                .await
                .map_err(StateStoreError::WriteFileError)?;
        }
        Ok(())
    }
}
