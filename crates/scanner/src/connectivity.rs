//! Connectivity state shared by the controller and sync passes.

use std::sync::RwLock;

use thiserror::Error;

use crate::backend::Backend;
pub use crate::types::ConnectivityState;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("device is offline; operation requires a network connection")]
    Offline,
}

#[derive(Debug)]
pub struct Connectivity {
    state: RwLock<ConnectivityState>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(ConnectivityState::Online)
    }
}

impl Connectivity {
    pub fn new(initial: ConnectivityState) -> Self {
        Self {
            state: RwLock::new(initial),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a new state; returns the previous one.
    pub fn set(&self, state: ConnectivityState) -> ConnectivityState {
        let mut current = self.state.write().unwrap_or_else(|e| e.into_inner());
        let previous = *current;
        *current = state;
        if previous != state {
            tracing::info!(from = ?previous, to = ?state, "connectivity changed");
        }
        previous
    }

    pub fn set_online(&self) -> ConnectivityState {
        self.set(ConnectivityState::Online)
    }

    pub fn set_offline(&self) -> ConnectivityState {
        self.set(ConnectivityState::Offline)
    }

    pub fn is_offline(&self) -> bool {
        self.state() == ConnectivityState::Offline
    }

    pub fn require_online(&self) -> Result<(), ConnectivityError> {
        if self.is_offline() {
            Err(ConnectivityError::Offline)
        } else {
            Ok(())
        }
    }

    /// Ping the backend and record the result.
    pub async fn probe(&self, backend: &dyn Backend) -> ConnectivityState {
        let state = match backend.ping().await {
            Ok(()) => ConnectivityState::Online,
            Err(err) => {
                tracing::debug!(error = %err, "connectivity probe failed");
                ConnectivityState::Offline
            }
        };
        self.set(state);
        state
    }
}
