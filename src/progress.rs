use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::storage::{Artifact, ArtifactStatus, CertStore};

/// Wizard step, derived from which artifacts are on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStep {
    Login,
    BridgePairing,
    Complete,
}

#[derive(Debug, Clone)]
pub struct ProvisioningState {
    store: Arc<CertStore>,
}

impl ProvisioningState {
    pub fn new(store: Arc<CertStore>) -> Self {
        Self { store }
    }

    pub fn current_step(&self) -> ProvisioningStep {
        if self.store.exists(Artifact::CaBundle) {
            ProvisioningStep::Complete
        } else if self.store.exists(Artifact::Certificate) {
            ProvisioningStep::BridgePairing
        } else {
            ProvisioningStep::Login
        }
    }

    pub fn artifacts(&self) -> Vec<ArtifactStatus> {
        self.store.status()
    }

    /// Delete the key, certificate and CA bundle. Already-missing files are fine.
    pub fn reset(&self) -> Result<()> {
        warn!(
            "Deleting certificate files in {}",
            self.store.dir().display()
        );
        self.store.remove_all()
    }
}
