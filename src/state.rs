use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::provisioner::Provisioner;

/// Per-operator values the wizard remembers between pages.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Session {
    pub server_addr: Option<String>,
    pub leap_version: Option<String>,
}

pub struct AppState {
    pub provisioner: Provisioner,
    pub session: RwLock<Session>,
}

impl AppState {
    pub fn new(provisioner: Provisioner) -> Arc<Self> {
        Arc::new(Self {
            provisioner,
            session: RwLock::new(Session::default()),
        })
    }
}
