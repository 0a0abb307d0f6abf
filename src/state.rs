//! Shared application state

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::backends::{Registries, global_registries};
use crate::config::ServerConfig;
use crate::manager::ModelManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionLimitError {
    #[error("global connection limit reached")]
    GlobalLimitReached,
    #[error("per-IP connection limit reached")]
    PerIpLimitReached,
}

pub struct AppState {
    pub config: ServerConfig,
    pub manager: Arc<ModelManager>,
    ws_connections: AtomicUsize,
    ip_connections: DashMap<IpAddr, u32>,
}

impl AppState {
    /// State backed by the process-wide backend registries.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Self::with_registries(config, global_registries())
    }

    /// State backed by a caller-supplied registry set.
    pub fn with_registries(config: ServerConfig, registries: Arc<Registries>) -> Arc<Self> {
        let manager = ModelManager::new(registries, config.models.clone(), config.retire_grace());
        Arc::new(Self {
            config,
            manager: Arc::new(manager),
            ws_connections: AtomicUsize::new(0),
            ip_connections: DashMap::new(),
        })
    }

    /// Reserve a connection slot for `ip`, enforcing both limits.
    pub fn try_acquire_connection(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        let result = {
            // The per-IP entry lock serializes acquisitions from the same address
            let mut per_ip = self.ip_connections.entry(ip).or_insert(0);
            if *per_ip >= self.config.max_connections_per_ip {
                Err(ConnectionLimitError::PerIpLimitReached)
            } else if self.acquire_global() {
                *per_ip += 1;
                Ok(())
            } else {
                Err(ConnectionLimitError::GlobalLimitReached)
            }
        };
        if result.is_err() {
            self.ip_connections.remove_if(&ip, |_, count| *count == 0);
        }
        result
    }

    fn acquire_global(&self) -> bool {
        let limit = self.config.max_websocket_connections;
        self.ws_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| match limit {
                Some(max) if current >= max => None,
                _ => Some(current + 1),
            })
            .is_ok()
    }

    pub fn release_connection(&self, ip: IpAddr) {
        let _ = self
            .ws_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        let now_empty = match self.ip_connections.get_mut(&ip) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if now_empty {
            self.ip_connections.remove_if(&ip, |_, count| *count == 0);
        }
    }

    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::SeqCst)
    }

    pub fn ip_connection_count(&self, ip: &IpAddr) -> u32 {
        self.ip_connections.get(ip).map(|c| *c).unwrap_or(0)
    }
}
