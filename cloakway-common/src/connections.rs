use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    connections: HashMap<u64, CancellationToken>,
}

/// Tracks the cancel tokens of live connections so a shutdown can
/// force-close all of them at once.
#[derive(Default)]
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, token: CancellationToken) -> u64 {
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        state.connections.insert(id, token);
        id
    }

    pub async fn remove(&self, id: u64) {
        self.state.lock().await.connections.remove(&id);
    }

    pub async fn close_all(&self) {
        let mut state = self.state.lock().await;
        for token in state.connections.values() {
            token.cancel();
        }
        state.connections.clear();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.connections.len()
    }
}
