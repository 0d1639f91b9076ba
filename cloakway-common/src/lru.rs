use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct LruState {
    next_id: u64,
    next_seq: u64,
    // insertion/touch order: seq -> entry id
    order: BTreeMap<u64, u64>,
    entries: HashMap<u64, LruSlot>,
}

struct LruSlot {
    seq: u64,
    token: CancellationToken,
}

/// Least-recently-active set of connections.
///
/// `close_oldest` cancels the stalest entry's token; the entry's owner is
/// expected to finalize asynchronously and drop its handle. Entries are
/// identified by handles, not protocol ids, so a handle left over from an
/// evicted connection can never touch or remove a successor that reused the
/// same id.
#[derive(Default)]
pub struct ConnectionLru {
    state: Mutex<LruState>,
}

impl ConnectionLru {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn add(self: &Arc<Self>, token: CancellationToken) -> LruHandle {
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, id);
        state.entries.insert(id, LruSlot { seq, token });
        LruHandle {
            lru: self.clone(),
            id,
        }
    }

    /// Cancels the least recently active entry, if any. The entry stays in
    /// the set until its owner removes the handle.
    pub async fn close_oldest(&self) -> bool {
        let state = self.state.lock().await;
        let Some((_, id)) = state.order.iter().next() else {
            return false;
        };
        if let Some(slot) = state.entries.get(id) {
            slot.token.cancel();
            return true;
        }
        false
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    async fn touch(&self, id: u64) {
        let mut state = self.state.lock().await;
        let Some(slot) = state.entries.get(&id) else {
            return;
        };
        let old_seq = slot.seq;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.remove(&old_seq);
        state.order.insert(seq, id);
        if let Some(slot) = state.entries.get_mut(&id) {
            slot.seq = seq;
        }
    }

    async fn remove(&self, id: u64) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.entries.remove(&id) {
            state.order.remove(&slot.seq);
        }
    }
}

/// Owner-side handle to one LRU entry.
pub struct LruHandle {
    lru: Arc<ConnectionLru>,
    id: u64,
}

impl LruHandle {
    pub async fn touch(&self) {
        self.lru.touch(self.id).await;
    }

    pub async fn remove(&self) {
        self.lru.remove(self.id).await;
    }
}
