use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use cairn_types::ContentHash;

/// Weight-bounded FIFO cache of decoded chunk payloads, keyed by the
/// chunk's processed-bytes hash. Owned by the session and passed into
/// random-access readers; a single mutex is enough at chunk-sized
/// granularity.
pub struct ChunkCache {
    inner: Mutex<Inner>,
}

struct Inner {
    map: HashMap<ContentHash, Arc<Vec<u8>>>,
    order: VecDeque<ContentHash>,
    weight: usize,
    capacity: usize,
}

impl ChunkCache {
    /// `capacity` is the total byte weight of cached payloads.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
                weight: 0,
                capacity,
            }),
        }
    }

    pub fn get(&self, hash: &ContentHash) -> Option<Arc<Vec<u8>>> {
        self.inner.lock().unwrap().map.get(hash).cloned()
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.inner.lock().unwrap().map.contains_key(hash)
    }

    pub fn insert(&self, hash: ContentHash, data: Vec<u8>) -> Arc<Vec<u8>> {
        let data = Arc::new(data);
        let mut inner = self.inner.lock().unwrap();
        if inner.map.contains_key(&hash) {
            return data;
        }
        inner.weight += data.len();
        inner.map.insert(hash, Arc::clone(&data));
        inner.order.push_back(hash);
        while inner.weight > inner.capacity && inner.order.len() > 1 {
            if let Some(evicted) = inner.order.pop_front() {
                if let Some(payload) = inner.map.remove(&evicted) {
                    inner.weight -= payload.len();
                }
            }
        }
        data
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
