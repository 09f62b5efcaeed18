//! Bounded LRU cache of live upstream connections keyed by backend identity

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;

/// Default number of cached upstream connections
pub const DEFAULT_CONNECTION_POOL_SIZE: usize = 100;

/// A transport handle that can be torn down when evicted
pub trait PooledConnection: Send + Sync {
    fn close(&self);
}

/// LRU map from backend identity to a shared connection handle
///
/// Holds at most `maxsize` handles. Evicted, replaced and removed handles are
/// closed after the map lock is released.
pub struct ConnectionPool<C: ?Sized + PooledConnection> {
    entries: Mutex<LruCache<String, Arc<C>>>,
}

impl<C: ?Sized + PooledConnection> ConnectionPool<C> {
    pub fn new(maxsize: usize) -> Self {
        let capacity = NonZeroUsize::new(maxsize).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn maxsize(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Whether a handle is cached, without touching recency
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains(key)
    }

    /// Cached handle for `key`, marking it most recently used
    pub fn get(&self, key: &str) -> Option<Arc<C>> {
        self.entries.lock().get(key).cloned()
    }

    /// Insert a handle, closing whatever it displaces
    pub fn put(&self, key: impl Into<String>, conn: Arc<C>) {
        let key = key.into();
        let displaced = self.entries.lock().push(key.clone(), conn);

        if let Some((old_key, old)) = displaced {
            if old_key == key {
                debug!(backend = %key, "Replaced pooled connection");
            } else {
                debug!(backend = %old_key, "Evicted least recently used connection");
            }
            old.close();
        }
    }

    /// Cached handle for `key`, or a new one from `create`
    pub fn get_or_create<F>(&self, key: &str, create: F) -> Result<Arc<C>>
    where
        F: FnOnce() -> Result<Arc<C>>,
    {
        if let Some(conn) = self.get(key) {
            return Ok(conn);
        }
        let conn = create()?;
        self.put(key, conn.clone());
        Ok(conn)
    }

    /// Drop and close the handle for `key`
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.entries.lock().pop(key);
        match removed {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Drop and close every handle
    pub fn clear(&self) {
        let drained: Vec<Arc<C>> = {
            let mut entries = self.entries.lock();
            let mut drained = Vec::with_capacity(entries.len());
            while let Some((_, conn)) = entries.pop_lru() {
                drained.push(conn);
            }
            drained
        };
        for conn in drained {
            conn.close();
        }
    }
}
