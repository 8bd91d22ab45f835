//! In-process coordination store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{CoordinationError, CoordinationStore};

#[derive(Debug, Default)]
pub struct InMemoryCoordinationStore {
    /// key -> expiry
    keys: Mutex<HashMap<String, Instant>>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.keys
            .lock()
            .map(|keys| keys.get(key).is_some_and(|expiry| *expiry > Instant::now()))
            .unwrap_or(false)
    }
}

fn poisoned() -> CoordinationError {
    CoordinationError::Unavailable("coordination lock poisoned".to_string())
}

#[async_trait::async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, CoordinationError> {
        let mut keys = self.keys.lock().map_err(|_| poisoned())?;
        let now = Instant::now();
        keys.retain(|_, expiry| *expiry > now);
        if keys.contains_key(key) {
            return Ok(false);
        }
        keys.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, CoordinationError> {
        let mut keys = self.keys.lock().map_err(|_| poisoned())?;
        let now = Instant::now();
        match keys.get_mut(key) {
            Some(expiry) if *expiry > now => {
                *expiry = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str) -> Result<(), CoordinationError> {
        self.keys.lock().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }
}
