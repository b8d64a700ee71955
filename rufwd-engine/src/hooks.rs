//! Registration of the query-serving hook with an outer transport
//!
//! An HTTP front end (DNS-over-HTTPS, for example) hands raw queries to a
//! registered hook. Registration is tracked per identity, so a second server
//! sharing a registry does not replace the first one's hook.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

/// Serves one raw DNS query for an outer transport
#[async_trait]
pub trait QueryHook: Send + Sync {
    /// Raw response, `None` when the server can no longer answer
    async fn serve_dns(&self, query: &[u8], client: IpAddr) -> Option<Vec<u8>>;
}

/// Where hooks are registered
pub trait HookRegistry: Send + Sync {
    /// Register `hook` under `id`, false when `id` already has a hook
    fn register(&self, id: &str, hook: Arc<dyn QueryHook>) -> bool;
}

/// Hooks kept in memory, looked up by identity
#[derive(Default)]
pub struct MemoryHookRegistry {
    hooks: Mutex<HashMap<String, Arc<dyn QueryHook>>>,
}

impl MemoryHookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn QueryHook>> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn QueryHook>>> {
        match self.hooks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl HookRegistry for MemoryHookRegistry {
    fn register(&self, id: &str, hook: Arc<dyn QueryHook>) -> bool {
        let mut hooks = self.lock();
        if hooks.contains_key(id) {
            log::debug!("Query hook {:?} already registered", id);
            return false;
        }
        hooks.insert(id.to_string(), hook);
        log::debug!("Registered query hook {:?}", id);
        true
    }
}
