//! Per-client query rate limit

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::classify::unmap;
use crate::error::{Error, Result};

/// Clients tracked at once; the least recently seen are forgotten first
const MAX_TRACKED_CLIENTS: usize = 4096;

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed one-second window per client address
pub struct RateLimiter {
    limit: u32,
    whitelist: Vec<IpAddr>,
    windows: Mutex<LruCache<IpAddr, Window>>,
}

impl RateLimiter {
    /// `limit` queries per second, 0 disables limiting
    pub fn new(limit: u32, whitelist: &[String]) -> Result<Self> {
        let whitelist = whitelist
            .iter()
            .map(|s| {
                s.trim()
                    .parse::<IpAddr>()
                    .map(unmap)
                    .map_err(|e| Error::InvalidConfig(format!("invalid ratelimit whitelist entry {:?}: {}", s, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let capacity = NonZeroUsize::new(MAX_TRACKED_CLIENTS).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            limit,
            whitelist,
            windows: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Count a query from `client`, false when it is over the limit
    pub fn allow(&self, client: IpAddr) -> bool {
        self.allow_at(client, Instant::now())
    }

    fn allow_at(&self, client: IpAddr, now: Instant) -> bool {
        let client = unmap(client);
        if self.limit == 0 || self.whitelist.contains(&client) {
            return true;
        }

        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let Some(window) = windows.get_mut(&client) else {
            windows.put(client, Window { started: now, count: 1 });
            return true;
        };

        if now.duration_since(window.started) >= WINDOW {
            window.started = now;
            window.count = 0;
        }

        window.count = window.count.saturating_add(1);
        window.count <= self.limit
    }
}
