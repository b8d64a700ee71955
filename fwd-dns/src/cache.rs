//! Response cache with TTL expiration
//!
//! An LRU keyed by question name, type and class. Entries expire after the
//! smallest TTL found in the response, clamped to [`MIN_TTL_SECS`, `MAX_TTL_SECS`].

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, RecordType};
use lru::LruCache;

/// Minimum TTL to use for caching
pub const MIN_TTL_SECS: u64 = 30;

/// Maximum TTL to use for caching
pub const MAX_TTL_SECS: u64 = 86400;

/// TTL used for NXDOMAIN responses without records
const NEGATIVE_TTL_SECS: u64 = 60;

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct CacheKey {
    name: String,
    record_type: RecordType,
    class: DNSClass,
}

impl CacheKey {
    fn from_query(query: &Query) -> Self {
        Self {
            name: query.name().to_ascii().to_lowercase(),
            record_type: query.query_type(),
            class: query.query_class(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: Vec<u8>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub entries: usize,
}

/// DNS response cache
pub struct DnsCache {
    cache: LruCache<CacheKey, CacheEntry>,
    stats: CacheStats,
}

impl DnsCache {
    /// Create a cache holding at most `max_entries` responses
    pub fn new(max_entries: NonZeroUsize) -> Self {
        Self {
            cache: LruCache::new(max_entries),
            stats: CacheStats::default(),
        }
    }

    /// Get a cached response for the given question, dropping it if expired
    pub fn get(&mut self, query: &Query) -> Option<Vec<u8>> {
        let key = CacheKey::from_query(query);

        match self.cache.get(&key) {
            Some(entry) if entry.is_expired() => {
                self.cache.pop(&key);
                self.stats.expired += 1;
                self.stats.misses += 1;
                self.stats.entries = self.cache.len();
                None
            }
            Some(entry) => {
                self.stats.hits += 1;
                Some(entry.response.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Store a response; truncated, failed and TTL-less responses are skipped
    pub fn insert(&mut self, query: &Query, response: &[u8]) {
        let Some(ttl) = cacheable_ttl(response) else {
            return;
        };

        let entry = CacheEntry {
            response: response.to_vec(),
            expires_at: Instant::now()
                + Duration::from_secs(ttl.clamp(MIN_TTL_SECS, MAX_TTL_SECS)),
        };

        self.cache.put(CacheKey::from_query(query), entry);
        self.stats.entries = self.cache.len();
    }

    /// Clear all entries
    pub fn clear(&mut self) {
        self.cache.clear();
        self.stats.entries = 0;
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Smallest TTL in the answer and authority sections
fn cacheable_ttl(response: &[u8]) -> Option<u64> {
    let message = Message::from_vec(response).ok()?;

    if message.truncated() {
        return None;
    }

    match message.response_code() {
        ResponseCode::NoError | ResponseCode::NXDomain => {}
        _ => return None,
    }

    let min_ttl = message
        .answers()
        .iter()
        .chain(message.name_servers())
        .map(|record| record.ttl() as u64)
        .min();

    match min_ttl {
        Some(ttl) => Some(ttl),
        None if message.response_code() == ResponseCode::NXDomain => Some(NEGATIVE_TTL_SECS),
        None => None,
    }
}
