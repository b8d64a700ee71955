//! Adds resolved addresses of configured domains to kernel ipsets
//!
//! Configuration lines have the form `dom1,dom2/set1,set2`. Every A or AAAA
//! answer for one of the domains, or a subdomain of one, is added to each
//! bound set of the matching family.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use fwd_ipset::{IpSetError, IpSetFamily, IpsetConn, SetHeader};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Kernel operations the binder needs
pub trait IpsetBackend: Send {
    fn header(&mut self, set: &str) -> fwd_ipset::Result<SetHeader>;
    fn add(&mut self, set: &str, ip: IpAddr) -> fwd_ipset::Result<()>;
}

/// Netlink connection to the kernel ipset subsystem
pub struct NetlinkIpset {
    conn: IpsetConn,
}

impl NetlinkIpset {
    pub fn open() -> fwd_ipset::Result<Self> {
        Ok(Self {
            conn: IpsetConn::open()?,
        })
    }
}

impl IpsetBackend for NetlinkIpset {
    fn header(&mut self, set: &str) -> fwd_ipset::Result<SetHeader> {
        self.conn.header(set)
    }

    fn add(&mut self, set: &str, ip: IpAddr) -> fwd_ipset::Result<()> {
        self.conn.add(set, ip)
    }
}

/// Minimum interval between batches handed to the kernel
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Pending entries that force a flush before the interval is up
const MAX_BATCH_SIZE: usize = 1000;

/// Queued entries beyond this are dropped
const QUEUE_CAPACITY: usize = 10000;

#[derive(Debug, Clone)]
struct BoundSet {
    name: String,
    family: IpSetFamily,
}

/// One address for one set
type Entry = (String, IpAddr);

struct Bindings {
    domains: HashMap<String, Vec<BoundSet>>,
    tx: mpsc::Sender<Entry>,
}

/// Parsed `domains -> sets` mapping, before the kernel is consulted
pub fn parse_ipset_config(lines: &[String]) -> Result<HashMap<String, Vec<String>>> {
    let mut domains: HashMap<String, Vec<String>> = HashMap::new();

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (hosts, sets) = line
            .split_once('/')
            .ok_or_else(|| Error::Ipset(format!("bad ipset config {:?}: no set names", line)))?;

        let hosts: Vec<String> = hosts
            .split(',')
            .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        let sets: Vec<String> = sets
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if hosts.is_empty() || sets.is_empty() {
            return Err(Error::Ipset(format!("bad ipset config {:?}", line)));
        }

        for host in hosts {
            let bound = domains.entry(host).or_default();
            for set in &sets {
                if !bound.contains(set) {
                    bound.push(set.clone());
                }
            }
        }
    }

    Ok(domains)
}

/// Domain to ipset binding, disabled when nothing is configured or the
/// kernel side is unavailable
///
/// Matching happens on the query path; the kernel is only touched by a
/// background worker that batches and deduplicates queued entries.
pub struct IpsetBinder {
    inner: Mutex<Option<Bindings>>,
}

impl IpsetBinder {
    pub fn disabled() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Bind `lines` using a backend produced by `open`
    ///
    /// Malformed lines and sets that do not exist are errors. Missing
    /// privileges or kernel support only disable the binder. Must be called
    /// within a Tokio runtime when `lines` is not empty.
    pub fn init_with<F>(lines: &[String], open: F) -> Result<Self>
    where
        F: FnOnce() -> fwd_ipset::Result<Box<dyn IpsetBackend>>,
    {
        let config = parse_ipset_config(lines)?;
        if config.is_empty() {
            return Ok(Self::disabled());
        }

        let mut backend = match open() {
            Ok(backend) => backend,
            Err(e) => return degraded_or_fatal(e, "opening ipset socket"),
        };

        let mut families: HashMap<String, IpSetFamily> = HashMap::new();
        let mut domains = HashMap::with_capacity(config.len());

        for (host, sets) in config {
            let mut bound = Vec::with_capacity(sets.len());
            for set in sets {
                let family = match families.get(&set) {
                    Some(family) => *family,
                    None => {
                        let header = match backend.header(&set) {
                            Ok(header) => header,
                            Err(e) => {
                                return degraded_or_fatal(e, &format!("getting header of ipset {:?}", set))
                            }
                        };
                        log::debug!("ipset {} is {} {}", header.name, header.type_name, header.family);
                        families.insert(set.clone(), header.family);
                        header.family
                    }
                };
                bound.push(BoundSet { name: set, family });
            }
            domains.insert(host, bound);
        }

        log::info!("ipset: {} domains bound to {} sets", domains.len(), families.len());

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(worker(backend, rx));

        Ok(Self {
            inner: Mutex::new(Some(Bindings { domains, tx })),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().is_some()
    }

    /// Queue `ips` resolved for `qname` for every matching set
    ///
    /// Returns the number of (set, address) pairs queued. Never blocks: when
    /// the queue is full the rest is dropped.
    pub fn process(&self, qname: &str, ips: &[IpAddr]) -> usize {
        if ips.is_empty() {
            return 0;
        }

        let guard = self.lock();
        let Some(bindings) = guard.as_ref() else {
            return 0;
        };

        let qname = qname.trim_end_matches('.').to_ascii_lowercase();
        let sets = parent_domains(&qname)
            .filter_map(|domain| bindings.domains.get(domain))
            .flatten();

        let mut queued = 0;
        for set in sets {
            for ip in ips.iter().filter(|ip| set.family.matches(ip)) {
                if bindings.tx.try_send((set.name.clone(), *ip)).is_err() {
                    log::warn!("ipset queue full, dropping entries for {}", qname);
                    return queued;
                }
                queued += 1;
            }
        }
        queued
    }

    /// Stop accepting entries; the worker flushes what is queued and exits
    pub fn close(&self) {
        if self.lock().take().is_some() {
            log::debug!("ipset binder closed");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Bindings>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Owns the kernel connection and applies queued entries in batches
async fn worker(mut backend: Box<dyn IpsetBackend>, mut rx: mpsc::Receiver<Entry>) {
    let mut pending: HashSet<Entry> = HashSet::new();
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        // Queued entries are drained before the timer so a burst lands in one batch
        let closed = tokio::select! {
            biased;
            entry = rx.recv() => match entry {
                Some(entry) => {
                    pending.insert(entry);
                    if pending.len() < MAX_BATCH_SIZE {
                        continue;
                    }
                    interval.reset();
                    false
                }
                None => true,
            },
            _ = interval.tick() => false,
        };

        if !pending.is_empty() {
            let batch: Vec<Entry> = pending.drain().collect();
            backend = match tokio::task::spawn_blocking(move || {
                flush_batch(backend.as_mut(), &batch);
                backend
            })
            .await
            {
                Ok(backend) => backend,
                Err(e) => {
                    log::error!("ipset worker failed: {}", e);
                    return;
                }
            };
        }

        if closed {
            log::debug!("ipset worker shutting down");
            return;
        }
    }
}

fn flush_batch(backend: &mut dyn IpsetBackend, batch: &[Entry]) {
    let mut added = 0;
    let mut errors = 0;

    for (set, ip) in batch {
        match backend.add(set, *ip) {
            Ok(()) | Err(IpSetError::ElementExists) => added += 1,
            Err(e) => {
                // Only the first failure of a batch is logged in full
                if errors == 0 {
                    log::warn!("Failed to add {} to ipset {}: {}", ip, set, e);
                }
                errors += 1;
            }
        }
    }

    log::debug!("ipset: flushed {} entries", added);
    if errors > 0 {
        log::warn!("ipset: {} entries could not be added", errors);
    }
}

fn degraded_or_fatal(e: IpSetError, context: &str) -> Result<IpsetBinder> {
    if e.is_degraded() {
        log::warn!("ipset unavailable, continuing without it: {}: {}", context, e);
        Ok(IpsetBinder::disabled())
    } else {
        Err(Error::Ipset(format!("{}: {}", context, e)))
    }
}

/// `a.b.c`, `b.c`, `c`
fn parent_domains(name: &str) -> impl Iterator<Item = &str> {
    let mut rest = Some(name).filter(|n| !n.is_empty());
    std::iter::from_fn(move || {
        let current = rest?;
        rest = current.split_once('.').map(|(_, parent)| parent);
        Some(current)
    })
}
