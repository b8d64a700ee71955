//! DHCP lease source consumed by the autohost table

use std::sync::{Arc, Mutex};

use crate::autohost::{Lease, LeaseEvent};

/// Lease change callback, receives the event and the current lease set
pub type LeaseCallback = Box<dyn Fn(LeaseEvent, &[Lease]) + Send + Sync>;

/// Source of DHCP leases
pub trait DhcpLeases: Send + Sync {
    /// Current lease set
    fn leases(&self) -> Vec<Lease>;

    /// Replace the change callback
    fn set_on_lease_changed(&self, callback: LeaseCallback);
}

/// In-memory lease set, fed from the config file or by hand
#[derive(Default)]
pub struct StaticLeases {
    leases: Mutex<Vec<Lease>>,
    callback: Mutex<Option<Arc<LeaseCallback>>>,
}

impl StaticLeases {
    pub fn new(leases: Vec<Lease>) -> Self {
        Self {
            leases: Mutex::new(leases),
            callback: Mutex::new(None),
        }
    }

    /// Add or update a lease by hostname and notify
    pub fn upsert(&self, lease: Lease) {
        let (event, snapshot) = {
            let mut leases = lock(&self.leases);
            let event = match leases.iter_mut().find(|l| l.hostname == lease.hostname) {
                Some(existing) => {
                    *existing = lease;
                    LeaseEvent::Updated
                }
                None => {
                    leases.push(lease);
                    LeaseEvent::Added
                }
            };
            (event, leases.clone())
        };
        self.notify(event, &snapshot);
    }

    /// Drop the lease for `hostname` and notify if one existed
    pub fn remove(&self, hostname: &str) {
        let snapshot = {
            let mut leases = lock(&self.leases);
            let before = leases.len();
            leases.retain(|l| l.hostname != hostname);
            if leases.len() == before {
                return;
            }
            leases.clone()
        };
        self.notify(LeaseEvent::Removed, &snapshot);
    }

    /// Replace every lease
    pub fn replace(&self, fresh: Vec<Lease>) {
        *lock(&self.leases) = fresh.clone();
        self.notify(LeaseEvent::RemovedAll, &[]);
        if !fresh.is_empty() {
            self.notify(LeaseEvent::Added, &fresh);
        }
    }

    fn notify(&self, event: LeaseEvent, leases: &[Lease]) {
        // Cloned out so the callback runs without our lock held
        let callback = lock(&self.callback).clone();
        if let Some(callback) = callback {
            callback(event, leases);
        }
    }
}

impl DhcpLeases for StaticLeases {
    fn leases(&self) -> Vec<Lease> {
        lock(&self.leases).clone()
    }

    fn set_on_lease_changed(&self, callback: LeaseCallback) {
        *lock(&self.callback) = Some(Arc::new(callback));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
