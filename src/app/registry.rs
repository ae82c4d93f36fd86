use std::collections::HashMap;
use std::fmt;
use std::process::Child;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

/// Device-side end of a forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ForwardTarget {
    /// Abstract-namespace unix socket, e.g. `minicap` or `scrcpy`.
    Socket(String),
    Tcp(u16),
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardTarget::Socket(name) => write!(f, "{name}"),
            ForwardTarget::Tcp(port) => write!(f, "{port}"),
        }
    }
}

pub fn forward_name(serial: &str, target: &ForwardTarget) -> String {
    format!("process-{serial}-forward-{target}")
}

pub fn process_name(serial: &str, purpose: &str) -> String {
    format!("process-{serial}-{purpose}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRegistration {
    pub name: String,
    pub serial: String,
    pub local_port: u16,
    pub target: ForwardTarget,
    pub created_at: DateTime<Utc>,
}

impl ForwardRegistration {
    pub fn new(serial: &str, local_port: u16, target: ForwardTarget) -> Self {
        Self {
            name: forward_name(serial, &target),
            serial: serial.to_string(),
            local_port,
            target,
            created_at: Utc::now(),
        }
    }
}

/// Per-key mutexes so that work on one logical name never blocks work on another.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut guard = lock_map(&self.locks);
        guard
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_map<K, V>(map: &Mutex<HashMap<K, V>>) -> MutexGuard<'_, HashMap<K, V>> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
pub struct PortRegistry {
    entries: Mutex<HashMap<String, ForwardRegistration>>,
    keys: KeyedLocks,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace-before-allocate: any registration already held under the same name is released and
    /// handed to `teardown` before `establish` runs for the new one. The new registration is
    /// recorded only when `establish` reports success.
    pub fn allocate(
        &self,
        registration: ForwardRegistration,
        teardown: impl FnOnce(&ForwardRegistration),
        establish: impl FnOnce(&ForwardRegistration) -> bool,
    ) -> bool {
        let key_lock = self.keys.lock_for(&registration.name);
        let _key_guard = hold(&key_lock);

        let previous = lock_map(&self.entries).remove(&registration.name);
        if let Some(previous) = previous {
            teardown(&previous);
        }
        if !establish(&registration) {
            return false;
        }
        lock_map(&self.entries).insert(registration.name.clone(), registration);
        true
    }

    pub fn lookup(&self, name: &str) -> Option<ForwardRegistration> {
        lock_map(&self.entries).get(name).cloned()
    }

    pub fn release(&self, name: &str) -> Option<ForwardRegistration> {
        let key_lock = self.keys.lock_for(name);
        let _key_guard = hold(&key_lock);
        lock_map(&self.entries).remove(name)
    }

    /// Releases `name` only while it still points at `local_port`, so a late cleanup cannot drop a
    /// newer registration that superseded it.
    pub fn release_if_port(&self, name: &str, local_port: u16) -> Option<ForwardRegistration> {
        let key_lock = self.keys.lock_for(name);
        let _key_guard = hold(&key_lock);
        let mut entries = lock_map(&self.entries);
        match entries.get(name) {
            Some(current) if current.local_port == local_port => entries.remove(name),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        lock_map(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A host-local process owned by the supervisor.
pub struct ManagedProcess {
    pub name: String,
    pub pid: u32,
    pub child: Mutex<Child>,
    pub started_at: DateTime<Utc>,
}

impl ManagedProcess {
    pub fn new(name: String, child: Child) -> Self {
        Self {
            name,
            pid: child.id(),
            child: Mutex::new(child),
            started_at: Utc::now(),
        }
    }

    pub fn child(&self) -> MutexGuard<'_, Child> {
        match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.child().try_wait(), Ok(None))
    }
}

#[derive(Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<String, Arc<ManagedProcess>>>,
    keys: KeyedLocks,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock serialising start/stop for one logical process name.
    pub fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.keys.lock_for(name)
    }

    /// Records `process`, returning whatever was displaced.
    pub fn put_process(&self, process: Arc<ManagedProcess>) -> Option<Arc<ManagedProcess>> {
        lock_map(&self.entries).insert(process.name.clone(), process)
    }

    pub fn get_process(&self, name: &str) -> Option<Arc<ManagedProcess>> {
        lock_map(&self.entries).get(name).cloned()
    }

    pub fn remove_process(&self, name: &str) -> Option<Arc<ManagedProcess>> {
        lock_map(&self.entries).remove(name)
    }

    /// Drops `name` only while it still refers to `process`, so a late exit cannot evict a newer
    /// process started under the same name.
    pub fn remove_if_same(&self, name: &str, process: &Arc<ManagedProcess>) -> bool {
        let mut entries = lock_map(&self.entries);
        match entries.get(name) {
            Some(current) if Arc::ptr_eq(current, process) => entries.remove(name).is_some(),
            _ => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = lock_map(&self.entries).keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}
