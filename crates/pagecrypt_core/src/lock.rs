//! Cluster-wide locks for the encryption state and the sweep.
//!
//! Every process sharing a database owns a [`LockClient`]. When a request
//! conflicts with locks other owners hold, those owners receive a
//! [`BlockingAst`] over their channel and are expected to give way.
//!
//! [`LocalLockManager`] is the in-process implementation: each connected
//! client plays the part of one process.

use crate::error::{CryptError, CryptResult};
use crate::types::LockOwnerId;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Lock levels, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    /// Not held.
    None,
    /// Shared, giving way to any change.
    Release,
    /// Shared read of the current state.
    Normal,
    /// Exclusive right to change the state.
    Change,
    /// Exclusive, used while initializing.
    Init,
}

impl LockLevel {
    /// Returns whether two owners may hold these levels at the same time.
    #[must_use]
    pub const fn compatible(self, other: Self) -> bool {
        use LockLevel::{Change, Init, None, Normal, Release};
        match (self, other) {
            (None, _) | (_, None) => true,
            (Init, _) | (_, Init) => false,
            (Release, _) | (_, Release) => true,
            (Normal, Normal) => true,
            (Normal | Change, Change) | (Change, Normal) => false,
        }
    }
}

/// Lock resources used by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockResource {
    /// Encryption state; its data word carries the state generation.
    CryptState,
    /// Held exclusively by the one running sweep.
    CryptSweep,
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CryptState => write!(f, "crypt-state"),
            Self::CryptSweep => write!(f, "crypt-sweep"),
        }
    }
}

/// Whether a lock request may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Block until granted or timed out.
    Wait,
    /// Return `false` immediately on conflict.
    NoWait,
}

/// A request from another owner that conflicts with a lock held here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingAst {
    /// The contested resource.
    pub resource: LockResource,
    /// The level the other owner wants.
    pub requested: LockLevel,
    /// The owner that is waiting.
    pub requester: LockOwnerId,
}

/// One owner's handle on the lock manager.
pub trait LockClient: Send + Sync + fmt::Debug {
    /// Returns this client's owner ID.
    fn owner(&self) -> LockOwnerId;

    /// Acquires `resource` at `level`.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if a waited request is not granted in time.
    fn lock(&self, resource: LockResource, level: LockLevel, wait: LockWait) -> CryptResult<bool>;

    /// Changes the level of a held lock.
    ///
    /// Downgrades are always granted.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if a waited upgrade is not granted in time.
    fn convert(&self, resource: LockResource, level: LockLevel, wait: LockWait)
        -> CryptResult<bool>;

    /// Lowers the level from `from` to `to` if `from` is what is held.
    ///
    /// Never waits. Returns whether the level changed. Used from the AST
    /// path, where a plain convert could undo an upgrade that raced ahead.
    fn downgrade(&self, resource: LockResource, from: LockLevel, to: LockLevel) -> bool;

    /// Releases `resource`.
    fn release(&self, resource: LockResource);

    /// Returns the level currently held on `resource`.
    fn level(&self, resource: LockResource) -> LockLevel;

    /// Reads the data word of `resource`.
    fn read_data(&self, resource: LockResource) -> u64;

    /// Writes the data word of `resource`.
    fn write_data(&self, resource: LockResource, data: u64);
}

#[derive(Debug, Default)]
struct ResourceState {
    holders: HashMap<LockOwnerId, LockLevel>,
    data: u64,
}

#[derive(Debug, Default)]
struct LockTable {
    resources: HashMap<LockResource, ResourceState>,
    clients: HashMap<LockOwnerId, Sender<BlockingAst>>,
}

impl LockTable {
    fn conflicts(
        &self,
        resource: LockResource,
        owner: LockOwnerId,
        level: LockLevel,
    ) -> Vec<(LockOwnerId, LockLevel)> {
        self.resources
            .get(&resource)
            .map(|state| {
                state
                    .holders
                    .iter()
                    .filter(|(holder, held)| **holder != owner && !held.compatible(level))
                    .map(|(holder, held)| (*holder, *held))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn grant(&mut self, resource: LockResource, owner: LockOwnerId, level: LockLevel) {
        let state = self.resources.entry(resource).or_default();
        if level == LockLevel::None {
            state.holders.remove(&owner);
        } else {
            state.holders.insert(owner, level);
        }
    }

    fn level(&self, resource: LockResource, owner: LockOwnerId) -> LockLevel {
        self.resources
            .get(&resource)
            .and_then(|state| state.holders.get(&owner).copied())
            .unwrap_or(LockLevel::None)
    }
}

/// In-process lock manager shared by all connected clients.
#[derive(Debug)]
pub struct LocalLockManager {
    table: Mutex<LockTable>,
    cond: Condvar,
    next_owner: AtomicU64,
    timeout: Duration,
}

impl LocalLockManager {
    /// Default time a waited request may block.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Creates a lock manager with the default timeout.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_timeout(Self::DEFAULT_TIMEOUT)
    }

    /// Creates a lock manager with a custom timeout.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(LockTable::default()),
            cond: Condvar::new(),
            next_owner: AtomicU64::new(1),
            timeout,
        })
    }

    /// Connects a new owner.
    ///
    /// Blocking ASTs for the owner arrive on the returned receiver.
    /// Dropping the client releases everything it holds.
    pub fn connect(self: &Arc<Self>) -> (LocalLockClient, Receiver<BlockingAst>) {
        let owner = LockOwnerId::new(self.next_owner.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel();
        self.table.lock().clients.insert(owner, tx);
        debug!(%owner, "lock client connected");
        (
            LocalLockClient {
                manager: Arc::clone(self),
                owner,
            },
            rx,
        )
    }

    /// Returns the owners currently holding `resource`, with their levels.
    #[must_use]
    pub fn holders(&self, resource: LockResource) -> Vec<(LockOwnerId, LockLevel)> {
        let table = self.table.lock();
        let mut holders: Vec<_> = table
            .resources
            .get(&resource)
            .map(|state| state.holders.iter().map(|(o, l)| (*o, *l)).collect())
            .unwrap_or_default();
        holders.sort();
        holders
    }

    fn request(
        &self,
        owner: LockOwnerId,
        resource: LockResource,
        level: LockLevel,
        wait: LockWait,
    ) -> CryptResult<bool> {
        let deadline = Instant::now() + self.timeout;
        let mut table = self.table.lock();
        // owners already told about this request, at the level they held then
        let mut notified: HashMap<LockOwnerId, LockLevel> = HashMap::new();
        let mut timed_out = false;

        loop {
            let conflicts = table.conflicts(resource, owner, level);
            if conflicts.is_empty() {
                table.grant(resource, owner, level);
                self.cond.notify_all();
                trace!(%owner, %resource, ?level, "lock granted");
                return Ok(true);
            }
            if wait == LockWait::NoWait {
                trace!(%owner, %resource, ?level, "lock denied");
                return Ok(false);
            }
            if timed_out {
                return Err(CryptError::lock_timeout(resource.to_string()));
            }

            for (holder, held) in conflicts {
                if notified.get(&holder) == Some(&held) {
                    continue;
                }
                notified.insert(holder, held);
                if let Some(tx) = table.clients.get(&holder) {
                    debug!(%owner, %holder, %resource, ?level, "sending blocking AST");
                    let _ = tx.send(BlockingAst {
                        resource,
                        requested: level,
                        requester: owner,
                    });
                }
            }

            timed_out = self.cond.wait_until(&mut table, deadline).timed_out();
        }
    }

    fn disconnect(&self, owner: LockOwnerId) {
        let mut table = self.table.lock();
        table.clients.remove(&owner);
        for state in table.resources.values_mut() {
            state.holders.remove(&owner);
        }
        self.cond.notify_all();
        debug!(%owner, "lock client disconnected");
    }
}

/// A client connected to a [`LocalLockManager`].
#[derive(Debug)]
pub struct LocalLockClient {
    manager: Arc<LocalLockManager>,
    owner: LockOwnerId,
}

impl LockClient for LocalLockClient {
    fn owner(&self) -> LockOwnerId {
        self.owner
    }

    fn lock(&self, resource: LockResource, level: LockLevel, wait: LockWait) -> CryptResult<bool> {
        self.manager.request(self.owner, resource, level, wait)
    }

    fn convert(
        &self,
        resource: LockResource,
        level: LockLevel,
        wait: LockWait,
    ) -> CryptResult<bool> {
        let current = self.level(resource);
        if current == LockLevel::None {
            return Err(CryptError::invalid_operation(format!(
                "cannot convert {resource}: not held"
            )));
        }
        self.manager.request(self.owner, resource, level, wait)
    }

    fn downgrade(&self, resource: LockResource, from: LockLevel, to: LockLevel) -> bool {
        let mut table = self.manager.table.lock();
        if to >= from || table.level(resource, self.owner) != from {
            return false;
        }
        table.grant(resource, self.owner, to);
        self.manager.cond.notify_all();
        trace!(owner = %self.owner, %resource, ?from, ?to, "lock downgraded");
        true
    }

    fn release(&self, resource: LockResource) {
        let mut table = self.manager.table.lock();
        table.grant(resource, self.owner, LockLevel::None);
        self.manager.cond.notify_all();
    }

    fn level(&self, resource: LockResource) -> LockLevel {
        self.manager.table.lock().level(resource, self.owner)
    }

    fn read_data(&self, resource: LockResource) -> u64 {
        self.manager
            .table
            .lock()
            .resources
            .get(&resource)
            .map_or(0, |state| state.data)
    }

    fn write_data(&self, resource: LockResource, data: u64) {
        self.manager
            .table
            .lock()
            .resources
            .entry(resource)
            .or_default()
            .data = data;
    }
}

impl Drop for LocalLockClient {
    fn drop(&mut self) {
        self.manager.disconnect(self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn compatibility_matrix() {
        use LockLevel::*;
        assert!(Release.compatible(Change));
        assert!(Normal.compatible(Normal));
        assert!(Normal.compatible(Release));
        assert!(!Normal.compatible(Change));
        assert!(!Change.compatible(Change));
        assert!(!Init.compatible(Release));
        assert!(None.compatible(Init));
    }

    #[test]
    fn shared_locks_coexist() {
        let manager = LocalLockManager::new();
        let (a, _rx_a) = manager.connect();
        let (b, _rx_b) = manager.connect();

        assert!(a.lock(LockResource::CryptState, LockLevel::Normal, LockWait::Wait).unwrap());
        assert!(b.lock(LockResource::CryptState, LockLevel::Normal, LockWait::Wait).unwrap());
        assert_eq!(manager.holders(LockResource::CryptState).len(), 2);
    }

    #[test]
    fn no_wait_is_denied_without_ast() {
        let manager = LocalLockManager::new();
        let (a, rx_a) = manager.connect();
        let (b, _rx_b) = manager.connect();

        assert!(a.lock(LockResource::CryptSweep, LockLevel::Init, LockWait::NoWait).unwrap());
        assert!(!b.lock(LockResource::CryptSweep, LockLevel::Init, LockWait::NoWait).unwrap());
        assert!(rx_a.try_recv().is_err());
        assert_eq!(b.level(LockResource::CryptSweep), LockLevel::None);
    }

    #[test]
    fn conflicting_wait_sends_ast_and_proceeds_after_downgrade() {
        let manager = LocalLockManager::new();
        let (a, rx_a) = manager.connect();
        let (b, _rx_b) = manager.connect();
        a.lock(LockResource::CryptState, LockLevel::Normal, LockWait::Wait).unwrap();

        let responder = thread::spawn(move || {
            let ast = rx_a.recv().unwrap();
            assert_eq!(ast.requested, LockLevel::Change);
            a.convert(ast.resource, LockLevel::Release, LockWait::NoWait).unwrap();
            a
        });

        assert!(b.lock(LockResource::CryptState, LockLevel::Change, LockWait::Wait).unwrap());
        let a = responder.join().unwrap();
        assert_eq!(a.level(LockResource::CryptState), LockLevel::Release);
        assert_eq!(b.level(LockResource::CryptState), LockLevel::Change);
    }

    #[test]
    fn waiting_times_out() {
        let manager = LocalLockManager::with_timeout(Duration::from_millis(50));
        let (a, _rx_a) = manager.connect();
        let (b, _rx_b) = manager.connect();
        a.lock(LockResource::CryptState, LockLevel::Init, LockWait::Wait).unwrap();

        let err = b
            .lock(LockResource::CryptState, LockLevel::Normal, LockWait::Wait)
            .unwrap_err();
        assert!(matches!(err, CryptError::LockTimeout { .. }));
    }

    #[test]
    fn dropping_client_releases_locks() {
        let manager = LocalLockManager::new();
        let (a, _rx_a) = manager.connect();
        let (b, _rx_b) = manager.connect();
        a.lock(LockResource::CryptSweep, LockLevel::Init, LockWait::Wait).unwrap();
        drop(a);

        assert!(b.lock(LockResource::CryptSweep, LockLevel::Init, LockWait::NoWait).unwrap());
    }

    #[test]
    fn data_word_is_shared() {
        let manager = LocalLockManager::new();
        let (a, _rx_a) = manager.connect();
        let (b, _rx_b) = manager.connect();

        a.write_data(LockResource::CryptState, 42);
        assert_eq!(b.read_data(LockResource::CryptState), 42);
        assert_eq!(b.read_data(LockResource::CryptSweep), 0);
    }

    #[test]
    fn downgrade_only_from_expected_level() {
        let manager = LocalLockManager::new();
        let (a, _rx_a) = manager.connect();
        a.lock(LockResource::CryptState, LockLevel::Change, LockWait::Wait).unwrap();

        assert!(!a.downgrade(LockResource::CryptState, LockLevel::Normal, LockLevel::Release));
        assert_eq!(a.level(LockResource::CryptState), LockLevel::Change);

        a.convert(LockResource::CryptState, LockLevel::Normal, LockWait::Wait).unwrap();
        assert!(a.downgrade(LockResource::CryptState, LockLevel::Normal, LockLevel::Release));
        assert_eq!(a.level(LockResource::CryptState), LockLevel::Release);
    }

    #[test]
    fn convert_requires_a_held_lock() {
        let manager = LocalLockManager::new();
        let (a, _rx_a) = manager.connect();
        assert!(a
            .convert(LockResource::CryptState, LockLevel::Normal, LockWait::Wait)
            .is_err());
    }
}
