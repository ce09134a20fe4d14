//! I/O barrier between page traffic and encryption state changes.
//!
//! Page reads and writes are frequent and must run in parallel; state
//! changes are rare and need a view with no page I/O in flight. The barrier
//! keeps a single signed counter:
//!
//! ```text
//! gate = in_flight_io - SPAN * (local_exclusive_requests + unpaid_remote_debts)
//! ```
//!
//! While the gate is non-negative, `io_begin` is one compare-and-swap.
//! A negative gate means either a local exclusive request or a remote
//! notification is pending, and new I/O waits.
//!
//! Remote notifications arrive on a foreign thread and must not block, so
//! [`Barrier::notify`] only subtracts `SPAN` and runs the lightweight hook.
//! The full resync is owed as a *debt*: the last I/O to leave (or the next
//! to arrive, if none is in flight) pays it before any new I/O proceeds.

use crate::error::CryptResult;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::{debug, warn};

/// Weight of one exclusive request or remote debt in the gate counter.
///
/// In-flight I/O never reaches this many operations, so the low part of
/// the gate always counts I/O exactly.
pub const BARRIER_SPAN: i64 = 1 << 32;

/// Callbacks the barrier runs on behalf of its owner.
pub trait BarrierSync: Send + Sync {
    /// Re-reads shared state after a remote change.
    ///
    /// Runs with no I/O in flight and no other resync running.
    ///
    /// # Errors
    ///
    /// A failed resync leaves the debt in place; the next boundary retries.
    fn resync(&self) -> CryptResult<()>;

    /// Reacts to a remote notification on the notifying thread.
    ///
    /// Must not block or take locks that page I/O may hold.
    fn on_notify(&self);
}

/// Identity of the current exclusive holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerToken(u64);

#[derive(Debug, Default)]
struct BarrierState {
    local_requests: u32,
    owner: Option<OwnerToken>,
    resyncing: bool,
}

/// Reader/writer barrier with deferred remote resync.
#[derive(Debug)]
pub struct Barrier {
    gate: AtomicI64,
    debt: AtomicU64,
    epoch: AtomicU64,
    next_token: AtomicU64,
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Barrier {
    /// Creates an idle barrier.
    #[must_use]
    pub fn new() -> Self {
        Self {
            gate: AtomicI64::new(0),
            debt: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            next_token: AtomicU64::new(1),
            state: Mutex::new(BarrierState::default()),
            cond: Condvar::new(),
        }
    }

    /// Enters an I/O critical section.
    ///
    /// Blocks while an exclusive holder or request exists. If a remote debt
    /// is owed and nothing is in flight, the caller pays it first.
    ///
    /// # Errors
    ///
    /// Returns the resync error if this caller had to pay a debt and the
    /// resync failed.
    pub fn io_begin<'a>(&'a self, sync: &'a dyn BarrierSync) -> CryptResult<IoGuard<'a>> {
        if !self.try_enter() {
            self.io_begin_slow(sync)?;
        }
        Ok(IoGuard {
            barrier: self,
            sync: Some(sync),
        })
    }

    /// Enters an I/O critical section on behalf of the exclusive holder.
    ///
    /// The holder rewrites pages through the ordinary I/O path while it
    /// keeps everyone else out, so it must not wait for itself.
    ///
    /// # Panics
    ///
    /// Panics if `owner` was issued by a different barrier.
    pub fn io_begin_as<'a>(&'a self, owner: &ExclusiveGuard<'a>) -> IoGuard<'a> {
        assert!(
            std::ptr::eq(owner.barrier, self),
            "exclusive guard belongs to another barrier"
        );
        self.gate.fetch_add(1, Ordering::SeqCst);
        IoGuard {
            barrier: self,
            sync: None,
        }
    }

    /// Requests exclusive access.
    ///
    /// Blocks new I/O immediately, waits for in-flight I/O to drain, then
    /// settles any outstanding remote debt as the holder.
    ///
    /// # Errors
    ///
    /// Returns the resync error if settling the debt failed. The request is
    /// withdrawn in that case and waiters are released.
    pub fn lock_begin<'a>(&'a self, sync: &'a dyn BarrierSync) -> CryptResult<ExclusiveGuard<'a>> {
        let mut state = self.state.lock();
        state.local_requests += 1;
        self.gate.fetch_sub(BARRIER_SPAN, Ordering::SeqCst);

        let mut pending = PendingLock {
            barrier: self,
            state,
            armed: true,
        };

        loop {
            let gate = self.gate.load(Ordering::SeqCst);
            if pending.state.owner.is_none() && !pending.state.resyncing && in_flight(gate) == 0 {
                break;
            }
            self.cond.wait(&mut pending.state);
        }

        let token = OwnerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        pending.state.owner = Some(token);

        let owed = self.debt.load(Ordering::SeqCst);
        if owed > 0 {
            debug!(owed, "settling remote debt under exclusive lock");
            if let Err(err) = MutexGuard::unlocked(&mut pending.state, || sync.resync()) {
                pending.state.owner = None;
                return Err(err);
            }
            self.repay(owed);
        }

        pending.armed = false;
        Ok(ExclusiveGuard {
            barrier: self,
            token,
        })
    }

    /// Records a remote notification.
    ///
    /// Safe to call from any thread: never blocks and never takes the
    /// barrier mutex. Only the lightweight hook runs here; the full resync
    /// happens at the next I/O boundary.
    pub fn notify(&self, sync: &dyn BarrierSync) {
        // debt before gate: anyone who sees the negative gate also sees the debt
        self.debt.fetch_add(1, Ordering::SeqCst);
        self.gate.fetch_sub(BARRIER_SPAN, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        sync.on_notify();
    }

    /// Returns whether a remote debt is still owed.
    #[must_use]
    pub fn has_debt(&self) -> bool {
        self.debt.load(Ordering::SeqCst) > 0
    }

    /// Returns the number of notifications received so far.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Returns the number of I/O sections currently open.
    #[must_use]
    pub fn in_flight(&self) -> i64 {
        in_flight(self.gate.load(Ordering::SeqCst))
    }

    /// Returns whether nothing is in flight, requested or owed.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.gate.load(Ordering::SeqCst) == 0
    }

    fn try_enter(&self) -> bool {
        let mut current = self.gate.load(Ordering::SeqCst);
        while current >= 0 {
            match self.gate.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    fn io_begin_slow(&self, sync: &dyn BarrierSync) -> CryptResult<()> {
        let mut state = self.state.lock();
        loop {
            if self.try_enter() {
                return Ok(());
            }
            if self.debt_payable(&state) {
                self.settle_debt(&mut state, sync)?;
                continue;
            }
            self.cond.wait(&mut state);
        }
    }

    fn io_end(&self, sync: Option<&dyn BarrierSync>) {
        let now = self.gate.fetch_sub(1, Ordering::SeqCst) - 1;
        if now >= 0 || in_flight(now) != 0 {
            return;
        }

        // Last I/O out while something is waiting.
        let mut state = self.state.lock();
        if let Some(sync) = sync {
            if self.debt_payable(&state) {
                if let Err(err) = self.settle_debt(&mut state, sync) {
                    warn!(error = %err, "deferred resync failed, next I/O retries");
                }
            }
        }
        self.cond.notify_all();
    }

    fn debt_payable(&self, state: &BarrierState) -> bool {
        state.local_requests == 0
            && !state.resyncing
            && self.debt.load(Ordering::SeqCst) > 0
            && in_flight(self.gate.load(Ordering::SeqCst)) == 0
    }

    fn settle_debt(
        &self,
        state: &mut MutexGuard<'_, BarrierState>,
        sync: &dyn BarrierSync,
    ) -> CryptResult<()> {
        let owed = self.debt.load(Ordering::SeqCst);
        state.resyncing = true;
        let result = MutexGuard::unlocked(state, || sync.resync());
        state.resyncing = false;
        if result.is_ok() {
            self.repay(owed);
        }
        self.cond.notify_all();
        result
    }

    fn repay(&self, owed: u64) {
        // gate before debt: a negative gate must never be seen without its cause
        let owed_gate = i64::try_from(owed).unwrap_or(i64::MAX / BARRIER_SPAN) * BARRIER_SPAN;
        self.gate.fetch_add(owed_gate, Ordering::SeqCst);
        self.debt.fetch_sub(owed, Ordering::SeqCst);
    }

    fn lock_end(&self, token: OwnerToken) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.owner, Some(token));
        state.owner = None;
        self.gate.fetch_add(BARRIER_SPAN, Ordering::SeqCst);
        state.local_requests -= 1;
        self.cond.notify_all();
    }
}

fn in_flight(gate: i64) -> i64 {
    gate.rem_euclid(BARRIER_SPAN)
}

/// Withdraws a half-finished exclusive request if `lock_begin` bails out.
struct PendingLock<'a> {
    barrier: &'a Barrier,
    state: MutexGuard<'a, BarrierState>,
    armed: bool,
}

impl Drop for PendingLock<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.local_requests -= 1;
            self.barrier.gate.fetch_add(BARRIER_SPAN, Ordering::SeqCst);
            self.barrier.cond.notify_all();
        }
    }
}

/// An open I/O section. Dropping it ends the section.
#[must_use = "dropping the guard ends the I/O section"]
pub struct IoGuard<'a> {
    barrier: &'a Barrier,
    sync: Option<&'a dyn BarrierSync>,
}

impl IoGuard<'_> {
    /// Ends the I/O section.
    pub fn end(self) {}
}

impl Drop for IoGuard<'_> {
    fn drop(&mut self) {
        self.barrier.io_end(self.sync);
    }
}

/// Exclusive access to the barrier. Dropping it releases the lock.
#[must_use = "dropping the guard releases exclusive access"]
pub struct ExclusiveGuard<'a> {
    barrier: &'a Barrier,
    token: OwnerToken,
}

impl ExclusiveGuard<'_> {
    /// Returns the owner token of this hold.
    #[must_use]
    pub fn token(&self) -> OwnerToken {
        self.token
    }

    /// Releases exclusive access.
    pub fn end(self) {}
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.barrier.lock_end(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CryptError;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSync {
        resyncs: AtomicUsize,
        notifies: AtomicUsize,
        failures_left: AtomicUsize,
    }

    impl BarrierSync for CountingSync {
        fn resync(&self) -> CryptResult<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CryptError::crypt("resync failed"));
            }
            self.resyncs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_notify(&self) {
            self.notifies.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn io_sections_nest_freely() {
        let barrier = Barrier::new();
        let sync = CountingSync::default();

        let a = barrier.io_begin(&sync).unwrap();
        let b = barrier.io_begin(&sync).unwrap();
        assert_eq!(barrier.in_flight(), 2);
        drop(a);
        b.end();
        assert!(barrier.is_idle());
    }

    #[test]
    fn lock_holder_never_sees_io() {
        let barrier = Arc::new(Barrier::new());
        let sync = Arc::new(CountingSync::default());
        let active = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let workers: Vec<_> = (0..6)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let sync = Arc::clone(&sync);
                let active = Arc::clone(&active);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        let guard = barrier.io_begin(sync.as_ref()).unwrap();
                        active.fetch_add(1, Ordering::SeqCst);
                        thread::yield_now();
                        active.fetch_sub(1, Ordering::SeqCst);
                        drop(guard);
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            let lock = barrier.lock_begin(sync.as_ref()).unwrap();
            assert_eq!(active.load(Ordering::SeqCst), 0);
            thread::yield_now();
            assert_eq!(active.load(Ordering::SeqCst), 0);
            drop(lock);
        }

        stop.store(true, Ordering::SeqCst);
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(barrier.is_idle());
    }

    #[test]
    fn holder_io_is_reentrant() {
        let barrier = Barrier::new();
        let sync = CountingSync::default();

        let lock = barrier.lock_begin(&sync).unwrap();
        let io = barrier.io_begin_as(&lock);
        assert_eq!(barrier.in_flight(), 1);
        drop(io);
        drop(lock);
        assert!(barrier.is_idle());
    }

    #[test]
    fn notify_defers_resync_to_next_io() {
        let barrier = Barrier::new();
        let sync = CountingSync::default();

        barrier.notify(&sync);
        assert_eq!(sync.notifies.load(Ordering::SeqCst), 1);
        assert_eq!(sync.resyncs.load(Ordering::SeqCst), 0);
        assert!(barrier.has_debt());
        assert_eq!(barrier.epoch(), 1);

        let io = barrier.io_begin(&sync).unwrap();
        assert_eq!(sync.resyncs.load(Ordering::SeqCst), 1);
        assert!(!barrier.has_debt());
        drop(io);

        let io = barrier.io_begin(&sync).unwrap();
        drop(io);
        assert_eq!(sync.resyncs.load(Ordering::SeqCst), 1);
        assert!(barrier.is_idle());
    }

    #[test]
    fn last_io_out_pays_the_debt() {
        let barrier = Barrier::new();
        let sync = CountingSync::default();

        let first = barrier.io_begin(&sync).unwrap();
        let second = barrier.io_begin(&sync).unwrap();
        barrier.notify(&sync);

        drop(first);
        assert_eq!(sync.resyncs.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(sync.resyncs.load(Ordering::SeqCst), 1);
        assert!(barrier.is_idle());
    }

    #[test]
    fn notifications_pile_up_into_one_resync() {
        let barrier = Barrier::new();
        let sync = CountingSync::default();

        barrier.notify(&sync);
        barrier.notify(&sync);
        barrier.notify(&sync);

        drop(barrier.io_begin(&sync).unwrap());
        assert_eq!(sync.resyncs.load(Ordering::SeqCst), 1);
        assert_eq!(barrier.epoch(), 3);
        assert!(barrier.is_idle());
    }

    #[test]
    fn waiting_io_resumes_after_lock_end() {
        let barrier = Arc::new(Barrier::new());
        let sync = Arc::new(CountingSync::default());
        let entered = Arc::new(AtomicBool::new(false));

        let lock = barrier.lock_begin(sync.as_ref()).unwrap();
        let handle = {
            let barrier = Arc::clone(&barrier);
            let sync = Arc::clone(&sync);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let io = barrier.io_begin(sync.as_ref()).unwrap();
                entered.store(true, Ordering::SeqCst);
                drop(io);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        drop(lock);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn notify_does_not_block_behind_holder() {
        let barrier = Arc::new(Barrier::new());
        let sync = Arc::new(CountingSync::default());

        let lock = barrier.lock_begin(sync.as_ref()).unwrap();
        let notifier = {
            let barrier = Arc::clone(&barrier);
            let sync = Arc::clone(&sync);
            thread::spawn(move || barrier.notify(sync.as_ref()))
        };
        notifier.join().unwrap();
        assert_eq!(sync.notifies.load(Ordering::SeqCst), 1);
        drop(lock);

        drop(barrier.io_begin(sync.as_ref()).unwrap());
        assert_eq!(sync.resyncs.load(Ordering::SeqCst), 1);
        assert!(barrier.is_idle());
    }

    #[test]
    fn failed_lock_begin_withdraws_request() {
        let barrier = Barrier::new();
        let sync = CountingSync::default();
        sync.failures_left.store(1, Ordering::SeqCst);

        barrier.notify(&sync);
        assert!(barrier.lock_begin(&sync).is_err());
        assert!(barrier.has_debt());

        // Request withdrawn: ordinary I/O can settle the debt and proceed.
        drop(barrier.io_begin(&sync).unwrap());
        assert!(!barrier.has_debt());

        drop(barrier.lock_begin(&sync).unwrap());
        assert!(barrier.is_idle());
    }

    #[test]
    fn failed_resync_surfaces_on_io_begin() {
        let barrier = Barrier::new();
        let sync = CountingSync::default();
        sync.failures_left.store(1, Ordering::SeqCst);

        barrier.notify(&sync);
        assert!(barrier.io_begin(&sync).is_err());
        assert!(barrier.has_debt());

        drop(barrier.io_begin(&sync).unwrap());
        assert!(barrier.is_idle());
    }
}
