use crate::agent::code::{DomainKey, ThreadHandle};
use crate::agent::error::Error;
use crate::agent::lock::InnerLockToken;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;

/// Collaborator service: the host runtime's native thread pause/resume
/// primitives. Threads pause cooperatively at safe points; only the dedicated
/// listener thread is exempt from suspension.
pub trait ThreadSuspender: Send + Sync {
    /// Mark every runtime thread for cooperative pause. Returns `true` when
    /// all of them already sit at safe points, `false` when a sweep is needed.
    fn suspend_cooperatively(&self) -> bool;

    /// Resume every previously paused thread, optionally only those of one
    /// application domain.
    fn resume_all(&self, domain: Option<DomainKey>);

    /// Whether the given thread currently rests at a safe point.
    fn thread_at_safe_point(&self, thread: ThreadHandle) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    /// Request arrived during teardown and was dropped, state untouched.
    Dropped,
    /// Already trapping or stopped, the second request is a no-op.
    AlreadyInProgress,
    /// This request initiated trapping.
    Trapping,
}

#[derive(Default)]
struct SuspendFlags {
    trapping: bool,
    stopped: bool,
}

/// Stop-the-world controller: `Running → Trapping → Stopped → Running`.
///
/// `trapping` is raised when a suspension request begins and cleared only by
/// [`SuspensionController::release`]; `stopped` is raised once every thread
/// reached a safe point. Invariant: `stopped ⇒ trapping`.
pub struct SuspensionController {
    flags: Mutex<SuspendFlags>,
    resumed: Condvar,
    /// Threads currently inside unsafe regions. Vetoes collection, never
    /// suspension.
    threads_at_unsafe: AtomicU32,
    /// Live runtime threads, swept for safe-point arrival.
    roster: Mutex<HashSet<ThreadHandle>>,
}

impl Default for SuspensionController {
    fn default() -> Self {
        Self {
            flags: Mutex::default(),
            resumed: Condvar::new(),
            threads_at_unsafe: AtomicU32::new(0),
            roster: Mutex::default(),
        }
    }
}

impl SuspensionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_thread(&self, thread: ThreadHandle) {
        let _token = InnerLockToken::new();
        self.roster.lock().expect("roster poisoned").insert(thread);
    }

    pub fn unregister_thread(&self, thread: ThreadHandle) {
        let _token = InnerLockToken::new();
        self.roster.lock().expect("roster poisoned").remove(&thread);
    }

    pub fn live_threads(&self) -> Vec<ThreadHandle> {
        let _token = InnerLockToken::new();
        self.roster
            .lock()
            .expect("roster poisoned")
            .iter()
            .copied()
            .collect()
    }

    /// Begin stopping the world. Idempotent: a second request without an
    /// intervening release is a no-op. Requests made during process teardown
    /// are dropped, no correctness requirement survives process exit.
    pub fn request_suspension(
        &self,
        teardown: bool,
        suspender: &dyn ThreadSuspender,
    ) -> SuspendOutcome {
        if teardown {
            debug!(target: "suspend", "suspension request dropped, teardown in progress");
            return SuspendOutcome::Dropped;
        }

        {
            let mut flags = self.flags.lock().expect("suspend state poisoned");
            if flags.trapping || flags.stopped {
                return SuspendOutcome::AlreadyInProgress;
            }
            flags.trapping = true;
        }

        debug!(target: "suspend", "trapping runtime threads");
        if !suspender.suspend_cooperatively() {
            debug!(target: "suspend", "stragglers remain, sweep required");
        }
        SuspendOutcome::Trapping
    }

    /// Poll the live threads until every one rests at a safe point. Listener
    /// duty; unbounded by design, the wait ends when the threads comply.
    pub fn sweep(&self, suspender: &dyn ThreadSuspender) {
        loop {
            let threads = self.live_threads();
            let straggler = threads
                .iter()
                .find(|t| !suspender.thread_at_safe_point(**t));
            match straggler {
                None => break,
                Some(t) => {
                    debug!(target: "suspend", "{t} not yet at a safe point");
                    thread::yield_now();
                }
            }
        }
        debug!(target: "suspend", "all threads at safe points");
    }

    /// Mark the world stopped. Caller must have requested suspension first;
    /// marking a non-trapping world inconsistent is a fatal engine error.
    pub fn mark_stopped(&self) -> Result<(), Error> {
        let mut flags = self.flags.lock().expect("suspend state poisoned");
        if !flags.trapping {
            return Err(Error::StopWithoutTrap);
        }
        if !flags.stopped {
            flags.stopped = true;
            info!(target: "suspend", "world stopped");
        }
        Ok(())
    }

    /// Resume the world and wake everything parked in
    /// [`Self::wait_until_resumed`]. Safe to call on a running world.
    pub fn release(&self, suspender: &dyn ThreadSuspender, domain: Option<DomainKey>) {
        {
            let mut flags = self.flags.lock().expect("suspend state poisoned");
            if !flags.trapping && !flags.stopped {
                return;
            }
            flags.trapping = false;
            flags.stopped = false;
        }
        suspender.resume_all(domain);
        self.resumed.notify_all();
        info!(target: "suspend", "world resumed");
    }

    pub fn is_trapping(&self) -> bool {
        self.flags.lock().expect("suspend state poisoned").trapping
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.lock().expect("suspend state poisoned").stopped
    }

    /// Trapping or stopped.
    pub fn is_suspended(&self) -> bool {
        let flags = self.flags.lock().expect("suspend state poisoned");
        flags.trapping || flags.stopped
    }

    /// Park until the peer continues the runtime. Returns immediately on a
    /// running world.
    pub fn wait_until_resumed(&self) {
        let mut flags = self.flags.lock().expect("suspend state poisoned");
        while flags.trapping || flags.stopped {
            flags = self.resumed.wait(flags).expect("suspend state poisoned");
        }
    }

    /// Enter an unsafe region on the calling thread. The scope guard
    /// decrements the counter on drop.
    pub fn enter_unsafe_region(&self) -> UnsafeRegionScope<'_> {
        self.threads_at_unsafe.fetch_add(1, Ordering::SeqCst);
        UnsafeRegionScope { ctl: self }
    }

    pub fn threads_at_unsafe(&self) -> u32 {
        self.threads_at_unsafe.load(Ordering::SeqCst)
    }
}

/// Scope of one thread's stay inside an unsafe region.
pub struct UnsafeRegionScope<'a> {
    ctl: &'a SuspensionController,
}

impl Drop for UnsafeRegionScope<'_> {
    fn drop(&mut self) {
        // saturating at zero, an unmatched exit must not underflow
        let res = self
            .ctl
            .threads_at_unsafe
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        if res.is_err() {
            warn!(target: "suspend", "unsafe region counter underflow suppressed");
        }
    }
}
