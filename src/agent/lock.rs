use crate::agent::error::{self, Error};
use log::{debug, info};
use std::cell::Cell;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use strum_macros::Display;

/// Modes of the exclusive agent lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LockMode {
    /// Ordinary mutual exclusion.
    Normal,
    /// Entry into engine logic is forbidden, acquirers park until re-enabled.
    Disabled,
    /// Process teardown: acquire and release become no-ops. Terminal.
    ShuttingDown,
}

struct LockCore {
    owner: Option<ThreadId>,
    depth: u32,
    mode: LockMode,
}

/// The outermost lock of the engine. Reentrant, owner-tracked, guarding every
/// piece of engine state that is not behind its own inner lock.
///
/// Lock ordering contract: a thread must never call [`AgentLock::acquire`]
/// while holding the patch-table lock or any other inner engine lock. The
/// acquire path verifies this against a thread-local count of held inner
/// locks and fails the whole session on a violation.
pub struct AgentLock {
    core: Mutex<LockCore>,
    freed: Condvar,
}

impl Default for AgentLock {
    fn default() -> Self {
        Self {
            core: Mutex::new(LockCore {
                owner: None,
                depth: 0,
                mode: LockMode::Normal,
            }),
            freed: Condvar::new(),
        }
    }
}

impl AgentLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock is owned by the calling thread, reentering if it
    /// already is. In `ShuttingDown` mode a no-op guard is returned instead;
    /// in `Disabled` mode the caller parks until the lock is re-enabled.
    pub fn acquire(&self) -> Result<AgentGuard<'_>, Error> {
        if error::is_unrecoverable() {
            return Err(Error::Unrecoverable);
        }
        if inner_locks_held() != 0 {
            debug_assert!(false, "agent lock acquired under an inner lock");
            error::set_unrecoverable("agent lock acquired under an inner lock");
            return Err(Error::LockOrder);
        }

        let me = thread::current().id();
        let mut core = self.core.lock().expect("agent lock poisoned");
        loop {
            match core.mode {
                LockMode::ShuttingDown => {
                    return Ok(AgentGuard {
                        lock: self,
                        noop: true,
                    });
                }
                LockMode::Disabled => {
                    debug!(target: "agent", "lock disabled, {me:?} parked");
                    core = self.freed.wait(core).expect("agent lock poisoned");
                }
                LockMode::Normal => {
                    if core.owner == Some(me) {
                        core.depth += 1;
                        return Ok(AgentGuard {
                            lock: self,
                            noop: false,
                        });
                    }
                    if core.owner.is_none() {
                        core.owner = Some(me);
                        core.depth = 1;
                        return Ok(AgentGuard {
                            lock: self,
                            noop: false,
                        });
                    }
                    core = self.freed.wait(core).expect("agent lock poisoned");
                }
            }
        }
    }

    pub fn mode(&self) -> LockMode {
        self.core.lock().expect("agent lock poisoned").mode
    }

    /// Toggle `Normal` ↔ `Disabled`. The attach/detach pipeline uses this to
    /// demand exclusivity. No effect once shutting down.
    pub fn set_disabled(&self, disabled: bool) {
        let mut core = self.core.lock().expect("agent lock poisoned");
        match (core.mode, disabled) {
            (LockMode::Normal, true) => {
                info!(target: "agent", "lock disabled");
                core.mode = LockMode::Disabled;
            }
            (LockMode::Disabled, false) => {
                info!(target: "agent", "lock re-enabled");
                core.mode = LockMode::Normal;
                self.freed.notify_all();
            }
            _ => {}
        }
    }

    /// Enter the terminal `ShuttingDown` mode. Parked acquirers are woken and
    /// receive no-op guards.
    pub fn begin_shutdown(&self) {
        let mut core = self.core.lock().expect("agent lock poisoned");
        if core.mode != LockMode::ShuttingDown {
            info!(target: "agent", "lock shutting down");
            core.mode = LockMode::ShuttingDown;
            self.freed.notify_all();
        }
    }

    pub fn held_by_current_thread(&self) -> bool {
        let core = self.core.lock().expect("agent lock poisoned");
        core.owner == Some(thread::current().id())
    }
}

/// RAII ownership of [`AgentLock`]: release on every exit path is structural.
pub struct AgentGuard<'a> {
    lock: &'a AgentLock,
    noop: bool,
}

impl AgentGuard<'_> {
    /// True when the guard was produced in `ShuttingDown` mode and protects
    /// nothing. Callers skip work that requires real exclusivity.
    pub fn is_noop(&self) -> bool {
        self.noop
    }
}

impl Drop for AgentGuard<'_> {
    fn drop(&mut self) {
        if self.noop {
            return;
        }
        let mut core = self.lock.core.lock().expect("agent lock poisoned");
        if core.mode == LockMode::ShuttingDown {
            return;
        }
        debug_assert_eq!(core.owner, Some(thread::current().id()));
        core.depth -= 1;
        if core.depth == 0 {
            core.owner = None;
            self.lock.freed.notify_all();
        }
    }
}

thread_local! {
    static INNER_LOCKS: Cell<u32> = Cell::new(0);
}

/// Number of engine inner locks held by the calling thread.
pub(crate) fn inner_locks_held() -> u32 {
    INNER_LOCKS.with(|c| c.get())
}

/// Witness of a held inner lock (patch table, code table, and friends). Keep
/// one alive for exactly as long as the inner lock is held, so the agent lock
/// can verify the ordering contract at acquire time.
pub(crate) struct InnerLockToken(());

impl InnerLockToken {
    pub(crate) fn new() -> Self {
        INNER_LOCKS.with(|c| c.set(c.get() + 1));
        InnerLockToken(())
    }
}

impl Drop for InnerLockToken {
    fn drop(&mut self) {
        INNER_LOCKS.with(|c| c.set(c.get() - 1));
    }
}
