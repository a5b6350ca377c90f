use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AttachPhase {
    Detached,
    AttachInProgress,
    Attached,
}

/// Result of an attach race entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// This caller won the Detached → AttachInProgress transition and is
    /// responsible for getting a debugger to the process.
    WonRace,
    /// Another thread is already driving the attach.
    AlreadyInProgress,
    AlreadyAttached,
}

/// Tracks the attach/detach lifecycle and resolves the on-demand-attach race:
/// exactly one thread wins the transition out of `Detached`; everyone else
/// parks on a gate released when the peer completes the handshake.
pub struct AttachCoordinator {
    phase: Mutex<AttachPhase>,
    gate: Condvar,
    launch_requested: AtomicBool,
}

impl Default for AttachCoordinator {
    fn default() -> Self {
        Self {
            phase: Mutex::new(AttachPhase::Detached),
            gate: Condvar::new(),
            launch_requested: AtomicBool::new(false),
        }
    }
}

impl AttachCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> AttachPhase {
        *self.phase.lock().expect("attach state poisoned")
    }

    pub fn is_attached(&self) -> bool {
        self.phase() == AttachPhase::Attached
    }

    /// Compare-and-set entry into the attach pipeline.
    pub fn try_begin_attach(&self) -> AttachOutcome {
        let mut phase = self.phase.lock().expect("attach state poisoned");
        match *phase {
            AttachPhase::Detached => {
                *phase = AttachPhase::AttachInProgress;
                info!(target: "attach", "attach started");
                AttachOutcome::WonRace
            }
            AttachPhase::AttachInProgress => AttachOutcome::AlreadyInProgress,
            AttachPhase::Attached => AttachOutcome::AlreadyAttached,
        }
    }

    /// Park until the in-progress attach completes (or unwinds back to
    /// detached). Returns immediately in any other phase.
    pub fn wait_for_attach(&self) {
        let mut phase = self.phase.lock().expect("attach state poisoned");
        while *phase == AttachPhase::AttachInProgress {
            debug!(target: "attach", "parked waiting for attach");
            phase = self.gate.wait(phase).expect("attach state poisoned");
        }
    }

    /// Peer handshake completed. Releases the gate. Idempotent.
    pub fn mark_attached(&self) {
        let mut phase = self.phase.lock().expect("attach state poisoned");
        if *phase != AttachPhase::Attached {
            info!(target: "attach", "peer attached");
            *phase = AttachPhase::Attached;
            self.gate.notify_all();
        }
    }

    /// Back to detached, waking any gate parkers. Idempotent.
    pub fn mark_detached(&self) {
        let mut phase = self.phase.lock().expect("attach state poisoned");
        if *phase != AttachPhase::Detached {
            info!(target: "attach", "peer detached");
            *phase = AttachPhase::Detached;
            self.launch_requested.store(false, Ordering::SeqCst);
            self.gate.notify_all();
        }
    }

    /// The attach winner asks the host to launch a debugger.
    pub fn request_launch(&self) {
        self.launch_requested.store(true, Ordering::SeqCst);
    }

    pub fn launch_requested(&self) -> bool {
        self.launch_requested.load(Ordering::SeqCst)
    }
}
