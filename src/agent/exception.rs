use crate::agent::error::Error;
use crate::agent::lock::InnerLockToken;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use strum_macros::{Display, IntoStaticStr};

/// Identity of one in-flight exception instance, assigned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExceptionId(pub u64);

impl fmt::Display for ExceptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exception#{}", self.0)
    }
}

/// The mutually exclusive final phases of an exception. For one exception
/// instance at most one of these ever fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum TerminalPhase {
    CatchHandlerFound,
    UnwindBegin,
    Unhandled,
}

#[derive(Debug, Default, Clone)]
struct ExceptionRecord {
    first_chance: bool,
    user_first_chance: bool,
    terminal: Option<TerminalPhase>,
}

/// Per-exception-instance phase bookkeeping. Enforces that FirstChance and
/// UserFirstChance each fire at most once, and that the terminal phases stay
/// mutually exclusive.
#[derive(Default)]
pub(crate) struct ExceptionTracker {
    records: Mutex<HashMap<ExceptionId, ExceptionRecord>>,
}

impl ExceptionTracker {
    pub fn note_first_chance(&self, id: ExceptionId) -> Result<(), Error> {
        let _token = InnerLockToken::new();
        let mut records = self.records.lock().expect("exception records poisoned");
        let rec = records.entry(id).or_default();
        if rec.first_chance {
            return Err(Error::ExceptionPhase(id, "FirstChance"));
        }
        rec.first_chance = true;
        Ok(())
    }

    pub fn note_user_first_chance(&self, id: ExceptionId) -> Result<(), Error> {
        let _token = InnerLockToken::new();
        let mut records = self.records.lock().expect("exception records poisoned");
        let rec = records.entry(id).or_default();
        if rec.user_first_chance {
            return Err(Error::ExceptionPhase(id, "UserFirstChance"));
        }
        rec.user_first_chance = true;
        Ok(())
    }

    pub fn note_terminal(&self, id: ExceptionId, phase: TerminalPhase) -> Result<(), Error> {
        let _token = InnerLockToken::new();
        let mut records = self.records.lock().expect("exception records poisoned");
        let rec = records.entry(id).or_default();
        if rec.terminal.is_some() {
            return Err(Error::ExceptionPhase(id, phase.into()));
        }
        rec.terminal = Some(phase);
        Ok(())
    }

    pub fn clear(&self) {
        let _token = InnerLockToken::new();
        self.records
            .lock()
            .expect("exception records poisoned")
            .clear();
    }
}
