use crate::agent::code::{CodeVersion, MethodToken, ModuleKey, ThreadHandle};
use crate::agent::exception::ExceptionId;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("config parsing error: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("dedicated listener already running")]
    ListenerAlreadyRunning,

    // --------------------------------- protocol errors -------------------------------------------
    #[error("duplicate patch at {module}:{method} (version {version})")]
    DuplicatePatch {
        module: ModuleKey,
        method: MethodToken,
        version: CodeVersion,
    },
    #[error("patch {0} not found")]
    UnknownPatchHandle(u32),
    #[error("function evaluation {0} not found")]
    UnknownEvalHandle(u32),
    #[error("thread {0} not found")]
    UnknownThread(ThreadHandle),
    #[error("no published code for {module}:{method}")]
    UnknownMethod {
        module: ModuleKey,
        method: MethodToken,
    },
    #[error("code version {version} of {module}:{method} already published")]
    DuplicateCodeVersion {
        module: ModuleKey,
        method: MethodToken,
        version: CodeVersion,
    },
    #[error("offset {il_offset} of version {version} has no machine location")]
    OffsetUnmapped { version: CodeVersion, il_offset: u32 },
    #[error("command {0} is not valid in the current state")]
    UnexpectedCommand(String),
    #[error("exception {0}: phase {1} conflicts with an already recorded phase")]
    ExceptionPhase(ExceptionId, &'static str),
    #[error("no peer attached")]
    PeerNotAttached,

    // --------------------------------- event buffer errors ---------------------------------------
    #[error("event buffer `{0}` is busy")]
    BufferBusy(&'static str),

    // --------------------------------- peer-side errors ------------------------------------------
    #[error("peer transport failure: {0}")]
    Transport(anyhow::Error),

    // --------------------------------- fatal engine errors ---------------------------------------
    #[error("agent lock acquired while an inner lock is held")]
    LockOrder,
    #[error("suspension marked stopped while not trapping")]
    StopWithoutTrap,
    #[error("debugging session is unrecoverable")]
    Unrecoverable,
}

impl Error {
    /// Whether this error poisons the whole debugging session (see [`set_unrecoverable`]).
    /// Non-fatal errors are surfaced to the peer as a reply code and recovered locally.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::ConfigParse(_) => false,
            Error::ListenerAlreadyRunning => false,
            Error::DuplicatePatch { .. } => false,
            Error::UnknownPatchHandle(_) => false,
            Error::UnknownEvalHandle(_) => false,
            Error::UnknownThread(_) => false,
            Error::UnknownMethod { .. } => false,
            Error::DuplicateCodeVersion { .. } => false,
            Error::OffsetUnmapped { .. } => false,
            Error::UnexpectedCommand(_) => false,
            Error::ExceptionPhase(_, _) => false,
            Error::PeerNotAttached => false,
            Error::BufferBusy(_) => false,
            // a dead peer is an implicit detach, not a poisoned session
            Error::Transport(_) => false,

            // currently fatal errors
            Error::LockOrder => true,
            Error::StopWithoutTrap => true,
            Error::Unrecoverable => true,
        }
    }
}

/// Process-wide flag raised by fatal engine errors. Once set, every engine
/// entry point fails fast with [`Error::Unrecoverable`] instead of risking an
/// inconsistent lock or suspension state. Terminal for the debugging session,
/// not for the process.
static UNRECOVERABLE: AtomicBool = AtomicBool::new(false);

#[inline(always)]
pub fn is_unrecoverable() -> bool {
    UNRECOVERABLE.load(Ordering::SeqCst)
}

/// Raise the unrecoverable flag. Logged once, on the raising call.
pub fn set_unrecoverable(reason: &str) {
    if !UNRECOVERABLE.swap(true, Ordering::SeqCst) {
        log::error!(target: "agent", "entering unrecoverable state: {reason}");
    }
}

/// Drop the unrecoverable flag. Only meaningful between debugging sessions,
/// i.e. after the old engine instance is fully torn down.
pub fn reset_unrecoverable() {
    UNRECOVERABLE.store(false, Ordering::SeqCst)
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "agent", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "agent", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
