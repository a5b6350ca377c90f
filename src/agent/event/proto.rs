use crate::agent::code::{CodeVersion, MethodToken, ModuleKey, ThreadHandle};
use crate::agent::error::Error;
use crate::agent::exception::ExceptionId;
use crate::agent::patch::{PatchRequest, PatchView};
use strum_macros::{AsRefStr, Display};

/// Direction of a protocol tag. Every tag declares one; the exhaustive
/// matches in [`DbgEvent::direction`] and [`DbgCommand::direction`] make a
/// missing declaration a compile error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Direction {
    /// Runtime → peer, fire-and-forget.
    Notification,
    /// Peer → runtime, the runtime writes a reply into the same buffer.
    CommandWithReply,
    /// Peer → runtime, no reply; the effect is observed through the runtime.
    CommandFireAndForget,
}

/// Outbound events. Each occupies the single-slot out buffer for the span of
/// one send.
#[derive(Debug, Clone, AsRefStr)]
pub enum DbgEvent {
    /// A code-visible patch fired.
    BreakpointHit { patch: u32, thread: ThreadHandle },
    /// A stepper patch fired.
    StepComplete { patch: u32, thread: ThreadHandle },
    ExceptionFirstChance {
        thread: ThreadHandle,
        exception: ExceptionId,
    },
    ExceptionUserFirstChance {
        thread: ThreadHandle,
        exception: ExceptionId,
    },
    ExceptionCatchHandlerFound {
        thread: ThreadHandle,
        exception: ExceptionId,
    },
    ExceptionUnwindBegin {
        thread: ThreadHandle,
        exception: ExceptionId,
    },
    ExceptionUnhandled {
        thread: ThreadHandle,
        exception: ExceptionId,
    },
    ModuleLoaded { module: ModuleKey },
    ModuleUnloaded { module: ModuleKey },
    ThreadCreated { thread: ThreadHandle },
    ThreadExited { thread: ThreadHandle },
    /// User diagnostic output routed through the debugger.
    LogMessage {
        thread: ThreadHandle,
        level: u32,
        category: String,
        message: String,
    },
    /// Execution reached an Edit-and-Continue trap on an old code version.
    /// The engine blocks for the peer's redirect decision after this.
    RemapOpportunity {
        patch: u32,
        thread: ThreadHandle,
        module: ModuleKey,
        method: MethodToken,
        old_version: CodeVersion,
        new_version: CodeVersion,
        il_offset: u32,
    },
    /// A patch could not be attached to a freshly published body.
    PatchBindFailed {
        patch: u32,
        module: ModuleKey,
        method: MethodToken,
        version: CodeVersion,
    },
    /// Every runtime thread reached a safe point, the world is stopped.
    SyncComplete,
    FuncEvalComplete { eval: u32, thread: ThreadHandle },
}

impl DbgEvent {
    pub fn direction(&self) -> Direction {
        match self {
            DbgEvent::BreakpointHit { .. } => Direction::Notification,
            DbgEvent::StepComplete { .. } => Direction::Notification,
            DbgEvent::ExceptionFirstChance { .. } => Direction::Notification,
            DbgEvent::ExceptionUserFirstChance { .. } => Direction::Notification,
            DbgEvent::ExceptionCatchHandlerFound { .. } => Direction::Notification,
            DbgEvent::ExceptionUnwindBegin { .. } => Direction::Notification,
            DbgEvent::ExceptionUnhandled { .. } => Direction::Notification,
            DbgEvent::ModuleLoaded { .. } => Direction::Notification,
            DbgEvent::ModuleUnloaded { .. } => Direction::Notification,
            DbgEvent::ThreadCreated { .. } => Direction::Notification,
            DbgEvent::ThreadExited { .. } => Direction::Notification,
            DbgEvent::LogMessage { .. } => Direction::Notification,
            DbgEvent::RemapOpportunity { .. } => Direction::Notification,
            DbgEvent::PatchBindFailed { .. } => Direction::Notification,
            DbgEvent::SyncComplete => Direction::Notification,
            DbgEvent::FuncEvalComplete { .. } => Direction::Notification,
        }
    }
}

/// Peer-settable engine behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugFlags {
    /// Forward user log messages to the peer.
    pub report_log_messages: bool,
    /// Stop the world on first-chance exceptions instead of only notifying.
    pub stop_on_first_chance: bool,
}

impl Default for DebugFlags {
    fn default() -> Self {
        Self {
            report_log_messages: true,
            stop_on_first_chance: false,
        }
    }
}

/// Inbound commands, dispatched strictly one at a time in arrival order.
#[derive(Debug, Clone, AsRefStr)]
pub enum DbgCommand {
    /// Resume the runtime. No reply, resumption itself is the visible effect.
    Continue,
    AddPatch(PatchRequest),
    RemovePatch { patch: u32 },
    ListPatches,
    SetDebugFlags(DebugFlags),
    /// Peer handshake completing an attach.
    Attach,
    Detach,
    FuncEvalSetup { thread: ThreadHandle },
    FuncEvalAbort { eval: u32 },
    /// Register an Edit-and-Continue source edit; the compiled body for the
    /// returned version arrives later through code-version publication.
    ApplyCodeEdit {
        module: ModuleKey,
        method: MethodToken,
    },
    SetInstructionPointer {
        thread: ThreadHandle,
        module: ModuleKey,
        method: MethodToken,
        il_offset: u32,
    },
    /// Answer to a remap opportunity: redirect the trapped thread into the
    /// named offset of the latest version.
    RemapRedirect {
        patch: u32,
        thread: ThreadHandle,
        il_offset: u32,
    },
}

impl DbgCommand {
    pub fn direction(&self) -> Direction {
        match self {
            DbgCommand::Continue => Direction::CommandFireAndForget,
            DbgCommand::AddPatch(_) => Direction::CommandWithReply,
            DbgCommand::RemovePatch { .. } => Direction::CommandWithReply,
            DbgCommand::ListPatches => Direction::CommandWithReply,
            DbgCommand::SetDebugFlags(_) => Direction::CommandWithReply,
            DbgCommand::Attach => Direction::CommandWithReply,
            DbgCommand::Detach => Direction::CommandWithReply,
            DbgCommand::FuncEvalSetup { .. } => Direction::CommandWithReply,
            DbgCommand::FuncEvalAbort { .. } => Direction::CommandWithReply,
            DbgCommand::ApplyCodeEdit { .. } => Direction::CommandWithReply,
            DbgCommand::SetInstructionPointer { .. } => Direction::CommandWithReply,
            DbgCommand::RemapRedirect { .. } => Direction::CommandWithReply,
        }
    }
}

/// Successful reply bodies.
#[derive(Debug, Clone, AsRefStr)]
pub enum ReplyPayload {
    Ack,
    PatchAdded { patch: u32 },
    Patches(Vec<PatchView>),
    EvalPrepared { eval: u32 },
    CodeEditApplied { version: CodeVersion },
}

/// Typed failure codes surfaced to the peer instead of crashing the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum ProtocolError {
    DuplicatePatch,
    UnknownPatchHandle,
    UnknownEvalHandle,
    UnknownThread,
    UnknownMethod,
    OffsetUnmapped,
    NotAttached,
    MalformedCommand,
    OutOfResources,
    EngineUnavailable,
}

impl ProtocolError {
    /// Downgrade an engine error to the code reported in a reply slot.
    pub fn from_error(e: &Error) -> ProtocolError {
        match e {
            Error::DuplicatePatch { .. } | Error::DuplicateCodeVersion { .. } => {
                ProtocolError::DuplicatePatch
            }
            Error::UnknownPatchHandle(_) => ProtocolError::UnknownPatchHandle,
            Error::UnknownEvalHandle(_) => ProtocolError::UnknownEvalHandle,
            Error::UnknownThread(_) => ProtocolError::UnknownThread,
            Error::UnknownMethod { .. } => ProtocolError::UnknownMethod,
            Error::OffsetUnmapped { .. } => ProtocolError::OffsetUnmapped,
            Error::PeerNotAttached => ProtocolError::NotAttached,
            Error::UnexpectedCommand(_) | Error::ExceptionPhase(_, _) => {
                ProtocolError::MalformedCommand
            }
            Error::BufferBusy(_) => ProtocolError::OutOfResources,
            _ => ProtocolError::EngineUnavailable,
        }
    }
}

/// The content of the reply slot for one command round-trip.
#[derive(Debug, Clone)]
pub struct CommandReply {
    /// Tag of the command being answered.
    pub command: String,
    pub result: Result<ReplyPayload, ProtocolError>,
}
