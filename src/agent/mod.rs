pub mod attach;
pub mod code;
pub mod config;
pub mod error;
pub mod event;
pub mod exception;
pub mod lock;
pub mod patch;
pub mod suspend;

use crate::agent::attach::{AttachCoordinator, AttachOutcome};
use crate::agent::code::{
    CodeVersion, CompiledBody, CodeVersionTable, MethodToken, ModuleKey, OffsetMapper,
    ThreadHandle,
};
use crate::agent::config::AgentConfig;
use crate::agent::error::Error;
use crate::agent::event::listener::{DEDICATED, FALLBACK, Listener};
use crate::agent::event::proto::{
    CommandReply, DbgCommand, DbgEvent, DebugFlags, Direction, ProtocolError, ReplyPayload,
};
use crate::agent::event::{EventChannel, PeerTransport};
use crate::agent::exception::{ExceptionId, ExceptionTracker, TerminalPhase};
use crate::agent::lock::{AgentLock, InnerLockToken, LockMode};
use crate::agent::patch::{PatchKind, PatchLocation, PatchRequest, PatchTable, PatchView, RebindPass};
use crate::agent::suspend::{SuspendOutcome, SuspensionController, ThreadSuspender, UnsafeRegionScope};
use crate::weak_error;
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

/// Where a redirected thread must resume, as decided by a set-ip or remap
/// command. The host consumes this when it continues the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectTarget {
    pub module: ModuleKey,
    pub method: MethodToken,
    pub version: CodeVersion,
    pub il_offset: u32,
    pub native_offset: u64,
}

#[derive(Debug)]
struct EvalRecord {
    thread: ThreadHandle,
    aborted: bool,
}

struct EvalTable {
    next: u32,
    live: IndexMap<u32, EvalRecord>,
}

impl Default for EvalTable {
    fn default() -> Self {
        Self {
            next: 1,
            live: IndexMap::new(),
        }
    }
}

enum PostDispatch {
    None,
    /// Resume the runtime after the reply, its visible effect.
    Release,
    /// Full local detach, releasing suspended threads as the last act.
    Detach,
}

/// The in-process debug engine: one explicit bundle of all engine state,
/// driven by call-ins from runtime threads and by commands from the external
/// peer. The engine never spawns threads of its own; the host runs
/// [`DebugAgent::run_listener`] on its dedicated helper thread.
pub struct DebugAgent {
    config: AgentConfig,
    lock: AgentLock,
    suspension: SuspensionController,
    patches: PatchTable,
    code: CodeVersionTable,
    channel: EventChannel,
    attach: AttachCoordinator,
    exceptions: ExceptionTracker,
    suspender: Arc<dyn ThreadSuspender>,
    mapper: Arc<dyn OffsetMapper>,
    flags: Mutex<DebugFlags>,
    evals: Mutex<EvalTable>,
    redirects: Mutex<HashMap<ThreadHandle, RedirectTarget>>,
    listener_alive: AtomicBool,
    listener_ever_started: AtomicBool,
    listener_wait_exhausted: AtomicBool,
}

impl DebugAgent {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        suspender: Arc<dyn ThreadSuspender>,
        mapper: Arc<dyn OffsetMapper>,
        config: AgentConfig,
    ) -> Self {
        Self {
            config,
            lock: AgentLock::new(),
            suspension: SuspensionController::new(),
            patches: PatchTable::new(),
            code: CodeVersionTable::default(),
            channel: EventChannel::new(transport),
            attach: AttachCoordinator::new(),
            exceptions: ExceptionTracker::default(),
            suspender,
            mapper,
            flags: Mutex::new(DebugFlags::default()),
            evals: Mutex::new(EvalTable::default()),
            redirects: Mutex::new(HashMap::new()),
            listener_alive: AtomicBool::new(false),
            listener_ever_started: AtomicBool::new(false),
            listener_wait_exhausted: AtomicBool::new(false),
        }
    }

    pub fn suspension(&self) -> &SuspensionController {
        &self.suspension
    }

    pub fn patches(&self) -> &PatchTable {
        &self.patches
    }

    pub fn code(&self) -> &CodeVersionTable {
        &self.code
    }

    pub(crate) fn channel(&self) -> &EventChannel {
        &self.channel
    }

    pub(crate) fn suspender(&self) -> &dyn ThreadSuspender {
        &*self.suspender
    }

    pub fn is_peer_attached(&self) -> bool {
        self.attach.is_attached()
    }

    pub fn debug_flags(&self) -> DebugFlags {
        let _token = InnerLockToken::new();
        *self.flags.lock().expect("flags poisoned")
    }

    /// Toggle the Disabled lock mode, demanded by the attach/detach pipeline
    /// when it needs exclusivity.
    pub fn set_engine_disabled(&self, disabled: bool) {
        self.lock.set_disabled(disabled)
    }

    /// Enter the terminal teardown mode: suspension requests are dropped and
    /// lock operations become no-ops from here on.
    pub fn begin_shutdown(&self) {
        self.lock.begin_shutdown()
    }

    pub fn enter_unsafe_region(&self) -> UnsafeRegionScope<'_> {
        self.suspension.enter_unsafe_region()
    }

    pub fn take_pending_redirect(&self, thread: ThreadHandle) -> Option<RedirectTarget> {
        let _token = InnerLockToken::new();
        self.redirects
            .lock()
            .expect("redirects poisoned")
            .remove(&thread)
    }

    // ------------------------------- attach lifecycle --------------------------------------------

    /// Begin the attach pipeline. Exactly one caller wins the transition out
    /// of `Detached`; the attach completes when the peer's handshake command
    /// arrives.
    pub fn request_attach(&self) -> Result<AttachOutcome, Error> {
        let guard = self.lock.acquire()?;
        let outcome = self.attach.try_begin_attach();
        drop(guard);
        Ok(outcome)
    }

    /// Park until an in-progress attach completes. Unbounded by design.
    pub fn wait_for_attach(&self) {
        self.attach.wait_for_attach()
    }

    /// Engine-side detach: drop every patch and wake the world. Idempotent.
    pub fn request_detach(&self) -> Result<(), Error> {
        let guard = self.lock.acquire()?;
        drop(guard);
        self.detach_locally();
        Ok(())
    }

    fn detach_locally(&self) {
        self.patches.clear();
        self.exceptions.clear();
        {
            let _token = InnerLockToken::new();
            let mut evals = self.evals.lock().expect("eval table poisoned");
            evals.live.clear();
        }
        {
            let _token = InnerLockToken::new();
            self.redirects.lock().expect("redirects poisoned").clear();
        }
        self.attach.mark_detached();
        // releasing suspended threads is the last act, so the peer's channel
        // teardown races safely with process continuation
        self.suspension.release(&*self.suspender, None);
    }

    pub(crate) fn implicit_detach(&self) {
        if self.attach.phase() != attach::AttachPhase::Detached {
            warn!(target: "agent", "peer transport failed, treating as detach");
        }
        self.detach_locally();
    }

    fn jit_attach(&self) {
        match self.attach.try_begin_attach() {
            AttachOutcome::WonRace => {
                info!(target: "attach", "on-demand attach initiated, debugger launch requested");
                self.attach.request_launch();
                self.attach.wait_for_attach();
            }
            AttachOutcome::AlreadyInProgress => self.attach.wait_for_attach(),
            AttachOutcome::AlreadyAttached => {}
        }
    }

    // ------------------------------- event send cycle --------------------------------------------

    /// Send a notification without stopping the world. Still serialized by
    /// the agent lock so per-thread event order reaches the peer intact.
    fn notify_only(&self, event: DbgEvent) -> Result<(), Error> {
        let guard = self.lock.acquire()?;
        if guard.is_noop() {
            return Ok(());
        }
        if let Err(e) = self
            .channel
            .send_notification(self.attach.is_attached(), event)
        {
            self.note_fatal(&e);
            self.implicit_detach();
        }
        Ok(())
    }

    /// The full stop-the-world cycle: lock → send → trap → stop →
    /// sync-complete → unlock → listener duty until the peer continues.
    /// Dropping the lock before parking is what lets the listener dequeue the
    /// peer's Continue and release suspension.
    fn stop_and_wait(&self, event: DbgEvent) -> Result<(), Error> {
        let mut guard = self.lock.acquire()?;
        if guard.is_noop() {
            return Ok(());
        }

        // an event race loser waits out the winner's full cycle, no event is
        // ever dropped over the race
        while self.suspension.is_suspended() {
            drop(guard);
            self.suspension.wait_until_resumed();
            guard = self.lock.acquire()?;
            if guard.is_noop() {
                return Ok(());
            }
        }

        if !self.attach.is_attached() {
            debug!(target: "agent", "{} dropped, no peer attached", event.as_ref());
            return Ok(());
        }

        if let Err(e) = self.channel.send_notification(true, event) {
            self.note_fatal(&e);
            self.implicit_detach();
            return Ok(());
        }

        let teardown = self.lock.mode() == LockMode::ShuttingDown;
        let outcome = self.suspension.request_suspension(teardown, &*self.suspender);
        if outcome == SuspendOutcome::Dropped {
            return Ok(());
        }

        let listener = self.duty_listener();
        if outcome == SuspendOutcome::Trapping {
            listener.sweep_stragglers(self);
            if let Err(e) = self.suspension.mark_stopped() {
                self.note_fatal(&e);
                return Err(e);
            }
            if let Err(e) = self
                .channel
                .send_notification(self.attach.is_attached(), DbgEvent::SyncComplete)
            {
                self.note_fatal(&e);
                self.implicit_detach();
                return Ok(());
            }
        }

        drop(guard);
        listener.pump_until_resumed(self)
    }

    /// Pick who performs listener duty for this cycle: the dedicated reader
    /// when it is alive, otherwise the calling thread itself. At startup the
    /// dedicated reader gets a bounded grace period to come up; after the
    /// ceiling (or once it has been seen dying) the fallback takes over
    /// immediately.
    fn duty_listener(&self) -> &'static dyn Listener {
        if self.listener_alive.load(Ordering::SeqCst) {
            return &DEDICATED;
        }
        if !self.listener_ever_started.load(Ordering::SeqCst)
            && !self.listener_wait_exhausted.load(Ordering::SeqCst)
        {
            let begin = Instant::now();
            while begin.elapsed() < self.config.listener_ready_ceiling() {
                if self.listener_alive.load(Ordering::SeqCst) {
                    return &DEDICATED;
                }
                thread::sleep(self.config.listener_ready_poll());
            }
            self.listener_wait_exhausted.store(true, Ordering::SeqCst);
            debug!(target: "channel", "no dedicated listener came up, falling back to same-thread duty");
        }
        &FALLBACK
    }

    fn note_fatal(&self, e: &Error) {
        if e.is_fatal() {
            error::set_unrecoverable(&format!("{e:#}"));
        } else {
            warn!(target: "agent", "{e:#}");
        }
    }

    // ------------------------------- inbound dispatch --------------------------------------------

    /// The host-run dedicated listener loop: receive, dispatch, reply, one
    /// command at a time, until shutdown or transport failure. The thread
    /// running this is never itself paused by suspension.
    pub fn run_listener(&self) -> Result<(), Error> {
        if self.listener_alive.swap(true, Ordering::SeqCst) {
            return Err(Error::ListenerAlreadyRunning);
        }
        self.listener_ever_started.store(true, Ordering::SeqCst);
        info!(target: "channel", "dedicated listener online");

        loop {
            if self.lock.mode() == LockMode::ShuttingDown || error::is_unrecoverable() {
                break;
            }
            match self.channel.transport().recv_command() {
                Ok(command) => {
                    weak_error!(self.dispatch_command(command));
                }
                Err(e) => {
                    warn!(target: "channel", "listener transport failure: {e:#}");
                    self.implicit_detach();
                    break;
                }
            }
        }

        self.listener_alive.store(false, Ordering::SeqCst);
        info!(target: "channel", "dedicated listener offline");
        Ok(())
    }

    /// Dispatch one inbound command: stage it in the in buffer, run the
    /// handler under the agent lock, reply if the tag demands one, then run
    /// the deferred effect (resume/detach) after the acknowledgement.
    pub fn dispatch_command(&self, command: DbgCommand) -> Result<(), Error> {
        if error::is_unrecoverable() {
            return Err(Error::Unrecoverable);
        }
        self.channel.begin_command(command)?;
        let command = self.channel.current_command().expect("staged above");
        let tag = command.as_ref().to_owned();
        let direction = command.direction();
        debug!(target: "channel", "dispatch {tag}");

        let (result, post) = self.handle_command(command);
        if let Err(e) = &result {
            self.note_fatal(e);
        }

        if direction == Direction::CommandWithReply {
            let reply = CommandReply {
                command: tag,
                result: result.map_err(|e| ProtocolError::from_error(&e)),
            };
            if let Err(e) = self.channel.send_reply(&reply) {
                warn!(target: "channel", "reply failed: {e:#}");
                self.channel.finish_command();
                self.implicit_detach();
                return Ok(());
            }
        }
        self.channel.finish_command();

        match post {
            PostDispatch::None => {}
            PostDispatch::Release => self.suspension.release(&*self.suspender, None),
            PostDispatch::Detach => self.detach_locally(),
        }
        Ok(())
    }

    fn handle_command(&self, command: DbgCommand) -> (Result<ReplyPayload, Error>, PostDispatch) {
        let guard = match self.lock.acquire() {
            Ok(guard) => guard,
            Err(e) => return (Err(e), PostDispatch::None),
        };
        let _guard = guard;

        match command {
            DbgCommand::Continue => (Ok(ReplyPayload::Ack), PostDispatch::Release),
            DbgCommand::Detach => (Ok(ReplyPayload::Ack), PostDispatch::Detach),
            DbgCommand::Attach => {
                self.attach.mark_attached();
                (Ok(ReplyPayload::Ack), PostDispatch::None)
            }
            DbgCommand::AddPatch(req) => (
                self.add_patch(req)
                    .map(|patch| ReplyPayload::PatchAdded { patch }),
                PostDispatch::None,
            ),
            DbgCommand::RemovePatch { patch } => (
                self.remove_patch(patch).map(|_| ReplyPayload::Ack),
                PostDispatch::None,
            ),
            DbgCommand::ListPatches => (
                Ok(ReplyPayload::Patches(self.patches.list())),
                PostDispatch::None,
            ),
            DbgCommand::SetDebugFlags(flags) => {
                let _token = InnerLockToken::new();
                *self.flags.lock().expect("flags poisoned") = flags;
                (Ok(ReplyPayload::Ack), PostDispatch::None)
            }
            DbgCommand::FuncEvalSetup { thread } => (
                self.func_eval_setup(thread)
                    .map(|eval| ReplyPayload::EvalPrepared { eval }),
                PostDispatch::None,
            ),
            DbgCommand::FuncEvalAbort { eval } => (
                self.func_eval_abort(eval).map(|_| ReplyPayload::Ack),
                PostDispatch::None,
            ),
            DbgCommand::ApplyCodeEdit { module, method } => (
                Ok(ReplyPayload::CodeEditApplied {
                    version: self.code.reserve_next_version(module, method),
                }),
                PostDispatch::None,
            ),
            DbgCommand::SetInstructionPointer {
                thread,
                module,
                method,
                il_offset,
            } => (
                self.set_instruction_pointer(thread, module, method, il_offset)
                    .map(|_| ReplyPayload::Ack),
                PostDispatch::None,
            ),
            DbgCommand::RemapRedirect {
                patch,
                thread,
                il_offset,
            } => (
                self.remap_redirect(patch, thread, il_offset)
                    .map(|_| ReplyPayload::Ack),
                PostDispatch::None,
            ),
        }
    }

    // ------------------------------- patch administration ----------------------------------------

    /// Create a patch and bind it against every already published body of its
    /// method. Only breakpoints and steppers may be created from outside;
    /// remap traps are engine-managed.
    pub fn add_patch(&self, req: PatchRequest) -> Result<u32, Error> {
        if !matches!(req.kind, PatchKind::Breakpoint | PatchKind::Stepper) {
            return Err(Error::UnexpectedCommand(format!("AddPatch({})", req.kind)));
        }
        let guard = self.lock.acquire()?;
        let _guard = guard;

        let (module, method) = (req.module, req.method);
        let default_version = self
            .code
            .latest_version(module, method)
            .unwrap_or(CodeVersion::INITIAL);
        let number = self.patches.add(req, default_version)?;

        let bodies = self.code.bodies(module, method);
        if !bodies.is_empty() {
            let mut pass = RebindPass::new();
            let mut failures = vec![];
            for body in &bodies {
                self.patches.rebind_after_code_version(
                    &mut pass,
                    module,
                    method,
                    body,
                    &*self.mapper,
                    |v| failures.push(v),
                );
            }
            self.notify_bind_failures(failures);
        }
        Ok(number)
    }

    pub fn remove_patch(&self, number: u32) -> Result<PatchView, Error> {
        let guard = self.lock.acquire()?;
        let _guard = guard;
        self.patches.remove(number)
    }

    pub fn list_patches(&self) -> Vec<PatchView> {
        self.patches.list()
    }

    fn notify_bind_failures(&self, failures: Vec<PatchView>) {
        for view in failures {
            let send = self.channel.send_notification(
                self.attach.is_attached(),
                DbgEvent::PatchBindFailed {
                    patch: view.number,
                    module: view.module,
                    method: view.method,
                    version: view.version,
                },
            );
            if send.is_err() {
                self.implicit_detach();
                break;
            }
        }
    }

    // ------------------------------- runtime call-ins --------------------------------------------

    /// A code-visible patch fired on `thread`. Breakpoints and steppers run
    /// the full stop cycle; a pending remap trap turns into a remap
    /// opportunity; a remap-complete marker is bookkeeping only.
    pub fn on_breakpoint_hit(&self, patch: u32, thread: ThreadHandle) -> Result<(), Error> {
        let view = self
            .patches
            .get(patch)
            .ok_or(Error::UnknownPatchHandle(patch))?;
        match view.kind {
            PatchKind::Breakpoint => self.stop_and_wait(DbgEvent::BreakpointHit { patch, thread }),
            PatchKind::Stepper => self.stop_and_wait(DbgEvent::StepComplete { patch, thread }),
            PatchKind::EncRemapPending => self.on_remap_opportunity(view, thread),
            PatchKind::EncRemapComplete => {
                debug!(target: "patch", "remap-complete marker {patch} crossed by {thread}");
                Ok(())
            }
        }
    }

    fn on_remap_opportunity(&self, view: PatchView, thread: ThreadHandle) -> Result<(), Error> {
        let new_version = self
            .code
            .latest_version(view.module, view.method)
            .ok_or(Error::UnknownMethod {
                module: view.module,
                method: view.method,
            })?;
        let PatchLocation::Il(il_offset) = view.location else {
            // remap traps are always seeded on IL sequence points
            return Err(Error::UnknownPatchHandle(view.number));
        };
        self.stop_and_wait(DbgEvent::RemapOpportunity {
            patch: view.number,
            thread,
            module: view.module,
            method: view.method,
            old_version: view.version,
            new_version,
            il_offset,
        })
    }

    pub fn on_exception_first_chance(
        &self,
        thread: ThreadHandle,
        exception: ExceptionId,
    ) -> Result<(), Error> {
        self.exceptions.note_first_chance(exception)?;
        let event = DbgEvent::ExceptionFirstChance { thread, exception };
        if self.debug_flags().stop_on_first_chance {
            self.stop_and_wait(event)
        } else {
            self.notify_only(event)
        }
    }

    pub fn on_exception_user_first_chance(
        &self,
        thread: ThreadHandle,
        exception: ExceptionId,
    ) -> Result<(), Error> {
        self.exceptions.note_user_first_chance(exception)?;
        let event = DbgEvent::ExceptionUserFirstChance { thread, exception };
        if self.debug_flags().stop_on_first_chance {
            self.stop_and_wait(event)
        } else {
            self.notify_only(event)
        }
    }

    pub fn on_exception_catch_handler_found(
        &self,
        thread: ThreadHandle,
        exception: ExceptionId,
    ) -> Result<(), Error> {
        self.exceptions
            .note_terminal(exception, TerminalPhase::CatchHandlerFound)?;
        self.notify_only(DbgEvent::ExceptionCatchHandlerFound { thread, exception })
    }

    pub fn on_exception_unwind_begin(
        &self,
        thread: ThreadHandle,
        exception: ExceptionId,
    ) -> Result<(), Error> {
        self.exceptions
            .note_terminal(exception, TerminalPhase::UnwindBegin)?;
        self.notify_only(DbgEvent::ExceptionUnwindBegin { thread, exception })
    }

    /// Unhandled exception: the last chance to get a debugger to the process.
    /// With on-demand attach enabled this blocks until a peer arrives, then
    /// runs the ordinary stop cycle.
    pub fn on_exception_unhandled(
        &self,
        thread: ThreadHandle,
        exception: ExceptionId,
    ) -> Result<(), Error> {
        self.exceptions
            .note_terminal(exception, TerminalPhase::Unhandled)?;
        if !self.attach.is_attached() && self.config.attach_on_unhandled {
            self.jit_attach();
        }
        self.stop_and_wait(DbgEvent::ExceptionUnhandled { thread, exception })
    }

    pub fn on_module_loaded(&self, module: ModuleKey) -> Result<(), Error> {
        self.stop_and_wait(DbgEvent::ModuleLoaded { module })
    }

    /// Module gone: its patches and code versions go with it.
    pub fn on_module_unloaded(&self, module: ModuleKey) -> Result<(), Error> {
        {
            let guard = self.lock.acquire()?;
            if !guard.is_noop() {
                self.patches.remove_module(module);
                self.code.remove_module(module);
            }
        }
        self.stop_and_wait(DbgEvent::ModuleUnloaded { module })
    }

    /// A body finished compiling: record it, seed Edit-and-Continue remap
    /// traps on every older version it replaces, and rebind applicable
    /// patches. One rebind pass per publication.
    pub fn on_code_version_published(
        &self,
        module: ModuleKey,
        method: MethodToken,
        body: CompiledBody,
    ) -> Result<(), Error> {
        let guard = self.lock.acquire()?;
        if guard.is_noop() {
            return Ok(());
        }

        let older = self.code.publish(module, method, &body)?;
        for old in &older {
            self.patches.seed_enc_remap(module, method, old);
        }

        let mut pass = RebindPass::new();
        let mut failures = vec![];
        self.patches.rebind_after_code_version(
            &mut pass,
            module,
            method,
            &body,
            &*self.mapper,
            |v| failures.push(v),
        );
        self.notify_bind_failures(failures);
        Ok(())
    }

    pub fn on_thread_created(&self, thread: ThreadHandle) -> Result<(), Error> {
        self.suspension.register_thread(thread);
        self.stop_and_wait(DbgEvent::ThreadCreated { thread })
    }

    pub fn on_thread_exited(&self, thread: ThreadHandle) -> Result<(), Error> {
        self.suspension.unregister_thread(thread);
        {
            let _token = InnerLockToken::new();
            self.redirects
                .lock()
                .expect("redirects poisoned")
                .remove(&thread);
        }
        {
            let _token = InnerLockToken::new();
            let mut evals = self.evals.lock().expect("eval table poisoned");
            evals.live.retain(|_, rec| rec.thread != thread);
        }
        self.notify_only(DbgEvent::ThreadExited { thread })
    }

    /// User diagnostic output. Forwarded as a plain notification when the
    /// peer asked for log messages.
    pub fn on_log_message(
        &self,
        thread: ThreadHandle,
        level: u32,
        category: &str,
        message: &str,
    ) -> Result<(), Error> {
        if !self.debug_flags().report_log_messages {
            return Ok(());
        }
        self.notify_only(DbgEvent::LogMessage {
            thread,
            level,
            category: category.to_owned(),
            message: message.to_owned(),
        })
    }

    /// The host finished (or abandoned) a debugger-injected call.
    pub fn on_func_eval_complete(&self, eval: u32, thread: ThreadHandle) -> Result<(), Error> {
        let record = {
            let _token = InnerLockToken::new();
            let mut evals = self.evals.lock().expect("eval table poisoned");
            evals
                .live
                .shift_remove(&eval)
                .ok_or(Error::UnknownEvalHandle(eval))?
        };
        if record.aborted {
            debug!(target: "agent", "eval {eval} completed after abort");
        }
        self.stop_and_wait(DbgEvent::FuncEvalComplete { eval, thread })
    }

    // ------------------------------- command handlers --------------------------------------------

    fn ensure_thread(&self, thread: ThreadHandle) -> Result<(), Error> {
        if !self.suspension.live_threads().contains(&thread) {
            return Err(Error::UnknownThread(thread));
        }
        Ok(())
    }

    fn func_eval_setup(&self, thread: ThreadHandle) -> Result<u32, Error> {
        self.ensure_thread(thread)?;
        let _token = InnerLockToken::new();
        let mut evals = self.evals.lock().expect("eval table poisoned");
        let eval = evals.next;
        evals.next += 1;
        evals.live.insert(
            eval,
            EvalRecord {
                thread,
                aborted: false,
            },
        );
        Ok(eval)
    }

    fn func_eval_abort(&self, eval: u32) -> Result<(), Error> {
        let _token = InnerLockToken::new();
        let mut evals = self.evals.lock().expect("eval table poisoned");
        let record = evals
            .live
            .get_mut(&eval)
            .ok_or(Error::UnknownEvalHandle(eval))?;
        record.aborted = true;
        Ok(())
    }

    fn set_instruction_pointer(
        &self,
        thread: ThreadHandle,
        module: ModuleKey,
        method: MethodToken,
        il_offset: u32,
    ) -> Result<(), Error> {
        self.ensure_thread(thread)?;
        let version = self
            .code
            .latest_version(module, method)
            .ok_or(Error::UnknownMethod { module, method })?;
        let native_offset = self
            .mapper
            .resolve(module, method, version, il_offset)
            .ok_or(Error::OffsetUnmapped { version, il_offset })?;

        let _token = InnerLockToken::new();
        self.redirects.lock().expect("redirects poisoned").insert(
            thread,
            RedirectTarget {
                module,
                method,
                version,
                il_offset,
                native_offset,
            },
        );
        Ok(())
    }

    fn remap_redirect(&self, patch: u32, thread: ThreadHandle, il_offset: u32) -> Result<(), Error> {
        self.ensure_thread(thread)?;
        let view = self
            .patches
            .get(patch)
            .ok_or(Error::UnknownPatchHandle(patch))?;
        if view.kind != PatchKind::EncRemapPending {
            return Err(Error::UnexpectedCommand(format!(
                "RemapRedirect({})",
                view.kind
            )));
        }
        let version = self
            .code
            .latest_version(view.module, view.method)
            .ok_or(Error::UnknownMethod {
                module: view.module,
                method: view.method,
            })?;
        let native_offset = self
            .mapper
            .resolve(view.module, view.method, version, il_offset)
            .ok_or(Error::OffsetUnmapped { version, il_offset })?;

        self.patches
            .complete_remap(patch, version, il_offset, native_offset)?;
        let _token = InnerLockToken::new();
        self.redirects.lock().expect("redirects poisoned").insert(
            thread,
            RedirectTarget {
                module: view.module,
                method: view.method,
                version,
                il_offset,
                native_offset,
            },
        );
        Ok(())
    }
}
