use crate::agent::DebugAgent;
use crate::agent::error::Error;
use log::{debug, warn};

/// Listener duty: sweeping straggler threads into safe points and pumping
/// inbound commands until the peer resumes the runtime. Implemented twice,
/// for the dedicated background reader and for the same-thread fallback; the
/// rest of the engine picks one through a single aliveness predicate and
/// never branches on which is active.
pub(crate) trait Listener: Sync {
    fn sweep_stragglers(&self, agent: &DebugAgent);

    /// Block until suspension is released. Must not be called while holding
    /// the agent lock: releasing it is what lets inbound dispatch proceed.
    fn pump_until_resumed(&self, agent: &DebugAgent) -> Result<(), Error>;
}

/// Duty implementation backed by the host-run background reader
/// ([`DebugAgent::run_listener`]): the caller only parks on the resume gate,
/// the reader does the dispatching.
pub(crate) struct DedicatedListener;

/// Same-thread duty for when no dedicated listener is available (startup or
/// shutdown race): the trapped thread itself pulls commands off the transport
/// and dispatches them, so suspension never silently fails to complete just
/// because a background actor hasn't started.
pub(crate) struct FallbackListener;

pub(crate) static DEDICATED: DedicatedListener = DedicatedListener;
pub(crate) static FALLBACK: FallbackListener = FallbackListener;

impl Listener for DedicatedListener {
    fn sweep_stragglers(&self, agent: &DebugAgent) {
        agent.suspension().sweep(agent.suspender());
    }

    fn pump_until_resumed(&self, agent: &DebugAgent) -> Result<(), Error> {
        agent.suspension().wait_until_resumed();
        Ok(())
    }
}

impl Listener for FallbackListener {
    fn sweep_stragglers(&self, agent: &DebugAgent) {
        agent.suspension().sweep(agent.suspender());
    }

    fn pump_until_resumed(&self, agent: &DebugAgent) -> Result<(), Error> {
        debug!(target: "channel", "fallback listener duty assumed");
        while agent.suspension().is_suspended() {
            let command = match agent.channel().transport().recv_command() {
                Ok(command) => command,
                Err(e) => {
                    warn!(target: "channel", "fallback listener transport failure: {e:#}");
                    agent.implicit_detach();
                    break;
                }
            };
            crate::weak_error!(agent.dispatch_command(command));
        }
        debug!(target: "channel", "fallback listener duty released");
        Ok(())
    }
}
