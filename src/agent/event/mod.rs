pub mod proto;

pub(crate) mod listener;

use crate::agent::error::Error;
use crate::agent::event::proto::{CommandReply, DbgCommand, DbgEvent};
use log::debug;
use std::sync::Arc;
use std::sync::Mutex;

/// Collaborator service: the cross-process byte transport (named pipe,
/// socket, or shared-memory handshake). The engine is agnostic to which; the
/// wire encoding of the typed values below is the transport's concern.
///
/// `recv_command` blocks until the peer sends something; a transport error
/// from any method is treated as the peer dying and turns into an implicit
/// detach.
pub trait PeerTransport: Send + Sync {
    fn notify(&self, event: &DbgEvent) -> anyhow::Result<()>;
    fn recv_command(&self) -> anyhow::Result<DbgCommand>;
    fn reply(&self, reply: &CommandReply) -> anyhow::Result<()>;
}

/// A fixed single-slot event buffer. Holds at most one in-flight value; a
/// second writer observes [`Error::BufferBusy`] until the first value's
/// lifecycle (send → ack, or receive → reply-sent) completes.
pub(crate) struct EventSlot<T> {
    name: &'static str,
    cell: Mutex<Option<T>>,
}

impl<T: Clone> EventSlot<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            cell: Mutex::new(None),
        }
    }

    /// Place a value into the slot. Fails when the previous one is still in
    /// flight.
    pub fn stage(&self, value: T) -> Result<(), Error> {
        let mut cell = self.cell.lock().expect("event slot poisoned");
        if cell.is_some() {
            return Err(Error::BufferBusy(self.name));
        }
        *cell = Some(value);
        Ok(())
    }

    /// Copy of the in-flight value, if any.
    pub fn snapshot(&self) -> Option<T> {
        self.cell.lock().expect("event slot poisoned").clone()
    }

    /// Complete the in-flight value's lifecycle, freeing the slot.
    pub fn complete(&self) -> Option<T> {
        self.cell.lock().expect("event slot poisoned").take()
    }

    pub fn is_busy(&self) -> bool {
        self.cell.lock().expect("event slot poisoned").is_some()
    }
}

/// The two-directional protocol endpoint: outbound notifications through the
/// out slot, inbound commands through the in slot. Outbound writers are
/// serialized by the agent lock, inbound by the listener's serial dispatch;
/// the slots verify that discipline rather than replace it.
pub struct EventChannel {
    transport: Arc<dyn PeerTransport>,
    out_slot: EventSlot<DbgEvent>,
    in_slot: EventSlot<DbgCommand>,
}

impl EventChannel {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            transport,
            out_slot: EventSlot::new("out"),
            in_slot: EventSlot::new("in"),
        }
    }

    pub(crate) fn transport(&self) -> &dyn PeerTransport {
        &*self.transport
    }

    /// Send a fire-and-forget notification. With no peer attached the event
    /// is dropped and `Ok(false)` returned. A transport failure bubbles up
    /// for the caller to turn into an implicit detach.
    pub(crate) fn send_notification(
        &self,
        peer_attached: bool,
        event: DbgEvent,
    ) -> Result<bool, Error> {
        if !peer_attached {
            debug!(target: "channel", "no peer, {} dropped", event.as_ref());
            return Ok(false);
        }

        self.out_slot.stage(event)?;
        let event = self.out_slot.snapshot().expect("staged above");
        debug!(target: "channel", "send {}", event.as_ref());
        let sent = self.transport.notify(&event);
        self.out_slot.complete();
        match sent {
            Ok(()) => Ok(true),
            Err(e) => Err(Error::Transport(e)),
        }
    }

    /// Accept an inbound command into the in slot. The slot stays busy until
    /// [`Self::finish_command`], enforcing one-at-a-time dispatch.
    pub(crate) fn begin_command(&self, command: DbgCommand) -> Result<(), Error> {
        self.in_slot.stage(command)
    }

    pub(crate) fn current_command(&self) -> Option<DbgCommand> {
        self.in_slot.snapshot()
    }

    /// Write the reply for the in-flight command and signal the peer.
    pub(crate) fn send_reply(&self, reply: &CommandReply) -> Result<(), Error> {
        debug!(
            target: "channel",
            "reply to {}: {}",
            reply.command,
            match &reply.result {
                Ok(p) => p.as_ref(),
                Err(e) => e.as_ref(),
            }
        );
        self.transport.reply(reply).map_err(Error::Transport)
    }

    pub(crate) fn finish_command(&self) {
        self.in_slot.complete();
    }
}
