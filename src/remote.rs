use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use error::{Error, Result};
use node::Node;
use pod::Properties;
use protocol::{ControlChannel, ControlEvent, CoreEvent, CoreInfo, ProtocolClient};
use session::NodeSession;
use Context;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Display, Serialize)]
pub enum RemoteState {
    #[strum(to_string = "unconnected")]
    Unconnected,
    #[strum(to_string = "connecting")]
    Connecting,
    #[strum(to_string = "connected")]
    Connected,
    #[strum(to_string = "error")]
    Error,
}

pub type StateListener = Box<FnMut(RemoteState, RemoteState, Option<&str>)>;
pub type SyncListener = Box<FnMut(u32)>;

/// The connection to the media server: a small state machine around a
/// protocol client, plus the table of nodes exported over it.
pub struct Remote {
    ctx: Arc<Context>,
    conn: Box<ProtocolClient>,
    channel: Arc<ControlChannel>,
    state: RemoteState,
    error: Option<String>,
    info: Option<CoreInfo>,
    sessions: BTreeMap<u32, NodeSession>,
    next_object_id: u32,
    state_listeners: Vec<StateListener>,
    sync_listeners: Vec<SyncListener>,
}

impl Remote {
    pub fn new(ctx: Arc<Context>, conn: Box<ProtocolClient>, channel: Arc<ControlChannel>) -> Remote {
        debug!("remote: new");
        Remote {
            ctx,
            conn,
            channel,
            state: RemoteState::Unconnected,
            error: None,
            info: None,
            sessions: BTreeMap::new(),
            next_object_id: 0,
            state_listeners: Vec::new(),
            sync_listeners: Vec::new(),
        }
    }

    pub fn state(&self) -> RemoteState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.as_str())
    }

    pub fn core_info(&self) -> Option<&CoreInfo> {
        self.info.as_ref()
    }

    pub fn on_state_change(&mut self, listener: StateListener) {
        self.state_listeners.push(listener);
    }

    pub fn on_sync_reply(&mut self, listener: SyncListener) {
        self.sync_listeners.push(listener);
    }

    fn update_state(&mut self, state: RemoteState, error: Option<String>) {
        if self.state == state {
            return;
        }
        let old = self.state;
        self.error = error;
        debug!(
            "remote: update state from {} -> {} ({:?})",
            old, state, self.error
        );
        self.state = state;

        let text = self.error.clone();
        for listener in &mut self.state_listeners {
            listener(old, state, text.as_ref().map(|e| e.as_str()));
        }
    }

    fn check_usable(&self) -> Result<()> {
        if self.state == RemoteState::Error {
            return Err(Error::io_str("remote is in the error state"));
        }
        Ok(())
    }

    pub fn connect(&mut self) -> Result<()> {
        self.check_usable()?;
        self.update_state(RemoteState::Connecting, None);
        if let Err(e) = self.conn.connect() {
            self.update_state(RemoteState::Error, Some(format!("connect failed: {}", e)));
            return Err(e);
        }
        Ok(())
    }

    pub fn connect_fd(&mut self, fd: RawFd) -> Result<()> {
        self.check_usable()?;
        self.update_state(RemoteState::Connecting, None);
        if let Err(e) = self.conn.connect_fd(fd) {
            self.update_state(
                RemoteState::Error,
                Some(format!("connect_fd failed: {}", e)),
            );
            return Err(e);
        }
        Ok(())
    }

    /// Take the connection fd and drop back to unconnected.
    pub fn steal_fd(&mut self) -> Option<RawFd> {
        let fd = self.conn.steal_fd();
        let _ = self.disconnect();
        fd
    }

    /// Tear down every exported node and the protocol connection,
    /// returning to the initial state whatever came before.
    pub fn disconnect(&mut self) -> Result<()> {
        debug!("remote: disconnect");
        for (_, mut session) in ::std::mem::replace(&mut self.sessions, BTreeMap::new()) {
            session.destroy();
        }
        if let Err(e) = self.conn.disconnect() {
            warn!("protocol disconnect failed: {}", e);
        }
        self.info = None;
        self.update_state(RemoteState::Unconnected, None);
        Ok(())
    }

    /// Feed one connection-level server event through the machine.
    pub fn handle_core_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Info(info) => {
                debug!("remote: got core info");
                self.info = Some(info);
            }
            CoreEvent::Done { seq } => {
                debug!("remote: core event done {}", seq);
                if seq == 0 {
                    self.update_state(RemoteState::Connected, None);
                }
                for listener in &mut self.sync_listeners {
                    listener(seq);
                }
            }
            CoreEvent::Error { id, res, message } => {
                warn!("remote: error on {}: {} ({})", id, message, res);
                self.update_state(RemoteState::Error, Some(message));
            }
            CoreEvent::RemoveId { id } => {
                debug!("remote: object remove {}", id);
                match self.sessions.remove(&id) {
                    Some(mut session) => session.destroy(),
                    None => warn!("asked to remove unknown object id {}", id),
                }
            }
        }
    }

    /// Export a local node: create its session, announce it, and hand
    /// back the object id the server will address it with.
    pub fn export(&mut self, node: Box<Node>, properties: Properties) -> Result<u32> {
        if self.state != RemoteState::Connected {
            self.check_usable()?;
            return Err(Error::io_str("not connected"));
        }

        let mut properties = properties;
        properties.set_default("client.name", "remote-node");

        let id = self.next_object_id;
        self.next_object_id += 1;

        let session = NodeSession::new(&self.ctx, self.channel.clone(), node, properties);
        session.announce();
        self.sessions.insert(id, session);
        debug!("remote: exported node as object {}", id);
        Ok(id)
    }

    pub fn session_mut(&mut self, id: u32) -> Option<&mut NodeSession> {
        self.sessions.get_mut(&id)
    }

    /// Route a node-addressed control event to its session.
    pub fn dispatch_node_event(&mut self, id: u32, event: ControlEvent) -> Result<()> {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.handle_event(event);
                Ok(())
            }
            None => Err(Error::NotFound { what: "object", id }),
        }
    }
}
