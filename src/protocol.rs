use std::os::unix::io::RawFd;

use buffers::BufferDesc;
use error::Result;
use mem::MemFlags;
use node::{Command, Direction, PortInfo};
use pod::{Pod, Properties};
use transport::Transport;

bitflags! {
    pub struct UpdateFlags: u32 {
        const MAX_INPUTS = 1 << 0;
        const MAX_OUTPUTS = 1 << 1;
        const PARAMS = 1 << 2;
    }
}

bitflags! {
    pub struct PortUpdateFlags: u32 {
        const PARAMS = 1 << 0;
        const INFO = 1 << 1;
    }
}

/// Server → client events addressed at one exported node. Everything
/// here is already parsed; wire serialization lives in the protocol
/// layer that feeds these in and consumes the replies.
pub enum ControlEvent {
    AddMem {
        mem_id: u32,
        type_: u32,
        fd: RawFd,
        flags: MemFlags,
    },
    /// A (re)attach: a freshly mapped transport plus the wake fds. The
    /// session takes ownership of all three.
    SetTransport {
        node_id: u32,
        read_fd: RawFd,
        write_fd: RawFd,
        transport: Transport,
    },
    SetParam {
        id: u32,
        flags: u32,
        param: Pod,
    },
    Event {
        event: Pod,
    },
    Command {
        seq: u32,
        command: Command,
    },
    AddPort {
        seq: u32,
        direction: Direction,
        port_id: u32,
    },
    RemovePort {
        seq: u32,
        direction: Direction,
        port_id: u32,
    },
    PortSetParam {
        seq: u32,
        direction: Direction,
        port_id: u32,
        id: u32,
        flags: u32,
        param: Pod,
    },
    PortUseBuffers {
        seq: u32,
        direction: Direction,
        port_id: u32,
        buffers: Vec<BufferDesc>,
    },
    PortCommand {
        direction: Direction,
        port_id: u32,
        command: Command,
    },
    PortSetIo {
        seq: u32,
        direction: Direction,
        port_id: u32,
        id: u32,
        mem_id: u32,
        offset: u32,
        size: u32,
    },
}

/// Client → server messages.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    Update {
        change_mask: UpdateFlags,
        max_input_ports: u32,
        max_output_ports: u32,
        params: Vec<Pod>,
    },
    PortUpdate {
        direction: Direction,
        port_id: u32,
        change_mask: PortUpdateFlags,
        params: Vec<Pod>,
        info: Option<PortInfo>,
    },
    SetActive(bool),
    Done {
        seq: u32,
        result: i32,
    },
}

/// Connection-level events from the server core.
#[derive(Clone, Debug, PartialEq)]
pub enum CoreEvent {
    Info(CoreInfo),
    Done { seq: u32 },
    Error { id: u32, res: i32, message: String },
    RemoveId { id: u32 },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreInfo {
    pub name: String,
    pub version: String,
    pub cookie: u32,
    pub props: Properties,
}

/// Outbound half of the control connection. Shared with every exported
/// session, so sends may come from either thread.
pub trait ControlChannel: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<()>;
}

/// Lifetime management of the underlying protocol connection.
pub trait ProtocolClient {
    fn connect(&mut self) -> Result<()>;
    fn connect_fd(&mut self, fd: RawFd) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;
    /// Hand the raw connection fd to the caller, leaving the client
    /// disconnected. `None` when there is no live fd to steal.
    fn steal_fd(&mut self) -> Option<RawFd>;
}
