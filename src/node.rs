use buffers::Buffer;
use error::Result;
use pod::Pod;
use transport::IoStatus;

/// Well-known parameter ids.
pub mod param {
    /// Enumerates the ids a node/port supports; each instance is an id pod.
    pub const ID_LIST: u32 = 1;
    pub const PROPS: u32 = 2;
    pub const ENUM_FORMAT: u32 = 3;
    pub const FORMAT: u32 = 4;
    pub const BUFFERS: u32 = 5;
}

/// Well-known io area ids for `port_set_io`.
pub mod io {
    pub const BUFFERS: u32 = 1;
    pub const CONTROL: u32 = 2;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Display, Serialize)]
pub enum Direction {
    #[strum(to_string = "input")]
    Input,
    #[strum(to_string = "output")]
    Output,
}

impl Direction {
    pub fn reverse(&self) -> Direction {
        match *self {
            Direction::Input => Direction::Output,
            Direction::Output => Direction::Input,
        }
    }
}

/// Commands delivered to a node (or one of its ports).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    Start,
    Pause,
    Flush,
    Drain,
    ClockUpdate {
        flags: u32,
        ticks: i64,
        rate: i32,
        monotonic_time: i64,
    },
}

bitflags! {
    pub struct PortInfoFlags: u32 {
        const REMOVABLE = 1 << 0;
        const OPTIONAL = 1 << 1;
        const CAN_USE_BUFFERS = 1 << 2;
        const CAN_ALLOC_BUFFERS = 1 << 3;
        const IN_PLACE = 1 << 4;
        const LIVE = 1 << 5;
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PortInfo {
    pub flags: PortInfoFlags,
    pub rate: u32,
}

/// Current and maximum port counts, per direction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PortCounts {
    pub n_inputs: u32,
    pub max_inputs: u32,
    pub n_outputs: u32,
    pub max_outputs: u32,
}

/// Callbacks a node raises back at whoever exported it. Invoked from
/// whichever thread is currently driving the node, so implementations
/// must be safe to call from the data loop.
pub trait NodeCallbacks: Send {
    fn done(&self, seq: u32, res: i32);
    fn event(&self, event: &Pod);
    fn need_input(&self);
    fn reuse_buffer(&self, port_id: u32, buffer_id: u32);
}

/// The contract a local media-processing node implements so the
/// session can export it: parameter enumeration, port topology, buffer
/// adoption, io binding and the process hooks. The session borrows the
/// node for its lifetime and never assumes anything about what the
/// process hooks do beyond the status they report.
pub trait Node: Send {
    fn enum_params(&self, id: u32, index: &mut u32, filter: Option<&Pod>) -> Result<Option<Pod>>;

    fn set_param(&mut self, id: u32, flags: u32, param: &Pod) -> Result<()>;

    fn send_command(&mut self, command: &Command) -> Result<()>;

    fn set_callbacks(&mut self, callbacks: Box<NodeCallbacks>);

    fn n_ports(&self) -> PortCounts;

    fn port_ids(&self, direction: Direction) -> Vec<u32>;

    fn port_info(&self, direction: Direction, port_id: u32) -> Result<PortInfo>;

    fn port_enum_params(
        &self,
        direction: Direction,
        port_id: u32,
        id: u32,
        index: &mut u32,
        filter: Option<&Pod>,
    ) -> Result<Option<Pod>>;

    fn port_set_param(
        &mut self,
        direction: Direction,
        port_id: u32,
        id: u32,
        flags: u32,
        param: &Pod,
    ) -> Result<()>;

    /// Adopt (or with an empty slice, release) the given buffers.
    fn port_use_buffers(
        &mut self,
        direction: Direction,
        port_id: u32,
        buffers: &[Buffer],
    ) -> Result<()>;

    /// Remote ports never allocate on behalf of the server.
    fn port_alloc_buffers(
        &mut self,
        _direction: Direction,
        _port_id: u32,
        _params: &[Pod],
        _buffers: &mut [Buffer],
    ) -> Result<()> {
        Err(::error::Error::NotSupported {
            what: "alloc buffers",
        })
    }

    fn port_set_io(
        &mut self,
        direction: Direction,
        port_id: u32,
        id: u32,
        ptr: *mut u8,
        size: usize,
    ) -> Result<()>;

    fn port_reuse_buffer(&mut self, port_id: u32, buffer_id: u32) -> Result<()>;

    fn port_send_command(
        &mut self,
        direction: Direction,
        port_id: u32,
        remote: bool,
        command: &Command,
    ) -> Result<()>;

    fn process_input(&mut self) -> Result<IoStatus>;

    fn process_output(&mut self) -> Result<IoStatus>;
}
