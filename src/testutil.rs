use std::ffi::CString;
use std::fs::File;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use libc;

use buffers::{Buffer, BufferDesc, BufferTemplate, DataTemplate, DataType, MetaTemplate, META_HEADER};
use error::Result;
use node::{param, Command, Direction, Node, NodeCallbacks, PortCounts, PortInfo, PortInfoFlags};
use pod::{Pod, Properties};
use protocol::{ClientMessage, ControlChannel, ControlEvent};
use session::NodeSession;
use transport::{IoStatus, RtMessage, Side, Transport};
use Context;

pub fn memfd(size: usize) -> File {
    // NOTE(unsafe) checked syscalls; the fd is wrapped immediately
    unsafe {
        let name = CString::new("remote-node-test").unwrap();
        let fd = libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC);
        assert!(fd >= 0, "memfd_create failed");
        assert_eq!(libc::ftruncate(fd, size as libc::off_t), 0);
        File::from_raw_fd(fd)
    }
}

pub fn eventfd() -> File {
    unsafe {
        let fd = libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK);
        assert!(fd >= 0, "eventfd failed");
        File::from_raw_fd(fd)
    }
}

/// Duplicate an fd so ownership can be handed to the code under test
/// while the test keeps its own handle.
pub fn dup_fd(f: &File) -> RawFd {
    let fd = unsafe { libc::dup(f.as_raw_fd()) };
    assert!(fd >= 0, "dup failed");
    fd
}

/// Control channel that just records what the session sends.
#[derive(Default)]
pub struct TestChannel {
    sent: Mutex<Vec<ClientMessage>>,
}

impl TestChannel {
    pub fn new() -> TestChannel {
        TestChannel::default()
    }

    pub fn take(&self) -> Vec<ClientMessage> {
        mem::replace(&mut *self.sent.lock().unwrap(), Vec::new())
    }
}

impl ControlChannel for TestChannel {
    fn send(&self, message: ClientMessage) -> Result<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

pub type Calls = Arc<Mutex<Vec<String>>>;
pub type SharedCallbacks = Arc<Mutex<Option<Box<NodeCallbacks>>>>;

pub fn cmd_name(command: &Command) -> &'static str {
    match *command {
        Command::Start => "start",
        Command::Pause => "pause",
        Command::Flush => "flush",
        Command::Drain => "drain",
        Command::ClockUpdate { .. } => "clock-update",
    }
}

/// Block until the recorded calls contain `needle`.
pub fn wait_for_call(calls: &Calls, needle: &str) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if calls.lock().unwrap().iter().any(|c| c == needle) {
            return;
        }
        if Instant::now() > deadline {
            panic!(
                "timed out waiting for {:?}; saw {:?}",
                needle,
                *calls.lock().unwrap()
            );
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// A node that records every contract call and lets tests poke its
/// callbacks, standing in for a real capture/playback element.
pub struct TestNode {
    n_in: u32,
    n_out: u32,
    param_ids: Vec<u32>,
    calls: Calls,
    callbacks: SharedCallbacks,
    pub input_status: IoStatus,
    pub output_status: IoStatus,
}

impl TestNode {
    pub fn new(n_in: u32, n_out: u32) -> (TestNode, Calls, SharedCallbacks) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let callbacks: SharedCallbacks = Arc::new(Mutex::new(None));
        let node = TestNode {
            n_in,
            n_out,
            param_ids: vec![param::PROPS, param::ENUM_FORMAT],
            calls: calls.clone(),
            callbacks: callbacks.clone(),
            input_status: IoStatus::NeedBuffer,
            output_status: IoStatus::HaveBuffer,
        };
        (node, calls, callbacks)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn enum_from_list(&self, id: u32, index: &mut u32) -> Result<Option<Pod>> {
        if id == param::ID_LIST {
            let i = *index as usize;
            if i < self.param_ids.len() {
                *index += 1;
                return Ok(Some(Pod::from_id(self.param_ids[i])));
            }
            return Ok(None);
        }
        if self.param_ids.contains(&id) && *index == 0 {
            *index += 1;
            return Ok(Some(Pod::new(id, Bytes::new())));
        }
        Ok(None)
    }
}

impl Node for TestNode {
    fn enum_params(&self, id: u32, index: &mut u32, _filter: Option<&Pod>) -> Result<Option<Pod>> {
        self.enum_from_list(id, index)
    }

    fn set_param(&mut self, id: u32, _flags: u32, _param: &Pod) -> Result<()> {
        self.record(format!("set_param {}", id));
        Ok(())
    }

    fn send_command(&mut self, command: &Command) -> Result<()> {
        self.record(format!("command {}", cmd_name(command)));
        Ok(())
    }

    fn set_callbacks(&mut self, callbacks: Box<NodeCallbacks>) {
        *self.callbacks.lock().unwrap() = Some(callbacks);
    }

    fn n_ports(&self) -> PortCounts {
        PortCounts {
            n_inputs: self.n_in,
            max_inputs: self.n_in,
            n_outputs: self.n_out,
            max_outputs: self.n_out,
        }
    }

    fn port_ids(&self, direction: Direction) -> Vec<u32> {
        let n = match direction {
            Direction::Input => self.n_in,
            Direction::Output => self.n_out,
        };
        (0..n).collect()
    }

    fn port_info(&self, _direction: Direction, _port_id: u32) -> Result<PortInfo> {
        Ok(PortInfo {
            flags: PortInfoFlags::CAN_USE_BUFFERS | PortInfoFlags::CAN_ALLOC_BUFFERS,
            rate: 44100,
        })
    }

    fn port_enum_params(
        &self,
        _direction: Direction,
        _port_id: u32,
        id: u32,
        index: &mut u32,
        _filter: Option<&Pod>,
    ) -> Result<Option<Pod>> {
        self.enum_from_list(id, index)
    }

    fn port_set_param(
        &mut self,
        direction: Direction,
        port_id: u32,
        id: u32,
        _flags: u32,
        _param: &Pod,
    ) -> Result<()> {
        self.record(format!("port_set_param {} {} id={}", direction, port_id, id));
        Ok(())
    }

    fn port_use_buffers(
        &mut self,
        direction: Direction,
        port_id: u32,
        buffers: &[Buffer],
    ) -> Result<()> {
        self.record(format!("use_buffers {} {} n={}", direction, port_id, buffers.len()));
        Ok(())
    }

    fn port_set_io(
        &mut self,
        direction: Direction,
        port_id: u32,
        id: u32,
        ptr: *mut u8,
        size: usize,
    ) -> Result<()> {
        self.record(format!(
            "set_io {} {} id={} null={} size={}",
            direction,
            port_id,
            id,
            ptr.is_null(),
            size
        ));
        Ok(())
    }

    fn port_reuse_buffer(&mut self, port_id: u32, buffer_id: u32) -> Result<()> {
        self.record(format!("reuse {} {}", port_id, buffer_id));
        Ok(())
    }

    fn port_send_command(
        &mut self,
        direction: Direction,
        port_id: u32,
        remote: bool,
        command: &Command,
    ) -> Result<()> {
        self.record(format!(
            "port_command {} {} remote={} {}",
            direction,
            port_id,
            remote,
            cmd_name(command)
        ));
        Ok(())
    }

    fn process_input(&mut self) -> Result<IoStatus> {
        self.record("process_input".to_owned());
        Ok(self.input_status)
    }

    fn process_output(&mut self) -> Result<IoStatus> {
        self.record("process_output".to_owned());
        Ok(self.output_status)
    }
}

/// An attached session plus the server-side handles the tests drive it
/// with: the server end of the transport and both wake fds.
pub struct Harness {
    pub ctx: Arc<Context>,
    pub channel: Arc<TestChannel>,
    pub calls: Calls,
    pub cbs: SharedCallbacks,
    pub sess: NodeSession,
    pub server: Transport,
    _area: File,
    pub read_efd: File,
    pub write_efd: File,
}

/// Build a session around a `TestNode` and attach a transport to it,
/// the way the server's first `transport` event would.
pub fn attach(n_in: u32, n_out: u32, max_in: u32, max_out: u32) -> Harness {
    let _ = ::env_logger::Builder::from_default_env().try_init();

    let ctx = Arc::new(Context::new().unwrap());
    let channel = Arc::new(TestChannel::new());
    let (node, calls, cbs) = TestNode::new(n_in, n_out);
    let mut sess = NodeSession::new(&ctx, channel.clone(), Box::new(node), Properties::new());

    let (server, area) = Transport::alloc(max_in, max_out).unwrap();
    let client = Transport::map_fd(area.as_raw_fd(), Side::Client).unwrap();
    let read_efd = eventfd();
    let write_efd = eventfd();
    sess.handle_event(ControlEvent::SetTransport {
        node_id: 1,
        read_fd: dup_fd(&read_efd),
        write_fd: dup_fd(&write_efd),
        transport: client,
    });
    channel.take();

    Harness {
        ctx,
        channel,
        calls,
        cbs,
        sess,
        server,
        _area: area,
        read_efd,
        write_efd,
    }
}

impl Harness {
    /// Drain everything the client appended for the server.
    pub fn server_messages(&self) -> Vec<RtMessage> {
        let mut out = Vec::new();
        while let Some(hdr) = self.server.next_message() {
            if let Some(m) = self.server.parse_message(&hdr).unwrap() {
                out.push(m);
            }
        }
        out
    }

    /// Register a fresh memfd-backed region under `mem_id`.
    pub fn add_region(&mut self, mem_id: u32, size: usize) {
        use std::os::unix::io::IntoRawFd;
        let region = memfd(size);
        self.sess.handle_event(ControlEvent::AddMem {
            mem_id,
            type_: DataType::MemFd as u32,
            fd: region.into_raw_fd(),
            flags: ::mem::MemFlags::READWRITE,
        });
    }

    /// A one-buffer `port_use_buffers` event: single header meta, single
    /// MemPtr data at offset 64, aimed at output port 0.
    pub fn one_buffer_event(&self, seq: u32, mem_id: u32, template_id: u32) -> ControlEvent {
        ControlEvent::PortUseBuffers {
            seq,
            direction: Direction::Output,
            port_id: 0,
            buffers: vec![BufferDesc {
                mem_id,
                offset: 0,
                size: 4096,
                buffer: BufferTemplate {
                    id: template_id,
                    metas: vec![MetaTemplate {
                        type_: META_HEADER,
                        size: 16,
                    }],
                    datas: vec![DataTemplate {
                        type_: DataType::MemPtr as u32,
                        flags: 0,
                        data: 64,
                        map_offset: 0,
                        max_size: 1024,
                    }],
                },
            }],
        }
    }
}
