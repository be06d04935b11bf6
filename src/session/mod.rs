pub mod dispatch;
pub mod pump;

use std::fs::File;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::{Arc, Mutex};

use mio::unix::UnixReady;
use mio::Ready;

use buffers::BufferEntry;
use data_loop::SourceId;
use error::Result;
use graph::{Graph, GraphNode, NodeId};
use mem::MemRegistry;
use node::{io, Direction, Node, NodeCallbacks};
use pod::{Pod, Properties};
use protocol::{ClientMessage, ControlChannel};
use transport::{self, IoSlot, IoStatus, RtMessage, Transport, ID_INVALID};
use Context;

/// Interest mask while the node is paused: errors only.
pub(crate) fn interest_stopped() -> Ready {
    Ready::from(UnixReady::error() | UnixReady::hup())
}

/// Interest mask while the node is started: input as well.
pub(crate) fn interest_running() -> Ready {
    Ready::from(UnixReady::from(Ready::readable()) | UnixReady::error() | UnixReady::hup())
}

pub(crate) struct RtEndpoint {
    pub transport: Arc<Transport>,
    pub write_fd: RawFd,
}

/// The emit path shared by the shims, the node callbacks and the control
/// dispatcher. Swapped out atomically when the transport changes.
pub(crate) struct RtLink {
    inner: Mutex<Option<RtEndpoint>>,
}

impl RtLink {
    fn new() -> RtLink {
        RtLink {
            inner: Mutex::new(None),
        }
    }

    fn set(&self, endpoint: Option<RtEndpoint>) {
        *self.inner.lock().unwrap() = endpoint;
    }

    pub fn emit(&self, message: RtMessage) {
        let guard = self.inner.lock().unwrap();
        match *guard {
            Some(ref ep) => {
                if let Err(e) = ep.transport.add_message(&message) {
                    warn!("failed to queue {:?}: {}", message, e);
                    return;
                }
                transport::wakeup(ep.write_fd);
            }
            None => trace!("emit {:?} with no transport", message),
        }
    }
}

/// The server stand-in inside the local graph. Process hooks only emit;
/// reuse requests have nothing to do here.
struct ShimNode {
    link: Arc<RtLink>,
}

impl GraphNode for ShimNode {
    fn process_input(&mut self) -> Result<IoStatus> {
        trace!("shim: have output");
        self.link.emit(RtMessage::HaveOutput);
        Ok(IoStatus::Ok)
    }

    fn process_output(&mut self) -> Result<IoStatus> {
        trace!("shim: need input");
        self.link.emit(RtMessage::NeedInput);
        Ok(IoStatus::NeedBuffer)
    }

    fn port_reuse_buffer(&mut self, _port_id: u32, _buffer_id: u32) -> Result<()> {
        Ok(())
    }
}

type SharedNode = Arc<Mutex<Box<Node>>>;

/// Lets the graph schedule the local node through the shared handle the
/// control dispatcher also uses.
struct LocalAdapter {
    node: SharedNode,
}

impl GraphNode for LocalAdapter {
    fn process_input(&mut self) -> Result<IoStatus> {
        self.node.lock().unwrap().process_input()
    }

    fn process_output(&mut self) -> Result<IoStatus> {
        self.node.lock().unwrap().process_output()
    }

    fn port_reuse_buffer(&mut self, port_id: u32, buffer_id: u32) -> Result<()> {
        self.node.lock().unwrap().port_reuse_buffer(port_id, buffer_id)
    }
}

/// Surfaces the node's callbacks to the transport and the control
/// channel.
struct SessionCallbacks {
    link: Arc<RtLink>,
    channel: Arc<ControlChannel>,
}

impl NodeCallbacks for SessionCallbacks {
    fn done(&self, seq: u32, res: i32) {
        if let Err(e) = self.channel.send(ClientMessage::Done { seq, result: res }) {
            warn!("done({}, {}) reply failed: {}", seq, res, e);
        }
    }

    fn event(&self, event: &Pod) {
        debug!("dropping node event type {}", event.type_id());
    }

    fn need_input(&self) {
        self.link.emit(RtMessage::NeedInput);
    }

    fn reuse_buffer(&self, port_id: u32, buffer_id: u32) {
        self.link.emit(RtMessage::PortReuseBuffer { port_id, buffer_id });
    }
}

/// One slot of the per-direction port arrays rebuilt on every transport
/// attach. A slot exists for every index the transport advertises, bound
/// or not.
pub(crate) struct PortSlot {
    pub bound: bool,
    pub buffers: Vec<BufferEntry>,
    pub in_order: bool,
    pub io: IoSlot,
}

/// One exported node: the bridge between a local `Node` implementation
/// and the server's scheduler on the other side of the transport. The
/// session owns the memory registry, the per-port buffer tables and
/// the transport for as long as the server keeps it attached.
pub struct NodeSession {
    pub(crate) node_id: u32,
    pub(crate) registry: MemRegistry,
    pub(crate) transport: Option<Arc<Transport>>,
    read_fd: Option<File>,
    write_fd: Option<File>,
    pub(crate) rt_source: Option<SourceId>,
    pub(crate) in_ports: Vec<PortSlot>,
    pub(crate) out_ports: Vec<PortSlot>,
    pub(crate) node: SharedNode,
    properties: Properties,
    graph: Arc<Graph>,
    local: NodeId,
    in_shim: NodeId,
    out_shim: NodeId,
    pub(crate) link: Arc<RtLink>,
    pub(crate) channel: Arc<ControlChannel>,
    pub(crate) data_loop: Arc<::data_loop::DataLoop>,
    active: bool,
}

impl NodeSession {
    pub fn new(
        ctx: &Context,
        channel: Arc<ControlChannel>,
        mut node: Box<Node>,
        properties: Properties,
    ) -> NodeSession {
        let link = Arc::new(RtLink::new());
        node.set_callbacks(Box::new(SessionCallbacks {
            link: link.clone(),
            channel: channel.clone(),
        }));
        let node: SharedNode = Arc::new(Mutex::new(node));

        let graph = Arc::new(Graph::new());
        let local = graph.add_node(Box::new(LocalAdapter { node: node.clone() }));
        let in_shim = graph.add_node(Box::new(ShimNode { link: link.clone() }));
        let out_shim = graph.add_node(Box::new(ShimNode { link: link.clone() }));
        debug!(
            "new session: graph nodes local={} in={} out={}",
            local, in_shim, out_shim
        );

        NodeSession {
            node_id: ID_INVALID,
            registry: MemRegistry::new(ctx.page_size),
            transport: None,
            read_fd: None,
            write_fd: None,
            rt_source: None,
            in_ports: Vec::new(),
            out_ports: Vec::new(),
            node,
            properties,
            graph,
            local,
            in_shim,
            out_shim,
            link,
            channel,
            data_loop: ctx.data_loop().clone(),
            active: false,
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Remember the active flag and tell the server. Re-announced on
    /// every transport attach.
    pub fn set_active(&mut self, active: bool) {
        debug!("active {}", active);
        self.active = active;
        if let Err(e) = self.channel.send(ClientMessage::SetActive(active)) {
            warn!("set_active failed: {}", e);
        }
    }

    pub(crate) fn port_slot(&mut self, direction: Direction, port_id: u32) -> Option<&mut PortSlot> {
        let slots = match direction {
            Direction::Input => &mut self.in_ports,
            Direction::Output => &mut self.out_ports,
        };
        slots.get_mut(port_id as usize)
    }

    /// Release a port's buffers on the node, then drop the table and
    /// every pin it held.
    pub(crate) fn clear_port_buffers(&mut self, direction: Direction, port_id: u32) {
        let bound = match self.port_slot(direction, port_id) {
            Some(s) => s.bound,
            None => return,
        };
        if bound {
            debug!("port {} {}: clear buffers", direction, port_id);
            if let Err(e) = self
                .node
                .lock()
                .unwrap()
                .port_use_buffers(direction, port_id, &[])
            {
                warn!("buffer release on {} port {} failed: {}", direction, port_id, e);
            }
        }
        let registry = &mut self.registry;
        let slots = match direction {
            Direction::Input => &mut self.in_ports,
            Direction::Output => &mut self.out_ports,
        };
        if let Some(slot) = slots.get_mut(port_id as usize) {
            ::buffers::clear_entries(&mut slot.buffers, registry);
            slot.in_order = true;
        }
    }

    /// Install a transport the server just handed us, replacing (and
    /// fully tearing down) whatever was attached before.
    pub(crate) fn set_transport(
        &mut self,
        node_id: u32,
        read_fd: RawFd,
        write_fd: RawFd,
        transport: Transport,
    ) {
        self.clean_transport();

        let trans = Arc::new(transport);
        self.node_id = node_id;
        info!(
            "create transport with fds {} {} for node {}",
            read_fd, write_fd, node_id
        );

        trans.reset_io();
        let max_in = trans.max_inputs();
        let max_out = trans.max_outputs();

        self.in_ports = (0..max_in)
            .map(|i| PortSlot {
                bound: false,
                buffers: Vec::new(),
                in_order: true,
                io: trans.input_io(i).unwrap(),
            })
            .collect();
        self.out_ports = (0..max_out)
            .map(|i| PortSlot {
                bound: false,
                buffers: Vec::new(),
                in_order: true,
                io: trans.output_io(i).unwrap(),
            })
            .collect();

        for i in 0..max_in {
            self.graph
                .add_port(self.in_shim, Direction::Output, i, trans.input_io(i));
        }
        for i in 0..max_out {
            self.graph
                .add_port(self.out_shim, Direction::Input, i, trans.output_io(i));
        }

        let (in_ids, out_ids) = {
            let node = self.node.lock().unwrap();
            (node.port_ids(Direction::Input), node.port_ids(Direction::Output))
        };
        for id in in_ids {
            self.bind_port(Direction::Input, id);
        }
        for id in out_ids {
            self.bind_port(Direction::Output, id);
        }

        // NOTE(unsafe) both fds were handed to us by the event; they are
        // ours to close on teardown
        self.write_fd = Some(unsafe { File::from_raw_fd(write_fd) });
        self.read_fd = Some(unsafe { File::from_raw_fd(read_fd) });
        self.link.set(Some(RtEndpoint {
            transport: trans.clone(),
            write_fd,
        }));

        let callback = pump::make_callback(
            read_fd,
            trans.clone(),
            self.graph.clone(),
            self.in_shim,
            self.out_shim,
        );
        match self.data_loop.add_source(read_fd, interest_stopped(), callback) {
            Ok(id) => self.rt_source = Some(id),
            Err(e) => error!("failed to install transport source: {}", e),
        }

        self.transport = Some(trans);

        if self.active {
            if let Err(e) = self.channel.send(ClientMessage::SetActive(true)) {
                warn!("set_active on attach failed: {}", e);
            }
        }
    }

    fn bind_port(&mut self, direction: Direction, port_id: u32) {
        let io = match self.port_slot(direction, port_id) {
            Some(slot) => {
                slot.bound = true;
                slot.io
            }
            None => {
                warn!(
                    "local {} port {} beyond transport maximum",
                    direction, port_id
                );
                return;
            }
        };

        self.graph.add_port(self.local, direction, port_id, Some(io));
        match direction {
            Direction::Input => self.graph.link(self.in_shim, port_id, self.local, port_id),
            Direction::Output => self.graph.link(self.local, port_id, self.out_shim, port_id),
        }
        debug!("transport {} {} io {:p}", direction, port_id, io.as_ptr());

        if let Err(e) = self.node.lock().unwrap().port_set_io(
            direction,
            port_id,
            io::BUFFERS,
            io.as_ptr(),
            IoSlot::size(),
        ) {
            warn!("io binding on {} port {} failed: {}", direction, port_id, e);
        }
    }

    /// Tear the transport down: buffers first, then the memory table,
    /// then the fds and the rt source. Safe to call any number of times.
    pub fn clean_transport(&mut self) {
        if self.transport.is_none() {
            return;
        }
        debug!("clean transport for node {}", self.node_id);

        self.link.set(None);
        if let Some(id) = self.rt_source.take() {
            self.data_loop.remove_source(id);
        }

        for i in 0..self.in_ports.len() {
            self.clear_port_buffers(Direction::Input, i as u32);
        }
        for i in 0..self.out_ports.len() {
            self.clear_port_buffers(Direction::Output, i as u32);
        }

        self.graph.clear_ports(self.local);
        self.graph.clear_ports(self.in_shim);
        self.graph.clear_ports(self.out_shim);

        self.registry.clear_all();
        self.in_ports.clear();
        self.out_ports.clear();

        self.transport = None;
        self.write_fd = None;
        self.read_fd = None;
    }

    pub fn destroy(&mut self) {
        debug!("session for node {}: destroy", self.node_id);
        self.clean_transport();
    }
}

impl Drop for NodeSession {
    fn drop(&mut self) {
        self.destroy();
    }
}
