use std::sync::Mutex;

use error::Result;
use node::Direction;
use transport::{IoSlot, IoStatus};

pub type NodeId = usize;

/// What the graph schedules. Implemented by the session for the local
/// node adapter and the transport shims.
pub trait GraphNode: Send {
    fn process_input(&mut self) -> Result<IoStatus>;
    fn process_output(&mut self) -> Result<IoStatus>;
    fn port_reuse_buffer(&mut self, port_id: u32, buffer_id: u32) -> Result<()>;
}

struct PortEntry {
    id: u32,
    io: Option<IoSlot>,
    peer: Option<(NodeId, u32)>,
}

struct Entry {
    imp: Box<GraphNode>,
    // ports[0] input side, ports[1] output side
    ports: [Vec<PortEntry>; 2],
}

#[derive(Default)]
struct Inner {
    nodes: Vec<Option<Entry>>,
}

/// An arena of processing nodes addressed by stable index, with
/// per-direction ports linked into edges. Scheduling is edge-event
/// propagation only; nodes move their own data through the io slots
/// their ports were bound to. One mutex guards topology and
/// scheduling; it is the locking discipline the data loop relies on
/// when it drives edges.
pub struct Graph {
    inner: Mutex<Inner>,
}

fn dir_index(direction: Direction) -> usize {
    match direction {
        Direction::Input => 0,
        Direction::Output => 1,
    }
}

impl Graph {
    pub fn new() -> Graph {
        Graph {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn add_node(&self, imp: Box<GraphNode>) -> NodeId {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.push(Some(Entry {
            imp,
            ports: [Vec::new(), Vec::new()],
        }));
        inner.nodes.len() - 1
    }

    pub fn add_port(&self, node: NodeId, direction: Direction, id: u32, io: Option<IoSlot>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.nodes.get_mut(node).and_then(|e| e.as_mut()) {
            entry.ports[dir_index(direction)].push(PortEntry {
                id,
                io,
                peer: None,
            });
        } else {
            warn!("add_port on unknown graph node {}", node);
        }
    }

    /// Connect an output port to an input port.
    pub fn link(&self, out_node: NodeId, out_port: u32, in_node: NodeId, in_port: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.set_peer(out_node, Direction::Output, out_port, Some((in_node, in_port)));
        inner.set_peer(in_node, Direction::Input, in_port, Some((out_node, out_port)));
    }

    /// Drop every port (and therefore every edge) attached to a node.
    /// Peers pointing back at it are unlinked too.
    pub fn clear_ports(&self, node: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        let peers: Vec<(NodeId, Direction, u32)> = match inner.nodes.get_mut(node).and_then(|e| e.as_mut()) {
            Some(entry) => {
                let mut peers = Vec::new();
                for (di, dir) in [Direction::Input, Direction::Output].iter().enumerate() {
                    for p in entry.ports[di].drain(..) {
                        if let Some((pn, pp)) = p.peer {
                            peers.push((pn, dir.reverse(), pp));
                        }
                    }
                }
                peers
            }
            None => return,
        };
        for (pn, pdir, pp) in peers {
            inner.set_peer(pn, pdir, pp, None);
        }
    }

    /// The io slot a port was created with.
    pub fn port_io(&self, node: NodeId, direction: Direction, id: u32) -> Option<IoSlot> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .get(node)
            .and_then(|e| e.as_ref())
            .and_then(|e| e.ports[dir_index(direction)].iter().find(|p| p.id == id))
            .and_then(|p| p.io)
    }

    /// `node` has produced: run `process_input` on each downstream peer,
    /// following edges while peers keep reporting they produced as well.
    pub fn have_output(&self, node: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.have_output(node);
    }

    /// `node` wants data: ask each upstream peer to produce, then let
    /// `node` consume when one of them did.
    pub fn need_input(&self, node: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.need_input(node);
    }

    /// Forward a reuse-buffer request through the addressed in-edge of
    /// `node` to the peer that owns the buffers.
    pub fn reuse_peer(&self, node: NodeId, port_id: u32, buffer_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        let peer = inner
            .nodes
            .get(node)
            .and_then(|e| e.as_ref())
            .and_then(|e| e.ports[0].iter().find(|p| p.id == port_id))
            .and_then(|p| p.peer);
        match peer {
            Some((pn, pp)) => {
                if let Some(entry) = inner.nodes.get_mut(pn).and_then(|e| e.as_mut()) {
                    trace!("reuse buffer {} on node {} port {}", buffer_id, pn, pp);
                    if let Err(e) = entry.imp.port_reuse_buffer(pp, buffer_id) {
                        warn!("reuse_buffer failed: {}", e);
                    }
                }
            }
            None => trace!("reuse: no peer behind port {} of node {}", port_id, node),
        }
    }
}

impl Inner {
    fn set_peer(&mut self, node: NodeId, direction: Direction, id: u32, peer: Option<(NodeId, u32)>) {
        if let Some(p) = self
            .nodes
            .get_mut(node)
            .and_then(|e| e.as_mut())
            .and_then(|e| e.ports[dir_index(direction)].iter_mut().find(|p| p.id == id))
        {
            p.peer = peer;
        } else {
            warn!("no {} port {} on graph node {}", direction, id, node);
        }
    }

    fn downstream(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        if let Some(entry) = self.nodes.get(node).and_then(|e| e.as_ref()) {
            for p in &entry.ports[1] {
                if let Some((pn, _)) = p.peer {
                    if !out.contains(&pn) {
                        out.push(pn);
                    }
                }
            }
        }
        out
    }

    fn upstream(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        if let Some(entry) = self.nodes.get(node).and_then(|e| e.as_ref()) {
            for p in &entry.ports[0] {
                if let Some((pn, _)) = p.peer {
                    if !out.contains(&pn) {
                        out.push(pn);
                    }
                }
            }
        }
        out
    }

    fn process_input_on(&mut self, node: NodeId) -> IoStatus {
        match self.nodes.get_mut(node).and_then(|e| e.as_mut()) {
            Some(entry) => match entry.imp.process_input() {
                Ok(s) => s,
                Err(e) => {
                    warn!("process_input on node {} failed: {}", node, e);
                    IoStatus::Ok
                }
            },
            None => IoStatus::Ok,
        }
    }

    fn process_output_on(&mut self, node: NodeId) -> IoStatus {
        match self.nodes.get_mut(node).and_then(|e| e.as_mut()) {
            Some(entry) => match entry.imp.process_output() {
                Ok(s) => s,
                Err(e) => {
                    warn!("process_output on node {} failed: {}", node, e);
                    IoStatus::Ok
                }
            },
            None => IoStatus::Ok,
        }
    }

    fn have_output(&mut self, node: NodeId) {
        for peer in self.downstream(node) {
            if self.process_input_on(peer) == IoStatus::HaveBuffer {
                self.have_output(peer);
            }
        }
    }

    fn need_input(&mut self, node: NodeId) {
        let mut produced = false;
        for peer in self.upstream(node) {
            if self.process_output_on(peer) == IoStatus::HaveBuffer {
                produced = true;
            }
        }
        if produced {
            self.process_input_on(node);
        }
    }
}
