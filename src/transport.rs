use std::ffi::CString;
use std::fs::File;
use std::mem;
use std::os::unix::io::{FromRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{fence, Ordering};
use std::sync::Mutex;

use enum_primitive::FromPrimitive;
use libc;
use nix::errno::errno;
use page_size::get as page_size;

use error::{Error, Result};
use mem::Mapping;

/// Invalid object / buffer / memory id on the wire.
pub const ID_INVALID: u32 = 0xffff_ffff;

/// Bytes of message payload each ring can hold. Power of two.
pub const RING_DATA_SIZE: u32 = 4096;

/// Largest payload a single real-time message may declare.
pub const MAX_RT_PAYLOAD: usize = 64;

const HDR_SIZE: usize = 8;

enum_from_primitive! {
#[repr(i32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoStatus {
    Ok = 0,
    NeedBuffer = 1,
    HaveBuffer = 2,
}
}

/// One per-port hand-off triplet inside the transport area. Single
/// writer per side; reads and writes are volatile.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct IoBuffers {
    pub status: i32,
    pub buffer_id: u32,
    pub sequence: u32,
}

#[repr(C)]
struct TransportArea {
    max_input_ports: u32,
    max_output_ports: u32,
}

#[repr(C)]
struct RingHeader {
    read_index: u32,
    write_index: u32,
}

/// A borrowed view of one io slot in the mapped area.
#[derive(Clone, Copy, Debug)]
pub struct IoSlot(*mut IoBuffers);

unsafe impl Send for IoSlot {}
unsafe impl Sync for IoSlot {}

impl IoSlot {
    pub fn status(&self) -> i32 {
        // NOTE(unsafe) the slot pointer stays valid for the life of the
        // transport mapping that handed it out
        unsafe { ptr::read_volatile(&(*self.0).status) }
    }

    pub fn set_status(&self, status: IoStatus) {
        unsafe { ptr::write_volatile(&mut (*self.0).status, status as i32) }
    }

    pub fn buffer_id(&self) -> u32 {
        unsafe { ptr::read_volatile(&(*self.0).buffer_id) }
    }

    pub fn set_buffer_id(&self, id: u32) {
        unsafe { ptr::write_volatile(&mut (*self.0).buffer_id, id) }
    }

    pub fn sequence(&self) -> u32 {
        unsafe { ptr::read_volatile(&(*self.0).sequence) }
    }

    pub fn reset(&self) {
        self.set_status(IoStatus::Ok);
        self.set_buffer_id(ID_INVALID);
        unsafe { ptr::write_volatile(&mut (*self.0).sequence, 0) }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.0 as *mut u8
    }

    pub fn size() -> usize {
        mem::size_of::<IoBuffers>()
    }
}

enum_from_primitive! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageType {
    NeedInput = 1,
    HaveOutput = 2,
    ProcessInput = 3,
    ProcessOutput = 4,
    PortReuseBuffer = 5,
}
}

/// A decoded real-time message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RtMessage {
    NeedInput,
    HaveOutput,
    ProcessInput,
    ProcessOutput,
    PortReuseBuffer { port_id: u32, buffer_id: u32 },
}

impl RtMessage {
    fn type_(&self) -> MessageType {
        match *self {
            RtMessage::NeedInput => MessageType::NeedInput,
            RtMessage::HaveOutput => MessageType::HaveOutput,
            RtMessage::ProcessInput => MessageType::ProcessInput,
            RtMessage::ProcessOutput => MessageType::ProcessOutput,
            RtMessage::PortReuseBuffer { .. } => MessageType::PortReuseBuffer,
        }
    }

    fn payload(&self, buf: &mut [u8]) -> usize {
        match *self {
            RtMessage::PortReuseBuffer { port_id, buffer_id } => {
                put_u32(&mut buf[0..4], port_id);
                put_u32(&mut buf[4..8], buffer_id);
                8
            }
            _ => 0,
        }
    }

    fn decode(t: MessageType, payload: &[u8]) -> Result<RtMessage> {
        match t {
            MessageType::NeedInput => Ok(RtMessage::NeedInput),
            MessageType::HaveOutput => Ok(RtMessage::HaveOutput),
            MessageType::ProcessInput => Ok(RtMessage::ProcessInput),
            MessageType::ProcessOutput => Ok(RtMessage::ProcessOutput),
            MessageType::PortReuseBuffer => {
                if payload.len() < 8 {
                    return Err(Error::Protocol {
                        what: format!("short reuse-buffer payload: {}", payload.len()),
                    });
                }
                Ok(RtMessage::PortReuseBuffer {
                    port_id: get_u32(&payload[0..4]),
                    buffer_id: get_u32(&payload[4..8]),
                })
            }
        }
    }
}

/// Header every ring message starts with: its type and payload size.
#[derive(Clone, Copy, Debug)]
pub struct MessageHeader {
    pub type_: u32,
    pub size: u32,
}

fn put_u32(buf: &mut [u8], v: u32) {
    buf[0] = v as u8;
    buf[1] = (v >> 8) as u8;
    buf[2] = (v >> 16) as u8;
    buf[3] = (v >> 24) as u8;
}

fn get_u32(buf: &[u8]) -> u32 {
    u32::from(buf[0])
        | u32::from(buf[1]) << 8
        | u32::from(buf[2]) << 16
        | u32::from(buf[3]) << 24
}

/// One direction of message flow: free-running indices over a
/// power-of-two byte area.
struct Ring {
    header: *mut RingHeader,
    data: *mut u8,
    size: u32,
}

impl Ring {
    /// This points at the producer's published index. The value
    /// continuously increases and is wrapped by the ring size on access.
    fn write_index(&self) -> u32 {
        let w = unsafe { ptr::read_volatile(&(*self.header).write_index) };
        fence(Ordering::Acquire);
        w
    }

    fn read_index(&self) -> u32 {
        let r = unsafe { ptr::read_volatile(&(*self.header).read_index) };
        fence(Ordering::Acquire);
        r
    }

    fn publish_write(&self, w: u32) {
        fence(Ordering::Release);
        unsafe { ptr::write_volatile(&mut (*self.header).write_index, w) }
    }

    fn publish_read(&self, r: u32) {
        fence(Ordering::Release);
        unsafe { ptr::write_volatile(&mut (*self.header).read_index, r) }
    }

    fn copy_in(&self, index: u32, src: &[u8]) {
        let mask = self.size - 1;
        let off = (index & mask) as usize;
        let first = src.len().min(self.size as usize - off);
        // NOTE(unsafe) bounds follow from the wrap arithmetic above
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.data.add(off), first);
            if first < src.len() {
                ptr::copy_nonoverlapping(src.as_ptr().add(first), self.data, src.len() - first);
            }
        }
    }

    fn copy_out(&self, index: u32, dst: &mut [u8]) {
        let mask = self.size - 1;
        let off = (index & mask) as usize;
        let first = dst.len().min(self.size as usize - off);
        unsafe {
            ptr::copy_nonoverlapping(self.data.add(off), dst.as_mut_ptr(), first);
            if first < dst.len() {
                ptr::copy_nonoverlapping(self.data, dst.as_mut_ptr().add(first), dst.len() - first);
            }
        }
    }
}

/// Which end of the connection mapped the area. The server allocates it
/// and reads what the client appends; the client reads what the server
/// appends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Side {
    Server,
    Client,
}

/// The shared-memory transport: one mapped area holding the port
/// counts, an `IoBuffers` slot per port per direction, and a pair of
/// byte rings carrying real-time messages, one per direction. Both
/// sides map the same area; the rings swap roles depending on which
/// `Side` did the mapping. Wakeups travel separately, as 8-byte
/// counters on eventfd-style descriptors.
pub struct Transport {
    mapping: Mapping,
    area: *mut TransportArea,
    inputs: *mut IoBuffers,
    outputs: *mut IoBuffers,
    rx: Ring,
    tx: Ring,
    tx_lock: Mutex<()>,
    side: Side,
}

unsafe impl Send for Transport {}
unsafe impl Sync for Transport {}

fn area_size(max_in: u32, max_out: u32) -> usize {
    mem::size_of::<TransportArea>()
        + mem::size_of::<IoBuffers>() * (max_in + max_out) as usize
        + 2 * (mem::size_of::<RingHeader>() + RING_DATA_SIZE as usize)
}

impl Transport {
    /// Carve the area out of a freshly created memfd. This is the server
    /// half of the hand-shake; the returned file is what gets passed to
    /// the peer (and keeps the fd alive for the test harness).
    pub fn alloc(max_in: u32, max_out: u32) -> Result<(Transport, File)> {
        let size = area_size(max_in, max_out);

        // NOTE(unsafe) plain syscalls; every return value is checked
        let fd = unsafe {
            let name = CString::new("remote-node-transport").unwrap();
            let fd = libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC);
            if fd < 0 {
                return Err(Error::NoMem {
                    what: format!("memfd_create failed: errno {}", errno()),
                });
            }
            if libc::ftruncate(fd, size as libc::off_t) < 0 {
                let e = errno();
                libc::close(fd);
                return Err(Error::NoMem {
                    what: format!("ftruncate failed: errno {}", e),
                });
            }
            fd
        };
        let file = unsafe { File::from_raw_fd(fd) };

        let mapping = Mapping::new(fd, 0, size as u32, libc::PROT_READ | libc::PROT_WRITE, page_size())?;
        let mut t = Transport::layout(mapping, max_in, max_out, Side::Server);

        unsafe {
            (*t.area).max_input_ports = max_in;
            (*t.area).max_output_ports = max_out;
            (*t.rx.header) = RingHeader { read_index: 0, write_index: 0 };
            (*t.tx.header) = RingHeader { read_index: 0, write_index: 0 };
        }
        t.reset_io();

        Ok((t, file))
    }

    /// Map an area the peer allocated. The fd stays with the caller.
    pub fn map_fd(fd: RawFd, side: Side) -> Result<Transport> {
        // NOTE(unsafe) fstat fills the struct on success
        let actual = unsafe {
            let mut st: libc::stat = mem::zeroed();
            if libc::fstat(fd, &mut st) < 0 {
                return Err(Error::Io {
                    inner: ::std::io::Error::from_raw_os_error(errno()),
                });
            }
            st.st_size as usize
        };
        if actual < mem::size_of::<TransportArea>() {
            return Err(Error::Protocol {
                what: format!("transport area too small: {} bytes", actual),
            });
        }

        let mapping = Mapping::new(fd, 0, actual as u32, libc::PROT_READ | libc::PROT_WRITE, page_size())?;
        let (max_in, max_out) = unsafe {
            let area = mapping.user_ptr() as *mut TransportArea;
            ((*area).max_input_ports, (*area).max_output_ports)
        };
        if actual < area_size(max_in, max_out) {
            return Err(Error::Protocol {
                what: format!(
                    "transport area truncated: {} bytes for {}/{} ports",
                    actual, max_in, max_out
                ),
            });
        }

        Ok(Transport::layout(mapping, max_in, max_out, side))
    }

    fn layout(mapping: Mapping, max_in: u32, max_out: u32, side: Side) -> Transport {
        let base = mapping.user_ptr();
        unsafe {
            let area = base as *mut TransportArea;
            let inputs = base.add(mem::size_of::<TransportArea>()) as *mut IoBuffers;
            let outputs = inputs.add(max_in as usize);
            let ring0 = outputs.add(max_out as usize) as *mut u8;
            let ring1 = ring0.add(mem::size_of::<RingHeader>() + RING_DATA_SIZE as usize);

            let server_to_client = Ring {
                header: ring0 as *mut RingHeader,
                data: ring0.add(mem::size_of::<RingHeader>()),
                size: RING_DATA_SIZE,
            };
            let client_to_server = Ring {
                header: ring1 as *mut RingHeader,
                data: ring1.add(mem::size_of::<RingHeader>()),
                size: RING_DATA_SIZE,
            };

            let (rx, tx) = match side {
                Side::Client => (server_to_client, client_to_server),
                Side::Server => (client_to_server, server_to_client),
            };

            Transport {
                mapping,
                area,
                inputs,
                outputs,
                rx,
                tx,
                tx_lock: Mutex::new(()),
                side,
            }
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn max_inputs(&self) -> u32 {
        unsafe { (*self.area).max_input_ports }
    }

    pub fn max_outputs(&self) -> u32 {
        unsafe { (*self.area).max_output_ports }
    }

    pub fn input_io(&self, index: u32) -> Option<IoSlot> {
        if index < self.max_inputs() {
            Some(IoSlot(unsafe { self.inputs.add(index as usize) }))
        } else {
            None
        }
    }

    pub fn output_io(&self, index: u32) -> Option<IoSlot> {
        if index < self.max_outputs() {
            Some(IoSlot(unsafe { self.outputs.add(index as usize) }))
        } else {
            None
        }
    }

    /// Put every io slot back to its initial state.
    pub fn reset_io(&self) {
        for i in 0..self.max_inputs() {
            self.input_io(i).unwrap().reset();
        }
        for i in 0..self.max_outputs() {
            self.output_io(i).unwrap().reset();
        }
    }

    /// Peek the next inbound message header, if any.
    pub fn next_message(&self) -> Option<MessageHeader> {
        let r = self.rx.read_index();
        let w = self.rx.write_index();
        if w.wrapping_sub(r) < HDR_SIZE as u32 {
            return None;
        }
        let mut hdr = [0u8; HDR_SIZE];
        self.rx.copy_out(r, &mut hdr);
        Some(MessageHeader {
            type_: get_u32(&hdr[0..4]),
            size: get_u32(&hdr[4..8]),
        })
    }

    /// Consume the message `next_message` returned. `Ok(None)` means the
    /// type was unknown; the message is skipped either way, so a bad
    /// frame costs one warning, not the ring.
    pub fn parse_message(&self, hdr: &MessageHeader) -> Result<Option<RtMessage>> {
        let r = self.rx.read_index();
        let w = self.rx.write_index();
        let avail = w.wrapping_sub(r);

        let total = HDR_SIZE as u32 + hdr.size;
        if hdr.size as usize > MAX_RT_PAYLOAD || total > avail {
            // declared size cannot be trusted; drop everything pending
            self.rx.publish_read(w);
            return Err(Error::Protocol {
                what: format!("bad rt message size: {} bytes", hdr.size),
            });
        }

        let mut frame = [0u8; MAX_RT_PAYLOAD];
        let payload = &mut frame[..hdr.size as usize];
        self.rx.copy_out(r.wrapping_add(HDR_SIZE as u32), payload);
        self.rx.publish_read(r.wrapping_add(total));

        match MessageType::from_u32(hdr.type_) {
            Some(t) => RtMessage::decode(t, payload).map(Some),
            None => Ok(None),
        }
    }

    /// Append an outbound message. Local producers are serialized; the
    /// consumer on the other side stays lock free.
    pub fn add_message(&self, msg: &RtMessage) -> Result<()> {
        let _guard = self.tx_lock.lock().unwrap();

        let mut payload = [0u8; MAX_RT_PAYLOAD];
        let len = msg.payload(&mut payload);
        let total = (HDR_SIZE + len) as u32;

        let r = self.tx.read_index();
        let w = self.tx.write_index();
        if self.tx.size - w.wrapping_sub(r) < total {
            return Err(Error::io_str("transport ring full"));
        }

        let mut hdr = [0u8; HDR_SIZE];
        put_u32(&mut hdr[0..4], msg.type_() as u32);
        put_u32(&mut hdr[4..8], len as u32);
        self.tx.copy_in(w, &hdr);
        self.tx.copy_in(w.wrapping_add(HDR_SIZE as u32), &payload[..len]);
        self.tx.publish_write(w.wrapping_add(total));
        Ok(())
    }
}

/// Kick the peer: write one 8-byte counter to a wake fd.
pub fn wakeup(fd: RawFd) {
    let cmd: u64 = 1;
    // NOTE(unsafe) plain write of 8 bytes from a stack value
    let n = unsafe { libc::write(fd, &cmd as *const u64 as *const libc::c_void, 8) };
    if n != 8 {
        warn!("wakeup write to fd {} returned {} (errno {})", fd, n, errno());
    }
}

/// Drain a wake fd; returns the accumulated counter.
pub fn read_wakeup(fd: RawFd) -> Result<u64> {
    let mut cmd: u64 = 0;
    let n = unsafe { libc::read(fd, &mut cmd as *mut u64 as *mut libc::c_void, 8) };
    if n != 8 {
        return Err(Error::io_str("short read on wake fd"));
    }
    Ok(cmd)
}
