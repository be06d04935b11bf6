use std::mem;
use std::os::unix::io::RawFd;

use enum_primitive::FromPrimitive;
use libc;

use error::{Error, Result};
use mem::{MemRegistry, Mapping};
use node::Direction;

enum_from_primitive! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataType {
    MemPtr = 1,
    MemFd = 2,
    DmaBuf = 3,
}
}

/// Meta carrying a standard header block.
pub const META_HEADER: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Chunk {
    pub offset: u32,
    pub size: u32,
    pub stride: i32,
}

/// Server-side description of one meta slot.
#[derive(Clone, Debug)]
pub struct MetaTemplate {
    pub type_: u32,
    pub size: u32,
}

/// Server-side description of one data element. `data` is a memory-id
/// cookie for fd-backed kinds and a byte offset for MemPtr.
#[derive(Clone, Debug)]
pub struct DataTemplate {
    pub type_: u32,
    pub flags: u32,
    pub data: u64,
    pub map_offset: u32,
    pub max_size: u32,
}

#[derive(Clone, Debug)]
pub struct BufferTemplate {
    pub id: u32,
    pub metas: Vec<MetaTemplate>,
    pub datas: Vec<DataTemplate>,
}

/// One entry of a `port_use_buffers` control event.
#[derive(Clone, Debug)]
pub struct BufferDesc {
    pub mem_id: u32,
    pub offset: u32,
    pub size: u32,
    pub buffer: BufferTemplate,
}

#[derive(Clone, Copy, Debug)]
pub struct Meta {
    pub type_: u32,
    pub data: *mut u8,
    pub size: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct Data {
    pub type_: u32,
    pub flags: u32,
    pub fd: RawFd,
    pub map_offset: u32,
    pub max_size: u32,
    pub data: *mut u8,
    pub chunk: *mut Chunk,
}

/// A buffer rebuilt in local memory, every pointer resolved against the
/// entry's mapping. Handed to the local node by `port_use_buffers`.
#[derive(Clone, Debug)]
pub struct Buffer {
    pub id: u32,
    pub metas: Vec<Meta>,
    pub datas: Vec<Data>,
}

unsafe impl Send for Buffer {}

/// A live buffer-table slot: the rebuilt buffer, its private mapping and
/// the region ids it keeps pinned.
#[derive(Debug)]
pub struct BufferEntry {
    pub id: u32,
    pub buffer: Buffer,
    map: Mapping,
    mems: Vec<u32>,
}

impl BufferEntry {
    pub fn map_ptr(&self) -> *mut u8 {
        self.map.user_ptr()
    }
}

/// Rebuild one server-described buffer. Every pinned region has had its
/// refcount incremented exactly once when this returns Ok.
pub fn build_entry(
    registry: &mut MemRegistry,
    desc: &BufferDesc,
    direction: Direction,
) -> Result<BufferEntry> {
    let fd = match registry.find(desc.mem_id) {
        Some(r) => r.fd,
        None => {
            error!("unknown memory id {}", desc.mem_id);
            return Err(Error::NotFound {
                what: "mem",
                id: desc.mem_id,
            });
        }
    };

    let prot = libc::PROT_READ
        | if direction == Direction::Output {
            libc::PROT_WRITE
        } else {
            0
        };

    let map = Mapping::new(fd, desc.offset, desc.size, prot, registry.page())?;
    if let Err(e) = map.lock() {
        warn!(
            "failed to mlock buffer memory {} +{} ({}): errno {}",
            desc.mem_id, desc.offset, desc.size, e
        );
    }

    let mut mems = Vec::with_capacity(1 + desc.buffer.datas.len());
    registry.pin(desc.mem_id)?;
    mems.push(desc.mem_id);

    let base = map.user_ptr();
    let t = &desc.buffer;

    let mut metas = Vec::with_capacity(t.metas.len());
    let mut offset = 0usize;
    for m in &t.metas {
        metas.push(Meta {
            type_: m.type_,
            // NOTE(unsafe) offsets stay inside the window the server
            // described; the server is trusted for its own layout
            data: unsafe { base.add(offset) },
            size: m.size,
        });
        offset += m.size as usize;
    }

    let mut datas = Vec::with_capacity(t.datas.len());
    for (j, d) in t.datas.iter().enumerate() {
        let chunk = unsafe { base.add(offset + mem::size_of::<Chunk>() * j) } as *mut Chunk;
        let mut out = Data {
            type_: d.type_,
            flags: d.flags,
            fd: -1,
            map_offset: d.map_offset,
            max_size: d.max_size,
            data: ::std::ptr::null_mut(),
            chunk,
        };

        match DataType::from_u32(d.type_) {
            Some(DataType::MemFd) | Some(DataType::DmaBuf) => {
                let cookie = d.data as u32;
                match registry.pin(cookie) {
                    Ok(dfd) => {
                        mems.push(cookie);
                        out.fd = dfd;
                        debug!("data {}: mem {} -> fd {}", j, cookie, dfd);
                    }
                    Err(e) => {
                        error!("unknown buffer mem {}", cookie);
                        // roll back the pins taken so far
                        for id in mems {
                            registry.unpin(id);
                        }
                        return Err(e);
                    }
                }
            }
            Some(DataType::MemPtr) => {
                out.data = unsafe { base.add(d.data as usize) };
                debug!("data {}: offset {} -> ptr {:p}", j, d.data, out.data);
            }
            None => {
                warn!("unknown buffer data type {}", d.type_);
            }
        }
        datas.push(out);
    }

    Ok(BufferEntry {
        id: t.id,
        buffer: Buffer {
            id: t.id,
            metas,
            datas,
        },
        map,
        mems,
    })
}

/// Tear down a port's buffer table: unmap every entry and drop each pin,
/// clearing regions whose count reaches zero.
pub fn clear_entries(entries: &mut Vec<BufferEntry>, registry: &mut MemRegistry) {
    debug!("clear {} buffer entries", entries.len());
    for entry in entries.drain(..) {
        let BufferEntry { map, mems, .. } = entry;
        drop(map);
        for id in mems {
            registry.unpin(id);
        }
    }
}
