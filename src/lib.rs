#[macro_use]
extern crate bitflags;
extern crate bytes;
#[macro_use]
extern crate enum_primitive;
extern crate failure;
#[macro_use]
extern crate failure_derive;
extern crate libc;
#[macro_use]
extern crate log;
extern crate mio;
extern crate nix;
extern crate page_size;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate strum;
#[macro_use]
extern crate strum_macros;

#[cfg(test)]
extern crate env_logger;
#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;
#[cfg(test)]
extern crate rand;

pub mod buffers;
pub mod data_loop;
pub mod error;
pub mod graph;
pub mod mem;
pub mod node;
pub mod pod;
pub mod protocol;
pub mod remote;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testutil;

use std::sync::Arc;

use data_loop::DataLoop;
use error::Result;

pub use error::Error;
pub use node::{Direction, Node, NodeCallbacks};
pub use pod::{Pod, Properties};
pub use remote::{Remote, RemoteState};
pub use session::NodeSession;

/// Process-wide services a remote hands to its sessions: the system page
/// granularity for shared-memory mapping and the data loop every
/// real-time source runs on.
pub struct Context {
    pub page_size: usize,
    data_loop: Arc<DataLoop>,
}

impl Context {
    pub fn new() -> Result<Context> {
        Ok(Context {
            page_size: page_size::get(),
            data_loop: Arc::new(DataLoop::new()?),
        })
    }

    pub fn data_loop(&self) -> &Arc<DataLoop> {
        &self.data_loop
    }
}
