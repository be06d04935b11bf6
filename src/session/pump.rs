use std::os::unix::io::RawFd;
use std::sync::Arc;

use mio::unix::UnixReady;
use mio::Ready;

use data_loop::{SourceAction, SourceCallback};
use graph::{Graph, NodeId};
use transport::{self, RtMessage, Transport};

/// The real-time message pump, installed as a data-loop source
/// callback on the transport's read fd: drain the wake counter, drain
/// the ring, route each message into the local graph. Errors on the fd
/// mark the source for removal; actual teardown stays with the control
/// thread.
pub(crate) fn make_callback(
    read_fd: RawFd,
    transport: Arc<Transport>,
    graph: Arc<Graph>,
    in_shim: NodeId,
    out_shim: NodeId,
) -> SourceCallback {
    Box::new(move |ready: Ready| {
        let unix = UnixReady::from(ready);
        if unix.is_error() || unix.is_hup() {
            warn!("got error on transport read fd {}", read_fd);
            return SourceAction::Remove;
        }

        if ready.is_readable() {
            match transport::read_wakeup(read_fd) {
                Ok(count) => {
                    if count > 1 {
                        warn!("{} messages", count);
                    }
                }
                Err(e) => warn!("read failed on fd {}: {}", read_fd, e),
            }

            while let Some(hdr) = transport.next_message() {
                match transport.parse_message(&hdr) {
                    Ok(Some(RtMessage::ProcessInput)) => {
                        trace!("process input");
                        graph.have_output(in_shim);
                    }
                    Ok(Some(RtMessage::ProcessOutput)) => {
                        trace!("process output");
                        graph.need_input(out_shim);
                    }
                    Ok(Some(RtMessage::PortReuseBuffer { port_id, buffer_id })) => {
                        trace!("reuse buffer {} on port {}", buffer_id, port_id);
                        graph.reuse_peer(out_shim, port_id, buffer_id);
                    }
                    Ok(Some(other)) => warn!("unexpected node message {:?}", other),
                    Ok(None) => warn!("unexpected node message {}", hdr.type_),
                    Err(e) => warn!("bad node message: {}", e),
                }
            }
        }
        SourceAction::Keep
    })
}
