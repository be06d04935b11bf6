use libc;
use mio::Ready;

use buffers::{self, Buffer, BufferDesc};
use error::{result_code, Error, Result};
use node::{Command, Direction, PortInfoFlags};
use pod::Pod;
use protocol::{ClientMessage, ControlEvent, PortUpdateFlags, UpdateFlags};
use session::{interest_running, interest_stopped, NodeSession};
use transport::{IoStatus, RtMessage, ID_INVALID};

impl NodeSession {
    /// Dispatch one control event from the server, on the control
    /// thread. Handlers that carry a sequence number answer with
    /// `done(seq, code)` instead of propagating errors; the server
    /// decides what to do about failures.
    pub fn handle_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::AddMem {
                mem_id,
                type_: _,
                fd,
                flags,
            } => {
                self.registry.add(mem_id, fd, flags);
            }
            ControlEvent::SetTransport {
                node_id,
                read_fd,
                write_fd,
                transport,
            } => {
                self.set_transport(node_id, read_fd, write_fd, transport);
            }
            ControlEvent::SetParam { id, flags, param } => {
                if let Err(e) = self.node.lock().unwrap().set_param(id, flags, &param) {
                    warn!("set param {} failed: {}", id, e);
                }
            }
            ControlEvent::Event { event } => {
                warn!("unhandled node event {}", event.type_id());
            }
            ControlEvent::Command { seq, command } => {
                self.handle_command(seq, command);
            }
            ControlEvent::AddPort { seq, .. } => {
                warn!("add port not supported");
                self.done(seq, -libc::ENOTSUP);
            }
            ControlEvent::RemovePort { seq, .. } => {
                warn!("remove port not supported");
                self.done(seq, -libc::ENOTSUP);
            }
            ControlEvent::PortSetParam {
                seq,
                direction,
                port_id,
                id,
                flags,
                param,
            } => {
                let res = self.port_set_param_event(direction, port_id, id, flags, &param);
                self.done(seq, result_code(&res));
            }
            ControlEvent::PortUseBuffers {
                seq,
                direction,
                port_id,
                buffers,
            } => {
                let res = self.port_use_buffers_event(direction, port_id, &buffers);
                self.done(seq, result_code(&res));
            }
            ControlEvent::PortCommand {
                direction,
                port_id,
                command,
            } => {
                self.port_command_event(direction, port_id, &command);
            }
            ControlEvent::PortSetIo {
                seq: _,
                direction,
                port_id,
                id,
                mem_id,
                offset,
                size,
            } => {
                if let Err(e) = self.port_set_io_event(direction, port_id, id, mem_id, offset, size)
                {
                    warn!("set io on {} port {} failed: {}", direction, port_id, e);
                }
            }
        }
    }

    fn update_rt_interest(&self, interest: Ready) {
        if let Some(id) = self.rt_source {
            if let Err(e) = self.data_loop.update_source(id, interest) {
                warn!("interest update failed: {}", e);
            }
        }
    }

    fn handle_command(&mut self, seq: u32, command: Command) {
        match command {
            Command::Pause => {
                debug!("node pause {}", seq);
                self.update_rt_interest(interest_stopped());
                let res = self.node.lock().unwrap().send_command(&Command::Pause);
                if res.is_err() {
                    warn!("pause failed");
                }
                self.done(seq, result_code(&res));
            }
            Command::Start => {
                debug!("node start {}", seq);
                self.update_rt_interest(interest_running());
                let res = self.node.lock().unwrap().send_command(&Command::Start);
                if res.is_err() {
                    warn!("start failed");
                }
                if let Some(ref trans) = self.transport {
                    for i in 0..trans.max_inputs() {
                        if let Some(slot) = trans.input_io(i) {
                            slot.set_status(IoStatus::NeedBuffer);
                        }
                    }
                }
                self.link.emit(RtMessage::NeedInput);
                self.done(seq, result_code(&res));
            }
            Command::ClockUpdate { .. } => {
                // accepted without effect; the node path has no use for
                // stream clock hints
                trace!("clock update {}", seq);
            }
            ref other => {
                warn!("unhandled node command {:?}", other);
                self.done(seq, -libc::ENOTSUP);
            }
        }
    }

    fn port_set_param_event(
        &mut self,
        direction: Direction,
        port_id: u32,
        id: u32,
        flags: u32,
        param: &Pod,
    ) -> Result<()> {
        match self.port_slot(direction, port_id) {
            Some(slot) if slot.bound => (),
            _ => {
                return Err(Error::invalid_arg(format!(
                    "no {} port {}",
                    direction, port_id
                )))
            }
        }
        self.node
            .lock()
            .unwrap()
            .port_set_param(direction, port_id, id, flags, param)?;
        self.send_port_update(
            direction,
            port_id,
            PortUpdateFlags::PARAMS | PortUpdateFlags::INFO,
        );
        Ok(())
    }

    /// Atomic buffer replacement: release, clear, rebuild, adopt. On any
    /// failure the entries built so far are rolled back and the port ends
    /// up empty.
    fn port_use_buffers_event(
        &mut self,
        direction: Direction,
        port_id: u32,
        descs: &[BufferDesc],
    ) -> Result<()> {
        if self.transport.is_none() {
            return Err(Error::io_str("no transport"));
        }
        match self.port_slot(direction, port_id) {
            Some(slot) if slot.bound => (),
            _ => {
                return Err(Error::invalid_arg(format!(
                    "no {} port {}",
                    direction, port_id
                )))
            }
        }

        self.clear_port_buffers(direction, port_id);

        let mut entries = Vec::with_capacity(descs.len());
        let mut in_order = true;
        for (i, desc) in descs.iter().enumerate() {
            match buffers::build_entry(&mut self.registry, desc, direction) {
                Ok(entry) => {
                    if entry.id != i as u32 {
                        warn!("unexpected id {} found, expected {}", entry.id, i);
                        in_order = false;
                    }
                    debug!(
                        "add buffer {} {} {} {}",
                        desc.mem_id, entry.id, desc.offset, desc.size
                    );
                    entries.push(entry);
                }
                Err(e) => {
                    buffers::clear_entries(&mut entries, &mut self.registry);
                    return Err(e);
                }
            }
        }

        let bufs: Vec<Buffer> = entries.iter().map(|e| e.buffer.clone()).collect();
        if let Err(e) = self
            .node
            .lock()
            .unwrap()
            .port_use_buffers(direction, port_id, &bufs)
        {
            buffers::clear_entries(&mut entries, &mut self.registry);
            return Err(e);
        }

        if let Some(slot) = self.port_slot(direction, port_id) {
            slot.buffers = entries;
            slot.in_order = in_order;
        }
        Ok(())
    }

    fn port_set_io_event(
        &mut self,
        direction: Direction,
        port_id: u32,
        id: u32,
        mem_id: u32,
        offset: u32,
        size: u32,
    ) -> Result<()> {
        match self.port_slot(direction, port_id) {
            Some(slot) if slot.bound => (),
            _ => {
                return Err(Error::invalid_arg(format!(
                    "no {} port {}",
                    direction, port_id
                )))
            }
        }

        let (ptr, len) = if mem_id == ID_INVALID {
            (::std::ptr::null_mut(), 0)
        } else {
            match self.registry.map(mem_id, offset, size) {
                Ok(p) => (p, size as usize),
                Err(e) => {
                    warn!("unknown memory id {}", mem_id);
                    return Err(e);
                }
            }
        };

        debug!("port {} {}: set io {} -> {:p}", direction, port_id, id, ptr);
        self.node
            .lock()
            .unwrap()
            .port_set_io(direction, port_id, id, ptr, len)
    }

    fn port_command_event(&mut self, direction: Direction, port_id: u32, command: &Command) {
        match self.port_slot(direction, port_id) {
            Some(slot) if slot.bound => (),
            _ => return,
        }
        if let Err(e) = self
            .node
            .lock()
            .unwrap()
            .port_send_command(direction, port_id, true, command)
        {
            warn!("port command on {} port {} failed: {}", direction, port_id, e);
        }
    }

    /// Package a port's parameters and/or info as a `port_update`. The
    /// parameter walk enumerates the declared id list, then every
    /// instance of each listed id.
    pub(crate) fn send_port_update(
        &self,
        direction: Direction,
        port_id: u32,
        change_mask: PortUpdateFlags,
    ) {
        let (params, info) = {
            let node = self.node.lock().unwrap();

            let mut params = Vec::new();
            if change_mask.contains(PortUpdateFlags::PARAMS) {
                let mut idx1 = 0;
                loop {
                    let pod = match node.port_enum_params(
                        direction,
                        port_id,
                        ::node::param::ID_LIST,
                        &mut idx1,
                        None,
                    ) {
                        Ok(Some(p)) => p,
                        _ => break,
                    };
                    let id = match pod.as_id() {
                        Some(id) => id,
                        None => {
                            warn!("id-list entry is not an id pod");
                            continue;
                        }
                    };
                    let mut idx2 = 0;
                    loop {
                        match node.port_enum_params(direction, port_id, id, &mut idx2, None) {
                            Ok(Some(p)) => params.push(p),
                            _ => break,
                        }
                    }
                }
            }

            let info = if change_mask.contains(PortUpdateFlags::INFO) {
                match node.port_info(direction, port_id) {
                    Ok(mut pi) => {
                        // a remote port cannot allocate for the server
                        pi.flags.remove(PortInfoFlags::CAN_ALLOC_BUFFERS);
                        Some(pi)
                    }
                    Err(e) => {
                        warn!("no info for {} port {}: {}", direction, port_id, e);
                        None
                    }
                }
            } else {
                None
            };
            (params, info)
        };

        if let Err(e) = self.channel.send(ClientMessage::PortUpdate {
            direction,
            port_id,
            change_mask,
            params,
            info,
        }) {
            warn!("port update failed: {}", e);
        }
    }

    /// The first thing the server hears about a freshly exported node:
    /// its port maxima, one update per existing port, and a `done(0, 0)`
    /// marking the description complete.
    pub(crate) fn announce(&self) {
        let (counts, in_ids, out_ids) = {
            let node = self.node.lock().unwrap();
            (
                node.n_ports(),
                node.port_ids(Direction::Input),
                node.port_ids(Direction::Output),
            )
        };

        if let Err(e) = self.channel.send(ClientMessage::Update {
            change_mask: UpdateFlags::MAX_INPUTS | UpdateFlags::MAX_OUTPUTS | UpdateFlags::PARAMS,
            max_input_ports: counts.max_inputs,
            max_output_ports: counts.max_outputs,
            params: Vec::new(),
        }) {
            warn!("node update failed: {}", e);
        }

        for id in in_ids {
            self.send_port_update(
                Direction::Input,
                id,
                PortUpdateFlags::PARAMS | PortUpdateFlags::INFO,
            );
        }
        for id in out_ids {
            self.send_port_update(
                Direction::Output,
                id,
                PortUpdateFlags::PARAMS | PortUpdateFlags::INFO,
            );
        }

        self.done(0, 0);
    }

    pub(crate) fn done(&self, seq: u32, result: i32) {
        if let Err(e) = self.channel.send(ClientMessage::Done { seq, result }) {
            warn!("done({}, {}) failed: {}", seq, result, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use libc;

    use node::{io, param, Command, Direction, PortInfoFlags};
    use pod::Pod;
    use protocol::{ClientMessage, ControlEvent, PortUpdateFlags, UpdateFlags};
    use testutil::attach;
    use transport::ID_INVALID;

    #[test]
    fn port_set_param_updates_and_replies() {
        let mut h = attach(0, 1, 0, 1);

        h.sess.handle_event(ControlEvent::PortSetParam {
            seq: 8,
            direction: Direction::Output,
            port_id: 0,
            id: param::FORMAT,
            flags: 0,
            param: Pod::from_id(0),
        });

        let sent = h.channel.take();
        assert_eq!(sent.len(), 2);
        match sent[0] {
            ClientMessage::PortUpdate {
                direction,
                port_id,
                change_mask,
                ref params,
                ref info,
            } => {
                assert_eq!(direction, Direction::Output);
                assert_eq!(port_id, 0);
                assert_eq!(change_mask, PortUpdateFlags::PARAMS | PortUpdateFlags::INFO);
                // TestNode lists two param ids with one instance each
                assert_eq!(params.len(), 2);
                let info = info.as_ref().unwrap();
                assert!(!info.flags.contains(PortInfoFlags::CAN_ALLOC_BUFFERS));
                assert!(info.flags.contains(PortInfoFlags::CAN_USE_BUFFERS));
            }
            ref other => panic!("expected port update, got {:?}", other),
        }
        assert_eq!(sent[1], ClientMessage::Done { seq: 8, result: 0 });
        assert!(h
            .calls
            .lock()
            .unwrap()
            .contains(&format!("port_set_param output 0 id={}", param::FORMAT)));
    }

    #[test]
    fn bad_port_is_an_invalid_argument() {
        let mut h = attach(0, 1, 0, 1);

        h.sess.handle_event(ControlEvent::PortSetParam {
            seq: 9,
            direction: Direction::Input,
            port_id: 4,
            id: param::FORMAT,
            flags: 0,
            param: Pod::from_id(0),
        });
        assert_eq!(
            h.channel.take(),
            vec![ClientMessage::Done {
                seq: 9,
                result: -libc::EINVAL,
            }]
        );
    }

    #[test]
    fn add_and_remove_port_are_refused() {
        let mut h = attach(0, 1, 0, 1);

        h.sess.handle_event(ControlEvent::AddPort {
            seq: 1,
            direction: Direction::Input,
            port_id: 1,
        });
        h.sess.handle_event(ControlEvent::RemovePort {
            seq: 2,
            direction: Direction::Output,
            port_id: 0,
        });
        assert_eq!(
            h.channel.take(),
            vec![
                ClientMessage::Done {
                    seq: 1,
                    result: -libc::ENOTSUP,
                },
                ClientMessage::Done {
                    seq: 2,
                    result: -libc::ENOTSUP,
                },
            ]
        );
    }

    #[test]
    fn clock_update_is_accepted_silently() {
        let mut h = attach(0, 1, 0, 1);
        h.calls.lock().unwrap().clear();

        h.sess.handle_event(ControlEvent::Command {
            seq: 6,
            command: Command::ClockUpdate {
                flags: 0,
                ticks: 1024,
                rate: 44100,
                monotonic_time: 99,
            },
        });
        assert!(h.channel.take().is_empty());
        assert!(h.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_commands_are_refused() {
        let mut h = attach(0, 1, 0, 1);

        h.sess.handle_event(ControlEvent::Command {
            seq: 7,
            command: Command::Flush,
        });
        assert_eq!(
            h.channel.take(),
            vec![ClientMessage::Done {
                seq: 7,
                result: -libc::ENOTSUP,
            }]
        );
    }

    #[test]
    fn set_io_binds_mapped_memory_and_null() {
        let mut h = attach(0, 1, 0, 1);
        h.add_region(3, 4096);

        h.sess.handle_event(ControlEvent::PortSetIo {
            seq: 1,
            direction: Direction::Output,
            port_id: 0,
            id: io::CONTROL,
            mem_id: 3,
            offset: 0,
            size: 64,
        });
        h.sess.handle_event(ControlEvent::PortSetIo {
            seq: 2,
            direction: Direction::Output,
            port_id: 0,
            id: io::CONTROL,
            mem_id: ID_INVALID,
            offset: 0,
            size: 0,
        });

        let calls = h.calls.lock().unwrap().clone();
        assert!(calls.contains(&format!("set_io output 0 id={} null=false size=64", io::CONTROL)));
        assert!(calls.contains(&format!("set_io output 0 id={} null=true size=0", io::CONTROL)));
        // set_io never answers
        assert!(h.channel.take().is_empty());
    }

    #[test]
    fn port_commands_are_forwarded_as_remote() {
        let mut h = attach(0, 1, 0, 1);

        h.sess.handle_event(ControlEvent::PortCommand {
            direction: Direction::Output,
            port_id: 0,
            command: Command::Pause,
        });
        assert!(h
            .calls
            .lock()
            .unwrap()
            .contains(&"port_command output 0 remote=true pause".to_owned()));
    }

    #[test]
    fn node_set_param_is_forwarded_without_reply() {
        let mut h = attach(0, 1, 0, 1);

        h.sess.handle_event(ControlEvent::SetParam {
            id: param::PROPS,
            flags: 0,
            param: Pod::from_id(1),
        });
        assert!(h
            .calls
            .lock()
            .unwrap()
            .contains(&format!("set_param {}", param::PROPS)));
        assert!(h.channel.take().is_empty());
    }

    #[test]
    fn announce_describes_the_node() {
        let h = attach(1, 1, 1, 1);
        h.sess.announce();

        let sent = h.channel.take();
        assert_eq!(sent.len(), 4); // update, two port updates, done
        match sent[0] {
            ClientMessage::Update {
                change_mask,
                max_input_ports,
                max_output_ports,
                ..
            } => {
                assert_eq!(
                    change_mask,
                    UpdateFlags::MAX_INPUTS | UpdateFlags::MAX_OUTPUTS | UpdateFlags::PARAMS
                );
                assert_eq!(max_input_ports, 1);
                assert_eq!(max_output_ports, 1);
            }
            ref other => panic!("expected update, got {:?}", other),
        }
        match (&sent[1], &sent[2]) {
            (
                &ClientMessage::PortUpdate {
                    direction: Direction::Input,
                    ..
                },
                &ClientMessage::PortUpdate {
                    direction: Direction::Output,
                    ..
                },
            ) => (),
            other => panic!("expected two port updates, got {:?}", other),
        }
        assert_eq!(sent[3], ClientMessage::Done { seq: 0, result: 0 });
    }
}
