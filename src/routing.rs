use std::collections::BTreeSet;
use std::net::SocketAddr;
use anyhow::bail;
use bytes::{BufMut, Bytes};
use tracing::{debug, trace, warn};

use crate::address::Address;
use crate::connection::PeerId;
use crate::control_messages::{DestinationCode, MetaMessage};
use crate::datagram::{Frame, FrameReader};
use crate::engine::{parse_body, DatagramBuilder, Engine};
use crate::message_header::is_application_message_type;
use crate::outbound::PacketTarget;

/// Where a datagram goes
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Destination {
    /// a literal address, regardless of whether there is a connection record for it
    Address(SocketAddr),
    /// a known peer, direct or indirect
    Peer(PeerId),
    /// resolved by the node doing the routing
    Code(DestinationCode),
}

impl From<SocketAddr> for Destination {
    fn from(value: SocketAddr) -> Self {
        Destination::Address(value)
    }
}

impl From<PeerId> for Destination {
    fn from(value: PeerId) -> Self {
        Destination::Peer(value)
    }
}

impl From<DestinationCode> for Destination {
    fn from(value: DestinationCode) -> Self {
        Destination::Code(value)
    }
}

/// The outcome of resolving a [Destination]: all recipients get the same bytes
#[derive(Debug, Clone)]
pub(crate) struct ResolvedTarget {
    /// wire addresses the datagram is sent to
    pub addresses: Vec<SocketAddr>,
    /// written into every message's footer
    pub forward_address: Address,
    /// who is expected to acknowledge reliable messages
    pub packet_target: PacketTarget,
    /// set if the datagram is routed symbolically by the server
    pub meta: Option<DestinationCode>,
}

impl ResolvedTarget {
    fn nowhere() -> ResolvedTarget {
        ResolvedTarget {
            addresses: Vec::new(),
            forward_address: Address::UNSET,
            packet_target: PacketTarget::Peers(BTreeSet::new()),
            meta: None,
        }
    }

    fn address(addr: SocketAddr) -> ResolvedTarget {
        ResolvedTarget {
            addresses: vec![addr],
            forward_address: Address::UNSET,
            packet_target: PacketTarget::Address(addr),
            meta: None,
        }
    }

    pub fn is_nowhere(&self) -> bool {
        self.addresses.is_empty()
    }
}

impl Engine {
    pub(crate) fn resolve(&self, destination: Destination) -> anyhow::Result<ResolvedTarget> {
        match destination {
            Destination::Address(addr) => Ok(ResolvedTarget::address(addr)),
            Destination::Peer(peer) => self.resolve_peer(peer),
            Destination::Code(code) => self.resolve_code(code),
        }
    }

    fn resolve_peer(&self, peer: PeerId) -> anyhow::Result<ResolvedTarget> {
        let Some(record) = self.directory.get(peer) else {
            bail!("sending to unknown peer {:?}", peer);
        };
        Ok(ResolvedTarget {
            addresses: vec![record.remote_address()],
            forward_address: record.vaddr(),
            packet_target: PacketTarget::Peers([peer].into()),
            meta: None,
        })
    }

    fn resolve_reply(&self) -> anyhow::Result<ResolvedTarget> {
        match self.current_source {
            Some(source) => self.resolve_peer(source.peer),
            None => bail!("REPLY is only meaningful while a received datagram is processed"),
        }
    }

    fn resolve_code(&self, code: DestinationCode) -> anyhow::Result<ResolvedTarget> {
        if let Some(server) = self.server_peer() {
            return match code {
                DestinationCode::Host => self.resolve_peer(server),
                DestinationCode::Reply => self.resolve_reply(),
                DestinationCode::All | DestinationCode::Everyone => {
                    let mut result = self.resolve_peer(server)?;
                    result.meta = Some(code);
                    Ok(result)
                }
            };
        }

        match code {
            DestinationCode::Host => {
                debug!("HOST on the server resolves to nobody");
                Ok(ResolvedTarget::nowhere())
            }
            DestinationCode::Reply => self.resolve_reply(),
            DestinationCode::All | DestinationCode::Everyone => {
                Ok(self.resolve_peer_set(self.directory.direct_peers().collect()))
            }
        }
    }

    /// Direct peers only: every recipient of a datagram gets the same bytes, and indirect peers
    ///  need their individual forward address.
    pub(crate) fn resolve_peer_set(&self, peers: BTreeSet<PeerId>) -> ResolvedTarget {
        let peers = peers.into_iter()
            .filter(|&p| self.directory.get(p).map(|r| !r.is_indirect()).unwrap_or(false))
            .collect::<BTreeSet<_>>();

        if peers.is_empty() {
            return ResolvedTarget::nowhere();
        }

        ResolvedTarget {
            addresses: peers.iter()
                .filter_map(|&p| self.directory.get(p))
                .map(|r| r.remote_address())
                .collect(),
            forward_address: Address::UNSET,
            packet_target: PacketTarget::Peers(peers),
            meta: None,
        }
    }

    /// Server side of a client's symbolically addressed datagram: re-emits the application
    ///  messages of the entire datagram to the resolved recipients.
    pub(crate) fn on_meta(&mut self, data: &Bytes, meta_frame: &Frame, sender: PeerId) {
        if self.server_peer().is_some() {
            debug!("received META on a client - ignoring");
            return;
        }

        let code = match parse_body(meta_frame, |buf| MetaMessage::deser(buf)) {
            Ok(meta) => meta.destination,
            Err(e) => {
                debug!("invalid META message from {:?}: {}", sender, e);
                return;
            }
        };

        let recipients = match code {
            DestinationCode::Host | DestinationCode::Reply => {
                trace!("META {:?} is addressed to the server itself - nothing to fan out", code);
                return;
            }
            DestinationCode::All => self.directory.direct_peers()
                .filter(|&p| p != sender)
                .collect::<BTreeSet<_>>(),
            DestinationCode::Everyone => self.directory.direct_peers()
                .collect::<BTreeSet<_>>(),
        };

        let frames = self.frames_for_fan_out(data, sender);
        if frames.is_empty() {
            return;
        }

        let target = self.resolve_peer_set(recipients);
        if target.is_nowhere() {
            trace!("no recipients for {:?} from {:?}", code, sender);
            return;
        }

        trace!("fanning out {} message(s) from {:?} to {:?}", frames.len(), sender, target.packet_target);
        let mut datagram = DatagramBuilder::new(self, target);
        for frame in &frames {
            if let Err(e) = copy_frame(&mut datagram, frame) {
                warn!("error re-emitting message of type 0x{:04x} from {:?}: {}", frame.header.message_type, sender, e);
                return;
            }
        }
        if let Err(e) = datagram.send() {
            warn!("error sending fan-out datagram for {:?}: {}", sender, e);
        }
    }

    /// The application messages to re-emit, re-scanning the datagram from its start. Reliable
    ///  messages that were processed before are retransmissions, and their fan-out happened
    ///  when they were first received.
    fn frames_for_fan_out(&self, data: &Bytes, sender: PeerId) -> Vec<Frame> {
        let Some(sender_record) = self.directory.get(sender) else {
            return Vec::new();
        };

        let mut result = Vec::new();
        for frame in FrameReader::new(data.clone()) {
            let Ok(frame) = frame else {
                break;
            };
            if !is_application_message_type(frame.header.message_type) || !frame.header.directed_here {
                continue;
            }
            if let Some(reliable_id) = frame.footer.reliable_id {
                if sender_record.is_confirmed(reliable_id) {
                    trace!("reliable message #{} from {:?} was fanned out before - skipping", reliable_id, sender);
                    continue;
                }
            }
            result.push(frame);
        }
        result
    }
}

/// writes the frame's body into a new message with the same type and reliability, allocating a
///  new reliable id
pub(crate) fn copy_frame(datagram: &mut DatagramBuilder, frame: &Frame) -> anyhow::Result<Option<u16>> {
    let info = datagram.begin_message(frame.header.message_type);
    datagram.body().put_slice(&frame.body);
    if frame.footer.is_reliable() {
        Ok(Some(datagram.finish_reliable_message(info, None)?))
    }
    else {
        datagram.finish_message(info)?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use bytes::BufMut;
    use crate::config::NetworkMetrics;
    use crate::engine::{Engine, Reliability};
    use crate::test_util::application::{AppEvent, RecordingApplication};
    use crate::test_util::memory::MemoryNetwork;
    use super::*;

    struct Session {
        server: Engine,
        server_app: RecordingApplication,
        clients: Vec<(Engine, RecordingApplication)>,
    }

    impl Session {
        fn new(network: &MemoryNetwork, num_clients: usize) -> Session {
            let metrics = Arc::new(NetworkMetrics::default());
            let server_socket = network.socket("10.0.0.1:9000".parse().unwrap());
            let server_addr = server_socket.addr();
            let server = Engine::server(Box::new(server_socket), "server", metrics.clone()).unwrap();

            let clients = (0..num_clients)
                .map(|n| {
                    let socket = network.socket(SocketAddr::from(([10, 0, 0, 10 + n as u8], 9000)));
                    let engine = Engine::client(Box::new(socket), server_addr, format!("client-{}", n), metrics.clone()).unwrap();
                    (engine, RecordingApplication::new())
                })
                .collect();

            let mut result = Session { server, server_app: RecordingApplication::new(), clients };
            result.pump();
            result
        }

        fn pump(&mut self) {
            for _ in 0..4 {
                for (engine, app) in self.clients.iter_mut() {
                    engine.update(app).unwrap();
                }
                self.server.update(&mut self.server_app).unwrap();
            }
        }

        fn client_messages(&self, n: usize) -> Vec<(u16, Vec<u8>)> {
            self.clients[n].1.messages().into_iter()
                .map(|(_, message_type, body)| (message_type, body))
                .collect()
        }
    }

    fn send(engine: &mut Engine, destination: Destination, message_type: u16, reliability: Reliability, payload: &[u8]) {
        engine.send_message(destination, message_type, reliability, |buf| buf.put_slice(payload)).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_broadcast_all() {
        let network = MemoryNetwork::new();
        let mut session = Session::new(&network, 3);

        send(&mut session.clients[0].0, DestinationCode::All.into(), 0x100, Reliability::Reliable, b"r");
        send(&mut session.clients[0].0, DestinationCode::All.into(), 0x101, Reliability::Unreliable, b"u");
        session.pump();

        assert!(session.client_messages(0).is_empty());
        for n in 1..3 {
            assert_eq!(session.client_messages(n), vec![(0x100, b"r".to_vec()), (0x101, b"u".to_vec())]);
        }
        // the server is a participant
        assert_eq!(session.server_app.messages().len(), 2);

        // all acknowledgements arrived: the sender's packet and the server's fan-out are retired
        assert_eq!(session.clients[0].0.pending_reliable_count(), 0);
        assert_eq!(session.server.pending_reliable_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_broadcast_everyone() {
        let network = MemoryNetwork::new();
        let mut session = Session::new(&network, 2);

        send(&mut session.clients[1].0, DestinationCode::Everyone.into(), 0x100, Reliability::Reliable, b"x");
        session.pump();

        assert_eq!(session.client_messages(0), vec![(0x100, b"x".to_vec())]);
        assert_eq!(session.client_messages(1), vec![(0x100, b"x".to_vec())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmission_is_not_fanned_out_twice() {
        let network = MemoryNetwork::new();
        let mut session = Session::new(&network, 2);

        // the first transmission reaches the server, but the acknowledgement does not come back
        send(&mut session.clients[0].0, DestinationCode::All.into(), 0x100, Reliability::Reliable, b"once");
        session.server.update(&mut session.server_app).unwrap();
        network.clear_inbox(session.clients[0].0.local_addr());

        tokio::time::advance(NetworkMetrics::default().reliable_resend).await;
        session.pump();

        assert_eq!(session.client_messages(1), vec![(0x100, b"once".to_vec())]);
        assert_eq!(session.server_app.messages().len(), 1);
        assert_eq!(session.clients[0].0.pending_reliable_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_broadcast_and_reply() {
        let network = MemoryNetwork::new();
        let mut session = Session::new(&network, 2);

        send(&mut session.server, DestinationCode::All.into(), 0x200, Reliability::Reliable, b"all");
        session.pump();
        assert_eq!(session.client_messages(0), vec![(0x200, b"all".to_vec())]);
        assert_eq!(session.client_messages(1), vec![(0x200, b"all".to_vec())]);

        // HOST from a client reaches the server only
        send(&mut session.clients[1].0, DestinationCode::Host.into(), 0x201, Reliability::Unreliable, b"host");
        session.pump();
        let server_messages = session.server_app.messages();
        assert_eq!(server_messages.len(), 1);
        assert_eq!(server_messages[0].1, 0x201);
        assert_eq!(session.client_messages(0).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_reaches_only_the_sender() {
        let network = MemoryNetwork::new();
        let mut session = Session::new(&network, 3);
        session.server_app.reply_with = Some((0x201, vec![9]));

        send(&mut session.clients[1].0, DestinationCode::Host.into(), 0x200, Reliability::Unreliable, b"ask");
        session.pump();

        assert_eq!(session.server_app.messages().len(), 1);
        assert_eq!(session.client_messages(1), vec![(0x201, vec![9])]);
        assert!(session.client_messages(0).is_empty());
        assert!(session.client_messages(2).is_empty());
        assert_eq!(session.server.pending_reliable_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_outside_of_receive_is_an_error() {
        let network = MemoryNetwork::new();
        let mut session = Session::new(&network, 1);

        assert!(session.server.send_message(DestinationCode::Reply.into(), 0x100, Reliability::Unreliable, |_| {}).is_err());
        assert!(session.server.send_message(DestinationCode::Host.into(), 0x100, Reliability::Reliable, |_| {}).is_ok());
        assert_eq!(session.server.pending_reliable_count(), 0);
        assert!(session.server_app.events.iter().all(|e| !matches!(e, AppEvent::Message { .. })));
    }
}
