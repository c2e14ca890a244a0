use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, trace, trace_span, warn};

use crate::address::Address;
use crate::application::{MessageContext, NetworkApplication};
use crate::config::NetworkMetrics;
use crate::connection::{ConnectionRecord, PeerId};
use crate::control_messages::{ConfirmPacketMessage, JoinMessage, LeaveMessage, LeaveReason, MetaMessage};
use crate::datagram::{DatagramWriter, Frame, FrameReader};
use crate::directory::ConnectionDirectory;
use crate::error::{EndReason, NetworkError};
use crate::message_header::{is_application_message_type, HeaderInfo, MessageFooter, MessageType};
use crate::outbound::{OutboundPacket, OutboundRegistry, PacketTarget, Resend};
use crate::routing::{Destination, ResolvedTarget};
use crate::socket::DatagramSocket;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Reliability {
    Unreliable,
    Reliable,
}

/// A client's session with its server
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClientPhase {
    /// JOIN was sent, waiting for the server's confirmation
    Joining,
    Connected,
    /// LEAVE was sent, waiting for its acknowledgement (or the timeout)
    Leaving,
    Disconnected,
}

#[derive(Debug)]
struct ClientState {
    server: PeerId,
    phase: ClientPhase,
    /// reliable id of the LEAVE message and when it was sent
    leave: Option<(u16, Instant)>,
}

#[derive(Debug)]
enum EngineRole {
    Client(ClientState),
    Server,
}

/// the sender of the message that is currently being processed, i.e. what REPLY resolves to
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReplyTarget {
    pub addr: SocketAddr,
    pub peer: PeerId,
}

/// events that happen outside of `update()` and are reported to the application during the
///  next `update()`
#[derive(Debug)]
enum PendingEvent {
    Kicked { peer: PeerId, record: ConnectionRecord, reason: LeaveReason },
    Closed(EndReason),
}

/// One node of a session: either the server, or one of its clients.
///
/// The engine does not run on its own. The host application calls [Engine::update] (or
///  [Engine::poll]) once per tick, which processes all received datagrams, calls back into the
///  application, and does the timer work (retransmissions, pings, timeouts).
pub struct Engine {
    socket: Box<dyn DatagramSocket>,
    metrics: Arc<NetworkMetrics>,
    name: String,
    local_addr: SocketAddr,
    next_reliable_id: u16,
    pub(crate) registry: OutboundRegistry,
    pub(crate) directory: ConnectionDirectory,
    role: EngineRole,
    ended: Option<EndReason>,
    pub(crate) current_source: Option<ReplyTarget>,
    pending_events: Vec<PendingEvent>,
    recv_buf: Vec<u8>,
}

impl Engine {
    pub fn server(socket: Box<dyn DatagramSocket>, name: impl Into<String>, metrics: Arc<NetworkMetrics>) -> anyhow::Result<Engine> {
        metrics.validate()?;
        let engine = Engine::new(socket, name.into(), metrics, ConnectionDirectory::new(), EngineRole::Server);
        info!("starting server {:?} on {:?}", engine.name, engine.local_addr);
        Ok(engine)
    }

    /// Creates a client and sends the JOIN to the server. The session is established once the
    ///  server confirmed, see [NetworkApplication::on_network_connected].
    pub fn client(socket: Box<dyn DatagramSocket>, server: SocketAddr, name: impl Into<String>, metrics: Arc<NetworkMetrics>) -> anyhow::Result<Engine> {
        metrics.validate()?;

        let mut directory = ConnectionDirectory::new();
        let (server_id, _) = directory.add(ConnectionRecord::direct(server, String::new(), Instant::now()));

        let role = EngineRole::Client(ClientState {
            server: server_id,
            phase: ClientPhase::Joining,
            leave: None,
        });
        let mut engine = Engine::new(socket, name.into(), metrics, directory, role);
        // a restarted client must not reuse the previous session's JOIN id: the server may
        //  still remember it and drop the new JOIN as a retransmission
        engine.next_reliable_id = rand::thread_rng().gen_range(1..=u16::MAX);
        info!("client {:?} on {:?} joining server {:?}", engine.name, engine.local_addr, server);

        let join = JoinMessage { name: engine.name.clone() };
        engine.send_message(Destination::Peer(server_id), MessageType::Join.into(), Reliability::Reliable, |buf| join.ser(buf))?;
        Ok(engine)
    }

    fn new(socket: Box<dyn DatagramSocket>, name: String, metrics: Arc<NetworkMetrics>, directory: ConnectionDirectory, role: EngineRole) -> Engine {
        let local_addr = socket.local_addr();
        let recv_buf = vec![0u8; metrics.max_datagram_size + 1];
        Engine {
            socket,
            metrics,
            name,
            local_addr,
            next_reliable_id: 1,
            registry: OutboundRegistry::new(),
            directory,
            role,
            ended: None,
            current_source: None,
            pending_events: Vec::new(),
            recv_buf,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> &NetworkMetrics {
        &self.metrics
    }

    pub fn is_server(&self) -> bool {
        matches!(self.role, EngineRole::Server)
    }

    /// `None` on a server
    pub fn client_phase(&self) -> Option<ClientPhase> {
        match &self.role {
            EngineRole::Client(state) => Some(state.phase),
            EngineRole::Server => None,
        }
    }

    /// the server's handle on a client, `None` on a server
    pub fn server_peer(&self) -> Option<PeerId> {
        match &self.role {
            EngineRole::Client(state) => Some(state.server),
            EngineRole::Server => None,
        }
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.ended
    }

    pub fn peers(&self) -> impl Iterator<Item=(PeerId, &ConnectionRecord)> {
        self.directory.iter()
    }

    pub fn peer(&self, peer: PeerId) -> Option<&ConnectionRecord> {
        self.directory.get(peer)
    }

    /// number of sent reliable messages that are not acknowledged yet
    pub fn pending_reliable_count(&self) -> usize {
        self.registry.len()
    }

    /// 0 is reserved for 'unreliable', so it is skipped on wrap-around
    pub(crate) fn next_reliable_id(&mut self) -> u16 {
        let result = self.next_reliable_id;
        self.next_reliable_id = match self.next_reliable_id.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        result
    }

    /// Starts a datagram to `destination`. Messages are added through the returned builder,
    ///  and the datagram goes out when [DatagramBuilder::send] is called.
    pub fn datagram(&mut self, destination: Destination) -> anyhow::Result<DatagramBuilder<'_>> {
        if let Some(reason) = self.ended {
            bail!("network session ended: {:?}", reason);
        }
        let target = self.resolve(destination)?;
        DatagramBuilder::with_meta(self, target)
    }

    /// Sends a datagram with a single message, returning the reliable id for a reliable message
    pub fn send_message<F>(&mut self, destination: Destination, message_type: u16, reliability: Reliability, body: F) -> anyhow::Result<Option<u16>>
    where F: FnOnce(&mut BytesMut)
    {
        let mut datagram = self.datagram(destination)?;
        let reliable_id = datagram.write_message(message_type, reliability, body)?;
        datagram.send()?;
        Ok(reliable_id)
    }

    /// Registers a peer that is reached through `relay_hop`, which forwards datagrams to
    ///  `real_address`.
    pub fn add_indirect_peer(&mut self, relay_hop: SocketAddr, real_address: SocketAddr, name: impl Into<String>) -> PeerId {
        let record = ConnectionRecord::indirect(relay_hop, real_address, name.into(), Instant::now());
        let (peer, replaced) = self.directory.add(record);
        if let Some((replaced_id, _)) = replaced {
            self.registry.forget_peer(replaced_id);
        }
        debug!("added indirect peer {:?}: {:?} via {:?}", peer, real_address, relay_hop);
        peer
    }

    /// Client: leaves the session gracefully. The engine ends with [EndReason::Left] once the
    ///  server acknowledged the LEAVE, or after the connection timeout.
    pub fn disconnect(&mut self, reason: LeaveReason) -> anyhow::Result<()> {
        let (server, phase) = match &self.role {
            EngineRole::Client(state) => (state.server, state.phase),
            EngineRole::Server => bail!("a server can not disconnect - close() it instead"),
        };
        if !matches!(phase, ClientPhase::Joining | ClientPhase::Connected) {
            bail!("can not disconnect in phase {:?}", phase);
        }

        let leave = LeaveMessage { reason };
        let reliable_id = self.send_message(Destination::Peer(server), MessageType::Leave.into(), Reliability::Reliable, |buf| leave.ser(buf))?;

        if let EngineRole::Client(state) = &mut self.role {
            state.phase = ClientPhase::Leaving;
            state.leave = reliable_id.map(|id| (id, Instant::now()));
        }
        info!("leaving session: {:?}", reason);
        Ok(())
    }

    /// Server: removes a peer, notifying it with an (unreliable) LEAVE. The application is
    ///  notified during the next `update()`.
    pub fn kick(&mut self, peer: PeerId, reason: LeaveReason) -> anyhow::Result<()> {
        if !self.is_server() {
            bail!("only a server can kick peers");
        }
        self.send_leave(peer, reason)?;

        let Some(record) = self.remove_peer(peer) else {
            bail!("kicking unknown peer {:?}", peer);
        };
        info!("kicked {:?} ({}): {:?}", peer, record.name(), reason);
        self.pending_events.push(PendingEvent::Kicked { peer, record, reason });
        Ok(())
    }

    /// Ends the engine, sending an unreliable LEAVE to all direct peers. The application gets
    ///  `on_network_closed()` during the next `update()`, which then returns
    ///  [NetworkError::Ended].
    pub fn close(&mut self) {
        if self.ended.is_some() {
            return;
        }

        let reason = if self.is_server() { LeaveReason::ServerShutdown } else { LeaveReason::Quit };
        let peers = self.directory.direct_peers().collect::<Vec<_>>();
        for peer in peers {
            if let Err(e) = self.send_leave(peer, reason) {
                debug!("error sending LEAVE to {:?}: {}", peer, e);
            }
        }

        info!("closing {:?}", self.name);
        self.mark_ended(EndReason::Closed);
        self.pending_events.push(PendingEvent::Closed(EndReason::Closed));
    }

    fn send_leave(&mut self, peer: PeerId, reason: LeaveReason) -> anyhow::Result<()> {
        let leave = LeaveMessage { reason };
        self.send_message(Destination::Peer(peer), MessageType::Leave.into(), Reliability::Unreliable, |buf| leave.ser(buf))?;
        Ok(())
    }

    fn remove_peer(&mut self, peer: PeerId) -> Option<ConnectionRecord> {
        let record = self.directory.remove(peer)?;
        self.registry.forget_peer(peer);
        Some(record)
    }

    fn mark_ended(&mut self, reason: EndReason) {
        self.ended = Some(reason);
        if let EngineRole::Client(state) = &mut self.role {
            state.phase = ClientPhase::Disconnected;
        }
    }

    fn end(&mut self, reason: EndReason, app: &mut dyn NetworkApplication) {
        if self.ended.is_some() {
            return;
        }
        info!("network session of {:?} ended: {:?}", self.name, reason);
        self.mark_ended(reason);
        app.on_network_closed(self, reason);
        self.release_resources();
    }

    fn release_resources(&mut self) {
        self.registry.clear();
        self.directory.clear();
    }

    fn ended_error(&self) -> Result<(), NetworkError> {
        match self.ended {
            Some(reason) => Err(NetworkError::ended(reason)),
            None => Ok(()),
        }
    }

    /// Waits until a datagram arrives or the poll timeout expires, whichever comes first, and
    ///  then does an [Engine::update].
    pub async fn poll(&mut self, app: &mut dyn NetworkApplication) -> Result<(), NetworkError> {
        if self.ended.is_none() && self.pending_events.is_empty() {
            if let Ok(Err(e)) = tokio::time::timeout(self.metrics.poll_timeout, self.socket.readable()).await {
                return Err(NetworkError::Socket(e));
            }
        }
        self.update(app)
    }

    /// Processes all datagrams that arrived since the last call, and does the timer work.
    ///
    /// Returns [NetworkError::Ended] once the session is over. That is terminal: every
    ///  subsequent call returns the same error.
    pub fn update(&mut self, app: &mut dyn NetworkApplication) -> Result<(), NetworkError> {
        self.deliver_pending_events(app);
        self.ended_error()?;

        self.receive_all(app);
        self.ended_error()?;

        self.on_tick(app);
        self.ended_error()
    }

    fn deliver_pending_events(&mut self, app: &mut dyn NetworkApplication) {
        for event in std::mem::take(&mut self.pending_events) {
            match event {
                PendingEvent::Kicked { peer, record, reason } => {
                    app.on_network_client_disconnected(self, peer, &record, reason);
                }
                PendingEvent::Closed(reason) => {
                    app.on_network_closed(self, reason);
                    self.release_resources();
                }
            }
        }
    }

    fn receive_all(&mut self, app: &mut dyn NetworkApplication) {
        loop {
            let (len, from) = match self.socket.try_recv_datagram(&mut self.recv_buf) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(e) => {
                    warn!("error receiving datagram: {}", e);
                    break;
                }
            };

            if len > self.metrics.max_datagram_size {
                warn!("dropping datagram from {:?}: exceeds the maximum size of {} bytes", from, self.metrics.max_datagram_size);
                continue;
            }

            let data = Bytes::copy_from_slice(&self.recv_buf[..len]);
            self.on_datagram(data, from, app);

            if self.ended.is_some() {
                break;
            }
        }
    }

    fn on_datagram(&mut self, data: Bytes, from: SocketAddr, app: &mut dyn NetworkApplication) {
        let span = trace_span!("datagram", ?from, len = data.len());
        let _entered = span.enter();

        let mut acks = Vec::new();
        for frame in FrameReader::new(data.clone()) {
            match frame {
                Ok(frame) => self.on_frame(&data, &frame, from, &mut acks, app),
                Err(e) => {
                    debug!("dropping rest of datagram from {:?}: {:#}", from, e);
                    break;
                }
            }
            if self.ended.is_some() {
                break;
            }
        }
        self.current_source = None;

        if !acks.is_empty() && self.ended.is_none() {
            if let Err(e) = self.send_acks(from, &acks) {
                warn!("error acknowledging reliable messages from {:?}: {}", from, e);
            }
        }
    }

    fn send_acks(&mut self, to: SocketAddr, reliable_ids: &[u16]) -> anyhow::Result<()> {
        let mut datagram = self.datagram(Destination::Address(to))?;
        for &reliable_id in reliable_ids {
            datagram.write_message(MessageType::ConfirmPacket.into(), Reliability::Unreliable, |buf| ConfirmPacketMessage { reliable_id }.ser(buf))?;
        }
        datagram.send()
    }

    fn on_frame(&mut self, data: &Bytes, frame: &Frame, from: SocketAddr, acks: &mut Vec<u16>, app: &mut dyn NetworkApplication) {
        let now = Instant::now();
        let header = frame.header;
        let kind = header.kind();

        let (sender, newly_joined) = match self.directory.find(from, Address::UNSET) {
            Some(peer) => (peer, false),
            None if self.is_server() && kind == Some(MessageType::Join) && header.directed_here => {
                let (peer, _) = self.directory.add(ConnectionRecord::direct(from, String::new(), now));
                (peer, true)
            }
            None => {
                debug!("dropping message of type 0x{:04x} from unknown sender {:?}", header.message_type, from);
                return;
            }
        };
        self.current_source = Some(ReplyTarget { addr: from, peer: sender });

        if let Some(record) = self.directory.get_mut(sender) {
            record.touch(now);

            if let Some(reliable_id) = frame.footer.reliable_id {
                acks.push(reliable_id);
                if !record.confirm(reliable_id, now) {
                    trace!(reliable_id, "duplicate reliable message from {:?} - skipping", sender);
                    return;
                }
            }
        }

        if !header.directed_here {
            self.relay(frame);
            return;
        }

        match kind {
            Some(MessageType::Join) => self.on_join(frame, sender, newly_joined, app),
            Some(MessageType::Leave) => self.on_leave(frame, sender, app),
            Some(MessageType::Ping) => self.on_ping(sender),
            Some(MessageType::Pong) => {
                if let Some(record) = self.directory.get_mut(sender) {
                    record.on_pong(now);
                }
            }
            Some(MessageType::ConfirmPacket) => self.on_confirm_packet(frame, from),
            Some(MessageType::Meta) => self.on_meta(data, frame, sender),
            None if is_application_message_type(header.message_type) => {
                let ctx = MessageContext {
                    sender_addr: from,
                    sender,
                    header,
                    footer: frame.footer,
                };
                let mut body: &[u8] = &frame.body;
                if !app.parse_application_message(self, &ctx, &mut body) {
                    debug!("application did not handle message of type 0x{:04x} from {:?}", header.message_type, sender);
                }
                else if !body.is_empty() {
                    warn!("message of type 0x{:04x} from {:?} was parsed incompletely: {} of {} bytes remaining - skipping to the end",
                        header.message_type, sender, body.len(), header.packet_size);
                }
            }
            None => {
                debug!("unknown protocol message type 0x{:04x} from {:?} - skipping", header.message_type, sender);
            }
        }
    }

    fn on_join(&mut self, frame: &Frame, sender: PeerId, newly_joined: bool, app: &mut dyn NetworkApplication) {
        let join = match parse_body(frame, |buf| JoinMessage::deser(buf)) {
            Ok(join) => join,
            Err(e) => {
                debug!("invalid JOIN from {:?}: {}", sender, e);
                if newly_joined {
                    self.directory.remove(sender);
                }
                return;
            }
        };

        if self.is_server() {
            let sender = if newly_joined {
                sender
            }
            else {
                self.rejoin(frame, sender, app)
            };
            if let Some(record) = self.directory.get_mut(sender) {
                record.set_name(join.name);
            }

            let confirmation = JoinMessage { name: self.name.clone() };
            if let Err(e) = self.send_message(Destination::Peer(sender), MessageType::Join.into(), Reliability::Reliable, |buf| confirmation.ser(buf)) {
                warn!("error confirming JOIN of {:?}: {}", sender, e);
            }

            info!("{:?} joined from {:?}", sender, self.current_source.map(|s| s.addr));
            app.on_network_client_connected(self, sender);
            return;
        }

        let EngineRole::Client(state) = &mut self.role else {
            return;
        };
        if sender != state.server {
            debug!("JOIN from {:?}, which is not the server - ignoring", sender);
            return;
        }
        if state.phase != ClientPhase::Joining {
            trace!("JOIN confirmation in phase {:?} - ignoring", state.phase);
            return;
        }
        state.phase = ClientPhase::Connected;

        if let Some(record) = self.directory.get_mut(sender) {
            record.set_name(join.name);
        }
        info!("connected to server");
        app.on_network_connected(self);
    }

    /// A JOIN that is not a retransmission, from an address that already has a session: the
    ///  client restarted. The old session ends, and the JOIN opens a new one with a fresh record.
    fn rejoin(&mut self, frame: &Frame, old_peer: PeerId, app: &mut dyn NetworkApplication) -> PeerId {
        let now = Instant::now();
        let Some(remote_address) = self.directory.get(old_peer).map(|r| r.remote_address()) else {
            return old_peer;
        };

        let mut record = ConnectionRecord::direct(remote_address, String::new(), now);
        if let Some(reliable_id) = frame.footer.reliable_id {
            record.confirm(reliable_id, now);
        }
        let (peer, replaced) = self.directory.add(record);
        self.current_source = Some(ReplyTarget { addr: remote_address, peer });

        if let Some((replaced_id, replaced_record)) = replaced {
            self.registry.forget_peer(replaced_id);
            info!("{:?} ({}) re-joined from {:?} as {:?}", replaced_id, replaced_record.name(), remote_address, peer);
            app.on_network_client_disconnected(self, replaced_id, &replaced_record, LeaveReason::Unspecified);
        }
        peer
    }

    fn on_leave(&mut self, frame: &Frame, sender: PeerId, app: &mut dyn NetworkApplication) {
        let reason = match parse_body(frame, |buf| LeaveMessage::deser(buf)) {
            Ok(leave) => leave.reason,
            Err(e) => {
                debug!("invalid LEAVE from {:?}, treating as unspecified: {}", sender, e);
                LeaveReason::Unspecified
            }
        };

        match self.server_peer() {
            Some(server) if server == sender => {
                self.end(EndReason::ServerClosed(reason), app);
            }
            Some(_) => {
                debug!("LEAVE from {:?}, which is not the server - ignoring", sender);
            }
            None => {
                if let Some(record) = self.remove_peer(sender) {
                    info!("{:?} ({}) left: {:?}", sender, record.name(), reason);
                    app.on_network_client_disconnected(self, sender, &record, reason);
                }
            }
        }
    }

    fn on_ping(&mut self, sender: PeerId) {
        if let Err(e) = self.send_message(Destination::Peer(sender), MessageType::Pong.into(), Reliability::Unreliable, |_| {}) {
            debug!("error answering PING from {:?}: {}", sender, e);
        }
    }

    fn on_confirm_packet(&mut self, frame: &Frame, from: SocketAddr) {
        let reliable_id = match parse_body(frame, |buf| ConfirmPacketMessage::deser(buf)) {
            Ok(confirm) => confirm.reliable_id,
            Err(e) => {
                debug!("invalid CONFIRM_PACKET from {:?}: {}", from, e);
                return;
            }
        };

        let directory = &self.directory;
        self.registry.on_confirm(reliable_id, from, |peer| {
            directory.get(peer)
                .map(|r| r.remote_address() == from)
                .unwrap_or(false)
        });
    }

    fn on_tick(&mut self, app: &mut dyn NetworkApplication) {
        let now = Instant::now();

        for resend in self.registry.on_tick(now, &self.metrics) {
            self.resend(resend);
        }

        self.check_liveness(now, app);
        if self.ended.is_some() {
            return;
        }

        self.send_pings(now);

        let retention = self.metrics.dedup_retention();
        for (_, record) in self.directory.iter_mut() {
            record.prune_confirmed(now, retention);
        }

        self.check_leave_complete(now, app);
    }

    fn resend(&mut self, resend: Resend) {
        match &resend.target {
            PacketTarget::Address(addr) => self.send_raw(*addr, &resend.data),
            PacketTarget::Peers(peers) => {
                for &peer in peers {
                    if let Some(record) = self.directory.get(peer) {
                        self.send_raw(record.remote_address(), &resend.data);
                    }
                }
            }
        }
    }

    fn check_liveness(&mut self, now: Instant, app: &mut dyn NetworkApplication) {
        let timeout = self.metrics.connection_timeout;

        if let Some(server) = self.server_peer() {
            let timed_out = self.directory.get(server)
                .map(|r| r.is_timed_out(now, timeout))
                .unwrap_or(true);
            if timed_out {
                warn!("no traffic from the server for more than {:?}", timeout);
                self.end(EndReason::TimedOut, app);
            }
            return;
        }

        let timed_out = self.directory.iter()
            .filter(|(_, r)| !r.is_indirect() && r.is_timed_out(now, timeout))
            .map(|(peer, _)| peer)
            .collect::<Vec<_>>();

        for peer in timed_out {
            if let Err(e) = self.send_leave(peer, LeaveReason::TimedOut) {
                debug!("error sending LEAVE to timed out peer {:?}: {}", peer, e);
            }
            if let Some(record) = self.remove_peer(peer) {
                info!("{:?} ({}) timed out", peer, record.name());
                app.on_network_client_timed_out(self, peer, &record);
            }
        }
    }

    fn send_pings(&mut self, now: Instant) {
        let ping_interval = self.metrics.ping_interval;
        let due = match &self.role {
            EngineRole::Client(state) if state.phase != ClientPhase::Connected => return,
            EngineRole::Client(state) => vec![state.server],
            EngineRole::Server => self.directory.iter()
                .filter(|(_, r)| !r.is_indirect())
                .map(|(peer, _)| peer)
                .collect(),
        };

        for peer in due {
            if !self.directory.get(peer).map(|r| r.is_ping_due(now, ping_interval)).unwrap_or(false) {
                continue;
            }
            match self.send_message(Destination::Peer(peer), MessageType::Ping.into(), Reliability::Reliable, |_| {}) {
                Ok(_) => {
                    if let Some(record) = self.directory.get_mut(peer) {
                        record.on_ping_sent(now);
                    }
                }
                Err(e) => debug!("error pinging {:?}: {}", peer, e),
            }
        }
    }

    fn check_leave_complete(&mut self, now: Instant, app: &mut dyn NetworkApplication) {
        let EngineRole::Client(state) = &self.role else {
            return;
        };
        if state.phase != ClientPhase::Leaving {
            return;
        }

        let is_complete = match state.leave {
            Some((reliable_id, sent)) => {
                !self.registry.contains(reliable_id)
                    || now.saturating_duration_since(sent) >= self.metrics.connection_timeout
            }
            None => true,
        };
        if is_complete {
            self.end(EndReason::Left, app);
        }
    }

    /// Sends a finished datagram, registering its reliable messages for retransmission
    fn flush_datagram(&mut self, target: ResolvedTarget, writer: DatagramWriter, prefix_len: usize, reliable_frames: Vec<ReliableFrame>) -> anyhow::Result<()> {
        if writer.len() == prefix_len {
            return Ok(());
        }
        if writer.len() > self.metrics.max_datagram_size {
            bail!("datagram of {} bytes exceeds the maximum size of {} bytes", writer.len(), self.metrics.max_datagram_size);
        }

        let data = writer.freeze();
        let now = Instant::now();
        for reliable in reliable_frames {
            let packet_data = if prefix_len == 0 {
                data.slice(reliable.start..reliable.end)
            }
            else {
                let mut buf = BytesMut::with_capacity(prefix_len + reliable.end - reliable.start);
                buf.put_slice(&data[..prefix_len]);
                buf.put_slice(&data[reliable.start..reliable.end]);
                buf.freeze()
            };

            self.registry.register(OutboundPacket {
                reliable_id: reliable.reliable_id,
                data: packet_data,
                target: target.packet_target.clone(),
                first_sent: now,
                last_sent: now,
            });
        }

        for &addr in &target.addresses {
            self.send_raw(addr, &data);
        }
        Ok(())
    }

    /// UDP is lossy anyway, so send errors are logged rather than propagated
    fn send_raw(&self, to: SocketAddr, data: &[u8]) {
        if to == self.local_addr {
            warn!("not sending datagram to this node's own address {:?}", to);
            return;
        }
        if let Err(e) = self.socket.send_datagram(to, data) {
            warn!("error sending datagram to {:?}: {}", to, e);
        }
    }
}

/// Parses a protocol message's body. Bytes the parser leaves over are logged and skipped, the
///  same as for application messages.
pub(crate) fn parse_body<T>(frame: &Frame, parse: impl FnOnce(&mut &[u8]) -> anyhow::Result<T>) -> anyhow::Result<T> {
    let mut body: &[u8] = &frame.body;
    let result = parse(&mut body)?;
    if !body.is_empty() {
        warn!("message of type 0x{:04x} was parsed incompletely: {} of {} bytes remaining - skipping to the end",
            frame.header.message_type, body.len(), frame.header.packet_size);
    }
    Ok(result)
}

#[derive(Debug, Clone, Copy)]
struct ReliableFrame {
    reliable_id: u16,
    start: usize,
    end: usize,
}

/// A datagram being written. Each message is written in two passes: `begin_message()` reserves
///  the header, the body is written through `body()`, and `finish_message()` or
///  `finish_reliable_message()` completes it.
///
/// Nothing is sent before [DatagramBuilder::send]; dropping the builder discards the datagram.
pub struct DatagramBuilder<'a> {
    engine: &'a mut Engine,
    target: ResolvedTarget,
    writer: DatagramWriter,
    prefix_len: usize,
    reliable_frames: Vec<ReliableFrame>,
}

impl<'a> DatagramBuilder<'a> {
    pub(crate) fn new(engine: &'a mut Engine, target: ResolvedTarget) -> DatagramBuilder<'a> {
        let writer = DatagramWriter::with_capacity(engine.metrics.max_datagram_size);
        DatagramBuilder {
            engine,
            target,
            writer,
            prefix_len: 0,
            reliable_frames: Vec::new(),
        }
    }

    /// starts the datagram with a META envelope if the target requires symbolic routing
    fn with_meta(engine: &'a mut Engine, target: ResolvedTarget) -> anyhow::Result<DatagramBuilder<'a>> {
        let meta = target.meta;
        let mut result = DatagramBuilder::new(engine, target);
        if let Some(destination) = meta {
            let info = result.writer.begin_message(MessageType::Meta.into());
            MetaMessage { destination }.ser(result.writer.body());
            result.writer.finish_message(info, Address::UNSET)?;
            result.prefix_len = result.writer.len();
        }
        Ok(result)
    }

    pub fn begin_message(&mut self, message_type: u16) -> HeaderInfo {
        self.writer.begin_message(message_type)
    }

    pub fn body(&mut self) -> &mut BytesMut {
        self.writer.body()
    }

    pub fn finish_message(&mut self, info: HeaderInfo) -> anyhow::Result<()> {
        self.writer.finish_message(info, self.target.forward_address)
    }

    /// Finishes a reliable message, using `reliable_id` if provided and allocating the next id
    ///  otherwise. Returns the message's reliable id.
    pub fn finish_reliable_message(&mut self, info: HeaderInfo, reliable_id: Option<u16>) -> anyhow::Result<u16> {
        let reliable_id = match reliable_id {
            Some(0) => bail!("0 is not a valid reliable id"),
            Some(id) => id,
            None => self.engine.next_reliable_id(),
        };

        let footer = MessageFooter::new(Some(reliable_id), self.target.forward_address, false);
        self.writer.finish_with_footer(info, &footer)?;
        self.reliable_frames.push(ReliableFrame {
            reliable_id,
            start: info.start(),
            end: self.writer.len(),
        });
        Ok(reliable_id)
    }

    /// one-pass convenience for a complete message
    pub fn write_message<F>(&mut self, message_type: u16, reliability: Reliability, body: F) -> anyhow::Result<Option<u16>>
    where F: FnOnce(&mut BytesMut)
    {
        let info = self.begin_message(message_type);
        body(self.body());
        match reliability {
            Reliability::Unreliable => {
                self.finish_message(info)?;
                Ok(None)
            }
            Reliability::Reliable => Ok(Some(self.finish_reliable_message(info, None)?)),
        }
    }

    pub fn len(&self) -> usize {
        self.writer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writer.len() == self.prefix_len
    }

    pub fn send(self) -> anyhow::Result<()> {
        let DatagramBuilder { engine, target, writer, prefix_len, reliable_frames } = self;
        engine.flush_datagram(target, writer, prefix_len, reliable_frames)
    }
}
