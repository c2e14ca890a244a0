use std::collections::VecDeque;
use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::time::Duration;
use rustc_hash::FxHashSet;
use tokio::time::Instant;
use tracing::trace;

use crate::address::Address;

/// Handle for a peer in an engine's directory. Handles are never reused: once a peer is
///  removed, its handle stays invalid even if the same remote node joins again.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerId(pub(crate) u32);

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Everything a node knows about one of its peers: where to send to, liveness and ping state,
///  and which reliable messages were already processed.
#[derive(Debug)]
pub struct ConnectionRecord {
    remote_address: SocketAddr,
    relay_target: Option<SocketAddr>,
    name: String,

    connection_snapshot: Instant,
    ping_in_flight: bool,
    last_ping_sent: Option<Instant>,
    ping_sent_at: Option<Instant>,
    last_ping: Option<Duration>,

    /// in order of receipt, for pruning
    confirmed_packets: VecDeque<(u16, Instant)>,
    confirmed_lookup: FxHashSet<u16>,
}

impl ConnectionRecord {
    pub fn direct(remote_address: SocketAddr, name: String, now: Instant) -> ConnectionRecord {
        ConnectionRecord::new(remote_address, None, name, now)
    }

    /// A peer that is reached through `relay_hop`: datagrams go to the hop, carrying
    ///  `real_address` as their forward address.
    pub fn indirect(relay_hop: SocketAddr, real_address: SocketAddr, name: String, now: Instant) -> ConnectionRecord {
        ConnectionRecord::new(relay_hop, Some(real_address), name, now)
    }

    fn new(remote_address: SocketAddr, relay_target: Option<SocketAddr>, name: String, now: Instant) -> ConnectionRecord {
        ConnectionRecord {
            remote_address,
            relay_target,
            name,
            connection_snapshot: now,
            ping_in_flight: false,
            last_ping_sent: None,
            ping_sent_at: None,
            last_ping: None,
            confirmed_packets: Default::default(),
            confirmed_lookup: Default::default(),
        }
    }

    /// the address datagrams are sent to, i.e. the relay hop for indirect peers
    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    /// the address written into footers as forward address: the real address of an indirect
    ///  peer, unset for a direct peer
    pub fn vaddr(&self) -> Address {
        match self.relay_target {
            Some(addr) => Address::new(addr),
            None => Address::UNSET,
        }
    }

    pub fn is_indirect(&self) -> bool {
        self.relay_target.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    /// round trip time of the most recent ping that was answered
    pub fn last_ping(&self) -> Option<Duration> {
        self.last_ping
    }

    pub fn is_ping_in_flight(&self) -> bool {
        self.ping_in_flight
    }

    /// registers valid traffic from the peer
    pub fn touch(&mut self, now: Instant) {
        self.connection_snapshot = now;
        self.ping_in_flight = false;
    }

    pub fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.connection_snapshot)
    }

    pub fn is_timed_out(&self, now: Instant, connection_timeout: Duration) -> bool {
        self.idle_time(now) > connection_timeout
    }

    pub fn is_ping_due(&self, now: Instant, ping_interval: Duration) -> bool {
        if self.ping_in_flight {
            return false;
        }
        match self.last_ping_sent {
            None => true,
            Some(sent) => now.saturating_duration_since(sent) >= ping_interval,
        }
    }

    pub fn on_ping_sent(&mut self, now: Instant) {
        self.ping_in_flight = true;
        self.last_ping_sent = Some(now);
        self.ping_sent_at = Some(now);
    }

    pub fn on_pong(&mut self, now: Instant) {
        if let Some(sent) = self.ping_sent_at.take() {
            let rtt = now.saturating_duration_since(sent);
            trace!("ping round trip to {:?}: {:?}", self.remote_address, rtt);
            self.last_ping = Some(rtt);
        }
        self.ping_in_flight = false;
    }

    pub fn is_confirmed(&self, reliable_id: u16) -> bool {
        self.confirmed_lookup.contains(&reliable_id)
    }

    /// Remembers a reliable id as processed. Returns `false` if it was processed before, i.e.
    ///  the message is a duplicate.
    pub fn confirm(&mut self, reliable_id: u16, now: Instant) -> bool {
        if !self.confirmed_lookup.insert(reliable_id) {
            return false;
        }
        self.confirmed_packets.push_back((reliable_id, now));
        true
    }

    /// Forgets reliable ids that were received more than `retention` ago: the sender has
    ///  stopped retransmitting them, and the ids may be reused after wrap-around.
    pub fn prune_confirmed(&mut self, now: Instant, retention: Duration) {
        while let Some(&(reliable_id, received)) = self.confirmed_packets.front() {
            if now.saturating_duration_since(received) < retention {
                break;
            }
            self.confirmed_packets.pop_front();
            self.confirmed_lookup.remove(&reliable_id);
        }
    }

    pub fn num_confirmed(&self) -> usize {
        self.confirmed_packets.len()
    }
}
