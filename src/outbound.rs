use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::NetworkMetrics;
use crate::connection::PeerId;

/// Who is expected to acknowledge an in-flight reliable message
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PacketTarget {
    /// a literal address, e.g. for messages to nodes without a connection record
    Address(SocketAddr),
    /// the peers that did not acknowledge yet
    Peers(BTreeSet<PeerId>),
}

#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub reliable_id: u16,
    /// the exact bytes that were sent, resent verbatim
    pub data: Bytes,
    pub target: PacketTarget,
    pub first_sent: Instant,
    pub last_sent: Instant,
}

/// A packet that is due for retransmission, see [OutboundRegistry::on_tick]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Resend {
    pub reliable_id: u16,
    pub data: Bytes,
    pub target: PacketTarget,
}

/// The reliable messages this node sent that were not acknowledged yet, keyed by reliable id.
#[derive(Debug, Default)]
pub struct OutboundRegistry {
    packets: BTreeMap<u16, OutboundPacket>,
}

impl OutboundRegistry {
    pub fn new() -> OutboundRegistry {
        OutboundRegistry::default()
    }

    pub fn register(&mut self, packet: OutboundPacket) {
        if let PacketTarget::Peers(peers) = &packet.target {
            if peers.is_empty() {
                trace!("reliable packet #{} has no recipients - not registering", packet.reliable_id);
                return;
            }
        }

        if let Some(prev) = self.packets.insert(packet.reliable_id, packet) {
            warn!("reliable id #{} was reused while the previous packet was still in flight - replacing it", prev.reliable_id);
        }
    }

    /// Handles an acknowledgement for `reliable_id` that arrived from `from`. `is_from` tells
    ///  whether a waiting peer is the one that sent the acknowledgement. Returns `true` if the
    ///  packet was retired by this acknowledgement.
    pub fn on_confirm(&mut self, reliable_id: u16, from: SocketAddr, is_from: impl Fn(PeerId) -> bool) -> bool {
        let Some(packet) = self.packets.get_mut(&reliable_id) else {
            trace!("acknowledgement for reliable packet #{} that is not (or no longer) in flight", reliable_id);
            return false;
        };

        let is_done = match &mut packet.target {
            PacketTarget::Address(addr) => {
                if *addr != from {
                    debug!("acknowledgement for reliable packet #{} from {:?}, expected {:?} - ignoring", reliable_id, from, addr);
                    return false;
                }
                true
            }
            PacketTarget::Peers(peers) => {
                peers.retain(|&p| !is_from(p));
                peers.is_empty()
            }
        };

        if is_done {
            trace!("reliable packet #{} acknowledged by all recipients", reliable_id);
            self.packets.remove(&reliable_id);
        }
        is_done
    }

    /// Removes a peer from all waiting sets, dropping packets that were waiting for that peer
    ///  only
    pub fn forget_peer(&mut self, peer: PeerId) {
        self.packets.retain(|reliable_id, packet| {
            match &mut packet.target {
                PacketTarget::Address(_) => true,
                PacketTarget::Peers(peers) => {
                    if peers.remove(&peer) && peers.is_empty() {
                        debug!("dropping reliable packet #{}: its only remaining recipient {:?} is gone", reliable_id, peer);
                        false
                    }
                    else {
                        true
                    }
                }
            }
        });
    }

    /// Drops packets that reached the give-up age and returns the packets that are due for
    ///  retransmission, marking them as resent at `now`.
    pub fn on_tick(&mut self, now: Instant, metrics: &NetworkMetrics) -> Vec<Resend> {
        self.packets.retain(|reliable_id, packet| {
            if now.saturating_duration_since(packet.first_sent) >= metrics.reliable_give_up {
                debug!("giving up on reliable packet #{} to {:?}", reliable_id, packet.target);
                false
            }
            else {
                true
            }
        });

        let mut result = Vec::new();
        for packet in self.packets.values_mut() {
            if now.saturating_duration_since(packet.last_sent) >= metrics.reliable_resend {
                trace!("resending reliable packet #{} to {:?}", packet.reliable_id, packet.target);
                packet.last_sent = now;
                result.push(Resend {
                    reliable_id: packet.reliable_id,
                    data: packet.data.clone(),
                    target: packet.target.clone(),
                });
            }
        }
        result
    }

    pub fn contains(&self, reliable_id: u16) -> bool {
        self.packets.contains_key(&reliable_id)
    }

    pub fn get(&self, reliable_id: u16) -> Option<&OutboundPacket> {
        self.packets.get(&reliable_id)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn peers(ids: &[u32]) -> PacketTarget {
        PacketTarget::Peers(ids.iter().map(|&id| PeerId(id)).collect())
    }

    fn packet(reliable_id: u16, target: PacketTarget) -> OutboundPacket {
        let now = Instant::now();
        OutboundPacket {
            reliable_id,
            data: Bytes::from(vec![reliable_id as u8; 3]),
            target,
            first_sent: now,
            last_sent: now,
        }
    }

    fn metrics() -> NetworkMetrics {
        NetworkMetrics {
            reliable_resend: Duration::from_millis(200),
            reliable_give_up: Duration::from_millis(1000),
            ..NetworkMetrics::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_and_give_up() {
        let metrics = metrics();
        let mut registry = OutboundRegistry::new();
        registry.register(packet(7, PacketTarget::Address(addr("1.2.3.4:5"))));

        let mut resend_times = Vec::new();
        let start = Instant::now();
        for _ in 0..150 {
            tokio::time::advance(Duration::from_millis(10)).await;
            for resend in registry.on_tick(Instant::now(), &metrics) {
                assert_eq!(resend.reliable_id, 7);
                assert_eq!(resend.data.as_ref(), &[7, 7, 7]);
                resend_times.push(Instant::now() - start);
            }
        }

        assert!(registry.is_empty());
        assert_eq!(resend_times, vec![
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(600),
            Duration::from_millis(800),
        ]);
    }

    #[rstest]
    #[case::in_order(vec![1, 2, 3])]
    #[case::reverse(vec![3, 2, 1])]
    #[case::mixed(vec![2, 3, 1])]
    #[case::with_duplicate(vec![2, 2, 3, 1])]
    #[tokio::test(start_paused = true)]
    async fn test_broadcast_convergence(#[case] ack_order: Vec<u32>) {
        let metrics = metrics();
        let mut registry = OutboundRegistry::new();
        registry.register(packet(1, peers(&[1, 2, 3])));

        let mut acked = BTreeSet::new();
        for (idx, &acker) in ack_order.iter().enumerate() {
            let retired = registry.on_confirm(1, addr("1.1.1.1:1"), |p| p == PeerId(acker));
            acked.insert(acker);

            let is_last = idx == ack_order.len() - 1;
            assert_eq!(retired, is_last);
            assert_eq!(registry.contains(1), !is_last);

            if !is_last {
                tokio::time::advance(metrics.reliable_resend).await;
                let resends = registry.on_tick(Instant::now(), &metrics);
                assert_eq!(resends.len(), 1);
                let expected = [1, 2, 3].into_iter()
                    .filter(|id| !acked.contains(id))
                    .map(PeerId)
                    .collect::<BTreeSet<_>>();
                assert_eq!(resends[0].target, PacketTarget::Peers(expected));
            }
        }
        assert!(registry.is_empty());
    }

    #[rstest]
    #[case::matching(addr("1.2.3.4:5"), true)]
    #[case::other_address(addr("1.2.3.4:6"), false)]
    fn test_confirm_address_target(#[case] from: SocketAddr, #[case] expected: bool) {
        let mut registry = OutboundRegistry::new();
        registry.register(packet(3, PacketTarget::Address(addr("1.2.3.4:5"))));

        assert_eq!(registry.on_confirm(3, from, |_| true), expected);
        assert_eq!(registry.contains(3), !expected);
        assert!(!registry.on_confirm(99, from, |_| true));
    }

    #[test]
    fn test_forget_peer() {
        let mut registry = OutboundRegistry::new();
        registry.register(packet(1, peers(&[1])));
        registry.register(packet(2, peers(&[1, 2])));
        registry.register(packet(3, peers(&[2])));
        registry.register(packet(4, PacketTarget::Address(addr("1.2.3.4:5"))));

        registry.forget_peer(PeerId(1));

        assert!(!registry.contains(1));
        assert_eq!(registry.get(2).unwrap().target, peers(&[2]));
        assert!(registry.contains(3));
        assert!(registry.contains(4));
    }

    #[test]
    fn test_register_without_recipients() {
        let mut registry = OutboundRegistry::new();
        registry.register(packet(1, peers(&[])));
        assert!(registry.is_empty());
    }
}
