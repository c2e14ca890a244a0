use std::time::Duration;
use anyhow::bail;

/// Timing policy and size limits of an [crate::engine::Engine]. All intervals are measured
///  against the engine's clock (`tokio::time::Instant`) at the time `update()` runs, so their
///  effective resolution is the host application's tick rate.
#[derive(Debug, Clone)]
pub struct NetworkMetrics {
    /// Upper bound for how long `Engine::poll()` waits for an incoming datagram before running
    ///  the tick's timer work anyway.
    pub poll_timeout: Duration,

    /// A peer that has not sent any valid traffic for this long is considered dead. On the
    ///  server, it is force-disconnected; on the client, the session ends.
    pub connection_timeout: Duration,

    /// Minimum time between two sends of an unacknowledged reliable message.
    pub reliable_resend: Duration,

    /// Age after which an unacknowledged reliable message is dropped from the outbound registry.
    ///
    /// NB: Receivers keep the ids of processed reliable messages for at least this long (plus
    ///  one resend interval) to reject retransmissions, so this must be the same on all nodes
    ///  of a session.
    pub reliable_give_up: Duration,

    /// Minimum time between two liveness pings to the same peer.
    pub ping_interval: Duration,

    /// This is the payload size inside UDP packets that is assumed to go through unfragmented.
    ///
    /// With full Ethernet frames and no optional IP headers, this payload is `1500 - 20 - 8 = 1472`
    ///  for IPV4. Datagrams exceeding this are rejected when sent and dropped when received.
    pub max_datagram_size: usize,
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        NetworkMetrics {
            poll_timeout: Duration::from_millis(5),
            connection_timeout: Duration::from_secs(10),
            reliable_resend: Duration::from_millis(200),
            reliable_give_up: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
            max_datagram_size: 1472,
        }
    }
}

impl NetworkMetrics {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reliable_resend.is_zero() {
            bail!("reliable resend interval must be positive");
        }
        if self.reliable_give_up <= self.reliable_resend {
            bail!("reliable give-up interval ({:?}) must exceed the resend interval ({:?})", self.reliable_give_up, self.reliable_resend);
        }
        if self.connection_timeout <= self.ping_interval {
            bail!("connection timeout ({:?}) must exceed the ping interval ({:?})", self.connection_timeout, self.ping_interval);
        }
        if self.max_datagram_size < 64 {
            bail!("max datagram size is too small");
        }
        if self.max_datagram_size > u16::MAX as usize {
            bail!("max datagram size {} exceeds what UDP can carry", self.max_datagram_size);
        }
        Ok(())
    }

    /// How long a receiver must remember a processed reliable id: after this, the sender has
    ///  given up on the message and will not retransmit it.
    pub fn dedup_retention(&self) -> Duration {
        self.reliable_give_up + self.reliable_resend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        NetworkMetrics::default().validate().unwrap();
    }

    #[rstest]
    #[case::zero_resend(0, 5000, 10_000, 1000, 1472)]
    #[case::give_up_below_resend(200, 200, 10_000, 1000, 1472)]
    #[case::timeout_below_ping(200, 5000, 1000, 1000, 1472)]
    #[case::tiny_datagram(200, 5000, 10_000, 1000, 10)]
    #[case::huge_datagram(200, 5000, 10_000, 1000, 70_000)]
    fn test_validate_rejects(#[case] resend: u64, #[case] give_up: u64, #[case] timeout: u64, #[case] ping: u64, #[case] max_datagram_size: usize) {
        let metrics = NetworkMetrics {
            poll_timeout: Duration::from_millis(5),
            connection_timeout: Duration::from_millis(timeout),
            reliable_resend: Duration::from_millis(resend),
            reliable_give_up: Duration::from_millis(give_up),
            ping_interval: Duration::from_millis(ping),
            max_datagram_size,
        };
        assert!(metrics.validate().is_err());
    }

    #[test]
    fn test_dedup_retention() {
        let metrics = NetworkMetrics::default();
        assert_eq!(metrics.dedup_retention(), Duration::from_millis(5200));
    }
}
