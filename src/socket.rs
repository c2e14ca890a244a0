use std::io::ErrorKind;
use std::net::SocketAddr;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

/// The datagram primitive the engine runs on. Sending and receiving never block: the engine is
///  driven by the host's tick, and only [DatagramSocket::readable] may wait.
///
/// This is an abstraction to facilitate mocking the I/O part away for testing, and for running
///  several engines against an in-memory network.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddr;

    /// Hands a datagram to the OS. Datagrams that can not be sent right away are lost, just as
    ///  they could be lost in flight.
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()>;

    /// returns `None` if there is no datagram waiting
    fn try_recv_datagram(&self, buf: &mut [u8]) -> anyhow::Result<Option<(usize, SocketAddr)>>;

    /// waits until there is (probably) a datagram to receive
    async fn readable(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    fn local_addr(&self) -> SocketAddr {
        match UdpSocket::local_addr(self) {
            Ok(addr) => addr,
            // a bound UdpSocket always has a local address
            Err(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }

    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending datagram of {} bytes to {:?}", datagram.len(), to);

        match self.try_send_to(datagram, to) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                trace!("UDP socket: send buffer full, dropping datagram to {:?}", to);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_recv_datagram(&self, buf: &mut [u8]) -> anyhow::Result<Option<(usize, SocketAddr)>> {
        match self.try_recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, from))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn readable(&self) -> anyhow::Result<()> {
        UdpSocket::readable(self).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_socket_round_trip() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = DatagramSocket::local_addr(&a);
        let b_addr = DatagramSocket::local_addr(&b);

        let mut buf = [0u8; 16];
        assert!(b.try_recv_datagram(&mut buf).unwrap().is_none());

        a.send_datagram(b_addr, &[1, 2, 3]).unwrap();
        DatagramSocket::readable(&b).await.unwrap();

        let mut received = None;
        for _ in 0..100 {
            received = b.try_recv_datagram(&mut buf).unwrap();
            if received.is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(received, Some((3, a_addr)));
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }
}
