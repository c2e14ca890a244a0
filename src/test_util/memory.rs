use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::trace;

use crate::socket::DatagramSocket;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicking test thread must not take down the other nodes' sockets
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct Inbox {
    queue: Mutex<VecDeque<(Bytes, SocketAddr)>>,
    notify: Notify,
}

struct NetworkState {
    inboxes: FxHashMap<SocketAddr, Arc<Inbox>>,
    loss_rate: f64,
    duplicate_rate: f64,
    rng: StdRng,
}

/// Delivers datagrams between [MemorySocket]s in the same process, in send order. Optionally
///  lossy and duplicating, driven by a seeded RNG so that test runs are reproducible.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        MemoryNetwork::lossy(0.0, 0.0, 0)
    }
}

impl MemoryNetwork {
    pub fn new() -> MemoryNetwork {
        MemoryNetwork::default()
    }

    /// `loss_rate` and `duplicate_rate` are probabilities per datagram
    pub fn lossy(loss_rate: f64, duplicate_rate: f64, seed: u64) -> MemoryNetwork {
        MemoryNetwork {
            state: Arc::new(Mutex::new(NetworkState {
                inboxes: Default::default(),
                loss_rate,
                duplicate_rate,
                rng: StdRng::seed_from_u64(seed),
            })),
        }
    }

    /// Creates a socket bound to `addr`. A second socket for the same address replaces the
    ///  first one's inbox.
    pub fn socket(&self, addr: SocketAddr) -> MemorySocket {
        let inbox = Arc::new(Inbox::default());
        lock(&self.state).inboxes.insert(addr, inbox.clone());
        MemorySocket {
            addr,
            network: self.clone(),
            inbox,
        }
    }

    /// drops all datagrams waiting for `addr`, simulating their loss
    pub fn clear_inbox(&self, addr: SocketAddr) {
        let inbox = lock(&self.state).inboxes.get(&addr).cloned();
        if let Some(inbox) = inbox {
            lock(&inbox.queue).clear();
        }
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        let (inbox, copies) = {
            let mut state = lock(&self.state);
            let Some(inbox) = state.inboxes.get(&to).cloned() else {
                trace!("memory network: no socket at {:?} - dropping datagram", to);
                return;
            };

            let loss_rate = state.loss_rate;
            let duplicate_rate = state.duplicate_rate;
            if loss_rate > 0.0 && state.rng.gen_bool(loss_rate) {
                trace!("memory network: losing datagram from {:?} to {:?}", from, to);
                return;
            }
            let copies = if duplicate_rate > 0.0 && state.rng.gen_bool(duplicate_rate) { 2 } else { 1 };
            (inbox, copies)
        };

        let data = Bytes::copy_from_slice(data);
        {
            let mut queue = lock(&inbox.queue);
            for _ in 0..copies {
                queue.push_back((data.clone(), from));
            }
        }
        inbox.notify.notify_one();
    }
}

pub struct MemorySocket {
    addr: SocketAddr,
    network: MemoryNetwork,
    inbox: Arc<Inbox>,
}

impl MemorySocket {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// removes and returns all waiting datagrams, for inspecting traffic at the wire level
    pub fn take_all(&self) -> Vec<(Bytes, SocketAddr)> {
        lock(&self.inbox.queue).drain(..).collect()
    }
}

#[async_trait]
impl DatagramSocket for MemorySocket {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        self.network.deliver(self.addr, to, datagram);
        Ok(())
    }

    fn try_recv_datagram(&self, buf: &mut [u8]) -> anyhow::Result<Option<(usize, SocketAddr)>> {
        let Some((data, from)) = lock(&self.inbox.queue).pop_front() else {
            return Ok(None);
        };

        // like a UDP socket, excess bytes are discarded; the length reports the full datagram
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(Some((data.len(), from)))
    }

    async fn readable(&self) -> anyhow::Result<()> {
        loop {
            if !lock(&self.inbox.queue).is_empty() {
                return Ok(());
            }
            self.inbox.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_delivery() {
        let network = MemoryNetwork::new();
        let a = network.socket(addr("1.1.1.1:1"));
        let b = network.socket(addr("2.2.2.2:2"));

        a.send_datagram(b.addr(), &[1, 2]).unwrap();
        a.send_datagram(b.addr(), &[3]).unwrap();
        a.send_datagram(addr("3.3.3.3:3"), &[4]).unwrap();
        b.readable().await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(b.try_recv_datagram(&mut buf).unwrap(), Some((2, a.addr())));
        assert_eq!(&buf[..2], &[1, 2]);
        assert_eq!(b.try_recv_datagram(&mut buf).unwrap(), Some((1, a.addr())));
        assert_eq!(b.try_recv_datagram(&mut buf).unwrap(), None);
        assert!(a.take_all().is_empty());
    }

    #[test]
    fn test_lossy() {
        let network = MemoryNetwork::lossy(0.5, 0.0, 17);
        let a = network.socket(addr("1.1.1.1:1"));
        let b = network.socket(addr("2.2.2.2:2"));

        for _ in 0..1000 {
            a.send_datagram(b.addr(), &[0]).unwrap();
        }
        let received = b.take_all().len();
        assert!(received > 350 && received < 650, "{}", received);
    }

    #[test]
    fn test_duplicating() {
        let network = MemoryNetwork::lossy(0.0, 1.0, 17);
        let a = network.socket(addr("1.1.1.1:1"));
        let b = network.socket(addr("2.2.2.2:2"));

        a.send_datagram(b.addr(), &[9]).unwrap();
        assert_eq!(b.take_all().len(), 2);
    }
}
