use tracing::{trace, warn};

use crate::datagram::Frame;
use crate::engine::Engine;
use crate::routing::{copy_frame, Destination};

impl Engine {
    /// Forwards a message that carries a forward address, i.e. that is only passing through
    ///  this node. The body is copied verbatim into a new message without forward address,
    ///  with a new reliable id if the original was reliable, so that this node takes over
    ///  retransmission for the second hop.
    ///
    /// Failures are logged and the message is dropped: retrying is the original sender's job.
    pub(crate) fn relay(&mut self, frame: &Frame) {
        let forward_address = frame.footer.forward_address();
        let Some(to) = forward_address.socket_addr() else {
            return;
        };

        if to == self.local_addr() {
            warn!("message of type 0x{:04x} is forwarded to this node itself - dropping", frame.header.message_type);
            return;
        }

        if let Err(e) = self.try_relay(frame, Destination::Address(to)) {
            warn!("error relaying message of type 0x{:04x} to {:?}: {}", frame.header.message_type, to, e);
        }
    }

    fn try_relay(&mut self, frame: &Frame, destination: Destination) -> anyhow::Result<()> {
        let mut datagram = self.datagram(destination)?;
        let reliable_id = copy_frame(&mut datagram, frame)?;
        datagram.send()?;
        trace!(?reliable_id, "relayed message of type 0x{:04x} to {:?}", frame.header.message_type, destination);
        Ok(())
    }
}
