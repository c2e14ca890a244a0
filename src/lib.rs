//! A reliable messaging layer on top of UDP, designed for synchronizing input device state
//!  (gamepads, keyboards) between machines with low latency.
//!
//! ## Design goals
//!
//! * Client / server topology: clients join a server, which keeps track of them and fans out
//!   broadcasts. Peers that are only reachable through a third node are supported by relaying.
//! * Messages are small and frequent. Several messages are packed into a single datagram, and
//!   each message can be sent either reliably or unreliably
//!   * unreliable messages are fire-and-forget - for state that is re-sent every tick anyway
//!   * reliable messages are acknowledged, re-sent until acknowledgement, and de-duplicated on
//!     the receiving side. There is no ordering guarantee, and there is a limit to the
//!     'reliability': a message that is not acknowledged after a configurable time is dropped
//!     on the sending side
//! * No threads, no locks: the engine is a plain value driven by the host application's tick
//!   loop, see [engine::Engine::update]
//! * Connection liveness is tracked by pings and timeouts; a peer that stays silent for too
//!   long is disconnected
//! * explicitly *not* goals: congestion control, encryption, fragmentation of messages that do
//!   not fit into a single datagram
//!
//! ## Wire format
//!
//! All numbers are in network byte order (BE). A datagram contains one or more messages, each
//!  with the following structure:
//!
//! ```ascii
//! 0: message type (u16)
//!     * 1: JOIN, 2: LEAVE, 3: PING, 4: PONG, 5: CONFIRM_PACKET, 6: META
//!     * 0x100 and above: application messages
//! 2: has footer (u8 - 0 or 1)
//! 3: packet size (u16): length of the message body, excluding the footer
//! 5: body
//! *: footer (if 'has footer' is set):
//!     * is reliable (u8 - 0 or 1)
//!     * address available (u8 - 0 or 1)
//!     * reliable id (u16, only if 'is reliable'): never 0
//!     * forward address (only if 'address available'): if this is set, the message is not
//!        for the receiving node, but must be relayed to the forward address
//! ```
//!
//! Addresses are encoded as a u8 discriminator followed by the address data:
//!
//! ```ascii
//! 0: unset, no data
//! 4: IPV4 - u32 address, u16 port
//! 6: IPV6 - u128 address, u16 port
//! 2: text - u16 length followed by "ip:port" in UTF-8 (only read, never written)
//! ```
//!
//! A reliable message is acknowledged with a CONFIRM_PACKET message containing its reliable id
//!  (u16). Receivers remember processed reliable ids per peer and skip retransmissions, but
//!  they acknowledge them again since the previous acknowledgement may have been lost.
//!
//! A client that sends a broadcast starts the datagram with a META message whose body is the
//!  destination code (u8 - 0: HOST, 1: REPLY, 2: ALL, 3: EVERYONE). The server re-emits all
//!  application messages of such a datagram to the resolved recipients.

pub mod address;
pub mod application;
pub mod buf;
pub mod config;
pub mod connection;
pub mod control_messages;
pub mod datagram;
pub mod directory;
pub mod engine;
pub mod error;
pub mod message_header;
pub mod outbound;
mod relay;
pub mod routing;
pub mod socket;
pub mod test_util;
