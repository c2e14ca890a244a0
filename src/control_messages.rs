use anyhow::anyhow;
use bytes::{Buf, BufMut};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

use crate::buf::{BufExt, BufMutExt};

/// Symbolic message destination, resolved by the node doing the routing
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum DestinationCode {
    /// the server (only meaningful on a client)
    Host = 0,
    /// the source of the datagram currently being processed
    Reply = 1,
    /// every connected peer except the originator
    All = 2,
    /// every connected peer including the originator
    Everyone = 3,
}

#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum LeaveReason {
    #[num_enum(default)]
    Unspecified = 0,
    Quit = 1,
    TimedOut = 2,
    Kicked = 3,
    ServerShutdown = 4,
}

/// JOIN carries the sender's display name, both for the client's request and the server's
///  confirmation
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JoinMessage {
    pub name: String,
}
impl JoinMessage {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_string(&self.name);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<JoinMessage> {
        Ok(JoinMessage {
            name: buf.try_read_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LeaveMessage {
    pub reason: LeaveReason,
}
impl LeaveMessage {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.reason.into());
    }

    /// unknown reasons are mapped to `Unspecified` rather than rejected: a LEAVE must never be
    ///  lost over a reason code
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<LeaveMessage> {
        Ok(LeaveMessage {
            reason: LeaveReason::from(buf.try_read_u16()?),
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConfirmPacketMessage {
    pub reliable_id: u16,
}
impl ConfirmPacketMessage {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.reliable_id);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConfirmPacketMessage> {
        Ok(ConfirmPacketMessage {
            reliable_id: buf.try_read_u16()?,
        })
    }
}

/// Routing envelope a client puts at the start of a datagram that is addressed symbolically
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MetaMessage {
    pub destination: DestinationCode,
}
impl MetaMessage {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.destination.into());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MetaMessage> {
        let raw = buf.try_read_u8()?;
        let destination = DestinationCode::try_from(raw)
            .map_err(|_| anyhow!("invalid destination code {}", raw))?;
        Ok(MetaMessage { destination })
    }
}
