use std::mem::size_of;
use anyhow::bail;
use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::address::Address;
use crate::buf::{BufExt, BufMutExt};

/// The message types handled by the protocol itself. Types starting at
///  [APPLICATION_MESSAGE_TYPE_START] belong to the application; all others are reserved.
#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum MessageType {
    Join = 1,
    Leave = 2,
    Ping = 3,
    Pong = 4,
    ConfirmPacket = 5,
    Meta = 6,
}

pub const APPLICATION_MESSAGE_TYPE_START: u16 = 0x100;

pub fn is_application_message_type(message_type: u16) -> bool {
    message_type >= APPLICATION_MESSAGE_TYPE_START
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MessageHeader {
    pub message_type: u16,
    /// length of the body following the header, *excluding* the footer
    pub packet_size: u16,
    pub has_footer: bool,
    /// derived from the footer on read: `false` iff the footer carries a forward address, i.e.
    ///  the message is only passing through this node
    pub directed_here: bool,
}

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = size_of_header();

    const HAS_FOOTER_OFFSET: usize = 2;
    const PACKET_SIZE_OFFSET: usize = 3;

    /// writes the header with placeholders for size and has-footer flag, returning the offsets
    ///  needed for patching them once body and footer are written
    pub fn reserve(buf: &mut BytesMut, message_type: u16) -> HeaderInfo {
        let start = buf.len();
        buf.put_u16(message_type);
        buf.put_bool(false);
        buf.put_u16(0);
        HeaderInfo { start }
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::try_from(self.message_type).ok()
    }

    /// Parses the header at the start of `buf` and - if flagged - the footer following the
    ///  body. `buf` is not consumed, the caller positions itself using `packet_size` and the
    ///  footer's `serialized_size`.
    pub fn try_read(buf: &[u8]) -> anyhow::Result<(MessageHeader, MessageFooter)> {
        let mut parse_buf = buf;
        let message_type = parse_buf.try_read_u16()?;
        let has_footer = parse_buf.try_read_bool()?;
        let packet_size = parse_buf.try_read_u16()?;

        if parse_buf.len() < packet_size as usize {
            bail!("message of type {} declares a body of {} bytes, only {} remaining", message_type, packet_size, parse_buf.len());
        }

        let footer = if has_footer {
            let mut footer_buf = &parse_buf[packet_size as usize..];
            MessageFooter::try_read(&mut footer_buf)?
        }
        else {
            MessageFooter::ABSENT
        };

        let header = MessageHeader {
            message_type,
            packet_size,
            has_footer,
            directed_here: footer.directed_here(),
        };
        Ok((header, footer))
    }

    /// total length of the frame including header, body and footer
    pub fn frame_len(&self, footer: &MessageFooter) -> usize {
        Self::SERIALIZED_LEN + self.packet_size as usize + footer.serialized_size
    }
}

const fn size_of_header() -> usize {
    size_of::<u16>() + size_of::<u8>() + size_of::<u16>()
}

/// Write-time bookkeeping for a message whose header was reserved but not yet patched
#[must_use]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HeaderInfo {
    start: usize,
}

impl HeaderInfo {
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn body_start(&self) -> usize {
        self.start + MessageHeader::SERIALIZED_LEN
    }

    /// finishes a message without footer, patching the body size
    pub fn finish_size(&self, buf: &mut BytesMut) -> anyhow::Result<u16> {
        let body_len = match buf.len().checked_sub(self.body_start()) {
            Some(len) => len,
            None => bail!("buffer was truncated below the reserved message header"),
        };
        let packet_size: u16 = match body_len.try_into() {
            Ok(size) => size,
            Err(_) => bail!("message body of {} bytes exceeds the maximum of {}", body_len, u16::MAX),
        };

        let offs = self.start + MessageHeader::PACKET_SIZE_OFFSET;
        buf[offs..offs + 2].copy_from_slice(&packet_size.to_be_bytes());
        Ok(packet_size)
    }

    fn set_has_footer(&self, buf: &mut BytesMut) {
        buf[self.start + MessageHeader::HAS_FOOTER_OFFSET] = 1;
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MessageFooter {
    /// `None` for unreliable messages; 0 is never a valid reliable id
    pub reliable_id: Option<u16>,
    /// `None` if there is no address slot in the footer; `Some(Address::UNSET)` if the slot
    ///  is present but empty
    pub forward_address: Option<Address>,
    /// computed on read, 0 for messages without footer
    pub serialized_size: usize,
}

impl MessageFooter {
    pub const ABSENT: MessageFooter = MessageFooter {
        reliable_id: None,
        forward_address: None,
        serialized_size: 0,
    };

    /// `force_address` writes the address slot even for an unset address
    pub fn new(reliable_id: Option<u16>, forward_address: Address, force_address: bool) -> MessageFooter {
        let forward_address = if forward_address.is_set() || force_address {
            Some(forward_address)
        }
        else {
            None
        };

        let mut result = MessageFooter {
            reliable_id,
            forward_address,
            serialized_size: 0,
        };
        result.serialized_size = result.calc_serialized_size();
        result
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable_id.is_some()
    }

    pub fn forward_address(&self) -> Address {
        self.forward_address.unwrap_or(Address::UNSET)
    }

    pub fn directed_here(&self) -> bool {
        !self.forward_address().is_set()
    }

    fn calc_serialized_size(&self) -> usize {
        2
            + self.reliable_id.map(|_| size_of::<u16>()).unwrap_or(0)
            + self.forward_address.map(|a| a.serialized_len()).unwrap_or(0)
    }

    /// Appends the footer after the message body, patching size and has-footer flag in the
    ///  reserved header.
    pub fn write_to(&self, buf: &mut BytesMut, info: &HeaderInfo) -> anyhow::Result<()> {
        info.finish_size(buf)?;
        info.set_has_footer(buf);

        buf.put_bool(self.reliable_id.is_some());
        buf.put_bool(self.forward_address.is_some());
        if let Some(reliable_id) = self.reliable_id {
            buf.put_u16(reliable_id);
        }
        if let Some(forward_address) = &self.forward_address {
            forward_address.ser(buf);
        }
        Ok(())
    }

    pub fn try_read(buf: &mut &[u8]) -> anyhow::Result<MessageFooter> {
        let initial_len = buf.len();

        let is_reliable = buf.try_read_bool()?;
        let address_available = buf.try_read_bool()?;

        let reliable_id = if is_reliable {
            match buf.try_read_u16()? {
                0 => bail!("reliable message with reliable id 0"),
                id => Some(id),
            }
        }
        else {
            None
        };

        let forward_address = if address_available {
            Some(Address::try_deser(buf)?)
        }
        else {
            None
        };

        Ok(MessageFooter {
            reliable_id,
            forward_address,
            serialized_size: initial_len - buf.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use rstest::rstest;
    use super::*;

    fn addr(s: &str) -> Address {
        Address::new(s.parse::<SocketAddr>().unwrap())
    }

    fn write_frame(buf: &mut BytesMut, message_type: u16, body: &[u8], footer: Option<MessageFooter>) {
        let info = MessageHeader::reserve(buf, message_type);
        buf.put_slice(body);
        match footer {
            Some(footer) => footer.write_to(buf, &info).unwrap(),
            None => { info.finish_size(buf).unwrap(); }
        }
    }

    #[rstest]
    #[case::unreliable_empty(0x100, vec![], None, vec![1,0, 0, 0,0])]
    #[case::unreliable(0x123, vec![9,8,7], None, vec![1,0x23, 0, 0,3, 9,8,7])]
    #[case::reliable(5, vec![0,7], Some(MessageFooter::new(Some(3), Address::UNSET, false)), vec![0,5, 1, 0,2, 0,7, 1,0, 0,3])]
    #[case::forced_unset_address(6, vec![2], Some(MessageFooter::new(None, Address::UNSET, true)), vec![0,6, 1, 0,1, 2, 0,1, 0])]
    #[case::forward(0x100, vec![], Some(MessageFooter::new(Some(0x102), addr("1.2.3.4:5"), false)), vec![1,0, 1, 0,0, 1,1, 1,2, 4, 1,2,3,4, 0,5])]
    fn test_write(#[case] message_type: u16, #[case] body: Vec<u8>, #[case] footer: Option<MessageFooter>, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        write_frame(&mut buf, message_type, &body, footer);
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[rstest]
    fn test_round_trip(
        #[values(1, 5, 0x100, 0xffff)] message_type: u16,
        #[values(vec![], vec![1], vec![0; 300])] body: Vec<u8>,
        #[values(None, Some(1), Some(0xffff))] reliable_id: Option<u16>,
        #[values(None, Some(Address::UNSET), Some(addr("10.1.2.3:4567")), Some(addr("[::2]:1")))] forward: Option<Address>,
    ) {
        let footer = if reliable_id.is_some() || forward.is_some() {
            Some(MessageFooter::new(reliable_id, forward.unwrap_or(Address::UNSET), forward.is_some()))
        }
        else {
            None
        };

        let mut buf = BytesMut::new();
        write_frame(&mut buf, message_type, &body, footer);
        // a second frame must not be affected by the first one
        buf.put_slice(&[0xaa, 0xbb]);

        let (header, actual_footer) = MessageHeader::try_read(&buf).unwrap();
        assert_eq!(header.message_type, message_type);
        assert_eq!(header.packet_size as usize, body.len());
        assert_eq!(header.has_footer, footer.is_some());
        assert_eq!(actual_footer, footer.unwrap_or(MessageFooter::ABSENT));
        assert_eq!(header.directed_here, !forward.unwrap_or(Address::UNSET).is_set());
        assert_eq!(&buf[MessageHeader::SERIALIZED_LEN..MessageHeader::SERIALIZED_LEN + body.len()], body.as_slice());
        assert_eq!(header.frame_len(&actual_footer), buf.len() - 2);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::short_header(vec![1,0, 0, 0])]
    #[case::body_too_short(vec![1,0, 0, 0,3, 1,2])]
    #[case::missing_footer(vec![1,0, 1, 0,1, 1])]
    #[case::truncated_reliable_id(vec![1,0, 1, 0,0, 1,0, 0])]
    #[case::reliable_id_zero(vec![1,0, 1, 0,0, 1,0, 0,0])]
    #[case::invalid_bool(vec![1,0, 2, 0,0])]
    #[case::truncated_address(vec![1,0, 1, 0,0, 0,1, 4, 1,2])]
    fn test_try_read_invalid(#[case] raw: Vec<u8>) {
        assert!(MessageHeader::try_read(&raw).is_err());
    }

    #[test]
    fn test_finish_size_rejects_oversized_body() {
        let mut buf = BytesMut::new();
        let info = MessageHeader::reserve(&mut buf, 0x100);
        buf.put_slice(&vec![0u8; u16::MAX as usize + 1]);
        assert!(info.finish_size(&mut buf).is_err());
    }

    #[rstest]
    #[case(1, Some(MessageType::Join))]
    #[case(6, Some(MessageType::Meta))]
    #[case(7, None)]
    #[case(0x100, None)]
    fn test_kind(#[case] message_type: u16, #[case] expected: Option<MessageType>) {
        let header = MessageHeader { message_type, packet_size: 0, has_footer: false, directed_here: true };
        assert_eq!(header.kind(), expected);
    }
}
