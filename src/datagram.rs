use bytes::{Bytes, BytesMut};

use crate::address::Address;
use crate::message_header::{HeaderInfo, MessageFooter, MessageHeader};

/// Accumulates consecutive messages for a single datagram. Each message is written in two
///  passes: [DatagramWriter::begin_message] reserves the header, the caller writes the body
///  through [DatagramWriter::body], and one of the finishers patches the header (and appends
///  the footer if there is one).
#[derive(Debug, Default)]
pub struct DatagramWriter {
    buf: BytesMut,
}

impl DatagramWriter {
    pub fn new() -> DatagramWriter {
        DatagramWriter::default()
    }

    pub fn with_capacity(capacity: usize) -> DatagramWriter {
        DatagramWriter {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn begin_message(&mut self, message_type: u16) -> HeaderInfo {
        MessageHeader::reserve(&mut self.buf, message_type)
    }

    pub fn body(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Finishes an unreliable message. A footer is only written if there is a forward address
    ///  to carry.
    pub fn finish_message(&mut self, info: HeaderInfo, forward_address: Address) -> anyhow::Result<()> {
        if forward_address.is_set() {
            MessageFooter::new(None, forward_address, false)
                .write_to(&mut self.buf, &info)
        }
        else {
            info.finish_size(&mut self.buf)?;
            Ok(())
        }
    }

    pub fn finish_with_footer(&mut self, info: HeaderInfo, footer: &MessageFooter) -> anyhow::Result<()> {
        footer.write_to(&mut self.buf, &info)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// A single decoded message inside a received datagram
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: MessageHeader,
    pub footer: MessageFooter,
    /// offset of the header in the datagram
    pub start: usize,
    pub body: Bytes,
}

impl Frame {
    /// offset *after* the footer, i.e. where the next frame starts
    pub fn end(&self) -> usize {
        self.start + self.header.frame_len(&self.footer)
    }
}

/// Iterates over the frames of a received datagram. A frame whose declared body or footer runs
///  past the end of the datagram yields an error and ends the iteration: there is no way to
///  find the next frame boundary after that.
pub struct FrameReader {
    data: Bytes,
    offset: usize,
}

impl FrameReader {
    pub fn new(data: Bytes) -> FrameReader {
        FrameReader { data, offset: 0 }
    }
}

impl Iterator for FrameReader {
    type Item = anyhow::Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let start = self.offset;
        match MessageHeader::try_read(&self.data[start..]) {
            Ok((header, footer)) => {
                let body_start = start + MessageHeader::SERIALIZED_LEN;
                let body = self.data.slice(body_start..body_start + header.packet_size as usize);
                let frame = Frame { header, footer, start, body };
                self.offset = frame.end();
                Some(Ok(frame))
            }
            Err(e) => {
                self.offset = self.data.len();
                Some(Err(e.context(format!("inconsistent frame at offset {}", start))))
            }
        }
    }
}
