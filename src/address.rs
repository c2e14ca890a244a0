use std::fmt::{Debug, Display, Formatter};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use anyhow::bail;
use bytes::BufMut;

use crate::buf::{BufExt, BufMutExt};

/// A network address as it appears in message footers. 'unset' is a regular value, meaning
///  "no address": A footer can carry an address slot without an address in it.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Address(Option<SocketAddr>);

impl Address {
    pub const UNSET: Address = Address(None);

    pub const KIND_UNSET: u8 = 0;
    pub const KIND_TEXT: u8 = 2;
    pub const KIND_IPV4: u8 = 4;
    pub const KIND_IPV6: u8 = 6;

    pub fn new(socket_addr: SocketAddr) -> Address {
        Address(Some(socket_addr))
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.0
    }

    pub fn serialized_len(&self) -> usize {
        match self.0 {
            None => 1,
            Some(SocketAddr::V4(_)) => 1 + 4 + 2,
            Some(SocketAddr::V6(_)) => 1 + 16 + 2,
        }
    }

    /// Addresses are always written in their binary form; the text form is accepted on read
    ///  for peers that cannot produce the binary form.
    pub fn ser(&self, buf: &mut impl BufMut) {
        match &self.0 {
            None => {
                buf.put_u8(Self::KIND_UNSET);
            }
            Some(SocketAddr::V4(data)) => {
                buf.put_u8(Self::KIND_IPV4);
                buf.put_u32(data.ip().to_bits());
                buf.put_u16(data.port());
            }
            Some(SocketAddr::V6(data)) => {
                buf.put_u8(Self::KIND_IPV6);
                buf.put_u128(data.ip().to_bits());
                buf.put_u16(data.port());
            }
        }
    }

    pub fn try_deser(buf: &mut impl BufExt) -> anyhow::Result<Address> {
        let addr = match buf.try_read_u8()? {
            Self::KIND_UNSET => None,
            Self::KIND_IPV4 => {
                let ip = buf.try_read_u32()?;
                let port = buf.try_read_u16()?;
                Some(SocketAddr::V4(SocketAddrV4::new(ip.into(), port)))
            }
            Self::KIND_IPV6 => {
                let ip = buf.try_read_u128()?;
                let port = buf.try_read_u16()?;
                Some(SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0)))
            }
            Self::KIND_TEXT => {
                let text = buf.try_read_string()?;
                match text.parse::<SocketAddr>() {
                    Ok(addr) => Some(addr),
                    Err(e) => bail!("invalid textual address {:?}: {}", text, e),
                }
            }
            n => {
                bail!("invalid address discriminator: {}", n);
            }
        };
        Ok(Address(addr))
    }

    /// writes the text form - only used for interoperability tests, regular code writes the
    ///  binary form
    pub fn ser_as_text(&self, buf: &mut impl BufMut) {
        match &self.0 {
            None => buf.put_u8(Self::KIND_UNSET),
            Some(addr) => {
                buf.put_u8(Self::KIND_TEXT);
                buf.put_string(&addr.to_string());
            }
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::new(addr)
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            None => write!(f, "[unset]"),
            Some(addr) => write!(f, "[{:?}]", addr),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            None => write!(f, "unset"),
            Some(addr) => write!(f, "{}", addr),
        }
    }
}
