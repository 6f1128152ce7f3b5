//! Commands in the extension range (`0x60..=0xFE`).
//!
//! Extension payloads travel as a length-prefixed blob, so the codec frames
//! them without knowing the extension. Each extension decodes its own fields
//! from that blob.

use std::{fmt, io::Cursor};

use async_trait::async_trait;
use log::debug;

use crate::{
    access::Access,
    error::Error,
    fcall::*,
    fs::saturate,
    serialize::{self, Decodable},
    session::{Origin, Session},
    utils::Result,
};

/// Server side file copy
pub const EXT_COPY: u8 = 0x60;

/// Per-session message size negotiation
pub const EXT_PKTSIZE: u8 = 0x61;

/// What an extension handler can see besides its session
pub struct Context<'a> {
    pub session: &'a Session,
    /// Transport the session was mounted over
    pub origin: Origin,
    /// Largest message size deliverable on that transport
    pub max_msg_size: usize,
}

/// Handler for one extension command
#[async_trait]
pub trait Extension: Send + Sync + fmt::Debug {
    /// Command code, outside the core set
    fn code(&self) -> u8;

    fn name(&self) -> &'static str;

    /// Whether guest sessions are refused
    fn requires_auth(&self) -> bool {
        false
    }

    /// Decode `payload`, act, and return the encoded reply payload.
    async fn handle(&self, ctx: &Context<'_>, payload: &[u8]) -> Result<Data>;
}

fn field<T: Decodable>(cursor: &mut Cursor<&[u8]>) -> Result<T> {
    T::decode(cursor).map_err(|_| Error::No(ResultCode::EINVAL))
}

/// COPY: `from`, `to` → bytes copied (u32, saturated)
#[derive(Copy, Clone, Debug, Default)]
pub struct CopyFile;

#[async_trait]
impl Extension for CopyFile {
    fn code(&self) -> u8 {
        EXT_COPY
    }

    fn name(&self) -> &'static str {
        "COPY"
    }

    fn requires_auth(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &Context<'_>, payload: &[u8]) -> Result<Data> {
        let mut cursor = Cursor::new(payload);
        let from: String = field(&mut cursor)?;
        let to: String = field(&mut cursor)?;

        let session = ctx.session;
        session.authorize(Access::Write)?;
        let copied = session
            .fs()
            .copy(&session.resolve(&from), &session.resolve(&to))
            .await?;
        Ok(serialize::encode_payload(|enc| enc << &saturate(copied))?)
    }
}

/// PKTSIZE: desired size (u16) → granted size (u16)
#[derive(Copy, Clone, Debug, Default)]
pub struct PacketSize;

impl PacketSize {
    /// Size granted for a request of `desired` bytes
    pub fn grant(desired: u16, max_msg_size: usize) -> u16 {
        let max = max_msg_size.clamp(UDP_MSG_SIZE, MAX_MSG_SIZE);
        (desired as usize).clamp(UDP_MSG_SIZE, max) as u16
    }
}

#[async_trait]
impl Extension for PacketSize {
    fn code(&self) -> u8 {
        EXT_PKTSIZE
    }

    fn name(&self) -> &'static str {
        "PKTSIZE"
    }

    async fn handle(&self, ctx: &Context<'_>, payload: &[u8]) -> Result<Data> {
        let mut cursor = Cursor::new(payload);
        let desired: u16 = field(&mut cursor)?;
        let granted = Self::grant(desired, ctx.max_msg_size);
        debug!("packet size over {:?}: asked {}, granted {}", ctx.origin, desired, granted);
        ctx.session.set_msg_size(granted as usize);
        Ok(serialize::encode_payload(|enc| enc << &granted)?)
    }
}

/// Request payload of COPY
pub fn copy_request(from: &str, to: &str) -> Result<Data> {
    Ok(serialize::encode_payload(|enc| enc << from << to)?)
}

/// Request payload of PKTSIZE
pub fn pktsize_request(desired: u16) -> Result<Data> {
    Ok(serialize::encode_payload(|enc| enc << &desired)?)
}

/// Decode a single-field reply payload
pub fn reply_field<T: Decodable>(payload: &Data) -> Result<T> {
    T::decode(&mut Cursor::new(&payload.0[..]))
        .map_err(|e| Error::Protocol(format!("malformed extension reply: {}", e)))
}

/// The extensions this crate ships
pub fn builtin() -> Vec<std::sync::Arc<dyn Extension>> {
    vec![std::sync::Arc::new(CopyFile), std::sync::Arc::new(PacketSize)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_is_clamped() {
        assert_eq!(PacketSize::grant(100, 8192), UDP_MSG_SIZE as u16);
        assert_eq!(PacketSize::grant(1024, 8192), 1024);
        assert_eq!(PacketSize::grant(60000, 8192), 8192);
        assert_eq!(PacketSize::grant(u16::MAX, MAX_MSG_SIZE), u16::MAX);
        assert_eq!(PacketSize::grant(u16::MAX, UDP_MAX_PAYLOAD), UDP_MAX_PAYLOAD as u16);
    }

    #[test]
    fn payloads() {
        let data = copy_request("/a", "/b").unwrap();
        assert_eq!(data.0, b"/a\0/b\0");

        let data = pktsize_request(1024).unwrap();
        assert_eq!(data.0, vec![0x00, 0x04]);
        assert_eq!(reply_field::<u16>(&data).unwrap(), 1024);

        assert!(reply_field::<u32>(&Data(vec![1])).is_err());
    }

    #[test]
    fn builtin_codes_are_extensions() {
        for ext in builtin() {
            assert!(Command::is_extension(ext.code()), "{}", ext.name());
        }
    }
}
