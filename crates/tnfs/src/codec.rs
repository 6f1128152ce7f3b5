//! Stream framing of TNFS messages.
//!
//! TNFS carries no length prefix, so a frame ends wherever the message
//! decoder says it does. The decoder is retried each time more bytes arrive;
//! running out of bytes means "wait for more", any other decode failure is
//! fatal to the connection.

use std::{io::Cursor, marker::PhantomData};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec;

use crate::{
    fcall::*,
    io_err,
    serialize::{self, Decodable, Encodable},
};

/// Framer for one direction pair: decodes `In`, encodes `Out`
#[derive(Debug)]
pub struct MsgCodec<In, Out> {
    max_size: usize,
    _marker: PhantomData<fn(Out) -> In>,
}

/// Server side framing: requests in, replies out
pub type ServerCodec = MsgCodec<Tcall, Rcall>;

/// Client side framing: replies in, requests out
pub type ClientCodec = MsgCodec<Rcall, Tcall>;

impl<In, Out> MsgCodec<In, Out> {
    pub fn new(max_size: usize) -> Self {
        MsgCodec {
            max_size,
            _marker: PhantomData,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }
}

impl<In, Out> codec::Decoder for MsgCodec<In, Out>
where
    Msg<In>: Decodable,
{
    type Item = Msg<In>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&src[..]);
        match Msg::<In>::decode(&mut cursor) {
            Ok(msg) => {
                let used = cursor.position() as usize;
                src.advance(used);
                Ok(Some(msg))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if src.len() >= self.max_size {
                    return Err(io_err!(InvalidData, "Message exceeds maximum size"));
                }
                src.reserve(self.max_size - src.len());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl<In, Out> codec::Encoder<Msg<Out>> for MsgCodec<In, Out>
where
    Msg<Out>: Encodable,
{
    type Error = std::io::Error;

    fn encode(&mut self, item: Msg<Out>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut writer = dst.writer();
        item.encode(&mut writer)?;
        Ok(())
    }
}

/// Encode a reply into `buf`, returning the encoded length.
pub fn encode_reply_into(buf: &mut [u8], msg: &Msg<Rcall>) -> std::io::Result<usize> {
    let mut cursor = Cursor::new(buf);
    serialize::write_reply(&mut cursor, msg)?;
    Ok(cursor.position() as usize)
}

/// Encode a request into `buf`, returning the encoded length.
pub fn encode_request_into(buf: &mut [u8], msg: &Msg<Tcall>) -> std::io::Result<usize> {
    let mut cursor = Cursor::new(buf);
    serialize::write_request(&mut cursor, msg)?;
    Ok(cursor.position() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{Decoder, Encoder};

    fn stat_request(seq: u8) -> Msg<Tcall> {
        Msg {
            session: 9,
            seq,
            body: Tcall::Stat {
                path: "/hello.txt".to_owned(),
            },
        }
    }

    #[test]
    fn partial_reads_wait_for_more() {
        let mut bytes = BytesMut::new();
        ClientCodec::new(TCP_MSG_SIZE)
            .encode(stat_request(1), &mut bytes)
            .unwrap();
        let whole = bytes.freeze();

        let mut codec = ServerCodec::new(TCP_MSG_SIZE);
        let mut src = BytesMut::new();
        for (i, b) in whole.iter().enumerate() {
            assert!(codec.decode(&mut src).unwrap().is_none(), "byte {}", i);
            src.put_u8(*b);
        }
        assert_eq!(codec.decode(&mut src).unwrap(), Some(stat_request(1)));
        assert!(src.is_empty());
    }

    #[test]
    fn back_to_back_messages_split() {
        let mut client = ClientCodec::new(TCP_MSG_SIZE);
        let mut src = BytesMut::new();
        client.encode(stat_request(1), &mut src).unwrap();
        client.encode(stat_request(2), &mut src).unwrap();

        let mut server = ServerCodec::new(TCP_MSG_SIZE);
        assert_eq!(server.decode(&mut src).unwrap(), Some(stat_request(1)));
        assert_eq!(server.decode(&mut src).unwrap(), Some(stat_request(2)));
        assert_eq!(server.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let mut server = ServerCodec::new(16);
        let mut src = BytesMut::new();
        src.extend_from_slice(&[0x01, 0x00, 0x00, 0x24]);
        src.extend_from_slice(&[b'a'; 32]);
        assert!(server.decode(&mut src).is_err());
    }

    #[test]
    fn garbage_is_fatal() {
        let mut server = ServerCodec::new(TCP_MSG_SIZE);
        let mut src = BytesMut::from(&[0x01, 0x00, 0x00, 0x05][..]);
        assert!(server.decode(&mut src).is_err());
    }

    #[test]
    fn reply_into_slice() {
        let mut buf = [0u8; 16];
        let msg = Msg {
            session: 1,
            seq: 2,
            body: Rcall::Write { count: 2 },
        };
        let n = encode_reply_into(&mut buf, &msg).unwrap();
        assert_eq!(&buf[..n], &[0x01, 0x00, 0x02, 0x22, 0x00, 0x02, 0x00]);

        let mut tiny = [0u8; 4];
        assert!(encode_reply_into(&mut tiny, &msg).is_err());
    }
}
