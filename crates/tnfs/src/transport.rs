//! Client side transport: one socket, one call in flight.

use std::{net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tokio_util::codec::Framed;

use crate::{
    codec::ClientCodec,
    error::Error,
    fcall::*,
    io_err, serialize,
    utils::{Endpoint, Proto, Result},
};

enum Link {
    Udp(UdpSocket),
    Tcp(Framed<TcpStream, ClientCodec>),
}

/// Request/reply channel to one server
pub struct Transport {
    link: Link,
    seq: u8,
    timeout: Option<Duration>,
    recv_buf: Vec<u8>,
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| Error::Io(io_err!(NotFound, "Address did not resolve")))
}

impl Transport {
    /// Connect to the server an endpoint names.
    pub async fn connect(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Self> {
        match endpoint.proto {
            Proto::Udp => Self::udp(&endpoint.address(), timeout).await,
            Proto::Tcp => Self::tcp(&endpoint.address(), timeout).await,
        }
    }

    pub async fn udp(addr: &str, timeout: Option<Duration>) -> Result<Self> {
        let peer = resolve(addr).await?;
        let local = match peer {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        Ok(Self::new(Link::Udp(socket), timeout))
    }

    pub async fn tcp(addr: &str, timeout: Option<Duration>) -> Result<Self> {
        let peer = resolve(addr).await?;
        let connect = TcpStream::connect(peer);
        let stream = match timeout {
            Some(t) => tokio::time::timeout(t, connect).await??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;
        let framed = Framed::new(stream, ClientCodec::new(MAX_MSG_SIZE));
        Ok(Self::new(Link::Tcp(framed), timeout))
    }

    fn new(link: Link, timeout: Option<Duration>) -> Self {
        Transport {
            link,
            seq: 0,
            timeout,
            recv_buf: vec![0; MAX_MSG_SIZE],
        }
    }

    pub fn proto(&self) -> Proto {
        match self.link {
            Link::Udp(_) => Proto::Udp,
            Link::Tcp(_) => Proto::Tcp,
        }
    }

    /// Message size a session starts with on this transport
    pub fn default_msg_size(&self) -> usize {
        match self.link {
            Link::Udp(_) => UDP_MSG_SIZE,
            Link::Tcp(_) => TCP_MSG_SIZE,
        }
    }

    /// Sequence number the next call will use
    pub fn sequence(&self) -> u8 {
        self.seq
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Send `body` under `session` and wait for its reply.
    ///
    /// A reply whose sequence number or command differs from the request is
    /// a protocol error. Nothing is retried.
    pub async fn call(&mut self, session: u16, body: Tcall) -> Result<Msg<Rcall>> {
        let seq = self.seq;
        self.seq = next_seq(seq);

        let code = body.code();
        let request = Msg { session, seq, body };
        debug!("\t→ {:?}", request);

        let reply = match self.timeout {
            Some(t) => tokio::time::timeout(t, self.exchange(request)).await??,
            None => self.exchange(request).await?,
        };
        debug!("\t← {:?}", reply);

        if reply.seq != seq || reply.body.code() != code {
            return Err(Error::Protocol(format!(
                "reply seq {} cmd 0x{:02x} does not answer seq {} cmd 0x{:02x}",
                reply.seq,
                reply.body.code(),
                seq,
                code
            )));
        }
        Ok(reply)
    }

    async fn exchange(&mut self, request: Msg<Tcall>) -> Result<Msg<Rcall>> {
        match self.link {
            Link::Udp(ref socket) => {
                let mut out = Vec::with_capacity(UDP_MSG_SIZE);
                serialize::write_request(&mut out, &request)?;
                socket.send(&out).await?;

                let n = socket.recv(&mut self.recv_buf).await?;
                serialize::read_reply(&mut &self.recv_buf[..n])
                    .map_err(|e| Error::Protocol(format!("malformed reply: {}", e)))
            }
            Link::Tcp(ref mut framed) => {
                framed.send(request).await?;
                match framed.next().await {
                    Some(Ok(reply)) => Ok(reply),
                    Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                        Err(Error::Protocol(format!("malformed reply: {}", e)))
                    }
                    Some(Err(e)) => Err(e.into()),
                    None => Err(Error::Io(io_err!(UnexpectedEof, "Connection closed by server"))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answer SIZE requests, shifting the sequence number by `skew`
    async fn fake_server(skew: u8) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; UDP_MSG_SIZE];
            loop {
                let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
                let request = serialize::read_request(&mut &buf[..n]).unwrap();
                let reply = Msg {
                    session: request.session,
                    seq: request.seq.wrapping_add(skew),
                    body: Rcall::Size {
                        kbytes: request.seq as u32,
                    },
                };
                let mut out = Vec::new();
                serialize::write_reply(&mut out, &reply).unwrap();
                socket.send_to(&out, peer).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn sequence_wraps_after_250() {
        let addr = fake_server(0).await;
        let mut t = Transport::udp(&addr.to_string(), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..260 {
            let reply = t.call(1, Tcall::Size).await.unwrap();
            assert_eq!(reply.body, Rcall::Size { kbytes: reply.seq as u32 });
            seen.push(reply.seq);
        }
        let expected: Vec<u8> = (0..=250).chain(0..9).collect();
        assert_eq!(seen, expected);
        assert_eq!(t.sequence(), 9);
    }

    #[tokio::test]
    async fn mismatched_reply_is_fatal() {
        let addr = fake_server(1).await;
        let mut t = Transport::udp(&addr.to_string(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        match t.call(1, Tcall::Size).await {
            Err(Error::Protocol(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let mut t = Transport::udp(&addr.to_string(), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        let err = t.call(1, Tcall::Free).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
        drop(silent);
    }
}
