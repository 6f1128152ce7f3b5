//! Asynchronous TNFS server.
//!
//! # Protocol
//! TNFS 1.2, over UDP and TCP

use {
    crate::{
        codec::ServerCodec,
        dispatch::{Dispatcher, Processor},
        error::Error,
        ext::{self, Extension},
        fcall::*,
        io_err,
        pool::{BufferPool, DEFAULT_POOL_ENTRIES},
        serialize,
        session::{DEFAULT_MAX_DIRS, DEFAULT_MAX_FILES, Mount, Origin},
        utils::Result,
    },
    futures::StreamExt,
    log::{debug, error, info, warn},
    std::{
        io,
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::Duration,
    },
    tokio::{
        io::AsyncWriteExt,
        net::{TcpListener, TcpStream, UdpSocket},
    },
    tokio_util::codec::FramedRead,
};

/// Pause after a receive error a retry will not cure
const RECV_BACKOFF: Duration = Duration::from_millis(250);

/// Receive errors caused by a single peer, not by the socket itself
fn is_peer_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Server settings
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address both transports bind to
    pub address: String,
    pub port: u16,
    pub udp: bool,
    pub tcp: bool,
    /// Initial message size of sessions mounted over UDP
    pub udp_msg_size: usize,
    /// Initial message size of sessions mounted over TCP
    pub tcp_msg_size: usize,
    /// Largest message accepted, and the ceiling of PKTSIZE
    pub max_msg_size: usize,
    /// Ceiling of PKTSIZE for sessions mounted over UDP
    pub udp_max_msg_size: usize,
    /// Open files per session
    pub max_files: usize,
    /// Open directories per session
    pub max_dirs: usize,
    /// Retry hint sent to clients on MOUNT, in milliseconds
    pub retry_ms: u16,
    /// Buffers kept in the message buffer pool
    pub pool_entries: usize,
    pub extensions: Vec<Arc<dyn Extension>>,
    pub processors: Vec<Arc<dyn Processor>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: "0.0.0.0".to_owned(),
            port: TNFS_PORT,
            udp: true,
            tcp: true,
            udp_msg_size: UDP_MSG_SIZE,
            tcp_msg_size: TCP_MSG_SIZE,
            max_msg_size: MAX_MSG_SIZE,
            udp_max_msg_size: UDP_MAX_PAYLOAD,
            max_files: DEFAULT_MAX_FILES,
            max_dirs: DEFAULT_MAX_DIRS,
            retry_ms: DEFAULT_RETRY_MS,
            pool_entries: DEFAULT_POOL_ENTRIES,
            extensions: Vec::new(),
            processors: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn udp(mut self, enabled: bool) -> Self {
        self.udp = enabled;
        self
    }

    pub fn tcp(mut self, enabled: bool) -> Self {
        self.tcp = enabled;
        self
    }

    pub fn udp_msg_size(mut self, size: usize) -> Self {
        self.udp_msg_size = size;
        self
    }

    pub fn tcp_msg_size(mut self, size: usize) -> Self {
        self.tcp_msg_size = size;
        self
    }

    pub fn max_msg_size(mut self, size: usize) -> Self {
        self.max_msg_size = size;
        self
    }

    pub fn udp_max_msg_size(mut self, size: usize) -> Self {
        self.udp_max_msg_size = size;
        self
    }

    pub fn max_files(mut self, n: usize) -> Self {
        self.max_files = n;
        self
    }

    pub fn max_dirs(mut self, n: usize) -> Self {
        self.max_dirs = n;
        self
    }

    pub fn retry_ms(mut self, ms: u16) -> Self {
        self.retry_ms = ms;
        self
    }

    pub fn pool_entries(mut self, n: usize) -> Self {
        self.pool_entries = n;
        self
    }

    pub fn extension(mut self, ext: Arc<dyn Extension>) -> Self {
        self.extensions.push(ext);
        self
    }

    /// Enable COPY and PKTSIZE
    pub fn builtin_extensions(mut self) -> Self {
        self.extensions.extend(ext::builtin());
        self
    }

    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// "address:port"
    pub fn bind_address(&self) -> String {
        match self.address.contains(':') && !self.address.starts_with('[') {
            true => format!("[{}]:{}", self.address, self.port),
            false => format!("{}:{}", self.address, self.port),
        }
    }
}

/// A TNFS server: shared dispatcher state plus the transport loops
#[derive(Clone, Debug)]
pub struct Server {
    dispatcher: Arc<Dispatcher>,
    pool: BufferPool,
    connections: Arc<AtomicU64>,
}

impl Server {
    pub fn new(config: ServerConfig, mounts: Vec<Mount>) -> Result<Self> {
        let pool = BufferPool::new(config.pool_entries);
        Ok(Server {
            dispatcher: Arc::new(Dispatcher::new(config, mounts)?),
            pool,
            connections: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Bind the enabled transports and serve until an I/O failure.
    pub async fn serve(&self) -> Result<()> {
        let config = self.dispatcher.config();
        let addr = config.bind_address();

        match (config.udp, config.tcp) {
            (true, true) => {
                let udp = UdpSocket::bind(&addr).await?;
                let tcp = TcpListener::bind(&addr).await?;
                tokio::try_join!(self.serve_udp(udp), self.serve_tcp(tcp))?;
                Ok(())
            }
            (true, false) => self.serve_udp(UdpSocket::bind(&addr).await?).await,
            (false, true) => self.serve_tcp(TcpListener::bind(&addr).await?).await,
            (false, false) => Err(Error::Io(io_err!(InvalidInput, "No transport enabled"))),
        }
    }

    /// Answer datagrams on `socket`, one message at a time.
    pub async fn serve_udp(&self, socket: UdpSocket) -> Result<()> {
        info!("listening on udp {}", socket.local_addr()?);
        let size = self.dispatcher.config().max_msg_size;

        loop {
            let mut inbuf = self.pool.acquire(size);
            let (len, peer) = match socket.recv_from(&mut inbuf).await {
                Ok(r) => r,
                Err(e) if is_peer_error(&e) => {
                    debug!("udp receive: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("udp receive failed: {}", e);
                    tokio::time::sleep(RECV_BACKOFF).await;
                    continue;
                }
            };

            let request = match serialize::read_request(&mut &inbuf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("{}: dropping malformed datagram: {}", peer, e);
                    continue;
                }
            };
            inbuf.release();
            debug!("\t← {} {:?}", peer, request);

            let mut outbuf = self.pool.acquire(size);
            match self.dispatcher.handle(request, Origin::Datagram, &mut outbuf).await {
                Ok(n) => {
                    if let Err(e) = socket.send_to(&outbuf[..n], peer).await {
                        error!("{}: failed to send reply: {}", peer, e);
                    }
                }
                Err(e) => warn!("{}: Error: \"{}\": {:?}", peer, e, e),
            }
        }
    }

    /// Accept connections on `listener`, each served by its own task.
    pub async fn serve_tcp(&self, listener: TcpListener) -> Result<()> {
        info!("listening on tcp {}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            info!("accepted: {:?}", peer);

            let server = self.clone();
            let origin = Origin::Stream(self.connections.fetch_add(1, Ordering::Relaxed));
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream, origin).await {
                    error!("{}: Error: {}: {:?}", peer, e, e);
                }
                server.dispatcher.disconnect(origin);
                info!("closed: {:?}", peer);
            });
        }
    }

    /// Handle the messages of one connection strictly in order.
    async fn serve_connection(&self, stream: TcpStream, origin: Origin) -> Result<()> {
        let size = self.dispatcher.config().max_msg_size;
        let (readhalf, mut writehalf) = stream.into_split();
        let mut framedread = FramedRead::new(readhalf, ServerCodec::new(size));

        while let Some(request) = framedread.next().await {
            let request = request?;
            debug!("\t← {:?} {:?}", origin, request);

            let mut outbuf = self.pool.acquire(size);
            let n = self.dispatcher.handle(request, origin, &mut outbuf).await?;
            writehalf.write_all(&outbuf[..n]).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfs::MemFs;

    fn server() -> Server {
        let fs = Arc::new(MemFs::new());
        Server::new(ServerConfig::default(), vec![Mount::new("/", fs)]).unwrap()
    }

    #[test]
    fn receive_errors_are_classified() {
        assert!(is_peer_error(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_peer_error(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_peer_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_peer_error(&io::Error::other("socket closed")));
    }

    fn mount_request() -> Vec<u8> {
        let msg = Msg {
            session: NO_SESSION,
            seq: 0,
            body: Tcall::Mount {
                version: TNFS_VERSION,
                path: "/".to_owned(),
                user: String::new(),
                password: String::new(),
            },
        };
        let mut buf = Vec::new();
        serialize::write_request(&mut buf, &msg).unwrap();
        buf
    }

    #[test]
    fn config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, TNFS_PORT);
        assert_eq!(config.udp_msg_size, 532);
        assert_eq!(config.tcp_msg_size, 4096);
        assert_eq!(config.max_files, 16);
        assert_eq!(config.max_dirs, 8);
        assert_eq!(config.bind_address(), "0.0.0.0:16384");

        let config = config.address("::1").port(9000).builtin_extensions();
        assert_eq!(config.bind_address(), "[::1]:9000");
        assert_eq!(config.extensions.len(), 2);
    }

    #[tokio::test]
    async fn malformed_datagram_is_dropped() {
        let server = server();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_udp(socket).await })
        };

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();
        client.send(&[0x00, 0x00, 0x00, 0x05]).await.unwrap();
        client.send(&mount_request()).await.unwrap();

        let mut buf = [0u8; UDP_MSG_SIZE];
        let n = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = serialize::read_reply(&mut &buf[..n]).unwrap();
        assert!(matches!(reply.body, Rcall::Mount { .. }));
        assert_eq!(server.dispatcher().sessions().len(), 1);

        task.abort();
    }

    #[tokio::test]
    async fn connection_loss_destroys_sessions() {
        let server = server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_tcp(listener).await })
        };

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&mount_request()).await.unwrap();
        // header, status, version, retry
        let mut buf = [0u8; 9];
        tokio::io::AsyncReadExt::read_exact(&mut stream, &mut buf).await.unwrap();
        let reply = serialize::read_reply(&mut &buf[..]).unwrap();
        assert!(matches!(reply.body, Rcall::Mount { .. }));
        assert_eq!(server.dispatcher().sessions().len(), 1);

        drop(stream);
        for _ in 0..100 {
            if server.dispatcher().sessions().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.dispatcher().sessions().is_empty());

        task.abort();
    }
}
