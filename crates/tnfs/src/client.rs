//! Asynchronous TNFS client.
//!
//! A `Client` owns one mounted session over one transport. Calls are
//! serialized on the transport, so a client can be cloned and shared between
//! tasks; each clone issues its own requests in turn.
//!
//! End of data and "not found" are ordinary outcomes here: reads return 0 at
//! end of file, directory enumeration stops, and `exists` answers false.
//! Everything else surfaces as an `Error`.

use std::{
    io::SeekFrom,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use log::info;
use tokio::sync::Mutex;

use crate::{
    error::Error,
    ext::{self, EXT_COPY, EXT_PKTSIZE},
    fcall::*,
    io_err, res,
    transport::Transport,
    utils::{self, Proto, Result},
};

/// Default reply timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings applied when mounting
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Reply timeout, `None` waits forever
    pub timeout: Option<Duration>,
    /// Empty user and password mount as guest
    pub user: String,
    pub password: String,
    /// Message size to negotiate with PKTSIZE after mounting
    pub packet_size: Option<u16>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            timeout: Some(DEFAULT_TIMEOUT),
            user: String::new(),
            password: String::new(),
            packet_size: None,
        }
    }
}

impl ClientConfig {
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn packet_size(mut self, size: u16) -> Self {
        self.packet_size = Some(size);
        self
    }
}

struct Inner {
    transport: Mutex<Transport>,
    session: u16,
    version: u16,
    retry_ms: u16,
    proto: Proto,
    msg_size: AtomicUsize,
}

/// A mounted TNFS session
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

fn unexpected(reply: Rcall) -> Error {
    Error::Protocol(format!("unexpected reply: {:?}", reply))
}

impl Client {
    /// Mount the path a `tnfs://` or `tnfs+tcp://` URI names.
    pub async fn connect(uri: &str, config: ClientConfig) -> Result<Client> {
        let endpoint = utils::parse_uri(uri)
            .ok_or_else(|| Error::Io(io_err!(InvalidInput, format!("Invalid TNFS URI: {}", uri))))?;
        let transport = Transport::connect(&endpoint, config.timeout).await?;
        Self::mount(transport, &endpoint.path, &config).await
    }

    /// Mount `path` over an already connected transport.
    pub async fn mount(mut transport: Transport, path: &str, config: &ClientConfig) -> Result<Client> {
        let reply = transport
            .call(
                NO_SESSION,
                Tcall::Mount {
                    version: TNFS_VERSION,
                    path: path.to_owned(),
                    user: config.user.clone(),
                    password: config.password.clone(),
                },
            )
            .await?;

        let (version, retry_ms) = match reply.body {
            Rcall::Mount { version, retry_ms } => (version, retry_ms),
            Rcall::Error { result, .. } => return res!(result),
            other => return Err(unexpected(other)),
        };
        info!(
            "mounted {} as session {:#06x}, server version {}.{}",
            path,
            reply.session,
            version >> 8,
            version & 0xff
        );

        let msg_size = transport.default_msg_size();
        let proto = transport.proto();
        let client = Client {
            inner: Arc::new(Inner {
                transport: Mutex::new(transport),
                session: reply.session,
                version,
                retry_ms,
                proto,
                msg_size: AtomicUsize::new(msg_size),
            }),
        };

        if let Some(size) = config.packet_size {
            client.set_packet_size(size).await?;
        }
        Ok(client)
    }

    pub fn session(&self) -> u16 {
        self.inner.session
    }

    /// Protocol version the server announced
    pub fn server_version(&self) -> u16 {
        self.inner.version
    }

    /// Retry hint the server sent on MOUNT, in milliseconds
    pub fn retry_ms(&self) -> u16 {
        self.inner.retry_ms
    }

    /// Message size currently in effect for this session
    pub fn msg_size(&self) -> usize {
        self.inner.msg_size.load(Ordering::Relaxed)
    }

    /// Largest payload one READ or WRITE can carry
    fn io_chunk(&self) -> usize {
        let msg_size = match self.inner.proto {
            Proto::Udp => self.msg_size().min(UDP_MAX_PAYLOAD),
            Proto::Tcp => self.msg_size(),
        };
        msg_size.saturating_sub(IOHDRSZ).clamp(1, u16::MAX as usize)
    }

    async fn call(&self, body: Tcall) -> Result<Rcall> {
        let reply = self
            .inner
            .transport
            .lock()
            .await
            .call(self.inner.session, body)
            .await?;
        match reply.body {
            Rcall::Error { result, .. } => res!(result),
            body => Ok(body),
        }
    }

    async fn call_ext(&self, code: u8, payload: Data) -> Result<Data> {
        match self.call(Tcall::Ext { code, payload }).await? {
            Rcall::Ext { payload, .. } => Ok(payload),
            other => Err(unexpected(other)),
        }
    }

    /// End the session. Handles still open on the server are released.
    pub async fn umount(&self) -> Result<()> {
        match self.call(Tcall::Umount).await? {
            Rcall::Umount => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn stat(&self, path: &str) -> Result<Stat> {
        match self.call(Tcall::Stat { path: path.to_owned() }).await? {
            Rcall::Stat { stat } => Ok(stat),
            other => Err(unexpected(other)),
        }
    }

    /// Whether `path` exists; "not found" is an answer, not an error.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn open(&self, path: &str, flags: OpenFlags, mode: u16) -> Result<File> {
        let body = Tcall::Open {
            flags,
            mode,
            path: path.to_owned(),
        };
        match self.call(body).await? {
            Rcall::Open { handle } => Ok(File {
                client: self.clone(),
                handle,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Create or truncate `path` for writing, mode 0644.
    pub async fn create(&self, path: &str) -> Result<File> {
        let flags = OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC;
        self.open(path, flags, 0o644).await
    }

    /// Whole contents of `path`
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.open(path, OpenFlags::RDONLY, 0).await?;
        let mut out = Vec::new();
        let res = file.read_to_end(&mut out).await;
        file.close().await?;
        res.map(|_| out)
    }

    /// Replace the contents of `path` with `data`.
    pub async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut file = self.create(path).await?;
        let res = file.write_all(data).await;
        file.close().await?;
        res
    }

    pub async fn mkdir(&self, path: &str) -> Result<()> {
        match self.call(Tcall::MkDir { path: path.to_owned() }).await? {
            Rcall::MkDir => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn rmdir(&self, path: &str) -> Result<()> {
        match self.call(Tcall::RmDir { path: path.to_owned() }).await? {
            Rcall::RmDir => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn unlink(&self, path: &str) -> Result<()> {
        match self.call(Tcall::Unlink { path: path.to_owned() }).await? {
            Rcall::Unlink => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let body = Tcall::Rename {
            from: from.to_owned(),
            to: to.to_owned(),
        };
        match self.call(body).await? {
            Rcall::Rename => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn chmod(&self, path: &str, mode: u16) -> Result<()> {
        let body = Tcall::Chmod {
            mode,
            path: path.to_owned(),
        };
        match self.call(body).await? {
            Rcall::Chmod => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Size of the mounted filesystem in KiB
    pub async fn size(&self) -> Result<u32> {
        match self.call(Tcall::Size).await? {
            Rcall::Size { kbytes } => Ok(kbytes),
            other => Err(unexpected(other)),
        }
    }

    /// Free space on the mounted filesystem in KiB
    pub async fn free(&self) -> Result<u32> {
        match self.call(Tcall::Free).await? {
            Rcall::Free { kbytes } => Ok(kbytes),
            other => Err(unexpected(other)),
        }
    }

    /// Open a READDIR cursor over `path`.
    pub async fn open_dir(&self, path: &str) -> Result<Dir> {
        match self.call(Tcall::OpenDir { path: path.to_owned() }).await? {
            Rcall::OpenDir { handle } => Ok(Dir {
                client: self.clone(),
                handle,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Names in `path`, in server order
    pub async fn read_dir(&self, path: &str) -> Result<Vec<String>> {
        let mut dir = self.open_dir(path).await?;
        let mut names = Vec::new();
        let res = loop {
            match dir.next_name().await {
                Ok(Some(name)) => names.push(name),
                Ok(None) => break Ok(names),
                Err(e) => break Err(e),
            }
        };
        dir.close().await?;
        res
    }

    /// Open an OPENDIRX listing of `path`.
    pub async fn list(&self, path: &str, options: &ListOptions) -> Result<Listing> {
        let body = Tcall::OpenDirX {
            options: options.options,
            sort: options.sort,
            max_results: options.max_results,
            pattern: options.pattern.clone(),
            path: path.to_owned(),
        };
        match self.call(body).await? {
            Rcall::OpenDirX { handle, count } => Ok(Listing {
                client: self.clone(),
                handle,
                total: count,
                done: false,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Every entry of `path` under `options`, fetched page by page
    pub async fn list_all(&self, path: &str, options: &ListOptions) -> Result<Vec<DirEntry>> {
        let mut listing = self.list(path, options).await?;
        let res = listing.collect().await;
        listing.close().await?;
        res
    }

    /// Copy `from` to `to` on the server. Returns the bytes copied.
    pub async fn copy(&self, from: &str, to: &str) -> Result<u32> {
        let payload = self.call_ext(EXT_COPY, ext::copy_request(from, to)?).await?;
        ext::reply_field(&payload)
    }

    /// Ask for a different message size; returns the size granted.
    pub async fn set_packet_size(&self, desired: u16) -> Result<u16> {
        let payload = self.call_ext(EXT_PKTSIZE, ext::pktsize_request(desired)?).await?;
        let granted: u16 = ext::reply_field(&payload)?;
        self.inner.msg_size.store(granted as usize, Ordering::Relaxed);
        Ok(granted)
    }
}

/// An open remote file.
///
/// The handle stays open on the server until `close` or `umount`.
pub struct File {
    client: Client,
    handle: u8,
}

impl File {
    pub fn handle(&self) -> u8 {
        self.handle
    }

    /// Read at most `buf.len()` bytes with a single READ; 0 at end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let size = buf.len().min(self.client.io_chunk()) as u16;
        let body = Tcall::Read {
            handle: self.handle,
            size,
        };
        match self.client.call(body).await {
            Ok(Rcall::Read { data }) => {
                let n = data.0.len().min(buf.len());
                buf[..n].copy_from_slice(&data.0[..n]);
                Ok(n)
            }
            Ok(other) => Err(unexpected(other)),
            Err(e) if e.is_eof() => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Read until end of file, appending to `out`.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut buf = vec![0; self.client.io_chunk()];
        let start = out.len();
        loop {
            match self.read(&mut buf).await? {
                0 => return Ok(out.len() - start),
                n => out.extend_from_slice(&buf[..n]),
            }
        }
    }

    /// Write a prefix of `data` with a single WRITE; returns its length.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let n = data.len().min(self.client.io_chunk());
        let body = Tcall::Write {
            handle: self.handle,
            data: Data(data[..n].to_vec()),
        };
        match self.client.call(body).await? {
            Rcall::Write { count } => Ok(count as usize),
            other => Err(unexpected(other)),
        }
    }

    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match self.write(data).await? {
                0 => return res!(io_err!(WriteZero, "Server accepted no bytes")),
                n => data = &data[n.min(data.len())..],
            }
        }
        Ok(())
    }

    /// Reposition the server side cursor; returns the new position.
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let (whence, offset) = match pos {
            SeekFrom::Start(n) => (Whence::Set, i32::try_from(n).ok()),
            SeekFrom::Current(n) => (Whence::Cur, i32::try_from(n).ok()),
            SeekFrom::End(n) => (Whence::End, i32::try_from(n).ok()),
        };
        let offset = offset.ok_or(Error::No(ResultCode::EINVAL))?;
        let body = Tcall::LSeek {
            handle: self.handle,
            whence,
            offset,
        };
        match self.client.call(body).await? {
            Rcall::LSeek { position } => Ok(position as u64),
            other => Err(unexpected(other)),
        }
    }

    pub async fn close(self) -> Result<()> {
        match self.client.call(Tcall::Close { handle: self.handle }).await? {
            Rcall::Close => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

/// A READDIR cursor
pub struct Dir {
    client: Client,
    handle: u8,
}

impl Dir {
    pub fn handle(&self) -> u8 {
        self.handle
    }

    /// Next name, `None` once the directory is exhausted
    pub async fn next_name(&mut self) -> Result<Option<String>> {
        match self.client.call(Tcall::ReadDir { handle: self.handle }).await {
            Ok(Rcall::ReadDir { name }) => Ok(Some(name)),
            Ok(other) => Err(unexpected(other)),
            Err(e) if e.is_eof() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn tell(&self) -> Result<u32> {
        match self.client.call(Tcall::TellDir { handle: self.handle }).await? {
            Rcall::TellDir { position } => Ok(position),
            other => Err(unexpected(other)),
        }
    }

    pub async fn seek(&mut self, position: u32) -> Result<()> {
        let body = Tcall::SeekDir {
            handle: self.handle,
            position,
        };
        match self.client.call(body).await? {
            Rcall::SeekDir => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn close(self) -> Result<()> {
        match self.client.call(Tcall::CloseDir { handle: self.handle }).await? {
            Rcall::CloseDir => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

/// Filters and ordering of an OPENDIRX listing
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    pub options: DirOptions,
    pub sort: SortOptions,
    /// 0 for no limit
    pub max_results: u16,
    /// Glob, empty matches everything
    pub pattern: String,
}

impl ListOptions {
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    pub fn options(mut self, options: DirOptions) -> Self {
        self.options = options;
        self
    }

    pub fn sort(mut self, sort: SortOptions) -> Self {
        self.sort = sort;
        self
    }

    pub fn max_results(mut self, max: u16) -> Self {
        self.max_results = max;
        self
    }
}

/// An OPENDIRX cursor, read in pages with READDIRX
pub struct Listing {
    client: Client,
    handle: u8,
    total: u16,
    done: bool,
}

impl Listing {
    pub fn handle(&self) -> u8 {
        self.handle
    }

    /// Number of entries the server selected
    pub fn total(&self) -> u16 {
        self.total
    }

    /// Next page of at most `count` entries (0 lets the server fill the
    /// message); `None` once the listing is exhausted.
    pub async fn next_page(&mut self, count: u8) -> Result<Option<Vec<DirEntry>>> {
        if self.done {
            return Ok(None);
        }
        let body = Tcall::ReadDirX {
            handle: self.handle,
            count,
        };
        match self.client.call(body).await {
            Ok(Rcall::ReadDirX { status, entries, .. }) => {
                if status.contains(DirStatus::EOF) || entries.is_empty() {
                    self.done = true;
                }
                Ok(Some(entries))
            }
            Ok(other) => Err(unexpected(other)),
            Err(e) if e.is_eof() => {
                self.done = true;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Remaining entries, in listing order
    pub async fn collect(&mut self) -> Result<Vec<DirEntry>> {
        let mut all = Vec::with_capacity(self.total as usize);
        while let Some(page) = self.next_page(0).await? {
            all.extend(page);
        }
        Ok(all)
    }

    pub async fn tell(&self) -> Result<u32> {
        match self.client.call(Tcall::TellDir { handle: self.handle }).await? {
            Rcall::TellDir { position } => Ok(position),
            other => Err(unexpected(other)),
        }
    }

    /// Reposition the cursor; paging resumes from `position`.
    pub async fn seek(&mut self, position: u32) -> Result<()> {
        let body = Tcall::SeekDir {
            handle: self.handle,
            position,
        };
        match self.client.call(body).await? {
            Rcall::SeekDir => {
                self.done = false;
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn close(self) -> Result<()> {
        match self.client.call(Tcall::CloseDir { handle: self.handle }).await? {
            Rcall::CloseDir => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
