//! In-memory filesystem backend.
//!
//! Keeps the whole tree in a map keyed by absolute path. Used as the test
//! double for the dispatcher and by the end-to-end tests, and usable as a
//! scratch export.

use std::{
    collections::BTreeMap,
    io::{self, SeekFrom},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};

use crate::{
    error::Error,
    fcall::{OpenFlags, ResultCode},
    fs::{Entry, EntryStream, FileKind, FileStream, Filesystem, Metadata},
    utils::{self, Result},
};

/// Default capacity reported by SIZE
pub const DEFAULT_CAPACITY: u64 = 64 * 1024 * 1024;

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

#[derive(Clone, Debug)]
struct Node {
    kind: FileKind,
    mode: u16,
    mtime: u32,
    ctime: u32,
    data: Arc<Mutex<Vec<u8>>>,
}

impl Node {
    fn new(kind: FileKind, mode: u16) -> Self {
        let t = now();
        Node {
            kind,
            mode,
            mtime: t,
            ctime: t,
            data: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn metadata(&self, name: &str) -> Metadata {
        Metadata {
            kind: self.kind,
            mode: self.mode,
            size: self.data.lock().len() as u64,
            atime: self.mtime,
            mtime: self.mtime,
            ctime: self.ctime,
            hidden: name.starts_with('.'),
            ..Default::default()
        }
    }
}

/// Filesystem held entirely in memory
pub struct MemFs {
    nodes: Mutex<BTreeMap<String, Node>>,
    capacity: u64,
}

impl MemFs {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: u64) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_owned(), Node::new(FileKind::Dir, 0o755));
        MemFs {
            nodes: Mutex::new(nodes),
            capacity,
        }
    }

    /// Create or replace a regular file holding `contents`.
    pub fn insert_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let path = utils::normalize_path(path);
        let mut nodes = self.nodes.lock();
        Self::check_parent(&nodes, &path)?;
        let node = Node::new(FileKind::File, 0o644);
        node.data.lock().extend_from_slice(contents);
        nodes.insert(path, node);
        Ok(())
    }

    /// Create a node that is neither a file nor a directory.
    pub fn insert_special(&self, path: &str) -> Result<()> {
        let path = utils::normalize_path(path);
        let mut nodes = self.nodes.lock();
        Self::check_parent(&nodes, &path)?;
        nodes.insert(path, Node::new(FileKind::Special, 0o600));
        Ok(())
    }

    pub fn set_mtime(&self, path: &str, mtime: u32) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(&utils::normalize_path(path))
            .ok_or(Error::No(ResultCode::ENOENT))?;
        node.mtime = mtime;
        Ok(())
    }

    /// Contents of the file at `path`
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let nodes = self.nodes.lock();
        let node = nodes.get(&utils::normalize_path(path))?;
        match node.kind {
            FileKind::File => Some(node.data.lock().clone()),
            _ => None,
        }
    }

    fn check_parent(nodes: &BTreeMap<String, Node>, path: &str) -> Result<()> {
        if path == "/" {
            return Err(Error::No(ResultCode::EEXIST));
        }
        match nodes.get(parent(path)) {
            Some(n) if n.kind == FileKind::Dir => Ok(()),
            Some(_) => Err(Error::No(ResultCode::ENOTDIR)),
            None => Err(Error::No(ResultCode::ENOENT)),
        }
    }

    fn children<'a>(
        nodes: &'a BTreeMap<String, Node>,
        dir: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Node)> + 'a {
        nodes
            .iter()
            .filter(move |(path, _)| path.as_str() != "/" && parent(path) == dir)
    }

    fn used(nodes: &BTreeMap<String, Node>) -> u64 {
        nodes.values().map(|n| n.data.lock().len() as u64).sum()
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Filesystem for MemFs {
    async fn stat(&self, path: &str) -> Result<Metadata> {
        let nodes = self.nodes.lock();
        nodes
            .get(path)
            .map(|n| n.metadata(utils::file_name(path)))
            .ok_or(Error::No(ResultCode::ENOENT))
    }

    async fn read_dir(&self, path: &str) -> Result<EntryStream> {
        let nodes = self.nodes.lock();
        match nodes.get(path) {
            Some(n) if n.kind == FileKind::Dir => {}
            Some(_) => return Err(Error::No(ResultCode::ENOTDIR)),
            None => return Err(Error::No(ResultCode::ENOENT)),
        }

        let entries: Vec<Result<Entry>> = Self::children(&nodes, path)
            .map(|(p, n)| {
                let name = utils::file_name(p);
                Ok(Entry::new(name, n.metadata(name)))
            })
            .collect();
        Ok(stream::iter(entries).boxed())
    }

    async fn open(&self, path: &str, flags: OpenFlags, mode: u16) -> Result<Box<dyn FileStream>> {
        let mut nodes = self.nodes.lock();

        let data = match nodes.get(path) {
            Some(_) if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) => {
                return Err(Error::No(ResultCode::EEXIST));
            }
            Some(n) if n.kind == FileKind::Dir => return Err(Error::No(ResultCode::EISDIR)),
            Some(n) => n.data.clone(),
            None if flags.contains(OpenFlags::CREAT) => {
                Self::check_parent(&nodes, path)?;
                let node = Node::new(FileKind::File, mode & 0o777);
                let data = node.data.clone();
                nodes.insert(path.to_owned(), node);
                data
            }
            None => return Err(Error::No(ResultCode::ENOENT)),
        };

        if flags.contains(OpenFlags::TRUNC) && flags.writable() {
            data.lock().clear();
            if let Some(n) = nodes.get_mut(path) {
                n.mtime = now();
            }
        }

        Ok(Box::new(MemFile {
            data,
            pos: 0,
            append: flags.contains(OpenFlags::APPEND),
            readable: flags.readable(),
            writable: flags.writable(),
        }))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(path) {
            return Err(Error::No(ResultCode::EEXIST));
        }
        Self::check_parent(&nodes, path)?;
        nodes.insert(path.to_owned(), Node::new(FileKind::Dir, 0o755));
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let mut nodes = self.nodes.lock();
        match nodes.get(path) {
            Some(n) if n.kind != FileKind::Dir => return Err(Error::No(ResultCode::ENOTDIR)),
            Some(_) if path == "/" => return Err(Error::No(ResultCode::EBUSY)),
            Some(_) => {}
            None => return Err(Error::No(ResultCode::ENOENT)),
        }
        if Self::children(&nodes, path).next().is_some() {
            return Err(Error::No(ResultCode::ENOTEMPTY));
        }
        nodes.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get(from).ok_or(Error::No(ResultCode::ENOENT))?;
        if from == to {
            return Ok(());
        }
        if node.kind == FileKind::Dir && to.starts_with(&format!("{}/", from)) {
            return Err(Error::No(ResultCode::EINVAL));
        }
        Self::check_parent(&nodes, to)?;
        match nodes.get(to) {
            Some(n) if n.kind == FileKind::Dir => return Err(Error::No(ResultCode::EEXIST)),
            _ => {}
        }

        let prefix = format!("{}/", from);
        let moved: Vec<String> = nodes
            .keys()
            .filter(|p| p.as_str() == from || p.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(n) = nodes.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                nodes.insert(new, n);
            }
        }
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let mut nodes = self.nodes.lock();
        match nodes.get(path) {
            Some(n) if n.kind == FileKind::Dir => Err(Error::No(ResultCode::EISDIR)),
            Some(_) => {
                nodes.remove(path);
                Ok(())
            }
            None => Err(Error::No(ResultCode::ENOENT)),
        }
    }

    async fn chmod(&self, path: &str, mode: u16) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(path).ok_or(Error::No(ResultCode::ENOENT))?;
        node.mode = mode & 0o7777;
        node.ctime = now();
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.capacity)
    }

    async fn free(&self) -> Result<u64> {
        Ok(self.capacity.saturating_sub(Self::used(&self.nodes.lock())))
    }
}

/// Open file of a [`MemFs`]
struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    pos: u64,
    append: bool,
    readable: bool,
    writable: bool,
}

impl AsyncRead for MemFile {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.readable {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::PermissionDenied)));
        }
        let n = {
            let data = self.data.lock();
            let start = (self.pos as usize).min(data.len());
            let n = buf.remaining().min(data.len() - start);
            buf.put_slice(&data[start..start + n]);
            n
        };
        self.pos += n as u64;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MemFile {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if !self.writable {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::PermissionDenied)));
        }
        let end = {
            let mut data = self.data.lock();
            let start = if self.append {
                data.len()
            } else {
                self.pos as usize
            };
            let end = start + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[start..end].copy_from_slice(buf);
            end
        };
        self.pos = end as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for MemFile {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let len = self.data.lock().len() as i64;
        let target = match position {
            SeekFrom::Start(n) => Some(n as i64),
            SeekFrom::Current(n) => (self.pos as i64).checked_add(n),
            SeekFrom::End(n) => len.checked_add(n),
        };
        match target {
            Some(t) if t >= 0 => {
                self.pos = t as u64;
                Ok(())
            }
            _ => Err(io::Error::from(io::ErrorKind::InvalidInput)),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

    #[tokio::test]
    async fn create_write_read() {
        let fs = MemFs::new();
        let mut f = fs
            .open("/a.txt", OpenFlags::RDWR | OpenFlags::CREAT, 0o644)
            .await
            .unwrap();
        f.write_all(b"hello").await.unwrap();
        f.seek(SeekFrom::Start(1)).await.unwrap();
        let mut buf = String::new();
        f.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "ello");
        assert_eq!(fs.stat("/a.txt").await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn open_flags() {
        let fs = MemFs::new();
        fs.insert_file("/a", b"abc").unwrap();

        let err = fs
            .open("/a", OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::EXCL, 0)
            .await
            .err()
            .unwrap();
        assert_eq!(err.result_code(), ResultCode::EEXIST);

        let err = fs.open("/missing", OpenFlags::RDONLY, 0).await.err().unwrap();
        assert_eq!(err.result_code(), ResultCode::ENOENT);

        let mut f = fs
            .open("/a", OpenFlags::WRONLY | OpenFlags::APPEND, 0)
            .await
            .unwrap();
        f.write_all(b"de").await.unwrap();
        assert_eq!(fs.contents("/a").unwrap(), b"abcde");

        fs.open("/a", OpenFlags::WRONLY | OpenFlags::TRUNC, 0).await.unwrap();
        assert!(fs.contents("/a").unwrap().is_empty());

        let mut f = fs.open("/a", OpenFlags::RDONLY, 0).await.unwrap();
        assert!(f.write_all(b"x").await.is_err());
    }

    #[tokio::test]
    async fn directories() {
        let fs = MemFs::new();
        fs.mkdir("/d").await.unwrap();
        fs.insert_file("/d/one", b"1").unwrap();
        fs.insert_file("/d/.hidden", b"").unwrap();
        fs.mkdir("/d/sub").await.unwrap();

        let names: Vec<String> = fs
            .read_dir("/d")
            .await
            .unwrap()
            .map(|e| e.unwrap().name)
            .collect()
            .await;
        assert_eq!(names, vec![".hidden", "one", "sub"]);

        let err = fs.rmdir("/d").await.unwrap_err();
        assert_eq!(err.result_code(), ResultCode::ENOTEMPTY);
        assert_eq!(
            fs.read_dir("/d/one").await.err().unwrap().result_code(),
            ResultCode::ENOTDIR
        );

        fs.rename("/d", "/e").await.unwrap();
        assert_eq!(fs.contents("/e/one").unwrap(), b"1");
        assert!(fs.stat("/d").await.is_err());
        assert!(fs.stat("/e/.hidden").await.unwrap().hidden);
    }

    #[tokio::test]
    async fn copy_and_space() {
        let fs = MemFs::with_capacity(4096);
        fs.insert_file("/src", &[7u8; 1000]).unwrap();
        assert_eq!(fs.copy("/src", "/dst").await.unwrap(), 1000);
        assert_eq!(fs.contents("/dst").unwrap(), vec![7u8; 1000]);
        assert_eq!(fs.size().await.unwrap(), 4096);
        assert_eq!(fs.free().await.unwrap(), 2096);

        fs.unlink("/src").await.unwrap();
        assert_eq!(
            fs.unlink("/src").await.unwrap_err().result_code(),
            ResultCode::ENOENT
        );
    }
}
