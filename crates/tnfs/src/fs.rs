//! Interfaces the server consumes: filesystem backends and authenticators.
//!
//! Paths handed to a backend are always absolute, normalized, and rooted at
//! the backend's own root ("/" is the root of the mount).

use {
    crate::{
        error::Error,
        fcall::{self, DirEntry, EntryFlags, OpenFlags, ResultCode, Stat},
        utils::Result,
    },
    async_trait::async_trait,
    futures::stream::BoxStream,
    tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, AsyncWriteExt},
};

/// Type of a filesystem object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum FileKind {
    #[default]
    File,
    Dir,
    /// Devices, sockets, pipes and anything else that is neither
    Special,
}

/// Attributes of a filesystem object as reported by a backend
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    pub kind: FileKind,
    /// Permission bits only, the type comes from `kind`
    pub mode: u16,
    pub size: u64,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub uid: u16,
    pub gid: u16,
    pub user: String,
    pub group: String,
    pub hidden: bool,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    /// Wire representation, with the size saturated to 32 bits
    pub fn to_stat(&self) -> Stat {
        let typ = match self.kind {
            FileKind::File => fcall::mode::S_IFREG,
            FileKind::Dir => fcall::mode::S_IFDIR,
            FileKind::Special => fcall::mode::S_IFCHR,
        };
        Stat {
            mode: typ | (self.mode & fcall::mode::PERM),
            uid: self.uid,
            gid: self.gid,
            size: saturate(self.size),
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            user: self.user.clone(),
            group: self.group.clone(),
        }
    }

    pub fn entry_flags(&self) -> EntryFlags {
        let mut flags = EntryFlags::empty();
        match self.kind {
            FileKind::Dir => flags.insert(EntryFlags::DIR),
            FileKind::Special => flags.insert(EntryFlags::SPECIAL),
            FileKind::File => {}
        }
        if self.hidden {
            flags.insert(EntryFlags::HIDDEN);
        }
        flags
    }
}

/// One row of a directory listing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub meta: Metadata,
}

impl Entry {
    pub fn new(name: impl Into<String>, meta: Metadata) -> Self {
        Entry {
            name: name.into(),
            meta,
        }
    }

    pub fn to_dir_entry(&self) -> DirEntry {
        DirEntry {
            flags: self.meta.entry_flags(),
            size: saturate(self.meta.size),
            mtime: self.meta.mtime,
            ctime: self.meta.ctime,
            name: self.name.clone(),
        }
    }
}

/// Lazy sequence of directory entries
pub type EntryStream = BoxStream<'static, Result<Entry>>;

/// An open file: a seekable byte stream
pub trait FileStream: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin {}

impl<T> FileStream for T where T: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin {}

/// Saturating conversion of a byte count to the 32 bit wire width
pub fn saturate(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Capability surface of a backing filesystem.
///
/// Every method defaults to `ENOSYS`, so a backend only implements what it
/// supports. Errors may be returned either as a result code
/// (`Error::No`) or as an `io::Error`, which the dispatcher translates.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Attributes of `path`.
    async fn stat(&self, _path: &str) -> Result<Metadata> {
        Err(Error::No(ResultCode::ENOSYS))
    }

    /// Entries of the directory at `path`, excluding `.` and `..`.
    ///
    /// The stream is consumed lazily by the directory cursor.
    async fn read_dir(&self, _path: &str) -> Result<EntryStream> {
        Err(Error::No(ResultCode::ENOSYS))
    }

    /// Open `path` with `flags`; `mode` applies when the file is created.
    async fn open(&self, _path: &str, _flags: OpenFlags, _mode: u16) -> Result<Box<dyn FileStream>> {
        Err(Error::No(ResultCode::ENOSYS))
    }

    async fn mkdir(&self, _path: &str) -> Result<()> {
        Err(Error::No(ResultCode::ENOSYS))
    }

    /// Remove the empty directory at `path`.
    async fn rmdir(&self, _path: &str) -> Result<()> {
        Err(Error::No(ResultCode::ENOSYS))
    }

    async fn rename(&self, _from: &str, _to: &str) -> Result<()> {
        Err(Error::No(ResultCode::ENOSYS))
    }

    /// Remove the file at `path`.
    async fn unlink(&self, _path: &str) -> Result<()> {
        Err(Error::No(ResultCode::ENOSYS))
    }

    async fn chmod(&self, _path: &str, _mode: u16) -> Result<()> {
        Err(Error::No(ResultCode::ENOSYS))
    }

    /// Total capacity in bytes.
    async fn size(&self) -> Result<u64> {
        Err(Error::No(ResultCode::ENOSYS))
    }

    /// Free space in bytes.
    async fn free(&self) -> Result<u64> {
        Err(Error::No(ResultCode::ENOSYS))
    }

    /// Copy the file `from` to `to`, replacing `to`.
    ///
    /// The default goes through `open`; backends with a native copy should
    /// override it.
    async fn copy(&self, from: &str, to: &str) -> Result<u64> {
        if self.stat(from).await?.is_dir() {
            return Err(Error::No(ResultCode::EISDIR));
        }
        let mut src = self.open(from, OpenFlags::RDONLY, 0).await?;
        let mut dst = self
            .open(
                to,
                OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC,
                0o644,
            )
            .await?;
        let copied = tokio::io::copy(&mut src, &mut dst).await?;
        dst.flush().await?;
        Ok(copied)
    }
}

/// An authenticated identity
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Principal {
    pub name: String,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Principal { name: name.into() }
    }
}

/// Decides whether credentials presented on MOUNT are acceptable.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the principal the credentials identify, or `None` to refuse.
    async fn authenticate(
        &self,
        fs: &dyn Filesystem,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Option<Principal>;
}
