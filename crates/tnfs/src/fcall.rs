//! TNFS protocol data types and constants.
//!
//! # Protocol
//! TNFS 1.2

use std::mem::size_of;

use bitflags::bitflags;
use enum_primitive::*;

/// Protocol version spoken by this implementation (major 1, minor 2)
pub const TNFS_VERSION: u16 = 0x0102;

/// TNFS default port, shared by the UDP and TCP transports
pub const TNFS_PORT: u16 = 16384;

/// Session id a client uses before it has mounted anything
pub const NO_SESSION: u16 = 0;

/// Sequence numbers run from 0 up to and including this value, then wrap
pub const MAX_SEQUENCE: u8 = 250;

/// Default maximum message size on UDP
pub const UDP_MSG_SIZE: usize = 532;

/// Default maximum message size on TCP
pub const TCP_MSG_SIZE: usize = 4096;

/// Largest message size the PKTSIZE extension may grant
pub const MAX_MSG_SIZE: usize = 0xffff;

/// Largest payload a single IPv4 UDP datagram carries
pub const UDP_MAX_PAYLOAD: usize = 65507;

/// Message header: session[2] sequence[1] command[1]
pub const HEADER_SIZE: usize = 4;

/// Room taken by a READ reply before its data: header, status[1] size[2]
pub const IOHDRSZ: usize = HEADER_SIZE + 3;

/// Room taken by a READDIRX reply before its entries:
/// header, status[1] count[1] dirstatus[1] dirpos[2]
pub const READDIRXHDRSZ: usize = HEADER_SIZE + 5;

/// First code of the extension range
pub const EXT_BASE: u8 = 0x60;

/// Default client retry hint sent with a MOUNT reply, in milliseconds
pub const DEFAULT_RETRY_MS: u16 = 1000;

enum_from_primitive! {
    #[doc = "Command codes, TNFS operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum Command {
        // Session
        Mount           = 0x00,
        Umount          = 0x01,

        // Directories
        OpenDir         = 0x10,
        ReadDir         = 0x11,
        CloseDir        = 0x12,
        MkDir           = 0x13,
        RmDir           = 0x14,
        TellDir         = 0x15,
        SeekDir         = 0x16,
        OpenDirX        = 0x17,
        ReadDirX        = 0x18,

        // Files
        Read            = 0x21,
        Write           = 0x22,
        Close           = 0x23,
        Stat            = 0x24,
        LSeek           = 0x25,
        Unlink          = 0x26,
        Chmod           = 0x27,
        Rename          = 0x28,
        Open            = 0x29,

        // Devices
        Size            = 0x30,
        Free            = 0x31,
    }
}

impl Command {
    /// Whether `code` lies in the extension range rather than the core set.
    pub fn is_extension(code: u8) -> bool {
        code >= EXT_BASE && code != 0xff
    }

    pub fn name(&self) -> &'static str {
        use crate::Command::*;

        match *self {
            Mount => "MOUNT",
            Umount => "UMOUNT",
            OpenDir => "OPENDIR",
            ReadDir => "READDIR",
            CloseDir => "CLOSEDIR",
            MkDir => "MKDIR",
            RmDir => "RMDIR",
            TellDir => "TELLDIR",
            SeekDir => "SEEKDIR",
            OpenDirX => "OPENDIRX",
            ReadDirX => "READDIRX",
            Read => "READ",
            Write => "WRITE",
            Close => "CLOSE",
            Stat => "STAT",
            LSeek => "LSEEK",
            Unlink => "UNLINK",
            Chmod => "CHMOD",
            Rename => "RENAME",
            Open => "OPEN",
            Size => "SIZE",
            Free => "FREE",
        }
    }

    /// Every core command
    pub const ALL: [Command; 22] = [
        Command::Mount,
        Command::Umount,
        Command::OpenDir,
        Command::ReadDir,
        Command::CloseDir,
        Command::MkDir,
        Command::RmDir,
        Command::TellDir,
        Command::SeekDir,
        Command::OpenDirX,
        Command::ReadDirX,
        Command::Read,
        Command::Write,
        Command::Close,
        Command::Stat,
        Command::LSeek,
        Command::Unlink,
        Command::Chmod,
        Command::Rename,
        Command::Open,
        Command::Size,
        Command::Free,
    ];
}

enum_from_primitive! {
    #[doc = "Result codes carried in the first byte of every reply payload"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum ResultCode {
        Success         = 0x00,
        EPERM           = 0x01,
        ENOENT          = 0x02,
        EIO             = 0x03,
        ENXIO           = 0x04,
        E2BIG           = 0x05,
        EBADF           = 0x06,
        EAGAIN          = 0x07,
        ENOMEM          = 0x08,
        EACCES          = 0x09,
        EBUSY           = 0x0a,
        EEXIST          = 0x0b,
        ENOTDIR         = 0x0c,
        EISDIR          = 0x0d,
        EINVAL          = 0x0e,
        ENFILE          = 0x0f,
        EMFILE          = 0x10,
        EFBIG           = 0x11,
        ENOSPC          = 0x12,
        ESPIPE          = 0x13,
        EROFS           = 0x14,
        ENAMETOOLONG    = 0x15,
        ENOSYS          = 0x16,
        ENOTEMPTY       = 0x17,
        ELOOP           = 0x18,
        ENODATA         = 0x19,
        ENOSTR          = 0x1a,
        EPROTO          = 0x1b,
        EBADFD          = 0x1c,
        EUSERS          = 0x1d,
        ENOBUFS         = 0x1e,
        EALREADY        = 0x1f,
        ESTALE          = 0x20,
        EOF             = 0x21,
        InvalidHandle   = 0xff,
    }
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        *self == ResultCode::Success
    }

    /// Short human readable description
    pub fn description(&self) -> &'static str {
        use crate::ResultCode::*;

        match *self {
            Success => "success",
            EPERM => "operation not permitted",
            ENOENT => "no such file or directory",
            EIO => "input/output error",
            ENXIO => "no such device or address",
            E2BIG => "argument list too long",
            EBADF => "bad file descriptor",
            EAGAIN => "resource temporarily unavailable",
            ENOMEM => "cannot allocate memory",
            EACCES => "permission denied",
            EBUSY => "device or resource busy",
            EEXIST => "file exists",
            ENOTDIR => "not a directory",
            EISDIR => "is a directory",
            EINVAL => "invalid argument",
            ENFILE => "too many open files in system",
            EMFILE => "too many open files",
            EFBIG => "file too large",
            ENOSPC => "no space left on device",
            ESPIPE => "illegal seek",
            EROFS => "read-only file system",
            ENAMETOOLONG => "file name too long",
            ENOSYS => "function not implemented",
            ENOTEMPTY => "directory not empty",
            ELOOP => "too many levels of symbolic links",
            ENODATA => "no data available",
            ENOSTR => "device not a stream",
            EPROTO => "protocol error",
            EBADFD => "file descriptor in bad state",
            EUSERS => "too many users",
            ENOBUFS => "no buffer space available",
            EALREADY => "operation already in progress",
            ESTALE => "stale file handle",
            EOF => "end of file",
            InvalidHandle => "invalid handle",
        }
    }
}

bitflags! {
    /// Flags of the OPEN request
    ///
    /// # Protocol
    /// TNFS 1.2
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct OpenFlags: u16 {
        const RDONLY    = 0x0001;
        const WRONLY    = 0x0002;
        const RDWR      = 0x0003;
        const APPEND    = 0x0008;
        const CREAT     = 0x0100;
        const TRUNC     = 0x0200;
        const EXCL      = 0x0400;
    }
}

impl OpenFlags {
    pub fn readable(&self) -> bool {
        self.contains(OpenFlags::RDONLY)
    }

    pub fn writable(&self) -> bool {
        self.contains(OpenFlags::WRONLY)
    }

    /// Whether opening with these flags can modify the filesystem
    pub fn mutates(&self) -> bool {
        self.writable()
            || self.intersects(OpenFlags::APPEND | OpenFlags::CREAT | OpenFlags::TRUNC)
    }
}

bitflags! {
    /// `diropt` of OPENDIRX
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct DirOptions: u8 {
        #[doc = "Do not list directories before files"]
        const NO_FOLDERSFIRST   = 0x01;
        #[doc = "Do not skip hidden entries"]
        const NO_SKIPHIDDEN     = 0x02;
        #[doc = "Do not skip special entries"]
        const NO_SKIPSPECIAL    = 0x04;
        #[doc = "Apply the wildcard pattern to directories too"]
        const DIR_PATTERN       = 0x08;
    }
}

bitflags! {
    /// `sortopt` of OPENDIRX
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct SortOptions: u8 {
        #[doc = "Leave entries in backend order"]
        const NONE          = 0x01;
        #[doc = "Case sensitive name ordering"]
        const CASE          = 0x02;
        #[doc = "Reverse the ordering"]
        const DESCENDING    = 0x04;
        #[doc = "Order by modification time"]
        const MODIFIED      = 0x08;
        #[doc = "Order by size"]
        const SIZE          = 0x10;
    }
}

bitflags! {
    /// Flags of a READDIRX entry
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct EntryFlags: u8 {
        const DIR       = 0x01;
        const HIDDEN    = 0x02;
        const SPECIAL   = 0x04;
    }
}

bitflags! {
    /// `dirstatus` of a READDIRX reply
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct DirStatus: u8 {
        const EOF       = 0x01;
    }
}

enum_from_primitive! {
    #[doc = "`whence` of LSEEK"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum Whence {
        Set     = 0x00,
        Cur     = 0x01,
        End     = 0x02,
    }
}

/// File type bits of `Stat::mode`
pub mod mode {
    pub const S_IFMT: u16 = 0o170000;
    pub const S_IFDIR: u16 = 0o040000;
    pub const S_IFREG: u16 = 0o100000;
    pub const S_IFCHR: u16 = 0o020000;
    pub const S_IFBLK: u16 = 0o060000;
    pub const S_IFIFO: u16 = 0o010000;
    pub const S_IFSOCK: u16 = 0o140000;
    /// Permission bits
    pub const PERM: u16 = 0o7777;
}

/// File attributes as reported by STAT
///
/// # Protocol
/// TNFS 1.2
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    /// File type and permission bits
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    /// Size in bytes, saturated to 32 bits
    pub size: u32,
    /// Time of last access, seconds since the epoch
    pub atime: u32,
    /// Time of last modification
    pub mtime: u32,
    /// Time of last status change
    pub ctime: u32,
    /// Owner name
    pub user: String,
    /// Group name
    pub group: String,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.mode & mode::S_IFMT == mode::S_IFDIR
    }
}

/// One row of a READDIRX reply
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub flags: EntryFlags,
    pub size: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub name: String,
}

impl DirEntry {
    /// Encoded size of this entry
    pub fn size(&self) -> usize {
        size_of::<u8>() + size_of::<u32>() * 3 + self.name.len() + 1
    }

    pub fn is_dir(&self) -> bool {
        self.flags.contains(EntryFlags::DIR)
    }
}

/// Opaque byte payload with a 16 bit length prefix on the wire
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

/// Request messages
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Tcall {
    Mount {
        version: u16,
        path: String,
        user: String,
        password: String,
    },
    Umount,
    OpenDir {
        path: String,
    },
    ReadDir {
        handle: u8,
    },
    CloseDir {
        handle: u8,
    },
    MkDir {
        path: String,
    },
    RmDir {
        path: String,
    },
    TellDir {
        handle: u8,
    },
    SeekDir {
        handle: u8,
        position: u32,
    },
    OpenDirX {
        options: DirOptions,
        sort: SortOptions,
        max_results: u16,
        pattern: String,
        path: String,
    },
    ReadDirX {
        handle: u8,
        count: u8,
    },
    Read {
        handle: u8,
        size: u16,
    },
    Write {
        handle: u8,
        data: Data,
    },
    Close {
        handle: u8,
    },
    Stat {
        path: String,
    },
    LSeek {
        handle: u8,
        whence: Whence,
        offset: i32,
    },
    Unlink {
        path: String,
    },
    Chmod {
        mode: u16,
        path: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Open {
        flags: OpenFlags,
        mode: u16,
        path: String,
    },
    Size,
    Free,
    /// Command in the extension range, payload still encoded
    Ext {
        code: u8,
        payload: Data,
    },
}

impl Tcall {
    /// Wire code of this request
    pub fn code(&self) -> u8 {
        match Command::try_from(self) {
            Ok(cmd) => cmd as u8,
            Err(code) => code,
        }
    }
}

/// Reply messages
///
/// A reply with a non-success result is carried by `Rcall::Error`, since an
/// error reply has no payload beyond the result code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rcall {
    Mount { version: u16, retry_ms: u16 },
    Umount,
    OpenDir { handle: u8 },
    ReadDir { name: String },
    CloseDir,
    MkDir,
    RmDir,
    TellDir { position: u32 },
    SeekDir,
    OpenDirX { handle: u8, count: u16 },
    ReadDirX {
        status: DirStatus,
        position: u16,
        entries: Vec<DirEntry>,
    },
    Read { data: Data },
    Write { count: u16 },
    Close,
    Stat { stat: Stat },
    LSeek { position: u32 },
    Unlink,
    Chmod,
    Rename,
    Open { handle: u8 },
    Size { kbytes: u32 },
    Free { kbytes: u32 },
    Ext { code: u8, payload: Data },
    Error { code: u8, result: ResultCode },
}

impl Rcall {
    /// Wire code of the command this reply answers
    pub fn code(&self) -> u8 {
        match *self {
            Rcall::Ext { code, .. } | Rcall::Error { code, .. } => code,
            ref core => match Command::try_from(core) {
                Ok(cmd) => cmd as u8,
                Err(code) => code,
            },
        }
    }

    /// Result byte this reply carries
    pub fn result(&self) -> ResultCode {
        match *self {
            Rcall::Error { result, .. } => result,
            _ => ResultCode::Success,
        }
    }

    /// Build an error reply for `code`
    pub fn error(code: u8, result: ResultCode) -> Rcall {
        Rcall::Error { code, result }
    }
}

impl<'a> TryFrom<&'a Tcall> for Command {
    /// The raw code, for requests outside the core set
    type Error = u8;

    fn try_from(fcall: &'a Tcall) -> Result<Command, u8> {
        Ok(match *fcall {
            Tcall::Mount { .. } => Command::Mount,
            Tcall::Umount => Command::Umount,
            Tcall::OpenDir { .. } => Command::OpenDir,
            Tcall::ReadDir { .. } => Command::ReadDir,
            Tcall::CloseDir { .. } => Command::CloseDir,
            Tcall::MkDir { .. } => Command::MkDir,
            Tcall::RmDir { .. } => Command::RmDir,
            Tcall::TellDir { .. } => Command::TellDir,
            Tcall::SeekDir { .. } => Command::SeekDir,
            Tcall::OpenDirX { .. } => Command::OpenDirX,
            Tcall::ReadDirX { .. } => Command::ReadDirX,
            Tcall::Read { .. } => Command::Read,
            Tcall::Write { .. } => Command::Write,
            Tcall::Close { .. } => Command::Close,
            Tcall::Stat { .. } => Command::Stat,
            Tcall::LSeek { .. } => Command::LSeek,
            Tcall::Unlink { .. } => Command::Unlink,
            Tcall::Chmod { .. } => Command::Chmod,
            Tcall::Rename { .. } => Command::Rename,
            Tcall::Open { .. } => Command::Open,
            Tcall::Size => Command::Size,
            Tcall::Free => Command::Free,
            Tcall::Ext { code, .. } => return Err(code),
        })
    }
}

impl<'a> TryFrom<&'a Rcall> for Command {
    /// The raw code, for replies outside the core set
    type Error = u8;

    fn try_from(fcall: &'a Rcall) -> Result<Command, u8> {
        Ok(match *fcall {
            Rcall::Mount { .. } => Command::Mount,
            Rcall::Umount => Command::Umount,
            Rcall::OpenDir { .. } => Command::OpenDir,
            Rcall::ReadDir { .. } => Command::ReadDir,
            Rcall::CloseDir => Command::CloseDir,
            Rcall::MkDir => Command::MkDir,
            Rcall::RmDir => Command::RmDir,
            Rcall::TellDir { .. } => Command::TellDir,
            Rcall::SeekDir => Command::SeekDir,
            Rcall::OpenDirX { .. } => Command::OpenDirX,
            Rcall::ReadDirX { .. } => Command::ReadDirX,
            Rcall::Read { .. } => Command::Read,
            Rcall::Write { .. } => Command::Write,
            Rcall::Close => Command::Close,
            Rcall::Stat { .. } => Command::Stat,
            Rcall::LSeek { .. } => Command::LSeek,
            Rcall::Unlink => Command::Unlink,
            Rcall::Chmod => Command::Chmod,
            Rcall::Rename => Command::Rename,
            Rcall::Open { .. } => Command::Open,
            Rcall::Size { .. } => Command::Size,
            Rcall::Free { .. } => Command::Free,
            Rcall::Ext { code, .. } | Rcall::Error { code, .. } => {
                return Command::from_u8(code).ok_or(code);
            }
        })
    }
}

/// Envelope of every TNFS message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Msg<B> {
    /// Session id, `NO_SESSION` until mounted
    pub session: u16,
    /// Sequence number, echoed by the reply
    pub seq: u8,
    /// Message body
    pub body: B,
}

/// Next sequence number after `seq`, wrapping after `MAX_SEQUENCE`
pub fn next_seq(seq: u8) -> u8 {
    if seq >= MAX_SEQUENCE { 0 } else { seq + 1 }
}
