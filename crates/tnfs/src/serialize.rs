//! Serialize/deserialize TNFS messages into/from binary.
//!
//! Requests and replies share command codes, so a message can only be decoded
//! knowing its direction: use [`read_request`]/[`read_reply`].

use crate::{fcall::*, io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(pub ::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable + ?Sized>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable + ?Sized, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable + ?Sized, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for i32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_i32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

// NUL-terminated
impl Encodable for str {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.as_bytes().contains(&0) {
            return res!(io_err!(InvalidInput, "NUL byte inside string"));
        }
        w.write_all(self.as_bytes())?;
        w.write_u8(0)?;
        Ok(self.len() + 1)
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.as_str().encode(w)
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        if size > u16::MAX as usize {
            return res!(io_err!(InvalidInput, "Payload exceeds 65535 bytes"));
        }
        let bytes = (size as u16).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.mode
            << &self.uid
            << &self.gid
            << &self.size
            << &self.atime
            << &self.mtime
            << &self.ctime
            << &self.user
            << &self.group
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for DirEntry {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.flags.bits()
            << &self.size
            << &self.mtime
            << &self.ctime
            << &self.name
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Msg<Tcall> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::Tcall::*;

        let buf = Encoder::new(w) << &self.session << &self.seq << &self.body.code();

        let buf = match self.body {
            Mount {
                ref version,
                ref path,
                ref user,
                ref password,
            } => buf << version << path << user << password,
            Umount => buf,
            OpenDir { ref path } => buf << path,
            ReadDir { ref handle } => buf << handle,
            CloseDir { ref handle } => buf << handle,
            MkDir { ref path } => buf << path,
            RmDir { ref path } => buf << path,
            TellDir { ref handle } => buf << handle,
            SeekDir {
                ref handle,
                ref position,
            } => buf << handle << position,
            OpenDirX {
                ref options,
                ref sort,
                ref max_results,
                ref pattern,
                ref path,
            } => buf << &options.bits() << &sort.bits() << max_results << pattern << path,
            ReadDirX {
                ref handle,
                ref count,
            } => buf << handle << count,
            Read { ref handle, ref size } => buf << handle << size,
            Write { ref handle, ref data } => buf << handle << data,
            Close { ref handle } => buf << handle,
            Stat { ref path } => buf << path,
            LSeek {
                ref handle,
                whence,
                ref offset,
            } => buf << handle << &(whence as u8) << offset,
            Unlink { ref path } => buf << path,
            Chmod { ref mode, ref path } => buf << mode << path,
            Rename { ref from, ref to } => buf << from << to,
            Open {
                ref flags,
                ref mode,
                ref path,
            } => buf << &flags.bits() << mode << path,
            Size => buf,
            Free => buf,
            Ext { ref payload, .. } => buf << payload,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Msg<Rcall> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::Rcall::*;

        let buf = Encoder::new(w)
            << &self.session
            << &self.seq
            << &self.body.code()
            << &(self.body.result() as u8);

        let buf = match self.body {
            Mount {
                ref version,
                ref retry_ms,
            } => buf << version << retry_ms,
            // A failed MOUNT still tells the client which version we speak
            Error { code, .. } if code == Command::Mount as u8 => buf << &TNFS_VERSION,
            Error { .. } => buf,
            Umount | CloseDir | MkDir | RmDir | SeekDir | Close | Unlink | Chmod | Rename => buf,
            OpenDir { ref handle } | Open { ref handle } => buf << handle,
            ReadDir { ref name } => buf << name,
            TellDir { ref position } => buf << position,
            OpenDirX {
                ref handle,
                ref count,
            } => buf << handle << count,
            ReadDirX {
                ref status,
                ref position,
                ref entries,
            } => {
                if entries.len() > u8::MAX as usize {
                    return res!(io_err!(InvalidInput, "Too many directory entries"));
                }
                entries.iter().fold(
                    buf << &(entries.len() as u8) << &status.bits() << position,
                    |acc, e| acc << e,
                )
            }
            Read { ref data } => buf << data,
            Write { ref count } => buf << count,
            Stat { ref stat } => buf << stat,
            LSeek { ref position } => buf << position,
            Size { ref kbytes } | Free { ref kbytes } => buf << kbytes,
            Ext { ref payload, .. } => buf << payload,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for i32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_i32::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let mut bytes = Vec::new();
        loop {
            match r.read_u8()? {
                0 => break,
                b => bytes.push(b),
            }
        }
        String::from_utf8(bytes).map_err(|_| io_err!(InvalidData, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Stat {
            mode: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            size: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            ctime: Decodable::decode(r)?,
            user: Decodable::decode(r)?,
            group: Decodable::decode(r)?,
        })
    }
}

impl Decodable for DirEntry {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(DirEntry {
            flags: decode!(EntryFlags, *r),
            size: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            ctime: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
        })
    }
}

fn decode_header<R: ReadBytesExt>(r: &mut R) -> Result<(u16, u8, u8)> {
    Ok((decode!(*r), decode!(*r), decode!(*r)))
}

fn unknown_command(code: u8) -> std::io::Error {
    io_err!(InvalidData, format!("Unknown command code 0x{:02x}", code))
}

impl Decodable for Msg<Tcall> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::Command::*;

        let mut buf = r;

        let (session, seq, code) = decode_header(buf)?;
        let body = match Command::from_u8(code) {
            Some(Mount) => Tcall::Mount {
                version: decode!(buf),
                path: decode!(buf),
                user: decode!(buf),
                password: decode!(buf),
            },
            Some(Umount) => Tcall::Umount,
            Some(OpenDir) => Tcall::OpenDir { path: decode!(buf) },
            Some(ReadDir) => Tcall::ReadDir {
                handle: decode!(buf),
            },
            Some(CloseDir) => Tcall::CloseDir {
                handle: decode!(buf),
            },
            Some(MkDir) => Tcall::MkDir { path: decode!(buf) },
            Some(RmDir) => Tcall::RmDir { path: decode!(buf) },
            Some(TellDir) => Tcall::TellDir {
                handle: decode!(buf),
            },
            Some(SeekDir) => Tcall::SeekDir {
                handle: decode!(buf),
                position: decode!(buf),
            },
            Some(OpenDirX) => Tcall::OpenDirX {
                options: decode!(DirOptions, *buf),
                sort: decode!(SortOptions, *buf),
                max_results: decode!(buf),
                pattern: decode!(buf),
                path: decode!(buf),
            },
            Some(ReadDirX) => Tcall::ReadDirX {
                handle: decode!(buf),
                count: decode!(buf),
            },
            Some(Read) => Tcall::Read {
                handle: decode!(buf),
                size: decode!(buf),
            },
            Some(Write) => Tcall::Write {
                handle: decode!(buf),
                data: decode!(buf),
            },
            Some(Close) => Tcall::Close {
                handle: decode!(buf),
            },
            Some(Stat) => Tcall::Stat { path: decode!(buf) },
            Some(LSeek) => Tcall::LSeek {
                handle: decode!(buf),
                whence: {
                    let w: u8 = decode!(buf);
                    Whence::from_u8(w).ok_or_else(|| io_err!(InvalidData, "Invalid seek type"))?
                },
                offset: decode!(buf),
            },
            Some(Unlink) => Tcall::Unlink { path: decode!(buf) },
            Some(Chmod) => Tcall::Chmod {
                mode: decode!(buf),
                path: decode!(buf),
            },
            Some(Rename) => Tcall::Rename {
                from: decode!(buf),
                to: decode!(buf),
            },
            Some(Open) => Tcall::Open {
                flags: decode!(OpenFlags, *buf),
                mode: decode!(buf),
                path: decode!(buf),
            },
            Some(Size) => Tcall::Size,
            Some(Free) => Tcall::Free,
            None if Command::is_extension(code) => Tcall::Ext {
                code,
                payload: decode!(buf),
            },
            None => return Err(unknown_command(code)),
        };

        Ok(Msg { session, seq, body })
    }
}

impl Decodable for Msg<Rcall> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::Command::*;

        let mut buf = r;

        let (session, seq, code) = decode_header(buf)?;
        let status: u8 = decode!(buf);
        let result = ResultCode::from_u8(status).ok_or_else(|| {
            io_err!(InvalidData, format!("Unknown result code 0x{:02x}", status))
        })?;

        let command = Command::from_u8(code);
        if command.is_none() && !Command::is_extension(code) {
            return Err(unknown_command(code));
        }

        if !result.is_success() {
            if command == Some(Mount) {
                let _version: u16 = decode!(buf);
            }
            return Ok(Msg {
                session,
                seq,
                body: Rcall::Error { code, result },
            });
        }

        let body = match command {
            Some(Mount) => Rcall::Mount {
                version: decode!(buf),
                retry_ms: decode!(buf),
            },
            Some(Umount) => Rcall::Umount,
            Some(OpenDir) => Rcall::OpenDir {
                handle: decode!(buf),
            },
            Some(ReadDir) => Rcall::ReadDir { name: decode!(buf) },
            Some(CloseDir) => Rcall::CloseDir,
            Some(MkDir) => Rcall::MkDir,
            Some(RmDir) => Rcall::RmDir,
            Some(TellDir) => Rcall::TellDir {
                position: decode!(buf),
            },
            Some(SeekDir) => Rcall::SeekDir,
            Some(OpenDirX) => Rcall::OpenDirX {
                handle: decode!(buf),
                count: decode!(buf),
            },
            Some(ReadDirX) => {
                let count: u8 = decode!(buf);
                let status = decode!(DirStatus, *buf);
                let position = decode!(buf);
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    entries.push(decode!(buf));
                }
                Rcall::ReadDirX {
                    status,
                    position,
                    entries,
                }
            }
            Some(Read) => Rcall::Read { data: decode!(buf) },
            Some(Write) => Rcall::Write {
                count: decode!(buf),
            },
            Some(Close) => Rcall::Close,
            Some(Stat) => Rcall::Stat { stat: decode!(buf) },
            Some(LSeek) => Rcall::LSeek {
                position: decode!(buf),
            },
            Some(Unlink) => Rcall::Unlink,
            Some(Chmod) => Rcall::Chmod,
            Some(Rename) => Rcall::Rename,
            Some(Open) => Rcall::Open {
                handle: decode!(buf),
            },
            Some(Size) => Rcall::Size {
                kbytes: decode!(buf),
            },
            Some(Free) => Rcall::Free {
                kbytes: decode!(buf),
            },
            None => Rcall::Ext {
                code,
                payload: decode!(buf),
            },
        };

        Ok(Msg { session, seq, body })
    }
}

/// Helper function to read a TNFS request from a byte-oriented stream
pub fn read_request<R: ReadBytesExt>(r: &mut R) -> Result<Msg<Tcall>> {
    Decodable::decode(r)
}

/// Helper function to write a TNFS request into a byte-oriented stream
pub fn write_request<W: WriteBytesExt>(w: &mut W, msg: &Msg<Tcall>) -> Result<usize> {
    msg.encode(w)
}

/// Helper function to read a TNFS reply from a byte-oriented stream
pub fn read_reply<R: ReadBytesExt>(r: &mut R) -> Result<Msg<Rcall>> {
    Decodable::decode(r)
}

/// Helper function to write a TNFS reply into a byte-oriented stream
pub fn write_reply<W: WriteBytesExt>(w: &mut W, msg: &Msg<Rcall>) -> Result<usize> {
    msg.encode(w)
}

/// Encode an extension payload from its fields
pub fn encode_payload<F>(f: F) -> Result<Data>
where
    F: FnOnce(Encoder<&mut Vec<u8>>) -> SResult<Encoder<&mut Vec<u8>>>,
{
    let mut buf = Vec::new();
    let res = match f(Encoder::new(&mut buf)) {
        SResult(Ok(_)) => Ok(()),
        SResult(Err(e)) => Err(e),
    };
    res.map(|_| Data(buf))
}
