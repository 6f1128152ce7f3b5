//! Routing of decoded requests to their handlers.
//!
//! Every request goes through the same steps: pre-processors, command table
//! lookup, session and authentication checks, the handler, post-processors.
//! Handler failures become error replies here; only an unregistered command
//! escapes as an `Err`, and that is fatal to the exchange.

use std::{cmp::Ordering, collections::HashMap, fmt, io::SeekFrom, sync::Arc};

use futures::TryStreamExt;
use glob::{MatchOptions, Pattern};
use log::{debug, error};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::{
    access::Access,
    codec,
    error::Error,
    ext::{self, Extension},
    fcall::*,
    fs::{Entry, saturate},
    session::{DirCursor, Mount, OpenFile, Origin, Session, SessionInit, SessionTable, find_mount},
    srv::ServerConfig,
    utils::Result,
};

/// Hook run over every request before dispatch and every reply after it.
pub trait Processor: Send + Sync + fmt::Debug {
    fn pre(&self, _request: &mut Msg<Tcall>) {}

    fn post(&self, _request: &Msg<Tcall>, _reply: &mut Msg<Rcall>) {}
}

#[derive(Clone, Debug)]
enum Handler {
    Core(Command),
    Ext(Arc<dyn Extension>),
}

/// How a command code is handled
#[derive(Clone, Debug)]
pub struct Registration {
    pub name: &'static str,
    pub requires_session: bool,
    pub requires_auth: bool,
    handler: Handler,
}

/// Map from command code to handler, built once per server
#[derive(Clone, Debug)]
pub struct CommandTable {
    entries: HashMap<u8, Registration>,
}

impl CommandTable {
    /// Table holding every core command
    pub fn new() -> Self {
        let entries = Command::ALL
            .iter()
            .map(|&cmd| {
                let reg = Registration {
                    name: cmd.name(),
                    requires_session: cmd != Command::Mount,
                    requires_auth: false,
                    handler: Handler::Core(cmd),
                };
                (cmd as u8, reg)
            })
            .collect();
        CommandTable { entries }
    }

    /// Register an extension. Codes of the core set, and codes already
    /// taken, are refused.
    pub fn register(&mut self, ext: Arc<dyn Extension>) -> Result<()> {
        let code = ext.code();
        if !Command::is_extension(code) {
            return Err(Error::Protocol(format!(
                "{} uses 0x{:02x}, outside the extension range",
                ext.name(),
                code
            )));
        }
        if self.entries.contains_key(&code) {
            return Err(Error::Protocol(format!(
                "{} uses 0x{:02x}, already registered",
                ext.name(),
                code
            )));
        }

        let reg = Registration {
            name: ext.name(),
            requires_session: true,
            requires_auth: ext.requires_auth(),
            handler: Handler::Ext(ext),
        };
        self.entries.insert(code, reg);
        Ok(())
    }

    pub fn get(&self, code: u8) -> Option<&Registration> {
        self.entries.get(&code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply the OPENDIRX selection: skip rules, wildcard, ordering and cap.
pub fn select_entries(
    mut entries: Vec<Entry>,
    options: DirOptions,
    sort: SortOptions,
    pattern: Option<&Pattern>,
    max_results: u16,
) -> Vec<Entry> {
    let match_options = MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };

    entries.retain(|e| {
        let flags = e.meta.entry_flags();
        let hidden = flags.contains(EntryFlags::HIDDEN) || e.name.starts_with('.');
        if hidden && !options.contains(DirOptions::NO_SKIPHIDDEN) {
            return false;
        }
        if flags.contains(EntryFlags::SPECIAL) && !options.contains(DirOptions::NO_SKIPSPECIAL) {
            return false;
        }
        match pattern {
            Some(p) if !e.meta.is_dir() || options.contains(DirOptions::DIR_PATTERN) => {
                p.matches_with(&e.name, match_options)
            }
            _ => true,
        }
    });

    let folders_first = !options.contains(DirOptions::NO_FOLDERSFIRST);
    let keyed = !sort.contains(SortOptions::NONE);
    let by_name = |a: &Entry, b: &Entry| {
        if sort.contains(SortOptions::CASE) {
            a.name.cmp(&b.name)
        } else {
            a.name.to_lowercase().cmp(&b.name.to_lowercase())
        }
    };

    entries.sort_by(|a, b| {
        let dirs = match folders_first {
            true => b.meta.is_dir().cmp(&a.meta.is_dir()),
            false => Ordering::Equal,
        };
        let key = if !keyed {
            Ordering::Equal
        } else if sort.contains(SortOptions::MODIFIED) {
            a.meta.mtime.cmp(&b.meta.mtime).then_with(|| by_name(a, b))
        } else if sort.contains(SortOptions::SIZE) {
            a.meta.size.cmp(&b.meta.size).then_with(|| by_name(a, b))
        } else {
            by_name(a, b)
        };
        let key = match sort.contains(SortOptions::DESCENDING) {
            true => key.reverse(),
            false => key,
        };
        dirs.then(key)
    });

    if max_results > 0 {
        entries.truncate(max_results as usize);
    }
    entries
}

/// Server state shared by every transport: mounts, sessions, commands
pub struct Dispatcher {
    config: ServerConfig,
    mounts: Vec<Arc<Mount>>,
    sessions: SessionTable,
    commands: CommandTable,
}

impl Dispatcher {
    pub fn new(config: ServerConfig, mounts: Vec<Mount>) -> Result<Self> {
        let mut commands = CommandTable::new();
        for ext in &config.extensions {
            commands.register(ext.clone())?;
        }

        Ok(Dispatcher {
            config,
            mounts: mounts.into_iter().map(Arc::new).collect(),
            sessions: SessionTable::new(),
            commands,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    /// Drop every session created over `origin`.
    pub fn disconnect(&self, origin: Origin) -> usize {
        let n = self.sessions.remove_origin(origin);
        if n > 0 {
            debug!("{:?} closed, {} session(s) destroyed", origin, n);
        }
        n
    }

    /// Dispatch `request` and encode the reply into `out`, returning its
    /// length.
    ///
    /// A request repeating the sequence number and command of its session's
    /// last exchange is answered from that exchange without running again.
    pub async fn handle(&self, request: Msg<Tcall>, origin: Origin, out: &mut [u8]) -> Result<usize> {
        let seq = request.seq;
        let code = request.body.code();

        if let Some(session) = self.session_of(request.session) {
            if let Some(cached) = session.replay(seq, code) {
                debug!("session {:#06x}: resending reply to seq {}", session.id(), seq);
                if cached.len() > out.len() {
                    return Err(Error::No(ResultCode::ENOBUFS));
                }
                out[..cached.len()].copy_from_slice(&cached);
                return Ok(cached.len());
            }
        }

        let reply = self.dispatch(request, origin).await?;
        debug!("\t→ {:?}", reply);
        let len = match codec::encode_reply_into(out, &reply) {
            Ok(len) => len,
            Err(e) => {
                error!("{:?}: failed to encode reply: {}", reply.body, e);
                let fallback = Msg {
                    session: reply.session,
                    seq: reply.seq,
                    body: Rcall::error(code, ResultCode::EIO),
                };
                codec::encode_reply_into(out, &fallback)?
            }
        };

        if let Some(session) = self.session_of(reply.session) {
            session.remember(seq, code, &out[..len]);
        }
        Ok(len)
    }

    /// Run one request through the pipeline and build its reply.
    pub async fn dispatch(&self, request: Msg<Tcall>, origin: Origin) -> Result<Msg<Rcall>> {
        let mut request = request;
        for p in &self.config.processors {
            p.pre(&mut request);
        }

        let code = request.body.code();
        let reg = self
            .commands
            .get(code)
            .ok_or_else(|| Error::Protocol(format!("unregistered command 0x{:02x}", code)))?;

        let session = self.session_of(request.session);
        let mut reply_session = request.session;

        let result = match (&reg.handler, session) {
            (Handler::Core(Command::Mount), _) => match self.mount(&request.body, origin).await {
                Ok((id, rcall)) => {
                    reply_session = id;
                    Ok(rcall)
                }
                Err(e) => Err(e),
            },
            (_, None) if reg.requires_session => Err(Error::No(ResultCode::EINVAL)),
            (_, Some(ref s)) if reg.requires_auth && s.principal().is_none() => {
                Err(Error::No(ResultCode::EINVAL))
            }
            (_, Some(s)) => self.invoke(reg, &s, &request.body).await,
            (_, None) => Err(Error::No(ResultCode::EINVAL)),
        };

        let body = result.unwrap_or_else(|e| {
            match e {
                Error::No(ResultCode::EOF) => {}
                Error::No(ref c) => debug!("{}: {}", reg.name, c.description()),
                ref e => error!("{}: Error: \"{}\": {:?}", reg.name, e, e),
            }
            Rcall::error(code, e.result_code())
        });

        let mut reply = Msg {
            session: reply_session,
            seq: request.seq,
            body,
        };
        for p in &self.config.processors {
            p.post(&request, &mut reply);
        }
        Ok(reply)
    }

    fn session_of(&self, id: u16) -> Option<Arc<Session>> {
        match id {
            NO_SESSION => None,
            id => self.sessions.get(id),
        }
    }

    fn default_msg_size(&self, origin: Origin) -> usize {
        match origin {
            Origin::Datagram => self.config.udp_msg_size,
            Origin::Stream(_) => self.config.tcp_msg_size,
        }
    }

    /// Largest message a session on `origin` may negotiate
    fn max_msg_size(&self, origin: Origin) -> usize {
        match origin {
            Origin::Datagram => self.config.max_msg_size.min(self.config.udp_max_msg_size),
            Origin::Stream(_) => self.config.max_msg_size,
        }
    }

    #[rustfmt::skip]
    async fn invoke(&self, reg: &Registration, session: &Session, body: &Tcall) -> Result<Rcall> {
        use crate::Tcall::*;

        match *body {
            Mount { .. }                                                => Err(Error::No(ResultCode::EINVAL)),
            Umount                                                      => self.umount(session),
            OpenDir { ref path }                                        => self.opendir(session, path).await,
            ReadDir { handle }                                          => self.readdir(session, handle).await,
            CloseDir { handle }                                         => self.closedir(session, handle),
            MkDir { ref path }                                          => self.mkdir(session, path).await,
            RmDir { ref path }                                          => self.rmdir(session, path).await,
            TellDir { handle }                                          => self.telldir(session, handle).await,
            SeekDir { handle, position }                                => self.seekdir(session, handle, position).await,
            OpenDirX { options, sort, max_results, ref pattern, ref path } => self.opendirx(session, options, sort, max_results, pattern, path).await,
            ReadDirX { handle, count }                                  => self.readdirx(session, handle, count).await,
            Read { handle, size }                                       => self.read(session, handle, size).await,
            Write { handle, ref data }                                  => self.write(session, handle, data).await,
            Close { handle }                                            => self.close(session, handle).await,
            Stat { ref path }                                           => self.stat(session, path).await,
            LSeek { handle, whence, offset }                            => self.lseek(session, handle, whence, offset).await,
            Unlink { ref path }                                         => self.unlink(session, path).await,
            Chmod { mode, ref path }                                    => self.chmod(session, mode, path).await,
            Rename { ref from, ref to }                                 => self.rename(session, from, to).await,
            Open { flags, mode, ref path }                              => self.open(session, flags, mode, path).await,
            Size                                                        => self.size(session).await,
            Free                                                        => self.free(session).await,
            Ext { code, ref payload }                                   => self.extension(reg, session, code, payload).await,
        }
    }

    async fn mount(&self, body: &Tcall, origin: Origin) -> Result<(u16, Rcall)> {
        let Tcall::Mount {
            version,
            ref path,
            ref user,
            ref password,
        } = *body
        else {
            return Err(Error::No(ResultCode::EINVAL));
        };
        debug!("mount {:?} (client version {:#06x})", path, version);

        let (mount, root) = find_mount(&self.mounts, path).ok_or(Error::No(ResultCode::ENOENT))?;

        let principal = match (user.as_str(), password.as_str()) {
            ("", "") => None,
            (user, password) => {
                let auth = mount.authenticator().ok_or(Error::No(ResultCode::EACCES))?;
                let principal = auth
                    .authenticate(
                        mount.fs().as_ref(),
                        Some(user).filter(|s| !s.is_empty()),
                        Some(password).filter(|s| !s.is_empty()),
                    )
                    .await
                    .ok_or(Error::No(ResultCode::EACCES))?;
                Some(principal)
            }
        };

        if mount.policy().allows(principal.as_ref(), Access::Read) {
            match mount.fs().stat(&root).await {
                Ok(meta) if !meta.is_dir() => return Err(Error::No(ResultCode::ENOTDIR)),
                Err(e) if e.result_code() != ResultCode::ENOSYS => return Err(e),
                _ => {}
            }
        }

        let session = self.sessions.create(SessionInit {
            mount: mount.clone(),
            root,
            principal,
            origin,
            msg_size: self.default_msg_size(origin),
            max_files: self.config.max_files,
            max_dirs: self.config.max_dirs,
        })?;

        Ok((
            session.id(),
            Rcall::Mount {
                version: TNFS_VERSION,
                retry_ms: self.config.retry_ms,
            },
        ))
    }

    fn umount(&self, session: &Session) -> Result<Rcall> {
        self.sessions
            .remove(session.id())
            .ok_or(Error::No(ResultCode::EINVAL))?;
        Ok(Rcall::Umount)
    }

    async fn opendir(&self, session: &Session, path: &str) -> Result<Rcall> {
        session.authorize(Access::Read)?;
        if session.dirs.len() >= session.dirs.capacity() {
            return Err(Error::No(ResultCode::EMFILE));
        }

        let path = session.resolve(path);
        let entries = session.fs().read_dir(&path).await?;
        let handle = session.dirs.insert(DirCursor::new(path, entries))?;
        Ok(Rcall::OpenDir { handle })
    }

    async fn readdir(&self, session: &Session, handle: u8) -> Result<Rcall> {
        session.authorize(Access::Read)?;
        let cursor = session.dirs.get(handle)?;
        let mut cursor = cursor.lock().await;
        match cursor.next_entry().await? {
            Some(entry) => Ok(Rcall::ReadDir { name: entry.name }),
            None => Err(Error::No(ResultCode::EOF)),
        }
    }

    fn closedir(&self, session: &Session, handle: u8) -> Result<Rcall> {
        session.dirs.remove(handle)?;
        Ok(Rcall::CloseDir)
    }

    async fn telldir(&self, session: &Session, handle: u8) -> Result<Rcall> {
        session.authorize(Access::Read)?;
        let cursor = session.dirs.get(handle)?;
        let position = cursor.lock().await.tell();
        Ok(Rcall::TellDir {
            position: position as u32,
        })
    }

    async fn seekdir(&self, session: &Session, handle: u8, position: u32) -> Result<Rcall> {
        session.authorize(Access::Read)?;
        let cursor = session.dirs.get(handle)?;
        cursor.lock().await.seek(position as usize).await?;
        Ok(Rcall::SeekDir)
    }

    async fn opendirx(
        &self,
        session: &Session,
        options: DirOptions,
        sort: SortOptions,
        max_results: u16,
        pattern: &str,
        path: &str,
    ) -> Result<Rcall> {
        session.authorize(Access::Read)?;
        if session.dirs.len() >= session.dirs.capacity() {
            return Err(Error::No(ResultCode::EMFILE));
        }

        let pattern = match pattern {
            "" => None,
            p => Some(Pattern::new(p).map_err(|_| Error::No(ResultCode::EINVAL))?),
        };

        let path = session.resolve(path);
        let entries: Vec<Entry> = session.fs().read_dir(&path).await?.try_collect().await?;
        let entries = select_entries(entries, options, sort, pattern.as_ref(), max_results);
        let count = entries.len().min(u16::MAX as usize) as u16;

        let handle = session.dirs.insert(DirCursor::with_entries(path, entries))?;
        Ok(Rcall::OpenDirX { handle, count })
    }

    async fn readdirx(&self, session: &Session, handle: u8, count: u8) -> Result<Rcall> {
        session.authorize(Access::Read)?;
        let cursor = session.dirs.get(handle)?;
        let mut cursor = cursor.lock().await;

        if cursor.at_end().await? {
            return Err(Error::No(ResultCode::EOF));
        }

        let position = cursor.tell().min(u16::MAX as usize) as u16;
        let wanted = match count {
            0 => u8::MAX as usize,
            n => n as usize,
        };
        let budget = session.msg_size().saturating_sub(READDIRXHDRSZ);

        let mut used = 0;
        let mut entries = Vec::new();
        while entries.len() < wanted {
            let entry = match cursor.peek().await? {
                Some(e) => e.to_dir_entry(),
                None => break,
            };
            if used + entry.size() > budget {
                break;
            }
            used += entry.size();
            entries.push(entry);
            cursor.next_entry().await?;
        }

        if entries.is_empty() {
            return Err(Error::No(ResultCode::ENOBUFS));
        }

        let status = match cursor.at_end().await? {
            true => DirStatus::EOF,
            false => DirStatus::empty(),
        };
        Ok(Rcall::ReadDirX {
            status,
            position,
            entries,
        })
    }

    async fn read(&self, session: &Session, handle: u8, size: u16) -> Result<Rcall> {
        session.authorize(Access::Read)?;
        let file = session.files.get(handle)?;
        let mut file = file.lock().await;
        if !file.flags.readable() {
            return Err(Error::No(ResultCode::EBADF));
        }

        let size = (size as usize).min(session.msg_size().saturating_sub(IOHDRSZ));
        let mut buf = vec![0; size];
        let mut filled = 0;
        while filled < size {
            let n = file.stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 && size > 0 {
            return Err(Error::No(ResultCode::EOF));
        }
        buf.truncate(filled);
        Ok(Rcall::Read { data: Data(buf) })
    }

    async fn write(&self, session: &Session, handle: u8, data: &Data) -> Result<Rcall> {
        session.authorize(Access::Write)?;
        let file = session.files.get(handle)?;
        let mut file = file.lock().await;
        if !file.flags.writable() {
            return Err(Error::No(ResultCode::EBADF));
        }

        file.stream.write_all(&data.0).await?;
        Ok(Rcall::Write {
            count: data.0.len() as u16,
        })
    }

    async fn close(&self, session: &Session, handle: u8) -> Result<Rcall> {
        let file = session.files.remove(handle)?;
        let mut file = file.lock().await;
        file.stream.flush().await?;
        Ok(Rcall::Close)
    }

    async fn stat(&self, session: &Session, path: &str) -> Result<Rcall> {
        session.authorize(Access::Read)?;
        let meta = session.fs().stat(&session.resolve(path)).await?;
        Ok(Rcall::Stat {
            stat: meta.to_stat(),
        })
    }

    async fn lseek(&self, session: &Session, handle: u8, whence: Whence, offset: i32) -> Result<Rcall> {
        session.authorize(Access::Read)?;
        let file = session.files.get(handle)?;
        let mut file = file.lock().await;

        let pos = match whence {
            Whence::Set if offset < 0 => return Err(Error::No(ResultCode::EINVAL)),
            Whence::Set => SeekFrom::Start(offset as u64),
            Whence::Cur => SeekFrom::Current(offset as i64),
            Whence::End => SeekFrom::End(offset as i64),
        };
        let position = file.stream.seek(pos).await?;
        Ok(Rcall::LSeek {
            position: saturate(position),
        })
    }

    async fn mkdir(&self, session: &Session, path: &str) -> Result<Rcall> {
        session.authorize(Access::Write)?;
        session.fs().mkdir(&session.resolve(path)).await?;
        Ok(Rcall::MkDir)
    }

    async fn rmdir(&self, session: &Session, path: &str) -> Result<Rcall> {
        session.authorize(Access::Write)?;
        session.fs().rmdir(&session.resolve(path)).await?;
        Ok(Rcall::RmDir)
    }

    async fn unlink(&self, session: &Session, path: &str) -> Result<Rcall> {
        session.authorize(Access::Write)?;
        session.fs().unlink(&session.resolve(path)).await?;
        Ok(Rcall::Unlink)
    }

    async fn chmod(&self, session: &Session, mode: u16, path: &str) -> Result<Rcall> {
        session.authorize(Access::Write)?;
        session.fs().chmod(&session.resolve(path), mode).await?;
        Ok(Rcall::Chmod)
    }

    async fn rename(&self, session: &Session, from: &str, to: &str) -> Result<Rcall> {
        session.authorize(Access::Write)?;
        session
            .fs()
            .rename(&session.resolve(from), &session.resolve(to))
            .await?;
        Ok(Rcall::Rename)
    }

    async fn open(&self, session: &Session, flags: OpenFlags, mode: u16, path: &str) -> Result<Rcall> {
        if !flags.intersects(OpenFlags::RDWR) {
            return Err(Error::No(ResultCode::EINVAL));
        }
        session.authorize(Access::Read)?;
        if flags.mutates() {
            session.authorize(Access::Write)?;
        }
        if session.files.len() >= session.files.capacity() {
            return Err(Error::No(ResultCode::EMFILE));
        }

        let path = session.resolve(path);
        let stream = session.fs().open(&path, flags, mode).await?;
        let handle = session.files.insert(OpenFile { path, flags, stream })?;
        Ok(Rcall::Open { handle })
    }

    async fn size(&self, session: &Session) -> Result<Rcall> {
        session.authorize(Access::Read)?;
        let bytes = session.fs().size().await?;
        Ok(Rcall::Size {
            kbytes: saturate(bytes / 1024),
        })
    }

    async fn free(&self, session: &Session) -> Result<Rcall> {
        session.authorize(Access::Read)?;
        let bytes = session.fs().free().await?;
        Ok(Rcall::Free {
            kbytes: saturate(bytes / 1024),
        })
    }

    async fn extension(&self, reg: &Registration, session: &Session, code: u8, payload: &Data) -> Result<Rcall> {
        let Handler::Ext(ref ext) = reg.handler else {
            return Err(Error::No(ResultCode::ENOSYS));
        };

        let ctx = ext::Context {
            session,
            origin: session.origin(),
            max_msg_size: self.max_msg_size(session.origin()),
        };
        let payload = ext.handle(&ctx, &payload.0).await?;
        Ok(Rcall::Ext { code, payload })
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("mounts", &self.mounts)
            .field("sessions", &self.sessions.len())
            .field("commands", &self.commands.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        access::PolicyKind,
        fs::{Authenticator, FileKind, Filesystem, Metadata, Principal},
        memfs::MemFs,
        serialize,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};

    struct Fixed;

    #[async_trait]
    impl Authenticator for Fixed {
        async fn authenticate(
            &self,
            _fs: &dyn Filesystem,
            user: Option<&str>,
            password: Option<&str>,
        ) -> Option<Principal> {
            (user == Some("alice") && password == Some("secret")).then(|| Principal::new("alice"))
        }
    }

    fn dispatcher_with(config: ServerConfig, policy: PolicyKind) -> (Arc<MemFs>, Dispatcher) {
        let fs = Arc::new(MemFs::new());
        let mount = Mount::new("/", fs.clone())
            .with_policy(policy.build())
            .with_authenticator(Arc::new(Fixed));
        (fs, Dispatcher::new(config, vec![mount]).unwrap())
    }

    fn dispatcher() -> (Arc<MemFs>, Dispatcher) {
        dispatcher_with(ServerConfig::default().builtin_extensions(), PolicyKind::ReadWrite)
    }

    async fn call(d: &Dispatcher, session: u16, body: Tcall) -> Rcall {
        d.dispatch(Msg { session, seq: 0, body }, Origin::Datagram)
            .await
            .unwrap()
            .body
    }

    async fn mount_as(d: &Dispatcher, user: &str, password: &str) -> Msg<Rcall> {
        let body = Tcall::Mount {
            version: TNFS_VERSION,
            path: "/".to_owned(),
            user: user.to_owned(),
            password: password.to_owned(),
        };
        d.dispatch(
            Msg {
                session: NO_SESSION,
                seq: 0,
                body,
            },
            Origin::Datagram,
        )
        .await
        .unwrap()
    }

    async fn mount(d: &Dispatcher) -> u16 {
        let reply = mount_as(d, "", "").await;
        assert_eq!(
            reply.body,
            Rcall::Mount {
                version: TNFS_VERSION,
                retry_ms: DEFAULT_RETRY_MS
            }
        );
        assert_ne!(reply.session, NO_SESSION);
        reply.session
    }

    async fn open(d: &Dispatcher, s: u16, path: &str, flags: OpenFlags) -> Rcall {
        call(
            d,
            s,
            Tcall::Open {
                flags,
                mode: 0o644,
                path: path.to_owned(),
            },
        )
        .await
    }

    fn err(result: ResultCode, cmd: Command) -> Rcall {
        Rcall::error(cmd as u8, result)
    }

    fn entry(name: &str, kind: FileKind, size: u64, mtime: u32) -> Entry {
        Entry::new(
            name,
            Metadata {
                kind,
                size,
                mtime,
                ..Default::default()
            },
        )
    }

    fn names(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn core_codes_cannot_be_taken() {
        #[derive(Debug)]
        struct Squatter;

        #[async_trait]
        impl Extension for Squatter {
            fn code(&self) -> u8 {
                Command::Stat as u8
            }
            fn name(&self) -> &'static str {
                "SQUAT"
            }
            async fn handle(&self, _: &ext::Context<'_>, _: &[u8]) -> Result<Data> {
                Ok(Data::default())
            }
        }

        let mut table = CommandTable::new();
        assert_eq!(table.len(), Command::ALL.len());
        assert!(table.register(Arc::new(Squatter)).is_err());
        for e in ext::builtin() {
            table.register(e).unwrap();
        }
        assert!(table.register(Arc::new(ext::PacketSize)).is_err());
        assert!(table.get(ext::EXT_COPY).unwrap().requires_auth);
        assert!(!table.get(Command::Mount as u8).unwrap().requires_session);
    }

    #[tokio::test]
    async fn unregistered_command_is_fatal() {
        let (_, d) = dispatcher_with(ServerConfig::default(), PolicyKind::ReadWrite);
        let s = mount(&d).await;
        let msg = Msg {
            session: s,
            seq: 1,
            body: Tcall::Ext {
                code: 0x7f,
                payload: Data::default(),
            },
        };
        match d.dispatch(msg, Origin::Datagram).await {
            Err(Error::Protocol(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn session_is_required() {
        let (_, d) = dispatcher();
        let stat = Tcall::Stat {
            path: "/".to_owned(),
        };
        assert_eq!(
            call(&d, 0x1234, stat.clone()).await,
            err(ResultCode::EINVAL, Command::Stat)
        );

        let s = mount(&d).await;
        assert!(matches!(call(&d, s, stat.clone()).await, Rcall::Stat { stat } if stat.is_dir()));

        assert_eq!(call(&d, s, Tcall::Umount).await, Rcall::Umount);
        assert_eq!(call(&d, s, stat).await, err(ResultCode::EINVAL, Command::Stat));
        assert!(d.sessions().is_empty());
    }

    #[tokio::test]
    async fn mount_credentials() {
        let (_, d) = dispatcher();
        let refused = mount_as(&d, "alice", "wrong").await;
        assert_eq!(refused.body, err(ResultCode::EACCES, Command::Mount));
        assert_eq!(refused.session, NO_SESSION);

        let accepted = mount_as(&d, "alice", "secret").await;
        let session = d.sessions().get(accepted.session).unwrap();
        assert_eq!(session.principal().unwrap().name, "alice");

        let fs = Arc::new(MemFs::new());
        let bare = Dispatcher::new(ServerConfig::default(), vec![Mount::new("/", fs)]).unwrap();
        assert_eq!(
            mount_as(&bare, "alice", "secret").await.body,
            err(ResultCode::EACCES, Command::Mount)
        );
    }

    #[tokio::test]
    async fn mount_selects_longest_prefix() {
        let root = Arc::new(MemFs::new());
        let games = Arc::new(MemFs::new());
        games.mkdir("/atari").await.unwrap();
        games.insert_file("/atari/elite.bin", b"xyz").unwrap();
        let d = Dispatcher::new(
            ServerConfig::default(),
            vec![Mount::new("/", root), Mount::new("/games", games)],
        )
        .unwrap();

        let reply = d
            .dispatch(
                Msg {
                    session: NO_SESSION,
                    seq: 0,
                    body: Tcall::Mount {
                        version: TNFS_VERSION,
                        path: "/games/atari".to_owned(),
                        user: String::new(),
                        password: String::new(),
                    },
                },
                Origin::Datagram,
            )
            .await
            .unwrap();
        let stat = call(
            &d,
            reply.session,
            Tcall::Stat {
                path: "../elite.bin".to_owned(),
            },
        )
        .await;
        assert!(matches!(stat, Rcall::Stat { stat } if stat.size == 3));
    }

    #[tokio::test]
    async fn file_lifecycle() {
        let (fs, d) = dispatcher();
        let s = mount(&d).await;

        let handle = match open(&d, s, "/hello.txt", OpenFlags::WRONLY | OpenFlags::CREAT).await {
            Rcall::Open { handle } => handle,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(handle, 1);
        let write = Tcall::Write {
            handle,
            data: Data(b"hi".to_vec()),
        };
        assert_eq!(call(&d, s, write).await, Rcall::Write { count: 2 });
        assert_eq!(call(&d, s, Tcall::Close { handle }).await, Rcall::Close);
        assert_eq!(
            call(&d, s, Tcall::Close { handle }).await,
            err(ResultCode::EBADF, Command::Close)
        );
        assert_eq!(fs.contents("/hello.txt").unwrap(), b"hi");

        let handle = match open(&d, s, "/hello.txt", OpenFlags::RDONLY).await {
            Rcall::Open { handle } => handle,
            other => panic!("unexpected {:?}", other),
        };
        let read = Tcall::Read { handle, size: 100 };
        assert_eq!(
            call(&d, s, read.clone()).await,
            Rcall::Read {
                data: Data(b"hi".to_vec())
            }
        );
        assert_eq!(call(&d, s, read).await, err(ResultCode::EOF, Command::Read));

        let seek = Tcall::LSeek {
            handle,
            whence: Whence::Set,
            offset: 1,
        };
        assert_eq!(call(&d, s, seek).await, Rcall::LSeek { position: 1 });
        let seek = Tcall::LSeek {
            handle,
            whence: Whence::End,
            offset: 0,
        };
        assert_eq!(call(&d, s, seek).await, Rcall::LSeek { position: 2 });

        let write = Tcall::Write {
            handle,
            data: Data(b"no".to_vec()),
        };
        assert_eq!(call(&d, s, write).await, err(ResultCode::EBADF, Command::Write));

        let unlink = Tcall::Unlink {
            path: "/hello.txt".to_owned(),
        };
        assert_eq!(call(&d, s, unlink).await, Rcall::Unlink);
        let stat = Tcall::Stat {
            path: "/hello.txt".to_owned(),
        };
        assert_eq!(call(&d, s, stat).await, err(ResultCode::ENOENT, Command::Stat));
    }

    #[tokio::test]
    async fn read_is_bounded_by_message_size() {
        let (fs, d) = dispatcher();
        fs.insert_file("/big", &[0xaa; 2000]).unwrap();
        let s = mount(&d).await;
        let Rcall::Open { handle } = open(&d, s, "/big", OpenFlags::RDONLY).await else {
            panic!("open failed");
        };
        match call(&d, s, Tcall::Read { handle, size: 2000 }).await {
            Rcall::Read { data } => assert_eq!(data.0.len(), UDP_MSG_SIZE - IOHDRSZ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn handle_table_exhaustion() {
        let (fs, d) = dispatcher_with(ServerConfig::default().max_files(2), PolicyKind::ReadWrite);
        fs.insert_file("/f", b"data").unwrap();
        let s = mount(&d).await;

        assert_eq!(open(&d, s, "/f", OpenFlags::RDONLY).await, Rcall::Open { handle: 1 });
        assert_eq!(open(&d, s, "/f", OpenFlags::RDONLY).await, Rcall::Open { handle: 2 });
        assert_eq!(
            open(&d, s, "/f", OpenFlags::RDONLY).await,
            err(ResultCode::EMFILE, Command::Open)
        );

        // the surviving handles are untouched
        let read = Tcall::Read { handle: 2, size: 4 };
        assert_eq!(
            call(&d, s, read).await,
            Rcall::Read {
                data: Data(b"data".to_vec())
            }
        );

        call(&d, s, Tcall::Close { handle: 1 }).await;
        assert_eq!(open(&d, s, "/f", OpenFlags::RDONLY).await, Rcall::Open { handle: 1 });
    }

    #[tokio::test]
    async fn read_only_policy_never_reaches_backend() {
        let (fs, d) = dispatcher_with(ServerConfig::default(), PolicyKind::ReadOnly);
        fs.insert_file("/keep", b"x").unwrap();
        let s = mount(&d).await;

        let stat = Tcall::Stat {
            path: "/keep".to_owned(),
        };
        assert!(matches!(call(&d, s, stat).await, Rcall::Stat { .. }));
        assert!(matches!(open(&d, s, "/keep", OpenFlags::RDONLY).await, Rcall::Open { .. }));

        assert_eq!(
            open(&d, s, "/new", OpenFlags::WRONLY | OpenFlags::CREAT).await,
            err(ResultCode::EACCES, Command::Open)
        );
        let mkdir = Tcall::MkDir {
            path: "/d".to_owned(),
        };
        assert_eq!(call(&d, s, mkdir).await, err(ResultCode::EACCES, Command::MkDir));
        let unlink = Tcall::Unlink {
            path: "/keep".to_owned(),
        };
        assert_eq!(call(&d, s, unlink).await, err(ResultCode::EACCES, Command::Unlink));

        assert!(fs.stat("/new").await.is_err());
        assert!(fs.stat("/d").await.is_err());
        assert_eq!(fs.contents("/keep").unwrap(), b"x");
    }

    #[tokio::test]
    async fn read_only_policy_refuses_every_mutation() {
        let (fs, d) = dispatcher_with(ServerConfig::default(), PolicyKind::ReadOnly);
        fs.insert_file("/keep", b"x").unwrap();
        fs.mkdir("/dir").await.unwrap();
        let mode = fs.stat("/keep").await.unwrap().mode;
        let s = mount(&d).await;

        for flags in [
            OpenFlags::WRONLY,
            OpenFlags::RDWR,
            OpenFlags::RDONLY | OpenFlags::TRUNC,
            OpenFlags::RDONLY | OpenFlags::APPEND,
        ] {
            assert_eq!(
                open(&d, s, "/keep", flags).await,
                err(ResultCode::EACCES, Command::Open),
                "{:?}",
                flags
            );
        }

        let rmdir = Tcall::RmDir {
            path: "/dir".to_owned(),
        };
        assert_eq!(call(&d, s, rmdir).await, err(ResultCode::EACCES, Command::RmDir));
        assert!(fs.stat("/dir").await.is_ok());

        let rename = Tcall::Rename {
            from: "/keep".to_owned(),
            to: "/moved".to_owned(),
        };
        assert_eq!(call(&d, s, rename).await, err(ResultCode::EACCES, Command::Rename));
        assert!(fs.stat("/moved").await.is_err());

        let chmod = Tcall::Chmod {
            mode: 0o600,
            path: "/keep".to_owned(),
        };
        assert_eq!(call(&d, s, chmod).await, err(ResultCode::EACCES, Command::Chmod));
        assert_eq!(fs.stat("/keep").await.unwrap().mode, mode);

        let Rcall::Open { handle } = open(&d, s, "/keep", OpenFlags::RDONLY).await else {
            panic!("read-only open failed");
        };
        let write = Tcall::Write {
            handle,
            data: Data(b"overwritten".to_vec()),
        };
        assert_eq!(call(&d, s, write).await, err(ResultCode::EACCES, Command::Write));
        assert_eq!(fs.contents("/keep").unwrap(), b"x");
    }

    #[tokio::test]
    async fn readdir_tell_seek() {
        let (fs, d) = dispatcher();
        for name in ["a", "b", "c"] {
            fs.insert_file(&format!("/{}", name), b"").unwrap();
        }
        let s = mount(&d).await;
        let Rcall::OpenDir { handle } = call(
            &d,
            s,
            Tcall::OpenDir {
                path: "/".to_owned(),
            },
        )
        .await
        else {
            panic!("opendir failed");
        };

        let readdir = Tcall::ReadDir { handle };
        assert_eq!(call(&d, s, readdir.clone()).await, Rcall::ReadDir { name: "a".into() });
        assert_eq!(call(&d, s, Tcall::TellDir { handle }).await, Rcall::TellDir { position: 1 });
        assert_eq!(call(&d, s, readdir.clone()).await, Rcall::ReadDir { name: "b".into() });
        assert_eq!(call(&d, s, readdir.clone()).await, Rcall::ReadDir { name: "c".into() });
        assert_eq!(call(&d, s, readdir.clone()).await, err(ResultCode::EOF, Command::ReadDir));

        let seek = Tcall::SeekDir {
            handle,
            position: 1,
        };
        assert_eq!(call(&d, s, seek).await, Rcall::SeekDir);
        assert_eq!(call(&d, s, readdir).await, Rcall::ReadDir { name: "b".into() });

        assert_eq!(call(&d, s, Tcall::CloseDir { handle }).await, Rcall::CloseDir);
        assert_eq!(
            call(&d, s, Tcall::TellDir { handle }).await,
            err(ResultCode::EBADF, Command::TellDir)
        );
    }

    /// Grants reads until revoked
    #[derive(Debug)]
    struct Revocable(Arc<AtomicBool>);

    impl crate::access::AccessPolicy for Revocable {
        fn allows(&self, _: Option<&Principal>, access: Access) -> bool {
            access == Access::Read && self.0.load(AtomicOrdering::SeqCst)
        }
    }

    #[tokio::test]
    async fn directory_cursor_checks_access() {
        let granted = Arc::new(AtomicBool::new(true));
        let fs = Arc::new(MemFs::new());
        fs.insert_file("/a", b"").unwrap();
        let root = Mount::new("/", fs).with_policy(Box::new(Revocable(granted.clone())));
        let d = Dispatcher::new(ServerConfig::default(), vec![root]).unwrap();
        let s = mount(&d).await;

        let Rcall::OpenDir { handle } = call(
            &d,
            s,
            Tcall::OpenDir {
                path: "/".to_owned(),
            },
        )
        .await
        else {
            panic!("opendir failed");
        };
        assert_eq!(call(&d, s, Tcall::TellDir { handle }).await, Rcall::TellDir { position: 0 });

        granted.store(false, AtomicOrdering::SeqCst);
        assert_eq!(
            call(&d, s, Tcall::TellDir { handle }).await,
            err(ResultCode::EACCES, Command::TellDir)
        );
        assert_eq!(
            call(&d, s, Tcall::ReadDir { handle }).await,
            err(ResultCode::EACCES, Command::ReadDir)
        );
        let seek = Tcall::SeekDir {
            handle,
            position: 0,
        };
        assert_eq!(call(&d, s, seek).await, err(ResultCode::EACCES, Command::SeekDir));
    }

    #[tokio::test]
    async fn readdirx_pages() {
        let (fs, d) = dispatcher();
        for i in 0..30 {
            fs.insert_file(&format!("/file_{:02}.txt", i), b"").unwrap();
        }
        let s = mount(&d).await;

        let opendirx = Tcall::OpenDirX {
            options: DirOptions::empty(),
            sort: SortOptions::empty(),
            max_results: 0,
            pattern: String::new(),
            path: "/".to_owned(),
        };
        let handle = match call(&d, s, opendirx).await {
            Rcall::OpenDirX { handle, count } => {
                assert_eq!(count, 30);
                handle
            }
            other => panic!("unexpected {:?}", other),
        };

        let page = |count| Tcall::ReadDirX { handle, count };
        match call(&d, s, page(8)).await {
            Rcall::ReadDirX {
                status,
                position,
                entries,
            } => {
                assert_eq!(position, 0);
                assert_eq!(entries.len(), 8);
                assert_eq!(entries[0].name, "file_00.txt");
                assert!(status.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }

        // each entry takes 25 bytes, 20 fit into a UDP reply
        match call(&d, s, page(0)).await {
            Rcall::ReadDirX {
                status,
                position,
                entries,
            } => {
                assert_eq!(position, 8);
                assert_eq!(entries.len(), 20);
                assert!(status.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }

        match call(&d, s, page(0)).await {
            Rcall::ReadDirX {
                status,
                position,
                entries,
            } => {
                assert_eq!(position, 28);
                assert_eq!(names_of(&entries), vec!["file_28.txt", "file_29.txt"]);
                assert_eq!(status, DirStatus::EOF);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(call(&d, s, page(0)).await, err(ResultCode::EOF, Command::ReadDirX));
    }

    fn names_of(entries: &[DirEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn opendirx_selection() {
        let all = vec![
            entry("alpha.txt", FileKind::File, 5, 30),
            entry(".hidden", FileKind::File, 0, 0),
            entry("Zeta", FileKind::Dir, 0, 20),
            entry("dev", FileKind::Special, 0, 0),
            entry("Beta.TXT", FileKind::File, 1, 10),
        ];
        let select = |options, sort, pattern: &str, max| {
            let pattern = match pattern {
                "" => None,
                p => Some(Pattern::new(p).unwrap()),
            };
            select_entries(all.clone(), options, sort, pattern.as_ref(), max)
        };

        let out = select(DirOptions::empty(), SortOptions::empty(), "", 0);
        assert_eq!(names(&out), vec!["Zeta", "alpha.txt", "Beta.TXT"]);

        let out = select(DirOptions::empty(), SortOptions::CASE, "", 0);
        assert_eq!(names(&out), vec!["Zeta", "Beta.TXT", "alpha.txt"]);

        let out = select(DirOptions::empty(), SortOptions::empty(), "*.txt", 0);
        assert_eq!(names(&out), vec!["Zeta", "alpha.txt", "Beta.TXT"]);

        let out = select(DirOptions::DIR_PATTERN, SortOptions::empty(), "*.txt", 0);
        assert_eq!(names(&out), vec!["alpha.txt", "Beta.TXT"]);

        let out = select(
            DirOptions::NO_FOLDERSFIRST,
            SortOptions::SIZE | SortOptions::DESCENDING,
            "",
            0,
        );
        assert_eq!(names(&out), vec!["alpha.txt", "Beta.TXT", "Zeta"]);

        let out = select(DirOptions::NO_FOLDERSFIRST, SortOptions::MODIFIED, "", 0);
        assert_eq!(names(&out), vec!["Beta.TXT", "Zeta", "alpha.txt"]);

        let out = select(
            DirOptions::NO_FOLDERSFIRST | DirOptions::NO_SKIPHIDDEN | DirOptions::NO_SKIPSPECIAL,
            SortOptions::NONE,
            "",
            0,
        );
        assert_eq!(names(&out), names(&all));

        let out = select(DirOptions::empty(), SortOptions::empty(), "", 1);
        assert_eq!(names(&out), vec!["Zeta"]);
    }

    #[tokio::test]
    async fn retransmission_is_not_executed_twice() {
        let (fs, d) = dispatcher();
        let s = mount(&d).await;
        let Rcall::Open { handle } = open(&d, s, "/log", OpenFlags::WRONLY | OpenFlags::CREAT).await else {
            panic!("open failed");
        };

        let write = Msg {
            session: s,
            seq: 42,
            body: Tcall::Write {
                handle,
                data: Data(b"once".to_vec()),
            },
        };
        let mut first = [0u8; UDP_MSG_SIZE];
        let mut second = [0u8; UDP_MSG_SIZE];
        let n = d.handle(write.clone(), Origin::Datagram, &mut first).await.unwrap();
        let m = d.handle(write, Origin::Datagram, &mut second).await.unwrap();

        assert_eq!(&first[..n], &second[..m]);
        assert_eq!(fs.contents("/log").unwrap(), b"once");

        let reply = serialize::read_reply(&mut &first[..n]).unwrap();
        assert_eq!(reply.body, Rcall::Write { count: 4 });
        assert_eq!(reply.seq, 42);
    }

    #[tokio::test]
    async fn extensions() {
        let (fs, d) = dispatcher();
        fs.insert_file("/src", b"payload").unwrap();

        let guest = mount(&d).await;
        let copy = Tcall::Ext {
            code: ext::EXT_COPY,
            payload: ext::copy_request("/src", "/dst").unwrap(),
        };
        assert_eq!(
            call(&d, guest, copy.clone()).await,
            Rcall::error(ext::EXT_COPY, ResultCode::EINVAL)
        );

        let pktsize = Tcall::Ext {
            code: ext::EXT_PKTSIZE,
            payload: ext::pktsize_request(2048).unwrap(),
        };
        match call(&d, guest, pktsize).await {
            Rcall::Ext { code, payload } => {
                assert_eq!(code, ext::EXT_PKTSIZE);
                assert_eq!(ext::reply_field::<u16>(&payload).unwrap(), 2048);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(d.sessions().get(guest).unwrap().msg_size(), 2048);

        let alice = mount_as(&d, "alice", "secret").await.session;
        match call(&d, alice, copy).await {
            Rcall::Ext { payload, .. } => {
                assert_eq!(ext::reply_field::<u32>(&payload).unwrap(), 7);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fs.contents("/dst").unwrap(), b"payload");
    }

    #[tokio::test]
    async fn processors_see_every_exchange() {
        #[derive(Debug, Default)]
        struct Counter {
            pre: AtomicUsize,
            post: AtomicUsize,
        }

        impl Processor for Counter {
            fn pre(&self, _: &mut Msg<Tcall>) {
                self.pre.fetch_add(1, AtomicOrdering::SeqCst);
            }
            fn post(&self, _: &Msg<Tcall>, _: &mut Msg<Rcall>) {
                self.post.fetch_add(1, AtomicOrdering::SeqCst);
            }
        }

        let counter = Arc::new(Counter::default());
        let (_, d) = dispatcher_with(
            ServerConfig::default().processor(counter.clone()),
            PolicyKind::ReadWrite,
        );
        let s = mount(&d).await;
        call(&d, s, Tcall::Size).await;
        call(&d, 0x4242, Tcall::Free).await;
        assert_eq!(counter.pre.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(counter.post.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn size_and_free_in_kib() {
        let fs = Arc::new(MemFs::with_capacity(10 * 1024));
        fs.insert_file("/x", &[0; 2048]).unwrap();
        let d = Dispatcher::new(ServerConfig::default(), vec![Mount::new("/", fs)]).unwrap();
        let s = mount(&d).await;
        assert_eq!(call(&d, s, Tcall::Size).await, Rcall::Size { kbytes: 10 });
        assert_eq!(call(&d, s, Tcall::Free).await, Rcall::Free { kbytes: 8 });
    }
}
