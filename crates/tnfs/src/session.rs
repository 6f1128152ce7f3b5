//! Sessions, mounts and per-session handle tables.
//!
//! Locking: the session table and each handle table sit behind `parking_lot`
//! locks that are never held across an `.await`. An individual open file or
//! directory cursor is behind an async mutex, held for one operation.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use futures::StreamExt;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::{
    access::{Access, AccessPolicy, ReadWrite},
    error::Error,
    fcall::*,
    fs::{Authenticator, Entry, EntryStream, FileStream, Filesystem, Principal},
    utils::{self, Result},
};

/// Default number of files a session may hold open
pub const DEFAULT_MAX_FILES: usize = 16;

/// Default number of directory cursors a session may hold open
pub const DEFAULT_MAX_DIRS: usize = 8;

/// A filesystem exported under a virtual path
pub struct Mount {
    path: String,
    fs: Arc<dyn Filesystem>,
    policy: Box<dyn AccessPolicy>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl Mount {
    /// Export `fs` under `path`, read-write, without an authenticator.
    pub fn new(path: &str, fs: Arc<dyn Filesystem>) -> Self {
        Mount {
            path: utils::normalize_path(path),
            fs,
            policy: Box::new(ReadWrite),
            authenticator: None,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn fs(&self) -> &Arc<dyn Filesystem> {
        &self.fs
    }

    pub fn policy(&self) -> &dyn AccessPolicy {
        self.policy.as_ref()
    }

    pub fn authenticator(&self) -> Option<&Arc<dyn Authenticator>> {
        self.authenticator.as_ref()
    }

    /// Path below this mount that `requested` selects, if the mount covers it
    pub fn subpath(&self, requested: &str) -> Option<String> {
        let requested = utils::normalize_path(requested);
        if self.path == "/" {
            return Some(requested);
        }
        match requested.strip_prefix(self.path.as_str()) {
            Some("") => Some("/".to_owned()),
            Some(rest) if rest.starts_with('/') => Some(rest.to_owned()),
            _ => None,
        }
    }
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("path", &self.path)
            .field("policy", &self.policy)
            .field("authenticated", &self.authenticator.is_some())
            .finish()
    }
}

/// Pick the mount with the longest virtual path covering `requested`.
pub fn find_mount<'a>(mounts: &'a [Arc<Mount>], requested: &str) -> Option<(&'a Arc<Mount>, String)> {
    mounts
        .iter()
        .filter_map(|m| m.subpath(requested).map(|sub| (m, sub)))
        .max_by_key(|(m, _)| m.path.len())
}

/// Small table of handles with ids in `[1, 255]`.
pub struct HandleTable<T> {
    capacity: usize,
    entries: Mutex<BTreeMap<u8, Arc<tokio::sync::Mutex<T>>>>,
}

impl<T> HandleTable<T> {
    pub fn new(capacity: usize) -> Self {
        HandleTable {
            capacity: capacity.min(u8::MAX as usize),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Store `value` under the lowest free id.
    ///
    /// Fails with `EMFILE` when the table is full.
    pub fn insert(&self, value: T) -> Result<u8> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            return Err(Error::No(ResultCode::EMFILE));
        }
        let id = (1..=u8::MAX)
            .find(|id| !entries.contains_key(id))
            .ok_or(Error::No(ResultCode::EMFILE))?;
        entries.insert(id, Arc::new(tokio::sync::Mutex::new(value)));
        Ok(id)
    }

    /// Look up an open handle; `EBADF` when unknown.
    pub fn get(&self, id: u8) -> Result<Arc<tokio::sync::Mutex<T>>> {
        self.entries
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::No(ResultCode::EBADF))
    }

    pub fn remove(&self, id: u8) -> Result<Arc<tokio::sync::Mutex<T>>> {
        self.entries
            .lock()
            .remove(&id)
            .ok_or(Error::No(ResultCode::EBADF))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// A file opened by OPEN
pub struct OpenFile {
    pub path: String,
    pub flags: OpenFlags,
    pub stream: Box<dyn FileStream>,
}

impl fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenFile")
            .field("path", &self.path)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Position within a directory listing.
///
/// Entries are pulled from the backend stream on demand and kept, so the
/// cursor can be moved backwards with SEEKDIR.
pub struct DirCursor {
    pub path: String,
    pending: Option<EntryStream>,
    fetched: Vec<Entry>,
    position: usize,
}

impl DirCursor {
    /// Cursor over a lazy backend stream
    pub fn new(path: String, entries: EntryStream) -> Self {
        DirCursor {
            path,
            pending: Some(entries),
            fetched: Vec::new(),
            position: 0,
        }
    }

    /// Cursor over an already materialized listing
    pub fn with_entries(path: String, entries: Vec<Entry>) -> Self {
        DirCursor {
            path,
            pending: None,
            fetched: entries,
            position: 0,
        }
    }

    /// Pull from the backend until entry `index` is available or the
    /// stream ends.
    async fn fill(&mut self, index: usize) -> Result<()> {
        while self.fetched.len() <= index {
            let Some(stream) = self.pending.as_mut() else {
                break;
            };
            match stream.next().await {
                Some(entry) => self.fetched.push(entry?),
                None => self.pending = None,
            }
        }
        Ok(())
    }

    /// Entry at the cursor, advancing past it; `None` at the end.
    pub async fn next_entry(&mut self) -> Result<Option<Entry>> {
        self.fill(self.position).await?;
        match self.fetched.get(self.position) {
            Some(entry) => {
                self.position += 1;
                Ok(Some(entry.clone()))
            }
            None => Ok(None),
        }
    }

    /// Entry at the cursor without advancing.
    pub async fn peek(&mut self) -> Result<Option<&Entry>> {
        self.fill(self.position).await?;
        Ok(self.fetched.get(self.position))
    }

    /// Whether the cursor is past the last entry.
    pub async fn at_end(&mut self) -> Result<bool> {
        Ok(self.peek().await?.is_none())
    }

    pub fn tell(&self) -> usize {
        self.position
    }

    /// Move the cursor; positions past the end park it at the end.
    pub async fn seek(&mut self, position: usize) -> Result<()> {
        if position > 0 {
            self.fill(position - 1).await?;
        }
        self.position = position.min(self.fetched.len());
        Ok(())
    }

    /// Number of entries, if the listing has been fully read
    pub fn known_len(&self) -> Option<usize> {
        match self.pending {
            None => Some(self.fetched.len()),
            Some(_) => None,
        }
    }
}

/// Lifecycle state of a live session
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Guest session
    Mounted,
    /// Session whose credentials were accepted by the mount's authenticator
    Authenticated,
}

/// Transport a session was created over
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    Datagram,
    /// TCP connection, by connection number
    Stream(u64),
}

/// The last exchange of a session, kept to answer retransmissions
#[derive(Clone, Debug)]
pub struct LastReply {
    pub seq: u8,
    pub code: u8,
    pub encoded: Vec<u8>,
}

/// Server side state of one mounted client
pub struct Session {
    id: u16,
    mount: Arc<Mount>,
    root: String,
    principal: Option<Principal>,
    origin: Origin,
    msg_size: AtomicUsize,
    pub files: HandleTable<OpenFile>,
    pub dirs: HandleTable<DirCursor>,
    last: Mutex<Option<LastReply>>,
}

/// Parameters of a session about to be created
pub struct SessionInit {
    pub mount: Arc<Mount>,
    pub root: String,
    pub principal: Option<Principal>,
    pub origin: Origin,
    pub msg_size: usize,
    pub max_files: usize,
    pub max_dirs: usize,
}

impl Session {
    fn new(id: u16, init: SessionInit) -> Self {
        Session {
            id,
            mount: init.mount,
            root: init.root,
            principal: init.principal,
            origin: init.origin,
            msg_size: AtomicUsize::new(init.msg_size),
            files: HandleTable::new(init.max_files),
            dirs: HandleTable::new(init.max_dirs),
            last: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    pub fn fs(&self) -> &dyn Filesystem {
        self.mount.fs.as_ref()
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn state(&self) -> SessionState {
        match self.principal {
            Some(_) => SessionState::Authenticated,
            None => SessionState::Mounted,
        }
    }

    /// Consult the mount's access policy; `EACCES` when denied.
    pub fn authorize(&self, access: Access) -> Result<()> {
        match self.mount.policy.allows(self.principal.as_ref(), access) {
            true => Ok(()),
            false => Err(Error::No(ResultCode::EACCES)),
        }
    }

    /// Backend path for a path received from the client
    pub fn resolve(&self, path: &str) -> String {
        utils::join_path(&self.root, path)
    }

    /// Largest message this session may receive
    pub fn msg_size(&self) -> usize {
        self.msg_size.load(Ordering::Acquire)
    }

    pub fn set_msg_size(&self, size: usize) {
        self.msg_size.store(size, Ordering::Release);
    }

    /// Cached reply for a retransmitted request, if `seq`/`code` repeat the
    /// last exchange.
    pub fn replay(&self, seq: u8, code: u8) -> Option<Vec<u8>> {
        match *self.last.lock() {
            Some(ref last) if last.seq == seq && last.code == code => Some(last.encoded.clone()),
            _ => None,
        }
    }

    pub fn remember(&self, seq: u8, code: u8, encoded: &[u8]) {
        *self.last.lock() = Some(LastReply {
            seq,
            code,
            encoded: encoded.to_vec(),
        });
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("mount", &self.mount.path)
            .field("root", &self.root)
            .field("state", &self.state())
            .field("origin", &self.origin)
            .finish()
    }
}

/// All live sessions of a server
pub struct SessionTable {
    sessions: RwLock<HashMap<u16, Arc<Session>>>,
    next_id: Mutex<u16>,
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable {
            sessions: RwLock::new(HashMap::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Create a session under a fresh id.
    ///
    /// Ids are handed out round-robin, never 0 and never one in use.
    pub fn create(&self, init: SessionInit) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let mut next_id = self.next_id.lock();

        let mut id = *next_id;
        for _ in 0..=u16::MAX {
            if id != NO_SESSION && !sessions.contains_key(&id) {
                let session = Arc::new(Session::new(id, init));
                sessions.insert(id, session.clone());
                *next_id = id.wrapping_add(1);
                debug!("session {:#06x} created", id);
                return Ok(session);
            }
            id = id.wrapping_add(1);
        }

        Err(Error::No(ResultCode::EUSERS))
    }

    pub fn get(&self, id: u16) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Destroy a session, releasing its handles.
    pub fn remove(&self, id: u16) -> Option<Arc<Session>> {
        let session = self.sessions.write().remove(&id)?;
        session.files.clear();
        session.dirs.clear();
        debug!("session {:#06x} destroyed", id);
        Some(session)
    }

    /// Destroy every session created over `origin`, returning how many.
    pub fn remove_origin(&self, origin: Origin) -> usize {
        let ids: Vec<u16> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.origin == origin)
            .map(|s| s.id)
            .collect();
        ids.into_iter().filter(|id| self.remove(*id).is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
