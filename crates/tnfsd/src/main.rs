use {
    async_trait::async_trait,
    clap::Parser,
    futures::StreamExt,
    log::info,
    std::{collections::HashMap, io, os::unix::fs::PermissionsExt, path::PathBuf, sync::Arc},
    tnfs::{
        access::PolicyKind,
        fs::{Authenticator, Entry, EntryStream, FileStream, Filesystem, Metadata, Principal},
        io_err, res,
        session::{DEFAULT_MAX_DIRS, DEFAULT_MAX_FILES, Mount},
        srv::{Server, ServerConfig},
        utils::normalize_path,
        *,
    },
    tokio::fs,
    tokio_stream::wrappers::ReadDirStream,
};

mod utils;
use crate::utils::*;

/// A local directory exported as a TNFS filesystem
#[derive(Clone, Debug)]
struct Diskfs {
    realroot: PathBuf,
}

impl Diskfs {
    /// Host path of a mount-relative path
    fn realpath(&self, path: &str) -> PathBuf {
        self.realroot
            .join(normalize_path(path).trim_start_matches('/'))
    }

    async fn statvfs(&self) -> Result<nix::sys::statvfs::Statvfs> {
        let path = self.realroot.clone();
        let stat = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&path))
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))?
            .map_err(io::Error::from)?;
        Ok(stat)
    }
}

#[async_trait]
impl Filesystem for Diskfs {
    async fn stat(&self, path: &str) -> Result<Metadata> {
        get_metadata(&self.realpath(path)).await
    }

    async fn read_dir(&self, path: &str) -> Result<EntryStream> {
        let entries = fs::read_dir(self.realpath(path)).await?;
        let stream = ReadDirStream::new(entries)
            .then(|entry| async move {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let attr = match fs::metadata(entry.path()).await {
                    Ok(attr) => attr,
                    // dangling symlink
                    Err(_) => entry.metadata().await?,
                };
                let meta = metadata_from_attr(&attr, &name);
                Ok::<_, Error>(Entry::new(name, meta))
            })
            .boxed();
        Ok(stream)
    }

    async fn open(&self, path: &str, flags: OpenFlags, mode: u16) -> Result<Box<dyn FileStream>> {
        let path = self.realpath(path);
        if let Ok(attr) = fs::metadata(&path).await {
            if attr.is_dir() {
                return res!(ResultCode::EISDIR);
            }
        }

        let excl = flags.contains(OpenFlags::EXCL | OpenFlags::CREAT);
        let file = fs::OpenOptions::new()
            .read(flags.readable())
            .write(flags.writable())
            .append(flags.contains(OpenFlags::APPEND))
            .truncate(flags.contains(OpenFlags::TRUNC))
            .create(flags.contains(OpenFlags::CREAT) && !excl)
            .create_new(excl)
            .mode((mode & mode::PERM) as u32)
            .open(&path)
            .await?;

        Ok(Box::new(file))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        fs::create_dir(self.realpath(path)).await?;
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        fs::remove_dir(self.realpath(path)).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.realpath(from), self.realpath(to)).await?;
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let path = self.realpath(path);
        match fs::symlink_metadata(&path).await? {
            ref attr if attr.is_dir() => res!(ResultCode::EISDIR),
            _ => Ok(fs::remove_file(&path).await?),
        }
    }

    async fn chmod(&self, path: &str, mode: u16) -> Result<()> {
        let perm = std::fs::Permissions::from_mode((mode & mode::PERM) as u32);
        fs::set_permissions(self.realpath(path), perm).await?;
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        let stat = self.statvfs().await?;
        Ok(stat.blocks() as u64 * stat.fragment_size() as u64)
    }

    async fn free(&self) -> Result<u64> {
        let stat = self.statvfs().await?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    async fn copy(&self, from: &str, to: &str) -> Result<u64> {
        let from = self.realpath(from);
        if fs::metadata(&from).await?.is_dir() {
            return res!(ResultCode::EISDIR);
        }
        Ok(fs::copy(from, self.realpath(to)).await?)
    }
}

/// Fixed table of accepted credentials
#[derive(Debug, Default)]
struct Users(HashMap<String, String>);

impl Users {
    /// Parse `user:password` pairs
    fn parse(pairs: &[String]) -> Result<Self> {
        let mut users = HashMap::new();
        for pair in pairs {
            let (user, password) = pair
                .split_once(':')
                .ok_or_else(|| io_err!(InvalidInput, format!("expected USER:PASSWORD, got {:?}", pair)))?;
            users.insert(user.to_owned(), password.to_owned());
        }
        Ok(Users(users))
    }
}

#[async_trait]
impl Authenticator for Users {
    async fn authenticate(
        &self,
        _fs: &dyn Filesystem,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Option<Principal> {
        let user = user?;
        match self.0.get(user) {
            Some(expected) if expected == password.unwrap_or("") => Some(Principal::new(user)),
            _ => None,
        }
    }
}

#[derive(Debug, clap::Parser)]
#[command(version, about = "Serve a directory over TNFS")]
struct Cli {
    /// Directory to export
    exportdir: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    address: String,

    /// Port for both UDP and TCP
    #[arg(long, short, default_value_t = TNFS_PORT)]
    port: u16,

    /// Virtual path clients mount the directory at
    #[arg(long, default_value = "/")]
    mount: String,

    /// Access policy: deny, ro, rw or auth
    #[arg(long, default_value = "rw")]
    policy: PolicyKind,

    /// Accepted credentials, may be repeated
    #[arg(long = "user", value_name = "USER:PASSWORD")]
    users: Vec<String>,

    /// Do not listen on UDP
    #[arg(long)]
    no_udp: bool,

    /// Do not listen on TCP
    #[arg(long)]
    no_tcp: bool,

    /// Do not offer the COPY and PKTSIZE extensions
    #[arg(long)]
    no_extensions: bool,

    /// Open files per session
    #[arg(long, default_value_t = DEFAULT_MAX_FILES)]
    max_files: usize,

    /// Open directories per session
    #[arg(long, default_value_t = DEFAULT_MAX_DIRS)]
    max_dirs: usize,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        let config = ServerConfig::default()
            .address(self.address.clone())
            .port(self.port)
            .udp(!self.no_udp)
            .tcp(!self.no_tcp)
            .max_files(self.max_files)
            .max_dirs(self.max_dirs);
        match self.no_extensions {
            true => config,
            false => config.builtin_extensions(),
        }
    }
}

async fn shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
    }
    Ok(())
}

async fn tnfsd_main(cli: Cli) -> Result<i32> {
    if !fs::try_exists(&cli.exportdir).await? {
        fs::create_dir_all(&cli.exportdir).await?;
    }
    if !fs::metadata(&cli.exportdir).await?.is_dir() {
        return res!(io_err!(Other, "export must be a directory"));
    }

    let config = cli.server_config();
    let address = config.bind_address();
    let diskfs = Diskfs {
        realroot: cli.exportdir.clone(),
    };
    let mut mount = Mount::new(&cli.mount, Arc::new(diskfs)).with_policy(cli.policy.build());
    if !cli.users.is_empty() {
        mount = mount.with_authenticator(Arc::new(Users::parse(&cli.users)?));
    }

    let server = Server::new(config, vec![mount])?;

    println!("[*] Exporting {:?} at {}", cli.exportdir, cli.mount);
    println!("[*] Ready to accept clients: {}", address);
    tokio::select! {
        res = server.serve() => res.and(Ok(0)),
        res = shutdown_signal() => Ok(res.map(|_| 0)?),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = tnfsd_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn scratch() -> Diskfs {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "tnfsd-test-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        Diskfs { realroot: dir }
    }

    #[tokio::test]
    async fn file_roundtrip() {
        let fs = scratch();
        let flags = OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC;
        let mut file = fs.open("/hello.txt", flags, 0o644).await.unwrap();
        file.write_all(b"hi").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let meta = fs.stat("/hello.txt").await.unwrap();
        assert_eq!(meta.size, 2);
        assert!(!meta.is_dir());

        let mut file = fs.open("/hello.txt", OpenFlags::RDONLY, 0).await.unwrap();
        let mut buf = String::new();
        file.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "hi");

        let err = fs
            .open("/hello.txt", flags | OpenFlags::EXCL, 0o644)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Exists);

        assert_eq!(fs.copy("/hello.txt", "/copy.txt").await.unwrap(), 2);
        fs.unlink("/hello.txt").await.unwrap();
        assert!(fs.stat("/hello.txt").await.unwrap_err().is_not_found());

        std::fs::remove_dir_all(&fs.realroot).unwrap();
    }

    #[tokio::test]
    async fn directories() {
        let fs = scratch();
        fs.mkdir("/games").await.unwrap();
        fs.mkdir("/games/atari").await.unwrap();
        std::fs::write(fs.realroot.join("games/.hidden"), b"x").unwrap();
        std::fs::write(fs.realroot.join("games/elite.bin"), b"xyz").unwrap();

        let mut entries: Vec<Entry> = fs
            .read_dir("/games")
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, [".hidden", "atari", "elite.bin"]);
        assert!(entries[0].meta.hidden);
        assert!(entries[1].meta.is_dir());
        assert_eq!(entries[2].meta.size, 3);

        assert_eq!(fs.rmdir("/games").await.unwrap_err().kind(), ErrorKind::DirectoryNotEmpty);
        assert_eq!(fs.unlink("/games/atari").await.unwrap_err().kind(), ErrorKind::IsADirectory);
        fs.rename("/games/elite.bin", "/elite.bin").await.unwrap();
        fs.chmod("/elite.bin", 0o600).await.unwrap();
        assert_eq!(fs.stat("/elite.bin").await.unwrap().mode, 0o600);

        // ".." never leaves the export
        assert_eq!(fs.realpath("/../../etc/passwd"), fs.realroot.join("etc/passwd"));

        assert!(fs.size().await.unwrap() > 0);
        std::fs::remove_dir_all(&fs.realroot).unwrap();
    }

    #[tokio::test]
    async fn users() {
        let users = Users::parse(&["alice:secret".to_owned()]).unwrap();
        let fs = scratch();
        assert_eq!(
            users.authenticate(&fs, Some("alice"), Some("secret")).await,
            Some(Principal::new("alice"))
        );
        assert_eq!(users.authenticate(&fs, Some("alice"), Some("nope")).await, None);
        assert_eq!(users.authenticate(&fs, None, None).await, None);
        assert!(Users::parse(&["alice".to_owned()]).is_err());
        std::fs::remove_dir_all(&fs.realroot).unwrap();
    }

    #[test]
    fn cli_maps_onto_config() {
        let cli = Cli::parse_from(["tnfsd", "/srv/tnfs", "--port", "9000", "--no-tcp", "--policy", "ro"]);
        let config = cli.server_config();
        assert_eq!(config.port, 9000);
        assert!(config.udp);
        assert!(!config.tcp);
        assert_eq!(config.extensions.len(), 2);
        assert_eq!(cli.policy, PolicyKind::ReadOnly);
    }
}
