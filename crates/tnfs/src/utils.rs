use crate::{error, fcall::TNFS_PORT};

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Transport selected by a TNFS URI
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
}

/// URI scheme selecting the UDP transport
pub const SCHEME_UDP: &str = "tnfs";

/// URI scheme selecting the TCP transport
pub const SCHEME_TCP: &str = "tnfs+tcp";

/// Components of `tnfs://host[:port][/path]` or `tnfs+tcp://host[:port][/path]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub proto: Proto,
    pub host: String,
    pub port: u16,
    /// Mount path, "/" when absent
    pub path: String,
}

impl Endpoint {
    /// "host:port", suitable for `ToSocketAddrs`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn parse_uri(uri: &str) -> Option<Endpoint> {
    let url = url::Url::parse(uri).ok()?;
    let proto = match url.scheme() {
        SCHEME_UDP => Proto::Udp,
        SCHEME_TCP => Proto::Tcp,
        _ => return None,
    };
    let host = match url.host()? {
        url::Host::Ipv6(addr) => format!("[{}]", addr),
        host => host.to_string(),
    };
    let path = match url.path() {
        "" => "/".to_owned(),
        p => p.to_owned(),
    };

    Some(Endpoint {
        proto,
        host,
        port: url.port().unwrap_or(TNFS_PORT),
        path,
    })
}

/// Normalize `path` into an absolute path without `.`/`..` components.
///
/// `..` never climbs above the root.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }

    let mut out = String::with_capacity(path.len() + 1);
    for p in &parts {
        out.push('/');
        out.push_str(p);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Join a request path onto a mount root, confined below the root.
pub fn join_path(root: &str, path: &str) -> String {
    let rel = normalize_path(path);
    match normalize_path(root).as_str() {
        "/" => rel,
        root if rel == "/" => root.to_owned(),
        root => format!("{}{}", root, rel),
    }
}

/// Final component of a normalized path
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("a/b/"), "/a/b");
        assert_eq!(normalize_path("/a/./b/../c"), "/a/c");
        assert_eq!(normalize_path("/../../etc/passwd"), "/etc/passwd");
        assert_eq!(normalize_path("\\games\\elite.bin"), "/games/elite.bin");
    }

    #[test]
    fn join_stays_below_root() {
        assert_eq!(join_path("/", "/hello.txt"), "/hello.txt");
        assert_eq!(join_path("/games", "hello.txt"), "/games/hello.txt");
        assert_eq!(join_path("/games", "../../secret"), "/games/secret");
        assert_eq!(join_path("/games", ""), "/games");
    }

    #[test]
    fn uri() {
        let ep = parse_uri("tnfs://example.org/games").unwrap();
        assert_eq!(ep.proto, Proto::Udp);
        assert_eq!(ep.address(), "example.org:16384");
        assert_eq!(ep.path, "/games");

        let ep = parse_uri("tnfs+tcp://127.0.0.1:9000").unwrap();
        assert_eq!(ep.proto, Proto::Tcp);
        assert_eq!(ep.port, 9000);
        assert_eq!(ep.path, "/");

        assert!(parse_uri("http://example.org/").is_none());
        assert!(parse_uri("not a uri").is_none());
    }

    #[test]
    fn names() {
        assert_eq!(file_name("/a/b.txt"), "b.txt");
        assert_eq!(file_name("/"), "");
    }
}
