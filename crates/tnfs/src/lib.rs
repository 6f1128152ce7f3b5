#![forbid(unsafe_code)]
//! Asynchronous TNFS (Trivial Network File System) library for Rust.
//!
//! TNFS is a small request/reply file protocol designed for 8-bit machines
//! and other resource-constrained clients. This crate provides the wire
//! codec, a tokio-based server serving one or more backing filesystems over
//! UDP and TCP, and a client that turns the protocol into a file-access API.
//!
//! # Getting Started
//!
//! To serve files:
//!
//! 1. Implement the [`fs::Filesystem`] trait for your backend (or use
//!    [`memfs::MemFs`])
//! 2. Describe each exported path with a [`session::Mount`], optionally with
//!    an [`access::AccessPolicy`] and an [`fs::Authenticator`]
//! 3. Start a [`srv::Server`] and call [`srv::Server::serve`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tnfs::{memfs::MemFs, session::Mount, srv::{Server, ServerConfig}, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let fs = Arc::new(MemFs::new());
//!     let config = ServerConfig::default().builtin_extensions();
//!     Server::new(config, vec![Mount::new("/", fs)])?.serve().await
//! }
//! ```
//!
//! And to use them:
//!
//! ```no_run
//! use tnfs::{client::{Client, ClientConfig}, Result};
//!
//! # async fn run() -> Result<()> {
//! let client = Client::connect("tnfs://localhost/", ClientConfig::default()).await?;
//! client.write_file("/hello.txt", b"hi").await?;
//! assert_eq!(client.read_file("/hello.txt").await?, b"hi");
//! for name in client.read_dir("/").await? {
//!     println!("{}", name);
//! }
//! client.umount().await
//! # }
//! ```
//!
//! # Protocol Details
//!
//! ## Message Flow
//!
//! 1. **Mount**: the client sends `MOUNT` with session id 0 and receives a
//!    session id in the reply header
//! 2. **Operations**: files and directories are opened into 1-byte handles,
//!    read, written and closed
//! 3. **Umount**: the session and all its handles are released
//!
//! Every message carries a sequence number that the reply echoes. A client
//! has one request in flight at a time, and a server that sees the same
//! sequence number twice answers again with the reply it already sent.
//!
//! ## Sessions and Handles
//!
//! - Session ids are unique among active sessions and never 0
//! - Handles are allocated lowest-free in `1..=255` per session
//! - Sessions mounted over TCP end with their connection
//!
//! # Error Handling
//!
//! Backends return [`error::Error`]; the dispatcher turns it into the TNFS
//! result code of the reply. On the client side result codes come back as
//! `Error::No` and can be classified with [`error::Error::kind`].
//!
//! # Transport
//!
//! - **UDP**: `"tnfs://host[:port]/path"`
//! - **TCP**: `"tnfs+tcp://host[:port]/path"`
//!
//! Both default to port 16384.
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`).
pub mod access;
pub mod client;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod ext;
pub mod fcall;
pub mod fs;
pub mod memfs;
pub mod pool;
pub mod serialize;
pub mod session;
pub mod srv;
pub mod transport;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::ErrorKind;
pub use crate::fcall::*;
pub use crate::utils::Result;
