//! A lightweight SOCKS5 proxy with an optional encrypted client transport
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT to IPv4 literals and domain names
//!     - No-authentication method negotiation
//!     - Optional AES-CFB128 stream encryption on the client leg, keyed by
//!       a pre-shared key plus a per-connection cleartext seed
//!     - Optional zlib compression stacked on the cipher
//!     - Async using tokio with one task per connection
//!     - In-process admin surface for publishing listeners and managing
//!       configuration while the dispatcher runs
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//!
//! # Example
//! ```no_run
//! use cloakproxy::{ServerConfig, Socks5Server};
//! use rand::SeedableRng;
//! use rand::rngs::StdRng;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (server, handle) = Socks5Server::new(ServerConfig::default(), StdRng::from_entropy());
//!     let dispatcher = tokio::spawn(server.run());
//!     handle.publish(1080).await?;
//!     dispatcher.await??;
//!     Ok(())
//! }
//! ```

pub mod connect;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod socks5;
pub mod users;

// Re-export main types at crate root for convenience
pub use error::{Error, Result};
pub use pipeline::Pipeline;
pub use server::{ServerConfig, ServerHandle, Socks5Server};
pub use socks5::address::Target;
pub use users::UserTable;
