//! tlsbind - transport-agnostic TLS/DTLS channel factory
//!
//! This crate turns a raw socket into an encrypted, full-duplex channel:
//! TLS over a `TcpStream`, DTLS over a `UdpSocket` fixed to one peer. The
//! cryptographic handshake and record layer are supplied by the `openssl`
//! crate; this crate's job is everything around that engine:
//!
//! - loading trust and identity material (PKCS#12 key stores, the platform
//!   default trust store, a pre-built `SslContext`, or an explicit
//!   accept-everything policy for testing),
//! - normalizing stream and datagram transports into the one byte-exchange
//!   contract the engine consumes (the [`binding::Binding`] trait),
//! - sequencing engine construction and the handshake so that a failure at
//!   any step releases every resource acquired so far.
//!
//! # Architecture
//!
//! 1. [`trust::TrustContext`] holds trust/identity material, loaded once.
//! 2. [`factory::ChannelFactory`] exposes four entry points
//!    (`client`/`server` over TCP, `datagram_client`/`datagram_server` over
//!    UDP) that build the matching transport binding, derive a native engine
//!    from the trust material, and drive the handshake.
//! 3. [`channel::SecureChannel`] / [`channel::SecureDatagramChannel`] wrap
//!    the live engine plus the raw socket and expose read/write/close.
//!
//! # Examples
//!
//! ```no_run
//! use tlsbind::{ChannelFactory, Diagnostics, HandshakeConfig, TrustContext};
//! use std::net::TcpStream;
//!
//! let trust = TrustContext::system_default().unwrap();
//! let factory = ChannelFactory::new(trust);
//!
//! let tcp = TcpStream::connect("example.com:443").unwrap();
//! let config = HandshakeConfig::default().with_server_name("example.com");
//! let mut channel = factory
//!     .client(tcp, config, Diagnostics::disabled())
//!     .unwrap();
//!
//! use std::io::Write;
//! channel.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
//! ```

pub mod binding;
pub mod channel;
pub mod config;
pub mod dev_cert;
pub mod factory;
pub mod trust;

pub use binding::{Binding, DatagramBinding, StreamBinding, TransportKind};
pub use channel::{SecureChannel, SecureDatagramChannel, SessionInfo};
pub use config::{ClientAuth, HandshakeConfig, TlsVersion};
pub use factory::{ChannelFactory, Diagnostics, Role};
pub use trust::{Passphrase, TrustContext};

/// Result type for channel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Channel construction and I/O errors
///
/// Every failure during channel construction aborts construction; no variant
/// is retried internally and partially-built channels are never returned.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failure acquiring an external byte source (missing file, filesystem
    /// failure)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed key store, wrong password, unsupported algorithm
    #[error("key material error: {0}")]
    KeyMaterial(String),

    /// Unsupported or contradictory handshake parameters, missing platform
    /// default trust store, engine creation failure
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Underlying socket failure during binding-level read or write
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// An operation's deadline elapsed
    #[error("operation timed out")]
    Timeout,

    /// Error raised by the handshake engine, passed through unchanged
    #[error("handshake error: {0}")]
    Handshake(#[source] openssl::ssl::Error),
}

impl Error {
    /// Map a channel error into the `std::io` error space
    ///
    /// Used where the handshake engine drives a binding through the
    /// `Read`/`Write` traits, which only speak `io::Error`.
    pub(crate) fn into_io(self) -> std::io::Error {
        match self {
            Error::Io(e) | Error::Transport(e) => e,
            Error::Timeout => {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "transport operation timed out")
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}
