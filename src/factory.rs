//! Secure channel factory
//!
//! One internal engine-construction primitive behind four public entry
//! points: client and server over a stream socket, client and server over a
//! datagram socket fixed to one peer. Each entry point builds the matching
//! transport binding, derives a native engine from the factory's trust
//! material, drives the handshake, and hands back a ready channel.
//!
//! A channel moves through engine creation, handshake and open exactly
//! once; any failure on the way collapses straight to closed, dropping the
//! engine, the binding and the raw socket with it. A partially-built
//! channel is never returned.

use crate::binding::{Binding, DatagramBinding, StreamBinding, TransportKind};
use crate::channel::{SecureChannel, SecureDatagramChannel};
use crate::config::{HandshakeConfig, DEFAULT_DTLS_MTU};
use crate::trust::TrustContext;
use crate::{Error, Result};
use log::debug;
use openssl::ssl::{Ssl, SslStream};
use std::fmt;
use std::net::{SocketAddr, TcpStream, UdpSocket};

/// Which side of the handshake this endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake
    Client,
    /// Awaits the handshake
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Client => "client",
            Role::Server => "server",
        })
    }
}

/// Optional sink for human-readable session trace lines
///
/// The disabled state is an explicit variant rather than an `Option` so the
/// "no tracing" case reads the same as the enabled one at every call site.
/// The sink holds no state of its own; lines are rendered only when a sink
/// is installed.
pub enum Diagnostics {
    /// Tracing disabled; trace lines are never rendered
    Disabled,
    /// Invoke the callback with each trace line
    Enabled(Box<dyn Fn(&str) + Send + Sync>),
}

impl Diagnostics {
    /// Tracing disabled
    pub fn disabled() -> Self {
        Diagnostics::Disabled
    }

    /// Trace through the given callback
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Diagnostics::Enabled(Box::new(sink))
    }

    /// Whether a sink is installed
    pub fn is_enabled(&self) -> bool {
        matches!(self, Diagnostics::Enabled(_))
    }

    pub(crate) fn trace<F: FnOnce() -> String>(&self, line: F) {
        if let Diagnostics::Enabled(sink) = self {
            sink(&line());
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Diagnostics::Disabled
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Diagnostics::Disabled => "Diagnostics::Disabled",
            Diagnostics::Enabled(_) => "Diagnostics::Enabled(..)",
        })
    }
}

/// Factory for secure channels over caller-supplied raw sockets
///
/// Holds the trust material; each entry point consumes a raw socket (the
/// channel owns it exclusively from then on) and a handshake configuration.
pub struct ChannelFactory {
    trust: TrustContext,
}

impl ChannelFactory {
    /// Create a factory around loaded trust material
    pub fn new(trust: TrustContext) -> Self {
        ChannelFactory { trust }
    }

    /// The trust material this factory builds channels from
    pub fn trust(&self) -> &TrustContext {
        &self.trust
    }

    /// TLS client channel over a connected stream socket
    pub fn client(
        &self,
        sock: TcpStream,
        config: HandshakeConfig,
        diagnostics: Diagnostics,
    ) -> Result<SecureChannel> {
        let binding = StreamBinding::new(sock);
        let stream =
            self.handshake(binding, Role::Client, &config, &diagnostics)?;
        Ok(SecureChannel::wrap(stream, diagnostics))
    }

    /// TLS server channel over an accepted stream socket
    pub fn server(
        &self,
        sock: TcpStream,
        config: HandshakeConfig,
        diagnostics: Diagnostics,
    ) -> Result<SecureChannel> {
        let binding = StreamBinding::new(sock);
        let stream =
            self.handshake(binding, Role::Server, &config, &diagnostics)?;
        Ok(SecureChannel::wrap(stream, diagnostics))
    }

    /// DTLS client channel over a datagram socket, fixed to `peer`
    pub fn datagram_client(
        &self,
        sock: UdpSocket,
        peer: SocketAddr,
        config: HandshakeConfig,
        diagnostics: Diagnostics,
    ) -> Result<SecureDatagramChannel> {
        let binding = DatagramBinding::new(sock, peer);
        let stream =
            self.handshake(binding, Role::Client, &config, &diagnostics)?;
        Ok(SecureDatagramChannel::wrap(stream, peer, diagnostics))
    }

    /// DTLS server channel over a datagram socket, fixed to `peer`
    pub fn datagram_server(
        &self,
        sock: UdpSocket,
        peer: SocketAddr,
        config: HandshakeConfig,
        diagnostics: Diagnostics,
    ) -> Result<SecureDatagramChannel> {
        let binding = DatagramBinding::new(sock, peer);
        let stream =
            self.handshake(binding, Role::Server, &config, &diagnostics)?;
        Ok(SecureDatagramChannel::wrap(stream, peer, diagnostics))
    }

    /// Build the engine over a binding and drive the handshake to completion
    ///
    /// On any failure the engine, the binding and the raw socket inside it
    /// are dropped before the error is returned.
    fn handshake<B: Binding>(
        &self,
        binding: B,
        role: Role,
        config: &HandshakeConfig,
        diagnostics: &Diagnostics,
    ) -> Result<SslStream<B>> {
        let kind = binding.kind();
        diagnostics.trace(|| format!("creating {} engine", role));
        let ssl = self.build_engine(kind, role, config)?;

        let mut stream = SslStream::new(ssl, binding)
            .map_err(|e| Error::Configuration(format!("engine binding failed: {}", e)))?;

        let outcome = match role {
            Role::Client => stream.connect(),
            Role::Server => stream.accept(),
        };

        match outcome {
            Ok(()) => {
                diagnostics.trace(|| {
                    format!(
                        "handshake complete: {} {}",
                        stream.ssl().version_str(),
                        stream
                            .ssl()
                            .current_cipher()
                            .map(|c| c.name())
                            .unwrap_or("<none>")
                    )
                });
                Ok(stream)
            }
            Err(e) => {
                debug!("{} handshake failed: {}", role, e);
                diagnostics.trace(|| format!("handshake failed: {}", e));
                // Dropping the stream releases the engine and the socket.
                Err(Error::Handshake(e))
            }
        }
    }

    /// Create and configure the native engine for one channel
    fn build_engine(
        &self,
        kind: TransportKind,
        role: Role,
        config: &HandshakeConfig,
    ) -> Result<Ssl> {
        let ctx = self.trust.ssl_context(kind, role, config)?;
        let mut ssl = Ssl::new(&ctx)
            .map_err(|e| Error::Configuration(format!("engine creation failed: {}", e)))?;

        let cfg_err = |e: openssl::error::ErrorStack| {
            Error::Configuration(format!("unsupported handshake parameter: {}", e))
        };

        if role == Role::Client {
            if let Some(ref name) = config.server_name {
                ssl.set_hostname(name).map_err(cfg_err)?;
                if config.verify_hostname {
                    ssl.param_mut().set_host(name).map_err(cfg_err)?;
                }
            }
        }

        if kind == TransportKind::Datagram {
            ssl.set_mtu(config.mtu.unwrap_or(DEFAULT_DTLS_MTU))
                .map_err(cfg_err)?;
        }

        Ok(ssl)
    }
}
