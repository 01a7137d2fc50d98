//! Secure channel resources
//!
//! A channel wraps the raw socket plus the live handshake engine produced
//! by the factory. It is only ever constructed from a fully-initialized
//! engine; its job here is encrypted read/write with optional timeouts and
//! deterministic teardown. Closing happens exactly once, on explicit
//! [`SecureChannel::close`] or on drop, whichever comes first.
//!
//! A channel supports one in-flight read and one in-flight write at a time;
//! it introduces no access to the binding beyond what the engine itself
//! issues.

use crate::binding::{poll_fd, Binding, DatagramBinding, PollEvents, StreamBinding};
use crate::factory::Diagnostics;
use crate::{Error, Result};
use openssl::nid::Nid;
use openssl::ssl::{SslRef, SslStream};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Negotiated session parameters, captured after the handshake
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Negotiated protocol version (e.g. "TLSv1.3")
    pub version: String,
    /// Negotiated cipher suite
    pub cipher: String,
    /// SNI name, as seen by this endpoint
    pub server_name: Option<String>,
    /// Common name of the peer certificate, if one was presented
    pub peer_subject: Option<String>,
}

impl SessionInfo {
    fn from_ssl(ssl: &SslRef) -> Self {
        let peer_subject = ssl.peer_certificate().and_then(|cert| {
            cert.subject_name()
                .entries_by_nid(Nid::COMMONNAME)
                .next()
                .and_then(|e| e.data().as_utf8().ok())
                .map(|s| s.to_string())
        });

        SessionInfo {
            version: ssl.version_str().to_string(),
            cipher: ssl
                .current_cipher()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "<none>".to_string()),
            server_name: ssl
                .servername(openssl::ssl::NameType::HOST_NAME)
                .map(|s| s.to_string()),
            peer_subject,
        }
    }
}

/// Engine-plus-binding plumbing shared by both channel flavors
struct ChannelInner<B: Binding> {
    stream: SslStream<B>,
    timeout: Option<Duration>,
    info: SessionInfo,
    diagnostics: Diagnostics,
    failed: bool,
    closed: bool,
}

impl<B: Binding> ChannelInner<B> {
    fn new(stream: SslStream<B>, diagnostics: Diagnostics) -> Self {
        let info = SessionInfo::from_ssl(stream.ssl());
        ChannelInner {
            stream,
            timeout: None,
            info,
            diagnostics,
            failed: false,
            closed: false,
        }
    }

    /// Apply the timeout to both the initial poll and the binding the
    /// engine drives, so a deadline holds even mid-record
    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
        self.stream.get_mut().set_io_timeout(timeout);
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // Decrypted bytes may already be buffered in the engine; only poll
        // the socket when there are none.
        if self.stream.ssl().pending() == 0 {
            let fd = self.stream.get_ref().as_raw_fd();
            if !poll_fd(fd, PollEvents::Read, self.timeout)? {
                return Err(Error::Timeout);
            }
        }
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(Error::Transport(e))
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let fd = self.stream.get_ref().as_raw_fd();
        if !poll_fd(fd, PollEvents::Write, self.timeout)? {
            return Err(Error::Timeout);
        }
        match self.stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(Error::Transport(e))
            }
        }
    }

    /// Send the close notification, once
    fn close_engine(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.diagnostics.trace(|| "closing channel".to_string());
        if !self.failed {
            let _ = self.stream.shutdown();
        }
    }
}

impl<B: Binding> Drop for ChannelInner<B> {
    fn drop(&mut self) {
        self.close_engine();
    }
}

/// Encrypted full-duplex channel over a stream socket
///
/// Owns the raw `TcpStream` exclusively for its lifetime.
pub struct SecureChannel {
    inner: ChannelInner<StreamBinding<TcpStream>>,
}

impl SecureChannel {
    pub(crate) fn wrap(
        stream: SslStream<StreamBinding<TcpStream>>,
        diagnostics: Diagnostics,
    ) -> Self {
        SecureChannel {
            inner: ChannelInner::new(stream, diagnostics),
        }
    }

    /// Set the timeout applied to each read and write; `None` waits
    /// indefinitely
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.inner.set_timeout(timeout);
    }

    /// Negotiated session parameters
    pub fn session(&self) -> &SessionInfo {
        &self.inner.info
    }

    /// Read decrypted application data
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
    }

    /// Write application data for encryption
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf)
    }

    /// Get a reference to the underlying socket
    pub fn get_ref(&self) -> &TcpStream {
        self.inner.stream.get_ref().get_ref()
    }

    /// Close the channel: engine close notification, then socket shutdown
    ///
    /// Subsequent calls are no-ops; dropping an unclosed channel performs
    /// the same teardown.
    pub fn close(&mut self) -> Result<()> {
        self.inner.close_engine();
        match self.get_ref().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // The peer may already have torn the connection down.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl Read for SecureChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        SecureChannel::read(self, buf).map_err(Error::into_io)
    }
}

impl Write for SecureChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SecureChannel::write(self, buf).map_err(Error::into_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.stream.flush()
    }
}

/// Encrypted packet channel over a datagram socket fixed to one peer
///
/// Owns the raw `UdpSocket` exclusively for its lifetime. Application
/// payloads carry no addressing; the binding underneath applies and strips
/// the address envelope.
pub struct SecureDatagramChannel {
    inner: ChannelInner<DatagramBinding<UdpSocket>>,
    peer: SocketAddr,
}

impl SecureDatagramChannel {
    pub(crate) fn wrap(
        stream: SslStream<DatagramBinding<UdpSocket>>,
        peer: SocketAddr,
        diagnostics: Diagnostics,
    ) -> Self {
        SecureDatagramChannel {
            inner: ChannelInner::new(stream, diagnostics),
            peer,
        }
    }

    /// The fixed peer address this channel exchanges datagrams with
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Set the timeout applied to each read and write; `None` waits
    /// indefinitely
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.inner.set_timeout(timeout);
    }

    /// Negotiated session parameters
    pub fn session(&self) -> &SessionInfo {
        &self.inner.info
    }

    /// Read one decrypted datagram payload
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
    }

    /// Write one datagram payload for encryption
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf)
    }

    /// Get a reference to the underlying socket
    pub fn get_ref(&self) -> &UdpSocket {
        self.inner.stream.get_ref().get_ref()
    }

    /// Close the channel: engine close notification
    ///
    /// Datagram sockets have no shutdown; the socket itself is released on
    /// drop.
    pub fn close(&mut self) -> Result<()> {
        self.inner.close_engine();
        Ok(())
    }
}

impl Read for SecureDatagramChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        SecureDatagramChannel::read(self, buf).map_err(Error::into_io)
    }
}

impl Write for SecureDatagramChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SecureDatagramChannel::write(self, buf).map_err(Error::into_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
