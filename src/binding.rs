//! Transport bindings
//!
//! This module normalizes the two supported raw transports (ordered byte
//! stream, addressed datagram) into the one byte-exchange contract the
//! handshake engine consumes. All transport-specific quirks are absorbed
//! here: addressing, atomicity of datagram reads, the meaninglessness of
//! empty datagram sends. The engine's record processing never branches on
//! transport kind.
//!
//! A binding is bound to exactly one raw socket (and, for datagrams, one
//! fixed peer address) for its entire lifetime and feeds exactly one engine.

use crate::{Error, Result};
use bytes::Bytes;
use log::debug;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// Transport flavor a binding adapts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Ordered byte stream (TCP)
    Stream,
    /// Addressed datagram (UDP)
    Datagram,
}

/// Largest possible UDP payload; staging buffer size for datagram reads
const MAX_DATAGRAM: usize = 65535;

/// Events to poll a socket for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollEvents {
    Read,
    Write,
}

/// Wait for a file descriptor to become ready
///
/// Returns false if the timeout elapsed first; `None` waits indefinitely.
pub(crate) fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().clamp(1, i32::MAX as u128) as i32)
        .unwrap_or(-1); // -1 = infinite

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        return Err(Error::Transport(io::Error::last_os_error()));
    }

    Ok(result > 0)
}

/// Convert an operation timeout into an absolute deadline
fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

/// Time left until a deadline, or `Error::Timeout` if it already passed
fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>> {
    match deadline {
        None => Ok(None),
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                Err(Error::Timeout)
            } else {
                Ok(Some(d - now))
            }
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// The byte-exchange contract between a raw transport and the handshake
/// engine
///
/// The engine is written once against this address-erased, two-operation
/// shape. The `Read`/`Write` supertraits are the form the engine's record
/// layer actually drives, using the binding's configured I/O timeout;
/// `send`/`recv` are the same operations with an explicit per-call timeout.
///
/// This is a closed abstraction with exactly two implementations,
/// [`StreamBinding`] and [`DatagramBinding`].
pub trait Binding: Read + Write + AsRawFd + sealed::Sealed {
    /// Transmit `data` via the underlying transport
    ///
    /// `None` timeout waits indefinitely. Fails with `Error::Timeout` if the
    /// deadline elapses before the transport accepts the write, and
    /// `Error::Transport` on transport failure.
    fn send(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<()>;

    /// Receive up to `max` bytes from the underlying transport
    ///
    /// Returns `None` on clean end-of-input (stream transport only; a
    /// datagram transport has no such signal and always returns data,
    /// blocks, or times out).
    fn recv(&mut self, max: usize, timeout: Option<Duration>) -> Result<Option<Bytes>>;

    /// Set the timeout used when the engine drives this binding through
    /// `Read`/`Write`
    fn set_io_timeout(&mut self, timeout: Option<Duration>);

    /// Which transport flavor this binding adapts
    fn kind(&self) -> TransportKind;
}

/// Pass-through binding over an ordered byte stream
///
/// Generic over the stream type so unit tests can substitute an
/// instrumented transport; channels always use `TcpStream`.
pub struct StreamBinding<S = TcpStream> {
    sock: S,
    io_timeout: Option<Duration>,
}

impl<S: Read + Write + AsRawFd> StreamBinding<S> {
    /// Bind to a stream socket
    pub fn new(sock: S) -> Self {
        StreamBinding {
            sock,
            io_timeout: None,
        }
    }

    /// Get a reference to the underlying socket
    pub fn get_ref(&self) -> &S {
        &self.sock
    }

    /// Get a mutable reference to the underlying socket
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.sock
    }

    fn wait(&self, events: PollEvents, deadline: Option<Instant>) -> Result<()> {
        if !poll_fd(self.sock.as_raw_fd(), events, remaining(deadline)?)? {
            return Err(Error::Timeout);
        }
        Ok(())
    }
}

impl<S> sealed::Sealed for StreamBinding<S> {}

impl<S: Read + Write + AsRawFd> Binding for StreamBinding<S> {
    fn send(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        let deadline = deadline(timeout);
        let mut off = 0;
        // An empty send is still forwarded: exactly one underlying write.
        loop {
            self.wait(PollEvents::Write, deadline)?;
            match self.sock.write(&data[off..]) {
                Ok(n) => {
                    off += n;
                    if off >= data.len() {
                        return Ok(());
                    }
                    if n == 0 {
                        return Err(Error::Transport(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "stream accepted no bytes",
                        )));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Transport(e)),
            }
        }
    }

    fn recv(&mut self, max: usize, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        if max == 0 {
            return Ok(Some(Bytes::new()));
        }
        let deadline = deadline(timeout);
        let mut buf = vec![0u8; max];
        loop {
            self.wait(PollEvents::Read, deadline)?;
            match self.sock.read(&mut buf) {
                // Clean end-of-stream
                Ok(0) => return Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Some(Bytes::from(buf)));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Transport(e)),
            }
        }
    }

    fn set_io_timeout(&mut self, timeout: Option<Duration>) {
        self.io_timeout = timeout;
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }
}

impl<S: Read + Write + AsRawFd> Read for StreamBinding<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.recv(buf.len(), self.io_timeout) {
            Ok(None) => Ok(0),
            Ok(Some(data)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Err(e) => Err(e.into_io()),
        }
    }
}

impl<S: Read + Write + AsRawFd> Write for StreamBinding<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let timeout = self.io_timeout;
        self.send(buf, timeout).map_err(Error::into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sock.flush()
    }
}

impl<S: AsRawFd> AsRawFd for StreamBinding<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

/// The datagram-socket surface a [`DatagramBinding`] needs
///
/// Implemented for `std::net::UdpSocket`; unit tests substitute an
/// instrumented socket.
pub trait DatagramSocket: AsRawFd {
    /// Send one datagram to the given address
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram, returning its length and source address
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, peer)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }
}

/// Binding over a datagram socket fixed to one peer address
///
/// Applies the address envelope on send and strips it on receive. Datagrams
/// arriving from any other source are discarded and the read retried within
/// the same deadline. Empty sends perform no transport operation at all; an
/// empty UDP datagram carries no record and would only confuse the peer.
pub struct DatagramBinding<S = UdpSocket> {
    sock: S,
    peer: SocketAddr,
    staging: Vec<u8>,
    io_timeout: Option<Duration>,
}

impl<S: DatagramSocket> DatagramBinding<S> {
    /// Bind to a datagram socket with a fixed peer address
    pub fn new(sock: S, peer: SocketAddr) -> Self {
        DatagramBinding {
            sock,
            peer,
            staging: vec![0u8; MAX_DATAGRAM],
            io_timeout: None,
        }
    }

    /// The fixed peer address this binding exchanges datagrams with
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Get a reference to the underlying socket
    pub fn get_ref(&self) -> &S {
        &self.sock
    }

    fn wait(&self, events: PollEvents, deadline: Option<Instant>) -> Result<()> {
        if !poll_fd(self.sock.as_raw_fd(), events, remaining(deadline)?)? {
            return Err(Error::Timeout);
        }
        Ok(())
    }
}

impl<S> sealed::Sealed for DatagramBinding<S> {}

impl<S: DatagramSocket> Binding for DatagramBinding<S> {
    fn send(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        // Nothing to transmit; sending an empty datagram is meaningless.
        if data.is_empty() {
            return Ok(());
        }
        let deadline = deadline(timeout);
        loop {
            self.wait(PollEvents::Write, deadline)?;
            match self.sock.send_to(data, self.peer) {
                Ok(n) if n == data.len() => return Ok(()),
                Ok(n) => {
                    return Err(Error::Transport(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("datagram truncated: sent {} of {} bytes", n, data.len()),
                    )))
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Transport(e)),
            }
        }
    }

    /// Receive one datagram from the fixed peer
    ///
    /// `max` is ignored: datagram reads are atomic per-packet and the packet
    /// is returned as-is. Never returns `None`.
    fn recv(&mut self, _max: usize, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        let deadline = deadline(timeout);
        loop {
            self.wait(PollEvents::Read, deadline)?;
            match self.sock.recv_from(&mut self.staging) {
                Ok((n, from)) => {
                    if from != self.peer {
                        debug!("discarding datagram from unexpected source {}", from);
                        continue;
                    }
                    return Ok(Some(Bytes::copy_from_slice(&self.staging[..n])));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Transport(e)),
            }
        }
    }

    fn set_io_timeout(&mut self, timeout: Option<Duration>) {
        self.io_timeout = timeout;
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }
}

impl<S: DatagramSocket> Read for DatagramBinding<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.io_timeout;
        match self.recv(buf.len(), timeout) {
            Ok(Some(data)) => {
                // A packet that does not fit cannot be delivered partially;
                // a truncated record is unusable.
                if data.len() > buf.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "datagram exceeds read buffer",
                    ));
                }
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Ok(None) => unreachable!("datagram recv has no end-of-input"),
            Err(e) => Err(e.into_io()),
        }
    }
}

impl<S: DatagramSocket> Write for DatagramBinding<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let timeout = self.io_timeout;
        self.send(buf, timeout).map_err(Error::into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: DatagramSocket> AsRawFd for DatagramBinding<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}
