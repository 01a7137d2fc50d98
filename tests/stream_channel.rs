//! TLS stream channel integration tests
//!
//! End-to-end coverage over loopback TCP pairs: handshakes in both roles,
//! application data exchange, trust material loaded from a PKCS#12 store,
//! client authentication, timeouts, and teardown.

use tlsbind::{
    ChannelFactory, ClientAuth, Diagnostics, Error, HandshakeConfig, Passphrase, TrustContext,
};
use tlsbind::dev_cert;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Spawn a TLS server for one connection; returns its port and join handle
fn spawn_server<F>(trust: TrustContext, config: HandshakeConfig, handler: F) -> (u16, thread::JoinHandle<()>)
where
    F: FnOnce(tlsbind::SecureChannel) + Send + 'static,
{
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let factory = ChannelFactory::new(trust);
        let (sock, _) = listener.accept().unwrap();
        let channel = factory.server(sock, config, Diagnostics::disabled()).unwrap();
        handler(channel);
    });

    (port, handle)
}

fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).unwrap()
}

fn dev_pkcs12_der(password: &str) -> Vec<u8> {
    let (cert, key) = dev_cert::dev_identity().unwrap();
    let mut builder = openssl::pkcs12::Pkcs12::builder();
    builder.name("dev identity");
    builder.pkey(&key);
    builder.cert(&cert);
    builder.build2(password).unwrap().to_der().unwrap()
}

#[test]
fn test_tls_ping_roundtrip() {
    let (port, server) = spawn_server(
        dev_cert::dev_trust().unwrap(),
        HandshakeConfig::default(),
        |mut channel| {
            let mut buf = [0u8; 4];
            let n = channel.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"ping");
            channel.write(b"pong").unwrap();
            channel.close().unwrap();
        },
    );

    let factory = ChannelFactory::new(TrustContext::insecure_trust_all());
    let mut channel = factory
        .client(connect(port), HandshakeConfig::default(), Diagnostics::disabled())
        .unwrap();

    channel.write(b"ping").unwrap();

    let mut buf = [0u8; 4];
    let n = channel.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong");

    channel.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_session_info_after_handshake() {
    let (port, server) = spawn_server(
        dev_cert::dev_trust().unwrap(),
        HandshakeConfig::default(),
        |channel| {
            assert!(channel.session().version.contains("TLS"));
        },
    );

    let factory = ChannelFactory::new(TrustContext::insecure_trust_all());
    let channel = factory
        .client(connect(port), HandshakeConfig::default(), Diagnostics::disabled())
        .unwrap();

    let session = channel.session();
    assert!(session.version.contains("TLS"));
    assert!(!session.cipher.is_empty());
    assert_eq!(session.peer_subject.as_deref(), Some("example.com"));

    server.join().unwrap();
}

#[test]
fn test_trust_all_accepts_self_signed_server() {
    // The development certificate is self-signed and anchored nowhere;
    // only the explicit accept-everything policy completes this handshake.
    let (port, server) = spawn_server(
        dev_cert::dev_trust().unwrap(),
        HandshakeConfig::default(),
        |_channel| {},
    );

    let factory = ChannelFactory::new(TrustContext::insecure_trust_all());
    let result = factory.client(connect(port), HandshakeConfig::default(), Diagnostics::disabled());
    assert!(result.is_ok());

    server.join().unwrap();
}

#[test]
fn test_validated_client_rejects_self_signed_server() {
    let (port, server) = spawn_server(
        dev_cert::dev_trust().unwrap(),
        HandshakeConfig::default(),
        |_channel| {},
    );

    let factory = ChannelFactory::new(TrustContext::system_default().unwrap());
    let result = factory.client(connect(port), HandshakeConfig::default(), Diagnostics::disabled());
    assert!(matches!(result, Err(Error::Handshake(_))));

    // The server side fails too once the client aborts; both outcomes are
    // fine as long as the thread finishes.
    let _ = server.join();
}

#[test]
fn test_server_identity_from_key_store() {
    let der = dev_pkcs12_der("storepass");
    let pass = Passphrase::from("storepass");
    let trust = TrustContext::from_key_store_der(&der, &pass, &pass).unwrap();

    let (port, server) = spawn_server(trust, HandshakeConfig::default(), |mut channel| {
        let mut buf = [0u8; 5];
        let n = channel.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    });

    let factory = ChannelFactory::new(TrustContext::insecure_trust_all());
    let mut channel = factory
        .client(connect(port), HandshakeConfig::default(), Diagnostics::disabled())
        .unwrap();
    channel.write(b"hello").unwrap();

    server.join().unwrap();
}

#[test]
fn test_client_auth_required_and_presented() {
    let server_config = HandshakeConfig::default().with_client_auth(ClientAuth::Require);
    let (port, server) = spawn_server(dev_cert::dev_trust().unwrap(), server_config, |channel| {
        // The client certificate survived verification.
        assert_eq!(channel.session().peer_subject.as_deref(), Some("example.com"));
    });

    // The client presents the same development identity the server anchors.
    let factory = ChannelFactory::new(dev_cert::dev_trust().unwrap());
    let result = factory.client(connect(port), HandshakeConfig::default(), Diagnostics::disabled());
    assert!(result.is_ok());

    server.join().unwrap();
}

#[test]
fn test_client_auth_required_but_missing() {
    init_logs();
    let server_config = HandshakeConfig::default().with_client_auth(ClientAuth::Require);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let factory = ChannelFactory::new(dev_cert::dev_trust().unwrap());
        let (sock, _) = listener.accept().unwrap();
        let result = factory.server(sock, server_config, Diagnostics::disabled());
        assert!(matches!(result, Err(Error::Handshake(_))));
    });

    // Insecure trust carries no identity, so the client has nothing to
    // present.
    let factory = ChannelFactory::new(TrustContext::insecure_trust_all());
    let _ = factory.client(connect(port), HandshakeConfig::default(), Diagnostics::disabled());

    server.join().unwrap();
}

#[test]
fn test_failed_construction_releases_socket() {
    use std::io::Read;
    use tlsbind::TlsVersion;

    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        // Construction fails on the client; the factory drops the raw
        // socket, so this read unblocks with end-of-stream.
        let mut buf = [0u8; 16];
        let n = sock.read(&mut buf).unwrap();
        assert_eq!(n, 0);
    });

    let factory = ChannelFactory::new(TrustContext::insecure_trust_all());
    let config =
        HandshakeConfig::default().with_version_range(TlsVersion::Tls13, TlsVersion::Tls12);
    let result = factory.client(connect(port), config, Diagnostics::disabled());
    assert!(matches!(result, Err(Error::Configuration(_))));

    server.join().unwrap();
}

#[test]
fn test_timeout_holds_mid_record() {
    use std::io::Write;
    use std::time::Instant;

    let (port, server) = spawn_server(
        dev_cert::dev_trust().unwrap(),
        HandshakeConfig::default(),
        |channel| {
            // One raw byte on the underlying socket: the start of a record
            // that never completes.
            let mut raw = channel.get_ref();
            raw.write_all(&[0x17]).unwrap();
            thread::sleep(Duration::from_millis(1000));
            drop(channel);
        },
    );

    let factory = ChannelFactory::new(TrustContext::insecure_trust_all());
    let mut channel = factory
        .client(connect(port), HandshakeConfig::default(), Diagnostics::disabled())
        .unwrap();
    channel.set_timeout(Some(Duration::from_millis(50)));

    // The poll sees the stray byte arrive, so the deadline must also bound
    // the engine's attempt to read the rest of the record.
    let start = Instant::now();
    let mut buf = [0u8; 16];
    let result = channel.read(&mut buf);
    assert!(result.is_err());
    assert!(start.elapsed() < Duration::from_millis(500));

    let _ = server.join();
}

#[test]
fn test_channel_read_timeout() {
    let (port, server) = spawn_server(
        dev_cert::dev_trust().unwrap(),
        HandshakeConfig::default(),
        |channel| {
            // Send nothing; hold the channel open long enough for the
            // client's read to time out.
            thread::sleep(Duration::from_millis(500));
            drop(channel);
        },
    );

    let factory = ChannelFactory::new(TrustContext::insecure_trust_all());
    let mut channel = factory
        .client(connect(port), HandshakeConfig::default(), Diagnostics::disabled())
        .unwrap();
    channel.set_timeout(Some(Duration::from_millis(50)));

    let mut buf = [0u8; 16];
    let result = channel.read(&mut buf);
    assert!(matches!(result, Err(Error::Timeout)));

    server.join().unwrap();
}

#[test]
fn test_close_is_idempotent() {
    let (port, server) = spawn_server(
        dev_cert::dev_trust().unwrap(),
        HandshakeConfig::default(),
        |_channel| {},
    );

    let factory = ChannelFactory::new(TrustContext::insecure_trust_all());
    let mut channel = factory
        .client(connect(port), HandshakeConfig::default(), Diagnostics::disabled())
        .unwrap();

    channel.close().unwrap();
    channel.close().unwrap();

    server.join().unwrap();
}

#[test]
fn test_diagnostics_trace_handshake_lines() {
    let (port, server) = spawn_server(
        dev_cert::dev_trust().unwrap(),
        HandshakeConfig::default(),
        |_channel| {},
    );

    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink_lines = lines.clone();
    let diagnostics = Diagnostics::new(move |line| {
        sink_lines.lock().unwrap().push(line.to_string());
    });

    let factory = ChannelFactory::new(TrustContext::insecure_trust_all());
    factory
        .client(connect(port), HandshakeConfig::default(), diagnostics)
        .unwrap();
    server.join().unwrap();

    let lines = lines.lock().unwrap();
    assert!(lines.iter().any(|l| l.contains("creating client engine")));
    assert!(lines.iter().any(|l| l.contains("handshake complete")));
}

#[test]
fn test_pinned_tls12_negotiates_tls12() {
    use tlsbind::TlsVersion;

    let server_config = HandshakeConfig::default();
    let (port, server) = spawn_server(dev_cert::dev_trust().unwrap(), server_config, |channel| {
        assert_eq!(channel.session().version, "TLSv1.2");
    });

    let factory = ChannelFactory::new(TrustContext::insecure_trust_all());
    let config = HandshakeConfig::default().with_version(TlsVersion::Tls12);
    let channel = factory
        .client(connect(port), config, Diagnostics::disabled())
        .unwrap();
    assert_eq!(channel.session().version, "TLSv1.2");

    server.join().unwrap();
}
