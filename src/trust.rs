//! Trust and identity material
//!
//! This module loads the trust/identity context a channel handshakes with:
//! a PKCS#12 key store (from a file, an embedded resource, or any byte
//! source), the platform default trust store, a pre-built `SslContext`, or
//! an explicit accept-everything policy for testing.
//!
//! Key material is parsed exactly once, at load time. The backing byte
//! source is owned by the loader call that opened it and is released before
//! that call returns, whether parsing succeeds or fails.

use crate::binding::TransportKind;
use crate::config::{ClientAuth, HandshakeConfig};
use crate::factory::Role;
use crate::{Error, Result};
use log::debug;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslOptions, SslVerifyMode};
use openssl::x509::X509;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use zeroize::Zeroizing;

/// Owned password material, wiped from memory on drop
///
/// The loader never retains a passphrase beyond the parse call that
/// consumes it.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    /// Wrap a secret string
    pub fn new(secret: impl Into<String>) -> Self {
        Passphrase(Zeroizing::new(secret.into()))
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Passphrase {
    fn from(secret: &str) -> Self {
        Passphrase::new(secret)
    }
}

impl From<String> for Passphrase {
    fn from(secret: String) -> Self {
        Passphrase::new(secret)
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// This endpoint's certificate, private key and intermediate chain
struct Identity {
    cert: X509,
    key: PKey<Private>,
    chain: Vec<X509>,
}

enum TrustSource {
    /// Caller-supplied, already-built native context used verbatim
    Native(SslContext),
    /// Accept every peer certificate chain, advertise no accepted issuers
    Insecure,
    /// Platform default trust store
    SystemDefault,
    /// Key material parsed from a key store; serves as both this endpoint's
    /// identity and the set of trust anchors for the peer
    Identity(Identity),
}

/// Trust/identity material for constructing secure channels
///
/// Built once by one of the loader entry points, then handed to a
/// [`crate::ChannelFactory`], which derives a native engine context from it
/// per channel. OpenSSL separates stream (TLS) and datagram (DTLS) methods
/// at the context level, so the native context is derived at channel
/// construction; the material itself is never re-parsed.
pub struct TrustContext {
    source: TrustSource,
}

impl TrustContext {
    /// Wrap an already-built native context
    ///
    /// The context is used as-is: its verification policy, identity and
    /// protocol settings govern the channel, and only per-engine parameters
    /// (SNI, hostname verification, MTU) from the handshake configuration
    /// are applied on top. The caller must have built it with a method
    /// matching the transport the channel will run over.
    pub fn from_native(ctx: SslContext) -> Self {
        TrustContext {
            source: TrustSource::Native(ctx),
        }
    }

    /// Trust context that accepts **every** peer certificate chain
    ///
    /// The peer validator unconditionally accepts any chain, including
    /// self-signed and expired ones, and advertises an empty accepted-issuer
    /// list. This disables authentication of the remote peer entirely: the
    /// channel is encrypted but the far end is unauthenticated. Only for
    /// tests and closed environments; never a default anywhere in this
    /// crate.
    pub fn insecure_trust_all() -> Self {
        TrustContext {
            source: TrustSource::Insecure,
        }
    }

    /// Platform default trust store
    ///
    /// Fails with `Error::Configuration` if the platform has no default
    /// verify paths configured.
    pub fn system_default() -> Result<Self> {
        // Probe at load time so a missing platform store surfaces here
        // rather than at first channel construction.
        let mut probe = SslContextBuilder::new(SslMethod::tls())
            .map_err(|e| Error::Configuration(format!("engine context creation failed: {}", e)))?;
        probe.set_default_verify_paths().map_err(|e| {
            Error::Configuration(format!("no platform default trust store: {}", e))
        })?;
        Ok(TrustContext {
            source: TrustSource::SystemDefault,
        })
    }

    /// Build from already-parsed identity material
    ///
    /// The entry for callers that obtained certificate and key out-of-band
    /// (for example from an in-memory store). `chain` lists intermediate
    /// certificates, leaf excluded.
    pub fn from_identity(cert: X509, key: PKey<Private>, chain: Vec<X509>) -> Self {
        TrustContext {
            source: TrustSource::Identity(Identity { cert, key, chain }),
        }
    }

    /// Parse a PKCS#12 key store from a byte source
    ///
    /// The reader is consumed: it is read to end and dropped before parsing
    /// begins, so the backing handle is released on every outcome. PKCS#12
    /// protects the whole store with one password; `store_pass` is tried
    /// first and `key_pass` second when the two differ.
    ///
    /// Fails with `Error::Io` if the source cannot be read and
    /// `Error::KeyMaterial` on a corrupt store or password mismatch.
    pub fn from_key_store_reader<R: Read>(
        reader: R,
        store_pass: &Passphrase,
        key_pass: &Passphrase,
    ) -> Result<Self> {
        let mut reader = reader;
        let mut bytes = Zeroizing::new(Vec::new());
        let read_result = reader.read_to_end(&mut bytes);
        // Release the byte source before parsing, success or failure.
        drop(reader);
        read_result?;
        Self::from_key_store_der(&bytes, store_pass, key_pass)
    }

    /// Parse a PKCS#12 key store from a file
    pub fn from_key_store_file<P: AsRef<Path>>(
        path: P,
        store_pass: &Passphrase,
        key_pass: &Passphrase,
    ) -> Result<Self> {
        debug!("loading key store from {}", path.as_ref().display());
        let file = File::open(path.as_ref())?;
        Self::from_key_store_reader(file, store_pass, key_pass)
    }

    /// Parse a PKCS#12 key store from in-memory DER bytes
    ///
    /// This is also the entry for embedded key stores
    /// (`include_bytes!("identity.p12")`).
    pub fn from_key_store_der(
        der: &[u8],
        store_pass: &Passphrase,
        key_pass: &Passphrase,
    ) -> Result<Self> {
        let pkcs12 = Pkcs12::from_der(der)
            .map_err(|e| Error::KeyMaterial(format!("malformed PKCS#12 key store: {}", e)))?;

        let parsed = match pkcs12.parse2(store_pass.as_str()) {
            Ok(parsed) => parsed,
            Err(first) if store_pass.as_str() != key_pass.as_str() => {
                pkcs12.parse2(key_pass.as_str()).map_err(|_| {
                    Error::KeyMaterial(format!("key store rejected both passwords: {}", first))
                })?
            }
            Err(e) => {
                return Err(Error::KeyMaterial(format!(
                    "key store rejected password: {}",
                    e
                )))
            }
        };

        let cert = parsed
            .cert
            .ok_or_else(|| Error::KeyMaterial("key store contains no certificate".into()))?;
        let key = parsed
            .pkey
            .ok_or_else(|| Error::KeyMaterial("key store contains no private key".into()))?;
        let chain: Vec<X509> = parsed
            .ca
            .map(|stack| stack.iter().map(|c| c.to_owned()).collect())
            .unwrap_or_default();

        debug!(
            "key store parsed: identity plus {} chain certificates",
            chain.len()
        );

        Ok(Self::from_identity(cert, key, chain))
    }

    /// Derive the native engine context for one channel
    ///
    /// Applies the trust material, the role's verification policy and the
    /// configuration's protocol/cipher parameters to a fresh context with
    /// the transport-appropriate method. Failures are configuration errors
    /// except identity installation, which is a key material error.
    pub(crate) fn ssl_context(
        &self,
        kind: TransportKind,
        role: Role,
        config: &HandshakeConfig,
    ) -> Result<SslContext> {
        config.check()?;

        if let TrustSource::Native(ctx) = &self.source {
            return Ok(ctx.clone());
        }

        let method = match kind {
            TransportKind::Stream => SslMethod::tls(),
            TransportKind::Datagram => SslMethod::dtls(),
        };
        let mut builder = SslContextBuilder::new(method)
            .map_err(|e| Error::Configuration(format!("engine context creation failed: {}", e)))?;

        let cfg_err = |e: openssl::error::ErrorStack| {
            Error::Configuration(format!("unsupported handshake parameter: {}", e))
        };
        let native_version = |v: crate::config::TlsVersion| match kind {
            TransportKind::Stream => Ok(v.to_openssl_version()),
            TransportKind::Datagram => v.to_openssl_dtls_version(),
        };
        if let Some(min) = config.min_version {
            builder
                .set_min_proto_version(Some(native_version(min)?))
                .map_err(cfg_err)?;
        }
        if let Some(max) = config.max_version {
            builder
                .set_max_proto_version(Some(native_version(max)?))
                .map_err(cfg_err)?;
        }
        if let Some(ref ciphers) = config.cipher_list {
            builder.set_cipher_list(ciphers).map_err(cfg_err)?;
        }
        if let Some(ref ciphers) = config.ciphersuites {
            builder.set_ciphersuites(ciphers).map_err(cfg_err)?;
        }
        if kind == TransportKind::Datagram {
            // The engine cannot query the path MTU through a binding; the
            // explicit MTU set at engine creation takes over.
            builder.set_options(SslOptions::NO_QUERY_MTU);
        }

        let key_err =
            |e: openssl::error::ErrorStack| Error::KeyMaterial(format!("identity rejected: {}", e));
        match &self.source {
            TrustSource::Native(_) => unreachable!("handled above"),
            TrustSource::Insecure => {}
            TrustSource::SystemDefault => {
                builder.set_default_verify_paths().map_err(|e| {
                    Error::Configuration(format!("no platform default trust store: {}", e))
                })?;
            }
            TrustSource::Identity(identity) => {
                builder.set_certificate(&identity.cert).map_err(key_err)?;
                builder.set_private_key(&identity.key).map_err(key_err)?;
                for cert in &identity.chain {
                    builder.add_extra_chain_cert(cert.clone()).map_err(key_err)?;
                }
                // The same material anchors verification of the peer.
                let store = builder.cert_store_mut();
                store.add_cert(identity.cert.clone()).map_err(key_err)?;
                for cert in &identity.chain {
                    store.add_cert(cert.clone()).map_err(key_err)?;
                }
            }
        }

        let insecure = matches!(self.source, TrustSource::Insecure);
        match role {
            Role::Client => {
                if insecure {
                    builder.set_verify_callback(SslVerifyMode::PEER, |_preverify, _ctx| true);
                } else {
                    builder.set_verify(SslVerifyMode::PEER);
                }
            }
            Role::Server => {
                let mode = match config.client_auth {
                    ClientAuth::None => SslVerifyMode::NONE,
                    ClientAuth::Request => SslVerifyMode::PEER,
                    ClientAuth::Require => {
                        SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT
                    }
                };
                if insecure && mode != SslVerifyMode::NONE {
                    builder.set_verify_callback(mode, |_preverify, _ctx| true);
                } else {
                    builder.set_verify(mode);
                }
            }
        }

        Ok(builder.build())
    }

    /// Whether this context carries identity material usable by a server
    pub fn has_identity(&self) -> bool {
        matches!(
            self.source,
            TrustSource::Identity(_) | TrustSource::Native(_)
        )
    }
}
