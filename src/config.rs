//! Handshake configuration
//!
//! This module defines the immutable protocol parameters applied to a
//! handshake engine before the handshake begins. A [`HandshakeConfig`] is a
//! plain value: build it once, pass it by value into the factory, never
//! mutate it afterwards.

use crate::Error;

/// TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// SSL 3.0 (deprecated, rarely used)
    Ssl3,
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Parse a TLS version from a string (case-insensitive)
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s.to_uppercase().as_str() {
            "SSLV3" | "SSL3" => Ok(TlsVersion::Ssl3),
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(Error::Configuration(format!("invalid TLS version: {}", s))),
        }
    }

    /// Get the OpenSSL protocol version constant
    pub fn to_openssl_version(self) -> openssl::ssl::SslVersion {
        use openssl::ssl::SslVersion;
        match self {
            TlsVersion::Ssl3 => SslVersion::SSL3,
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get the OpenSSL protocol version constant for a datagram transport
    ///
    /// Only TLS 1.0 and TLS 1.2 have DTLS counterparts (DTLS 1.0 and
    /// DTLS 1.2); pinning any other version on a datagram channel is a
    /// configuration error.
    pub(crate) fn to_openssl_dtls_version(self) -> Result<openssl::ssl::SslVersion, Error> {
        use openssl::ssl::SslVersion;
        match self {
            TlsVersion::Tls10 => Ok(SslVersion::DTLS1),
            TlsVersion::Tls12 => Ok(SslVersion::DTLS1_2),
            other => Err(Error::Configuration(format!(
                "{} has no datagram (DTLS) equivalent",
                other.as_str()
            ))),
        }
    }

    /// Get the version as a string
    pub fn as_str(self) -> &'static str {
        match self {
            TlsVersion::Ssl3 => "SSLv3",
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

/// Client certificate requirement (server side)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuth {
    /// Don't request a client certificate
    #[default]
    None,
    /// Request a client certificate but don't require one
    Request,
    /// Require a client certificate
    Require,
}

/// Protocol parameters applied to the engine before the handshake begins
///
/// `None` fields mean "platform default". The configuration is never
/// consulted again once the engine is built.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Minimum enabled protocol version
    pub min_version: Option<TlsVersion>,
    /// Maximum enabled protocol version
    pub max_version: Option<TlsVersion>,
    /// Cipher list for TLS 1.2 and below (OpenSSL cipher string)
    pub cipher_list: Option<String>,
    /// Cipher suites for TLS 1.3 (OpenSSL ciphersuite string)
    pub ciphersuites: Option<String>,
    /// Expected peer name: sent as SNI and, when `verify_hostname` is set,
    /// checked against the peer certificate (client side)
    pub server_name: Option<String>,
    /// Verify that the peer certificate matches `server_name`
    pub verify_hostname: bool,
    /// Client certificate requirement (server side)
    pub client_auth: ClientAuth,
    /// Path MTU hint for datagram channels
    ///
    /// DTLS over a bound datagram socket cannot query the link MTU, so
    /// handshake flights are fragmented to this size. Ignored for stream
    /// channels.
    pub mtu: Option<u32>,
}

/// Conservative MTU default for DTLS handshake flights
pub const DEFAULT_DTLS_MTU: u32 = 1200;

impl Default for HandshakeConfig {
    fn default() -> Self {
        HandshakeConfig {
            min_version: None,
            max_version: None,
            cipher_list: None,
            ciphersuites: None,
            server_name: None,
            verify_hostname: true,
            client_auth: ClientAuth::None,
            mtu: None,
        }
    }
}

impl HandshakeConfig {
    /// Set the protocol version (both min and max)
    pub fn with_version(mut self, version: TlsVersion) -> Self {
        self.min_version = Some(version);
        self.max_version = Some(version);
        self
    }

    /// Set the protocol version range
    pub fn with_version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.min_version = Some(min);
        self.max_version = Some(max);
        self
    }

    /// Set the cipher list (TLS 1.2 and below)
    pub fn with_cipher_list(mut self, ciphers: impl Into<String>) -> Self {
        self.cipher_list = Some(ciphers.into());
        self
    }

    /// Set the cipher suites (TLS 1.3)
    pub fn with_ciphersuites(mut self, ciphers: impl Into<String>) -> Self {
        self.ciphersuites = Some(ciphers.into());
        self
    }

    /// Set the expected peer name (SNI + hostname verification)
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Enable or disable hostname verification against `server_name`
    pub fn with_verify_hostname(mut self, verify: bool) -> Self {
        self.verify_hostname = verify;
        self
    }

    /// Set the client certificate requirement (server side)
    pub fn with_client_auth(mut self, auth: ClientAuth) -> Self {
        self.client_auth = auth;
        self
    }

    /// Set the DTLS path MTU hint
    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Validate the version range
    ///
    /// Contradictory parameters are a configuration error, caught before
    /// any engine is created.
    pub(crate) fn check(&self) -> Result<(), Error> {
        if let (Some(min), Some(max)) = (self.min_version, self.max_version) {
            if min > max {
                return Err(Error::Configuration(format!(
                    "contradictory version range: min {} > max {}",
                    min.as_str(),
                    max.as_str()
                )));
            }
        }
        Ok(())
    }
}
