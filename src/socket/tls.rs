//! TLS options and their compilation into rustls configurations.
//!
//! `TlsOptions` is the opaque configuration handed to the TLS provider: trust
//! material, an optional identity, verification mode, protocol version bounds
//! and a server-name override. It is compiled into a rustls `ClientConfig` or
//! `ServerConfig`, depending on which side of the handshake the socket plays.
//! Compiled configurations are cached and shared by every clone of the options;
//! `TlsOptionsBuilder::build` compiles them up front.

use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pemfile::Item;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

static NATIVE_ROOTS: OnceLock<Arc<RootCertStore>> = OnceLock::new();

/// Peer certificate verification mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// Accept any certificate (development only)
    None,
    /// Certificate must chain to a trusted root and match the server name
    #[default]
    Peer,
}

impl std::fmt::Display for VerifyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Peer => write!(f, "peer"),
        }
    }
}

impl std::str::FromStr for VerifyMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "peer" => Ok(Self::Peer),
            _ => Err(Error::Argument(format!(
                "invalid verify mode '{}': expected none or peer",
                s
            ))),
        }
    }
}

/// TLS protocol version bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub enum TlsVersion {
    /// TLS 1.2
    #[serde(rename = "1.2")]
    Tls12,
    /// TLS 1.3
    #[serde(rename = "1.3")]
    Tls13,
}

impl TlsVersion {
    fn supported(self) -> &'static rustls::SupportedProtocolVersion {
        match self {
            Self::Tls12 => &rustls::version::TLS12,
            Self::Tls13 => &rustls::version::TLS13,
        }
    }
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tls12 => write!(f, "1.2"),
            Self::Tls13 => write!(f, "1.3"),
        }
    }
}

impl std::str::FromStr for TlsVersion {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "1.2" | "TLSv1.2" => Ok(Self::Tls12),
            "1.3" | "TLSv1.3" => Ok(Self::Tls13),
            _ => Err(Error::Argument(format!(
                "invalid TLS version '{}': expected 1.2 or 1.3",
                s
            ))),
        }
    }
}

/// TLS options for secure-pending connects and in-place upgrades.
///
/// By default the peer is verified against the system root certificates and
/// both TLS 1.2 and 1.3 are allowed.
///
/// # Examples
///
/// ```ignore
/// use tls_sockets::TlsOptions;
///
/// // Trust a private CA
/// let tls = TlsOptions::builder()
///     .ca_cert_path("/etc/ssl/private-ca.pem")
///     .server_name("db.internal")
///     .build()?;
///
/// // Server side of an upgrade
/// let tls = TlsOptions::builder()
///     .identity_paths("/etc/ssl/server.crt", "/etc/ssl/server.key")
///     .build()?;
/// ```
#[derive(Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsOptions {
    /// PEM file with trusted CA certificates (None = system roots)
    ca_cert_path: Option<PathBuf>,
    /// In-memory PEM trust material, takes precedence over `ca_cert_path`
    #[serde(skip)]
    ca_cert_pem: Option<Vec<u8>>,
    /// PEM certificate chain presented to the peer
    cert_path: Option<PathBuf>,
    /// PEM private key matching `cert_path`
    key_path: Option<PathBuf>,
    #[serde(skip)]
    cert_pem: Option<Vec<u8>>,
    #[serde(skip)]
    key_pem: Option<Vec<u8>>,
    verify_mode: VerifyMode,
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    /// SNI / verification name override
    server_name: Option<String>,
    #[serde(skip)]
    compiled: Arc<Compiled>,
}

#[derive(Default)]
struct Compiled {
    client: OnceLock<Arc<ClientConfig>>,
    server: OnceLock<Arc<ServerConfig>>,
}

impl TlsOptions {
    /// Create a new TLS options builder.
    pub fn builder() -> TlsOptionsBuilder {
        TlsOptionsBuilder::default()
    }

    /// Verification mode
    pub fn verify_mode(&self) -> VerifyMode {
        self.verify_mode
    }

    /// Server name override, if any
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Minimum protocol version, if bounded
    pub fn min_version(&self) -> Option<TlsVersion> {
        self.min_version
    }

    /// Maximum protocol version, if bounded
    pub fn max_version(&self) -> Option<TlsVersion> {
        self.max_version
    }

    /// Whether an identity (certificate chain and key) is configured
    pub fn has_identity(&self) -> bool {
        (self.cert_pem.is_some() || self.cert_path.is_some())
            && (self.key_pem.is_some() || self.key_path.is_some())
    }

    /// Check option consistency without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        if let (Some(min), Some(max)) = (self.min_version, self.max_version) {
            if min > max {
                return Err(Error::Argument(format!(
                    "min_version {} is greater than max_version {}",
                    min, max
                )));
            }
        }

        let has_cert = self.cert_pem.is_some() || self.cert_path.is_some();
        let has_key = self.key_pem.is_some() || self.key_path.is_some();
        if has_cert != has_key {
            return Err(Error::Argument(
                "certificate and private key must be configured together".into(),
            ));
        }

        if let Some(name) = &self.server_name {
            resolve_server_name(name)?;
        }

        Ok(())
    }

    fn protocol_versions(&self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        [TlsVersion::Tls12, TlsVersion::Tls13]
            .into_iter()
            .filter(|v| self.min_version.map_or(true, |min| *v >= min))
            .filter(|v| self.max_version.map_or(true, |max| *v <= max))
            .map(TlsVersion::supported)
            .collect()
    }

    /// Client configuration, if already compiled
    pub(crate) fn cached_client_config(&self) -> Option<Arc<ClientConfig>> {
        self.compiled.client.get().cloned()
    }

    /// Server configuration, if already compiled
    pub(crate) fn cached_server_config(&self) -> Option<Arc<ServerConfig>> {
        self.compiled.server.get().cloned()
    }

    /// Client configuration, compiled on first use.
    ///
    /// May read certificate files and the system trust store.
    pub(crate) fn client_config(&self) -> Result<Arc<ClientConfig>> {
        if let Some(config) = self.cached_client_config() {
            return Ok(config);
        }
        let config = self.compile_client()?;
        Ok(self.compiled.client.get_or_init(|| config).clone())
    }

    /// Server configuration, compiled on first use. Requires an identity.
    pub(crate) fn server_config(&self) -> Result<Arc<ServerConfig>> {
        if let Some(config) = self.cached_server_config() {
            return Ok(config);
        }
        let config = self.compile_server()?;
        Ok(self.compiled.server.get_or_init(|| config).clone())
    }

    fn compile_client(&self) -> Result<Arc<ClientConfig>> {
        self.validate()?;
        let provider = crypto_provider();
        let versions = self.protocol_versions();

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&versions)
            .map_err(|e| Error::Config(format!("unsupported TLS versions: {}", e)))?;

        let builder = match self.verify_mode {
            VerifyMode::Peer => builder.with_root_certificates(self.root_store()?),
            VerifyMode::None => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification::new(provider))),
        };

        let config = match self.identity()? {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::Config(format!("invalid client certificate: {}", e)))?,
            None => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }

    fn compile_server(&self) -> Result<Arc<ServerConfig>> {
        self.validate()?;
        let (certs, key) = self.identity()?.ok_or_else(|| {
            Error::Argument("server-side TLS requires a certificate and private key".into())
        })?;

        let versions = self.protocol_versions();
        let config = ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&versions)
            .map_err(|e| Error::Config(format!("unsupported TLS versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Config(format!("invalid server certificate: {}", e)))?;

        Ok(Arc::new(config))
    }

    fn root_store(&self) -> Result<Arc<RootCertStore>> {
        if let Some(pem) = &self.ca_cert_pem {
            return load_custom_ca(pem, "<memory>").map(Arc::new);
        }

        if let Some(path) = &self.ca_cert_path {
            let pem = read_file(path, "CA certificate")?;
            return load_custom_ca(&pem, &path.display().to_string()).map(Arc::new);
        }

        Ok(NATIVE_ROOTS.get_or_init(load_native_roots).clone())
    }

    #[allow(clippy::type_complexity)]
    fn identity(&self) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
        let cert_pem = match (&self.cert_pem, &self.cert_path) {
            (Some(pem), _) => pem.clone(),
            (None, Some(path)) => read_file(path, "certificate")?,
            (None, None) => return Ok(None),
        };
        let key_pem = match (&self.key_pem, &self.key_path) {
            (Some(pem), _) => pem.clone(),
            (None, Some(path)) => read_file(path, "private key")?,
            (None, None) => return Ok(None),
        };

        let certs = rustls_pemfile::certs(&mut std::io::Cursor::new(&cert_pem))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Config(format!("failed to parse certificate chain: {}", e)))?;
        if certs.is_empty() {
            return Err(Error::Config("no certificates found in chain".into()));
        }

        let key = rustls_pemfile::private_key(&mut std::io::Cursor::new(&key_pem))
            .map_err(|e| Error::Config(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| Error::Config("no private key found".into()))?;

        Ok(Some((certs, key)))
    }
}

impl std::fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsOptions")
            .field("ca_cert_path", &self.ca_cert_path)
            .field("ca_cert_pem", &self.ca_cert_pem.as_ref().map(|_| "<pem>"))
            .field("cert_path", &self.cert_path)
            .field("has_identity", &self.has_identity())
            .field("verify_mode", &self.verify_mode)
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("server_name", &self.server_name)
            .finish()
    }
}

/// Builder for TLS options.
#[derive(Default)]
pub struct TlsOptionsBuilder {
    options: TlsOptions,
}

impl TlsOptionsBuilder {
    /// Trust the CA certificates in a PEM file instead of the system roots.
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.ca_cert_path = Some(path.into());
        self
    }

    /// Trust the CA certificates in an in-memory PEM buffer.
    pub fn ca_cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.options.ca_cert_pem = Some(pem.into());
        self
    }

    /// Present the certificate chain and key stored in PEM files.
    ///
    /// Required on the server side of an upgrade; optional client identity otherwise.
    pub fn identity_paths(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.options.cert_path = Some(cert.into());
        self.options.key_path = Some(key.into());
        self
    }

    /// Present an in-memory PEM certificate chain and key.
    pub fn identity_pem(mut self, cert: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        self.options.cert_pem = Some(cert.into());
        self.options.key_pem = Some(key.into());
        self
    }

    /// Set the verification mode (default: peer).
    pub fn verify_mode(mut self, mode: VerifyMode) -> Self {
        self.options.verify_mode = mode;
        self
    }

    /// ⚠️ **DANGER**: accept any peer certificate (development only).
    pub fn danger_accept_invalid_certs(self) -> Self {
        self.verify_mode(VerifyMode::None)
    }

    /// Lowest protocol version to negotiate.
    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.options.min_version = Some(version);
        self
    }

    /// Highest protocol version to negotiate.
    pub fn max_version(mut self, version: TlsVersion) -> Self {
        self.options.max_version = Some(version);
        self
    }

    /// Name used for SNI and certificate verification instead of the dialed host.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.options.server_name = Some(name.into());
        self
    }

    /// Build the options and compile their rustls configurations.
    ///
    /// The server configuration is compiled only when an identity is set.
    ///
    /// # Errors
    ///
    /// Returns `Error::Argument` if the version bounds are inverted, only half
    /// of an identity is configured, or the server name is invalid, and
    /// `Error::Config` if certificate or key material cannot be loaded.
    pub fn build(self) -> Result<TlsOptions> {
        self.options.validate()?;
        self.options.client_config()?;
        if self.options.has_identity() {
            self.options.server_config()?;
        }
        Ok(self.options)
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// System trust store, with the bundled webpki roots as a fallback.
///
/// Loaded once per process.
fn load_native_roots() -> Arc<RootCertStore> {
    let result = rustls_native_certs::load_native_certs();
    let mut store = RootCertStore::empty();
    for cert in result.certs {
        let _ = store.add_parsable_certificates(std::iter::once(cert));
    }

    if store.is_empty() {
        tracing::warn!(
            errors = result.errors.len(),
            "no system root certificates loaded, using bundled webpki roots"
        );
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    Arc::new(store)
}

fn read_file(path: &Path, what: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        Error::Config(format!(
            "failed to read {} file '{}': {}",
            what,
            path.display(),
            e
        ))
    })
}

/// Load CA certificates from PEM data.
fn load_custom_ca(pem: &[u8], source: &str) -> Result<RootCertStore> {
    let mut reader = std::io::Cursor::new(pem);
    let mut root_store = RootCertStore::empty();
    let mut found_certs = 0;

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::X509Certificate(cert))) => {
                let _ = root_store.add_parsable_certificates(std::iter::once(cert));
                found_certs += 1;
            }
            Ok(Some(_)) => {
                // Skip keys and other items
            }
            Ok(None) => break,
            Err(_) => {
                return Err(Error::Config(format!(
                    "failed to parse CA certificate from '{}'",
                    source
                )));
            }
        }
    }

    if found_certs == 0 {
        return Err(Error::Config(format!(
            "no valid certificates found in '{}'",
            source
        )));
    }

    Ok(root_store)
}

/// Resolve a host name or IP literal into a TLS server name.
///
/// A trailing dot is ignored.
pub fn resolve_server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim_end_matches('.');

    if host.is_empty() || host.len() > 253 {
        return Err(Error::Argument(format!(
            "invalid hostname for TLS: '{}'",
            host
        )));
    }

    ServerName::try_from(host.to_string())
        .map_err(|_| Error::Argument(format!("invalid hostname for TLS: '{}'", host)))
}

/// Certificate verifier that accepts any certificate but still checks
/// handshake signatures.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl NoVerification {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
