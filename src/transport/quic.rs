//! QUIC endpoints, TLS setup, and the datagram connection wrapper.
//!
//! Paths dial with an 8 s timeout, QUIC datagrams enabled, 15 s keep-alive
//! and 60 s idle timeout, and the congestion controller named in the
//! config. ALPN is `mpquic-ip`, TLS 1.3 only.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TlsConfig;
use crate::error::{Error, Result, TransportError};
use crate::types::CongestionAlgorithm;
use crate::ALPN;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(8);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

fn tls_err(e: impl std::fmt::Display) -> Error {
    TransportError::Tls(e.to_string()).into()
}

fn quic_err(e: impl std::fmt::Display) -> Error {
    TransportError::Quic(e.to_string()).into()
}

/// Shared transport parameters for both directions.
fn transport_config(congestion: CongestionAlgorithm) -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(KEEPALIVE_INTERVAL));
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(IDLE_TIMEOUT).map_err(quic_err)?,
    ));
    transport.datagram_receive_buffer_size(Some(1 << 20));
    transport.datagram_send_buffer_size(1 << 20);
    match congestion {
        CongestionAlgorithm::Cubic => {
            transport.congestion_controller_factory(Arc::new(
                quinn::congestion::CubicConfig::default(),
            ));
        }
        CongestionAlgorithm::Bbr => {
            transport.congestion_controller_factory(Arc::new(
                quinn::congestion::BbrConfig::default(),
            ));
        }
        CongestionAlgorithm::Reno => {
            transport.congestion_controller_factory(Arc::new(
                quinn::congestion::NewRenoConfig::default(),
            ));
        }
    }
    Ok(transport)
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the rustls client config: CA-bundle verification, or none when the
/// config says so.
fn client_crypto(tls: &TlsConfig) -> Result<rustls::ClientConfig> {
    let provider = crypto_provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_err)?;

    let mut crypto = if tls.insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipVerification(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        let ca_path = tls.ca_file.as_ref().ok_or_else(|| {
            Error::InvalidConfig("tls: ca_file is required unless insecure is set".into())
        })?;
        let pem = std::fs::read(ca_path)?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            roots.add(cert.map_err(tls_err)?).map_err(tls_err)?;
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    crypto.alpn_protocols = vec![ALPN.to_vec()];
    Ok(crypto)
}

/// Build the rustls server config. Certificate and key come from files, or
/// a self-signed pair is generated when none are configured.
fn server_crypto(tls: &TlsConfig) -> Result<rustls::ServerConfig> {
    let (certs, key) = match (&tls.cert_file, &tls.key_file) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read(cert_path)?;
            let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(tls_err)?;
            let key_pem = std::fs::read(key_path)?;
            let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                .map_err(tls_err)?
                .ok_or_else(|| tls_err(format!("no private key in {}", key_path.display())))?;
            (certs, key)
        }
        _ => {
            debug!("no TLS certificate configured, generating self-signed");
            let signed = rcgen::generate_simple_self_signed(vec![tls
                .server_name
                .clone()
                .unwrap_or_else(|| "braid".to_string())])
            .map_err(tls_err)?;
            let cert = signed.cert.der().clone();
            let key = rustls::pki_types::PrivateKeyDer::Pkcs8(
                rustls::pki_types::PrivatePkcs8KeyDer::from(signed.key_pair.serialize_der()),
            );
            (vec![cert], key)
        }
    };

    let mut crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_err)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(tls_err)?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];
    Ok(crypto)
}

/// Dial a QUIC connection from `bind` to `remote`.
pub async fn dial_quic(
    bind: SocketAddr,
    remote: SocketAddr,
    tls: &TlsConfig,
    congestion: CongestionAlgorithm,
) -> Result<quinn::Connection> {
    let crypto = client_crypto(tls)?;
    let quic_crypto =
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto).map_err(tls_err)?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));
    client_config.transport_config(Arc::new(transport_config(congestion)?));

    let socket = super::create_udp_socket(bind)?;
    let runtime = quinn::default_runtime()
        .ok_or_else(|| Error::Internal("no async runtime for quinn".into()))?;
    let mut endpoint = quinn::Endpoint::new(
        quinn::EndpointConfig::default(),
        None,
        socket,
        runtime,
    )
    .map_err(|e| Error::Io(e))?;
    endpoint.set_default_client_config(client_config);

    let server_name = tls
        .server_name
        .clone()
        .unwrap_or_else(|| remote.ip().to_string());
    let connecting = endpoint.connect(remote, &server_name).map_err(quic_err)?;
    let connection = tokio::time::timeout(DIAL_TIMEOUT, connecting)
        .await
        .map_err(|_| Error::ConnectionTimeout)?
        .map_err(|e| Error::ConnectionFailed {
            addr: remote,
            reason: e.to_string(),
        })?;
    Ok(connection)
}

/// Create the server listening endpoint.
pub fn listen_quic(
    listen: SocketAddr,
    tls: &TlsConfig,
    congestion: CongestionAlgorithm,
) -> Result<quinn::Endpoint> {
    let crypto = server_crypto(tls)?;
    let quic_crypto =
        quinn::crypto::rustls::QuicServerConfig::try_from(crypto).map_err(tls_err)?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
    server_config.transport_config(Arc::new(transport_config(congestion)?));

    let socket = super::create_udp_socket(listen)?;
    let runtime = quinn::default_runtime()
        .ok_or_else(|| Error::Internal("no async runtime for quinn".into()))?;
    let endpoint = quinn::Endpoint::new(
        quinn::EndpointConfig::default(),
        Some(server_config),
        socket,
        runtime,
    )
    .map_err(Error::Io)?;
    Ok(endpoint)
}

/// A QUIC connection carrying one IP packet per datagram.
pub struct QuicDatagramConn {
    connection: quinn::Connection,
}

impl QuicDatagramConn {
    pub fn new(connection: quinn::Connection) -> Self {
        Self { connection }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub fn connection(&self) -> &quinn::Connection {
        &self.connection
    }
}

#[async_trait]
impl super::DatagramConn for QuicDatagramConn {
    async fn send_datagram(&self, pkt: &[u8]) -> Result<()> {
        self.connection
            .send_datagram(Bytes::copy_from_slice(pkt))
            .map_err(|e| TransportError::SendFailed(e.to_string()).into())
    }

    async fn recv_datagram(&self, cancel: &CancellationToken) -> Result<Bytes> {
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            datagram = self.connection.read_datagram() => {
                datagram.map_err(|e| TransportError::ReceiveFailed(e.to_string()).into())
            }
        }
    }

    fn close(&self) {
        self.connection.close(0u32.into(), b"shutdown");
    }
}

/// Certificate verifier that accepts anything; enabled only by the
/// `insecure` config flag.
#[derive(Debug)]
struct SkipVerification(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
