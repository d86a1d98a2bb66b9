use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector, client::TlsStream};

use crate::subway::tunnel::transport::{
    PendingConn, TlsDialOptions, TlsListenOptions, Transport, TransportConn, TransportDialOptions,
    TransportListenOptions, TransportListener, host_of,
};

/// TCP wrapped in TLS 1.2+.
pub struct TlsTransport;

#[async_trait]
impl Transport for TlsTransport {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let acceptor = acceptor(&opts.tls)?;
        let ln = TcpListener::bind(addr)
            .await
            .with_context(|| format!("tunnel: bind {addr}"))?;
        Ok(Box::new(TlsTransportListener { ln, acceptor }))
    }

    async fn dial(&self, addr: &str, opts: TransportDialOptions) -> anyhow::Result<TransportConn> {
        let c = TcpStream::connect(addr)
            .await
            .with_context(|| format!("tunnel: connect {addr}"))?;
        let _ = c.set_nodelay(true);
        let remote_addr = c.peer_addr().ok();
        let s = connect(c, addr, &opts.tls).await?;
        Ok(TransportConn {
            stream: Box::new(s),
            remote_addr,
        })
    }
}

pub struct TlsTransportListener {
    ln: TcpListener,
    acceptor: TlsAcceptor,
}

#[async_trait]
impl TransportListener for TlsTransportListener {
    async fn accept(&self) -> anyhow::Result<PendingConn> {
        let (c, peer) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        let acceptor = self.acceptor.clone();
        Ok(Box::pin(async move {
            let s = acceptor
                .accept(c)
                .await
                .with_context(|| format!("tunnel: tls handshake with {peer}"))?;
            Ok(TransportConn {
                stream: Box::new(s),
                remote_addr: Some(peer),
            })
        }))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }
}

pub(crate) fn acceptor(opts: &TlsListenOptions) -> anyhow::Result<TlsAcceptor> {
    let (certs, key) = tls_config::load_or_generate_cert(&opts.cert_file, &opts.key_file)?;
    let cfg = tls_config::server_config(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(cfg)))
}

pub(crate) async fn connect(
    c: TcpStream,
    addr: &str,
    opts: &TlsDialOptions,
) -> anyhow::Result<TlsStream<TcpStream>> {
    let cfg = tls_config::client_config(opts.insecure_skip_verify, &opts.ca_file)?;
    let name = if opts.server_name.trim().is_empty() {
        host_of(addr).to_string()
    } else {
        opts.server_name.trim().to_string()
    };
    let server_name = rustls::pki_types::ServerName::try_from(name.clone())
        .with_context(|| format!("tunnel: invalid tls server name {name:?}"))?;
    let s = TlsConnector::from(Arc::new(cfg))
        .connect(server_name, c)
        .await
        .with_context(|| format!("tunnel: tls handshake with {addr}"))?;
    Ok(s)
}

mod tls_config {
    use std::{fs, path::Path, sync::Arc};

    use rcgen::generate_simple_self_signed;
    use rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::CryptoProvider,
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    };

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    pub fn load_or_generate_cert(
        cert_file: &str,
        key_file: &str,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let cert_file = cert_file.trim();
        let key_file = key_file.trim();

        if !cert_file.is_empty() || !key_file.is_empty() {
            if cert_file.is_empty() || key_file.is_empty() {
                anyhow::bail!(
                    "tunnel: tls requires both cert_file and key_file (or neither to auto-generate)"
                );
            }
            let certs = load_certs(Path::new(cert_file))?;
            let key = load_key(Path::new(key_file))?;
            return Ok((certs, key));
        }

        tracing::warn!("tunnel: no tls certificate configured; using a generated self-signed one");
        let rcgen::CertifiedKey { cert, signing_key } =
            generate_simple_self_signed(["localhost".to_string()])?;
        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
        Ok((vec![cert_der], key_der))
    }

    fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
        let data = fs::read(path).map_err(|e| anyhow::anyhow!("tunnel: read {}: {e}", path.display()))?;
        let mut rd = std::io::Cursor::new(&data);
        let certs = rustls_pemfile::certs(&mut rd).collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            anyhow::bail!("tunnel: no certificates found in {}", path.display());
        }
        Ok(certs)
    }

    fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
        let data = fs::read(path).map_err(|e| anyhow::anyhow!("tunnel: read {}: {e}", path.display()))?;
        let mut rd = std::io::Cursor::new(&data);
        let Some(k) = rustls_pemfile::private_key(&mut rd)? else {
            anyhow::bail!("tunnel: no private key found in {}", path.display());
        };
        Ok(k)
    }

    pub fn server_config(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> anyhow::Result<rustls::ServerConfig> {
        let cfg = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(cfg)
    }

    pub fn client_config(
        insecure_skip_verify: bool,
        ca_file: &str,
    ) -> anyhow::Result<rustls::ClientConfig> {
        let builder = rustls::ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?;

        if insecure_skip_verify {
            tracing::warn!("tunnel: tls certificate verification disabled");
            return Ok(builder
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new())
                .with_no_client_auth());
        }

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let ca_file = ca_file.trim();
        if !ca_file.is_empty() {
            for cert in load_certs(Path::new(ca_file))? {
                roots.add(cert)?;
            }
        }
        Ok(builder.with_root_certificates(roots).with_no_client_auth())
    }

    /// Certificate verifier that accepts any server certificate.
    ///
    /// NOTE: vulnerable to MITM. Intended for local dev / testing only.
    #[derive(Debug)]
    struct SkipServerVerification(Arc<CryptoProvider>);

    impl SkipServerVerification {
        fn new() -> Arc<Self> {
            Arc::new(Self(provider()))
        }
    }

    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
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

}
