use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::net;
use crate::tunnel::transport::{
    mux::MuxSession, Transport, TransportDialOptions, TransportListenOptions, TransportListener,
    TransportSession,
};

/// TLS session transport: a rustls-wrapped TCP connection carrying the same
/// yamux session as the plain transport. Certificate files are optional on
/// the listen side; when unset a self-signed certificate is generated, which
/// pairs with `tls_insecure_skip_verify` on the client.
pub struct TlsTransport;

impl TlsTransport {
    pub fn new() -> Self {
        Self
    }
}

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
        let server_cfg = pki::acceptor_config(&opts.tls.cert_file, &opts.tls.key_file)?;
        let acceptor = TlsAcceptor::from(Arc::new(server_cfg));

        let ln = TcpListener::bind(net::normalize_bind_addr(addr).as_ref()).await?;
        Ok(Box::new(TlsTransportListener { ln, acceptor }))
    }

    async fn dial(
        &self,
        addr: &str,
        opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let connector = TlsConnector::from(Arc::new(pki::connector_config(
            opts.tls.insecure_skip_verify,
        )));

        let name = if opts.tls.server_name.trim().is_empty() {
            host_of(addr)
        } else {
            opts.tls.server_name.trim().to_string()
        };
        let server_name = rustls::pki_types::ServerName::try_from(name)?;

        let c = TcpStream::connect(addr).await?;
        let remote = c.peer_addr().ok();
        let tls = connector.connect(server_name, c).await?;
        Ok(Arc::new(MuxSession::client(tls, remote)))
    }
}

fn host_of(addr: &str) -> String {
    let addr = addr.trim();
    let host = addr.rsplit_once(':').map_or(addr, |(h, _)| h);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        "localhost".to_string()
    } else {
        host.to_string()
    }
}

pub struct TlsTransportListener {
    ln: TcpListener,
    acceptor: TlsAcceptor,
}

#[async_trait]
impl TransportListener for TlsTransportListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        // A failed TLS handshake only burns that connection, not the listener.
        loop {
            let (c, peer) = self.ln.accept().await?;
            match self.acceptor.accept(c).await {
                Ok(tls) => return Ok(Arc::new(MuxSession::server(tls, Some(peer)))),
                Err(err) => {
                    tracing::debug!(peer = %peer, err = %err, "tunnel: tls handshake failed");
                }
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

mod pki {
    use std::{fs, io::BufReader, path::Path, sync::Arc};

    use anyhow::Context;
    use rustls::{
        client::danger::{ServerCertVerified, ServerCertVerifier},
        crypto::WebPkiSupportedAlgorithms,
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    };

    type Identity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

    /// Server-side rustls config. Both PEM paths set: load them; both empty:
    /// mint a throwaway self-signed identity; anything else is a config
    /// mistake.
    pub fn acceptor_config(cert_file: &str, key_file: &str) -> anyhow::Result<rustls::ServerConfig> {
        let (chain, key) = match (cert_file.trim(), key_file.trim()) {
            ("", "") => self_signed_identity()?,
            ("", _) | (_, "") => anyhow::bail!(
                "tunnel: tls_cert_file and tls_key_file must be set together (leave both empty for a self-signed identity)"
            ),
            (cert, key) => pem_identity(Path::new(cert), Path::new(key))?,
        };

        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|err| anyhow::anyhow!("tunnel: tls server identity rejected: {err}"))
    }

    fn self_signed_identity() -> anyhow::Result<Identity> {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
        let chain = vec![generated.cert.der().to_owned()];
        let key = PrivatePkcs8KeyDer::from(generated.signing_key.serialize_der());
        Ok((chain, key.into()))
    }

    fn pem_identity(cert_path: &Path, key_path: &Path) -> anyhow::Result<Identity> {
        let mut cert_reader = BufReader::new(
            fs::File::open(cert_path)
                .with_context(|| format!("tunnel: tls cert {}", cert_path.display()))?,
        );
        let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<_, _>>()
            .with_context(|| format!("tunnel: tls cert {}", cert_path.display()))?;
        anyhow::ensure!(
            !chain.is_empty(),
            "tunnel: no certificates in {}",
            cert_path.display()
        );

        let mut key_reader = BufReader::new(
            fs::File::open(key_path)
                .with_context(|| format!("tunnel: tls key {}", key_path.display()))?,
        );
        let key = rustls_pemfile::private_key(&mut key_reader)
            .with_context(|| format!("tunnel: tls key {}", key_path.display()))?
            .ok_or_else(|| anyhow::anyhow!("tunnel: no private key in {}", key_path.display()))?;

        Ok((chain, key))
    }

    /// Client-side rustls config. The default (empty root store) only trusts
    /// what a future root-CA option would add; self-signed deployments opt
    /// into `insecure_skip_verify` instead.
    pub fn connector_config(insecure_skip_verify: bool) -> rustls::ClientConfig {
        let builder = rustls::ClientConfig::builder();
        if insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(TrustAnyCert::default()))
                .with_no_client_auth()
        } else {
            builder
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth()
        }
    }

    /// Accepts whatever certificate the server presents, while still checking
    /// the handshake signatures. Only reachable through
    /// `tls_insecure_skip_verify`; in that mode the auth token is the real
    /// gate, and the connection is open to interception.
    #[derive(Debug)]
    struct TrustAnyCert {
        algs: WebPkiSupportedAlgorithms,
    }

    impl Default for TrustAnyCert {
        fn default() -> Self {
            Self {
                algs: rustls::crypto::ring::default_provider().signature_verification_algorithms,
            }
        }
    }

    impl ServerCertVerifier for TrustAnyCert {
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
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algs)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algs)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.algs.supported_schemes()
        }
    }
}
