use std::sync::Arc;

use rustls::{pki_types::CertificateDer, ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use typed_builder::TypedBuilder;

use crate::error::{ErrorKind, Result};

/// Caller-supplied TLS configuration for [`Dialer::dial_tls`](crate::Dialer::dial_tls).
///
/// The bundled web PKI roots are always trusted; the defaults negotiate
/// TLS 1.2 or newer.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[non_exhaustive]
pub struct TlsOptions {
    /// Extra DER-encoded CA certificates trusted in addition to the
    /// bundled web PKI roots.
    #[builder(default)]
    pub extra_ca_certificates: Vec<Vec<u8>>,

    /// Overrides the name presented for SNI and certificate validation.
    /// Defaults to the dialed hostname.
    #[builder(default)]
    pub server_name: Option<String>,
}

fn make_rustls_config(options: &TlsOptions) -> Result<ClientConfig> {
    let mut roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect(),
    };
    for der in &options.extra_ca_certificates {
        roots
            .add(CertificateDer::from(der.clone()))
            .map_err(|e| ErrorKind::HandshakeFailure {
                message: format!("invalid extra CA certificate: {}", e),
            })?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Performs the client-side handshake over an established socket. The
/// socket is consumed; on failure it is dropped, which closes it.
pub(crate) async fn tls_connect(
    host: &str,
    options: &TlsOptions,
    tcp: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let name = options
        .server_name
        .clone()
        .unwrap_or_else(|| host.to_string());
    let server_name =
        rustls::pki_types::ServerName::try_from(name.clone()).map_err(|_| {
            ErrorKind::HandshakeFailure {
                message: format!("\"{}\" is not a valid TLS server name", name),
            }
        })?;

    let connector: TlsConnector = Arc::new(make_rustls_config(options)?).into();
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| {
            ErrorKind::HandshakeFailure {
                message: e.to_string(),
            }
            .into()
        })
}
