//! Accept loop and shared server state.

use std::net::SocketAddr;
use std::sync::Arc;

use eyre::WrapErr;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{Instrument, error, info, info_span};

use crate::anchor::AnchorTable;
use crate::app::{App, AppState};
use crate::config::{Config, RequestSettings, TlsConfig};
use crate::connection::ConnectionHandler;
use crate::language::Response;
use crate::log::{EventLog, Transaction, TransactionRecord};
use crate::policy::PolicyGate;

pub struct Server {
    pub config: Arc<Config>,
    pub anchors: AnchorTable,
    pub app: App,
    log: Arc<EventLog>,
    policy: PolicyGate,
    tls: Option<TlsAcceptor>,
}

impl Server {
    /// Validate the configuration and build the shared state. Anchor
    /// compilation and TLS material loading happen here, eagerly; a bad
    /// anchor or unreadable certificate means the server must not start.
    pub fn new(config: Config) -> eyre::Result<Arc<Self>> {
        let settings = config.request_settings();
        let anchors = AnchorTable::compile(&config.anchors, &settings)?;
        let tls = config.tls.as_ref().map(load_tls_acceptor).transpose()?;
        let log = Arc::new(if config.noapi {
            EventLog::disabled()
        } else {
            EventLog::new()
        });
        let config = Arc::new(config);
        let policy = PolicyGate {
            sizelimit: config.sizelimit,
            nohang: config.nohang,
        };
        let app = App::new(AppState {
            log: Arc::clone(&log),
            config: Arc::clone(&config),
        });
        Ok(Arc::new(Server {
            config,
            anchors,
            app,
            log,
            policy,
            tls,
        }))
    }

    /// Bind the configured address. With port 0 the resolved port is on the
    /// returned listener's local address.
    pub async fn bind(&self) -> eyre::Result<TcpListener> {
        TcpListener::bind(self.config.addr)
            .await
            .wrap_err_with(|| format!("failed to bind {}", self.config.addr))
    }

    /// Accept connections forever, one task per connection
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> eyre::Result<()> {
        let local = listener
            .local_addr()
            .wrap_err("listener has no local address")?;
        info!(%local, "listening");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(%err, "accept failed");
                    continue;
                }
            };
            let server = Arc::clone(&self);
            tokio::spawn(
                async move { server.handle_connection(stream, peer).await }
                    .instrument(info_span!("connection", %peer)),
            );
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        match self.tls.clone() {
            Some(acceptor) => {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(tls_stream) => tls_stream,
                    Err(err) => {
                        info!(%err, "TLS handshake failed");
                        self.add_log(Transaction::error(format!("TLS handshake failed: {err}")));
                        return;
                    }
                };
                let sni = tls_stream
                    .get_ref()
                    .1
                    .server_name()
                    .map(|name| name.to_string());
                ConnectionHandler::new(Arc::clone(&self), peer, sni)
                    .run(tls_stream)
                    .await;
            }
            None => {
                ConnectionHandler::new(Arc::clone(&self), peer, None)
                    .run(stream)
                    .await;
            }
        }
    }

    pub fn request_settings(&self) -> RequestSettings {
        self.config.request_settings()
    }

    pub fn check_policy(&self, response: &Response) -> Option<&'static str> {
        self.policy.check(response)
    }

    pub fn add_log(&self, transaction: Transaction) -> Option<u64> {
        self.log.append(transaction)
    }

    pub fn clear_log(&self) {
        self.log.clear()
    }

    pub fn log_by_id(&self, id: u64) -> Option<TransactionRecord> {
        self.log.by_id(id)
    }

    /// All retained records, newest first
    pub fn get_log(&self) -> Vec<TransactionRecord> {
        self.log.all()
    }
}

fn load_tls_acceptor(tls: &TlsConfig) -> eyre::Result<TlsAcceptor> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(&tls.certfile)
        .wrap_err("failed to read certificate file")?
        .collect::<Result<_, _>>()
        .wrap_err("failed to parse certificate file")?;
    let key = PrivateKeyDer::from_pem_file(&tls.keyfile).wrap_err("failed to read key file")?;
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .wrap_err("invalid certificate/key pair")?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
