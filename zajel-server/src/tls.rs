//! TLS for the client listener.
//!
//! Wraps the accept loop in a `TlsAcceptor` built from PEM cert/key
//! files so the WebSocket surface can be served directly over TLS.
//! Handshakes run in their own tasks; a failed handshake drops that
//! connection and never stalls the accept loop. The resulting listener
//! plugs straight into `axum::serve`.

use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;
use tokio_rustls::server::TlsStream;

/// Load a rustls server config from PEM cert chain and key files.
fn load_tls_config(cert_path: &str, key_path: &str) -> Result<rustls::ServerConfig> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("opening TLS certificate {cert_path}"))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("reading TLS certificate {cert_path}"))?;

    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("opening TLS key {key_path}"))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("reading TLS key {key_path}"))?
        .with_context(|| format!("no private key found in {key_path}"))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS config")
}

/// A TLS-terminating listener for `axum::serve`.
pub struct TlsListener {
    local_addr: SocketAddr,
    accepted: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
}

impl TlsListener {
    /// Wrap a bound TCP listener with TLS from the given PEM files.
    pub fn new(listener: TcpListener, cert_path: &str, key_path: &str) -> Result<Self> {
        let config = load_tls_config(cert_path, key_path)?;
        let acceptor = TlsAcceptor::from(Arc::new(config));
        let local_addr = listener.local_addr()?;
        let (tx, accepted) = mpsc::channel(64);

        tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("client accept error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls) => {
                            let _ = tx.send((tls, addr)).await;
                        }
                        Err(e) => {
                            tracing::debug!(%addr, "TLS handshake failed: {e}");
                        }
                    }
                });
            }
        });

        Ok(Self {
            local_addr,
            accepted,
        })
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.accepted.recv().await {
            Some(pair) => pair,
            // The accept task only dies at shutdown: park instead of
            // handing axum a broken connection.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}
