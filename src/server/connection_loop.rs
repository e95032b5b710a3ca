// src/server/connection_loop.rs

//! Accept loops for the RPC and provisioning listeners, plus the graceful
//! shutdown sequence.

use super::initialization::BoundListener;
use super::stream::AnyStream;
use crate::connection::{ConnectionHandler, PeerAuth, PeerInfo};
use crate::core::cell::CellLogic;
use crate::core::certs;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use tokio::signal::unix::{SignalKind, signal};

/// Waits for SIGINT or SIGTERM.
pub async fn await_shutdown_signal() {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!("could not install SIGINT handler: {e}");
            std::future::pending::<()>().await;
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("could not install SIGTERM handler: {e}");
            std::future::pending::<()>().await;
            return;
        }
    };
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown."),
        _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
    }
}

/// Runs one listener until shutdown, spawning a handler per session. The
/// TLS handshake happens inside the session task so a slow peer cannot
/// stall the accept loop.
pub async fn run_listener(
    logic: Arc<dyn CellLogic>,
    listener: BoundListener,
    prov_only: bool,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut sessions = JoinSet::new();
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,

            // Reap finished session tasks as they go.
            Some(res) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = res
                    && e.is_panic()
                {
                    warn!("a session handler panicked: {e:?}");
                }
            }

            accepted = accept_raw(&listener) => {
                let (raw, tls) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("failed to accept session: {e}");
                        continue;
                    }
                };

                let logic = logic.clone();
                let rx = shutdown_tx.subscribe();

                sessions.spawn(async move {
                    let Some((stream, auth)) = finish_handshake(raw, tls).await else {
                        return;
                    };
                    let peer = PeerInfo { auth, prov_only };
                    ConnectionHandler::new(stream, logic, peer, rx).run().await;
                });
            }
        }
    }

    sessions.shutdown().await;
}

/// A connection fresh off a listener, before any TLS handshake.
enum RawConn {
    Tcp(tokio::net::TcpStream, std::net::SocketAddr),
    Unix(tokio::net::UnixStream),
}

async fn accept_raw(
    listener: &BoundListener,
) -> std::io::Result<(RawConn, Option<tokio_rustls::TlsAcceptor>)> {
    match listener {
        BoundListener::Unix { listener } => {
            let (socket, _) = listener.accept().await?;
            Ok((RawConn::Unix(socket), None))
        }
        BoundListener::Tcp { listener, tls } => {
            let (socket, addr) = listener.accept().await?;
            debug!("accepted connection from {addr}");
            Ok((RawConn::Tcp(socket, addr), tls.clone()))
        }
    }
}

/// Finishes the TLS handshake (when configured) and resolves the peer's
/// transport-level identity. `None` means the connection was dropped.
async fn finish_handshake(
    raw: RawConn,
    tls: Option<tokio_rustls::TlsAcceptor>,
) -> Option<(AnyStream, PeerAuth)> {
    match raw {
        RawConn::Unix(socket) => Some((AnyStream::Unix(socket), PeerAuth::TrustedLocal)),
        RawConn::Tcp(socket, addr) => {
            let Some(acceptor) = tls else {
                return Some((AnyStream::Tcp(socket), PeerAuth::Anonymous));
            };
            match acceptor.accept(socket).await {
                Ok(stream) => {
                    let auth = match stream
                        .get_ref()
                        .1
                        .peer_certificates()
                        .and_then(|chain| chain.first())
                    {
                        Some(leaf) => match certs::peer_cert_cn(leaf) {
                            Ok(cn) => PeerAuth::CertCn(cn),
                            Err(e) => {
                                warn!("TLS peer from {addr} has an unusable cert: {e}");
                                return None;
                            }
                        },
                        None => PeerAuth::Anonymous,
                    };
                    Some((AnyStream::Tls(Box::new(stream.into())), auth))
                }
                Err(e) => {
                    warn!("TLS handshake error for {addr}: {e}");
                    None
                }
            }
        }
    }
}
