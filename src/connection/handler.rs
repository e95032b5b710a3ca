// src/connection/handler.rs

//! Defines the `ConnectionHandler` which manages the full lifecycle of one
//! inbound transport session: framing, auth, sequential RPC dispatch, and
//! the exactly-once link-down signal.

use super::session::{PeerAuth, PeerInfo};
use crate::core::cell::{CellLogic, SessionCtx};
use crate::core::metrics;
use crate::core::wire::{self, WireMsg};
use crate::server::AnyStream;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Outbound frames queued per session before backpressure applies.
const OUT_QUEUE_CAPACITY: usize = 256;

/// Manages the full lifecycle of one inbound session.
pub struct ConnectionHandler {
    framed: Framed<AnyStream, tokio_util::codec::LengthDelimitedCodec>,
    logic: Arc<dyn CellLogic>,
    peer: PeerInfo,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ConnectionHandler {
    pub fn new(
        stream: AnyStream,
        logic: Arc<dyn CellLogic>,
        peer: PeerInfo,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            framed: Framed::new(stream, wire::codec()),
            logic,
            peer,
            shutdown_rx,
        }
    }

    /// The main loop. When it returns, the session's link-down has been
    /// delivered exactly once.
    pub async fn run(self) {
        let Self {
            framed,
            logic,
            peer,
            mut shutdown_rx,
        } = self;

        metrics::SESSIONS_RECEIVED_TOTAL.inc();
        metrics::CONNECTED_SESSIONS.inc();

        let link = uuid::Uuid::new_v4().simple().to_string();
        let (out_tx, mut out_rx) = mpsc::channel::<WireMsg>(OUT_QUEUE_CAPACITY);

        let mut ctx = SessionCtx {
            link: link.clone(),
            user: None,
            admin: false,
            prov_only: peer.prov_only,
            prov_iden: None,
            out_tx: out_tx.clone(),
        };

        // Transport-level identity is resolved before the first frame. A
        // rejected certificate identity is reported on the first call so
        // the peer sees the denial instead of a bare disconnect.
        let mut cert_denied: Option<crate::core::errors::AhaError> = None;
        match &peer.auth {
            PeerAuth::Anonymous => {}
            PeerAuth::TrustedLocal => {
                ctx.user = Some("root".to_string());
                ctx.admin = true;
            }
            PeerAuth::CertCn(cn) => match logic.auth_user_cert(cn) {
                Ok((user, admin)) => {
                    ctx.user = Some(user);
                    ctx.admin = admin;
                }
                Err(e) => {
                    warn!("session {link}: certificate identity rejected: {e}");
                    cert_denied = Some(e);
                }
            },
        }

        let (mut sink, mut stream) = framed.split();

        // One writer task serialises all outbound frames, preserving FIFO
        // per direction across replies and pushed events.
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let buf = match msg.encode() {
                    Ok(buf) => buf,
                    Err(_) => break,
                };
                if sink.send(buf).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // A dropped shutdown channel means nothing will ever signal; only
        // a real signal ends the session from this side.
        let mut shutdown_closed = false;
        loop {
            tokio::select! {
                biased;
                res = shutdown_rx.recv(), if !shutdown_closed => {
                    if res.is_err() {
                        shutdown_closed = true;
                        continue;
                    }
                    let _ = out_tx.send(WireMsg::Fini).await;
                    break;
                }
                frame = stream.next() => {
                    let Some(frame) = frame else { break };
                    let buf = match frame {
                        Ok(buf) => buf,
                        Err(e) => {
                            debug!("session {link}: stream error: {e}");
                            break;
                        }
                    };
                    let msg = match WireMsg::decode(&buf) {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!("session {link}: {e}");
                            break;
                        }
                    };
                    match msg {
                        WireMsg::Call { seq, method, params } => {
                            metrics::CALLS_PROCESSED_TOTAL.inc();
                            if let Some(denied) = &cert_denied
                                && method != "auth"
                            {
                                if out_tx.send(WireMsg::fault(seq, denied)).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                            let reply = match logic.handle_call(&mut ctx, &method, params).await {
                                Ok(value) => WireMsg::Reply { seq, value },
                                Err(e) => {
                                    debug!("session {link}: {method} failed: {e}");
                                    WireMsg::fault(seq, &e)
                                }
                            };
                            if out_tx.send(reply).await.is_err() {
                                break;
                            }
                        }
                        WireMsg::Fini => break,
                        other => {
                            debug!("session {link}: unexpected frame {other:?}");
                            break;
                        }
                    }
                }
            }
        }

        // Dropping the sender ends the writer; then the terminal link-down
        // is observed exactly once.
        let prov_iden = ctx.prov_iden.clone();
        drop(out_tx);
        drop(ctx);
        let _ = writer.await;

        logic.on_link_down(&link).await;
        if let Some(iden) = &prov_iden {
            logic.on_prov_session_fini(iden).await;
        }
        metrics::CONNECTED_SESSIONS.dec();
    }
}
