//! WebSocket connection handling
//!
//! Each connection gets an independent reader loop and writer task. The
//! writer drains the session's bounded outbound queue; the reader feeds
//! inbound frames into the gateway. Transport failures on either side are
//! treated as implicit disconnects.

use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use log::{debug, info};
use std::net::IpAddr;
use warp::ws::{Message, WebSocket};

use crate::core::message::ServerFrame;
use crate::core::server::SharedGateway;

/// Drive one upgraded WebSocket connection to completion.
pub async fn handle_gateway_client(
    ws: WebSocket,
    remote_addr: Option<IpAddr>,
    tenant_id: String,
    token: Option<String>,
    gateway: SharedGateway,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    // Admission and registration. A rejected handshake gets a structured
    // error frame and the connection closes with no session state created.
    let registered = match gateway
        .handshake(remote_addr, tenant_id, token.as_deref())
        .await
    {
        Ok(registered) => registered,
        Err(e) => {
            debug!("Handshake rejected: {}", e);
            if let Ok(text) = serde_json::to_string(&ServerFrame::from_error(&e)) {
                let _ = ws_tx.send(Message::text(text)).await;
            }
            let _ = ws_tx.close().await;
            return;
        }
    };

    let session_id = registered.session_id.clone();
    let queue = registered.queue.clone();

    // Writer task: forward queued frames until the queue closes or the
    // transport fails.
    let writer = tokio::spawn(async move {
        while let Some(frame) = queue.pop().await {
            if ws_tx.send(frame).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let authenticated = gateway.sessions().is_authenticated(&session_id).await;
    gateway
        .sessions()
        .send(
            &session_id,
            &ServerFrame::Connected {
                session_id: session_id.clone(),
                tenant_id: registered.tenant_id.clone(),
                authenticated,
            },
        )
        .await;

    info!("Session connected: {}", session_id);

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(msg) => {
                if msg.is_text() {
                    if let Ok(text) = msg.to_str() {
                        gateway.inbound(&session_id, text).await;
                    }
                } else if msg.is_ping() {
                    gateway.sessions().heartbeat(&session_id).await;
                } else if msg.is_close() {
                    break;
                }
                // The gateway may have terminated the session mid-loop
                // (strikes, auth limit); stop reading for it if so.
                if !gateway.sessions().contains(&session_id).await {
                    break;
                }
            }
            Err(e) => {
                debug!("WebSocket error on {}: {}", session_id, e);
                break;
            }
        }
    }

    gateway.terminate_session(&session_id, "disconnect").await;
    let _ = writer.await;
}
