//! WebSocket transport between cluster nodes
//!
//! Every node runs an [`RpcServer`]; peers reach it through a
//! [`WsTransport`] holding one lazily opened connection per peer.
//! Frames are borsh-encoded [`Envelope`]s correlated by request id.

use crate::error::TransportError;
use crate::rpc::{Envelope, RpcRequest, RpcResponse};
use crate::transport::{RaftTransport, RpcHandler};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use sequencer_types::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};

/// Inbound RPC listener
pub struct RpcServer;

impl RpcServer {
    /// Bind `addr` and serve requests with `handler`. Returns the bound address.
    pub async fn start(addr: &str, handler: Arc<dyn RpcHandler>) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        tracing::info!("RPC server listening on {}", local_addr);

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        tracing::debug!("Peer connected from {}", peer_addr);
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handler).await {
                                tracing::warn!("Peer connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
        });

        Ok(local_addr)
    }
}

async fn serve_connection(stream: TcpStream, handler: Arc<dyn RpcHandler>) -> Result<(), TransportError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let send_task = tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if ws_sender.send(Message::Binary(data)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => match Envelope::from_bytes(&data) {
                Ok(Envelope::Request { request_id, from, body }) => {
                    let handler = handler.clone();
                    let out_tx = out_tx.clone();
                    tokio::spawn(async move {
                        let body = handler.handle(from, body).await;
                        let _ = out_tx.send(Envelope::Response { request_id, body }.to_bytes());
                    });
                }
                Ok(Envelope::Response { .. }) => {
                    tracing::warn!("Ignoring response frame on server connection");
                }
                Err(e) => {
                    tracing::warn!("Undecodable frame: {}", e);
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
    Ok(())
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

#[derive(Clone)]
struct PeerConnection {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: PendingMap,
}

/// Outbound transport over websockets
pub struct WsTransport {
    node_id: NodeId,
    /// Peer id to `host:port`
    peers: HashMap<NodeId, String>,
    rpc_timeout: Duration,
    connections: Mutex<HashMap<NodeId, PeerConnection>>,
    next_request_id: AtomicU64,
}

impl WsTransport {
    pub fn new(node_id: NodeId, peers: HashMap<NodeId, String>, rpc_timeout: Duration) -> Self {
        Self {
            node_id,
            peers,
            rpc_timeout,
            connections: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        }
    }

    async fn connection(&self, target: NodeId) -> Result<PeerConnection, TransportError> {
        let existing = self.connections.lock().get(&target).cloned();
        if let Some(conn) = existing {
            if !conn.outbound.is_closed() {
                return Ok(conn);
            }
        }

        let addr = self
            .peers
            .get(&target)
            .ok_or(TransportError::UnknownPeer(target))?;
        let url = format!("ws://{}", addr);
        let (ws_stream, _) = tokio::time::timeout(self.rpc_timeout, connect_async(&url))
            .await
            .map_err(|_| TransportError::Timeout(target))?
            .map_err(|_| TransportError::Unreachable(target))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        tracing::debug!("Connected to node {} at {}", target, addr);

        let (outbound, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_sender.send(Message::Binary(data)).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        if let Ok(Envelope::Response { request_id, body }) = Envelope::from_bytes(&data) {
                            if let Some(waiter) = reader_pending.lock().remove(&request_id) {
                                let _ = waiter.send(body);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        tracing::debug!("Connection to node {} failed: {}", target, e);
                        break;
                    }
                    _ => {}
                }
            }
            // Dropping the waiters fails every in-flight request
            reader_pending.lock().clear();
        });

        let conn = PeerConnection { outbound, pending };
        self.connections.lock().insert(target, conn.clone());
        Ok(conn)
    }

    fn drop_connection(&self, target: NodeId) {
        self.connections.lock().remove(&target);
    }
}

#[async_trait]
impl RaftTransport for WsTransport {
    async fn send(&self, target: NodeId, request: RpcRequest) -> Result<RpcResponse, TransportError> {
        let conn = self.connection(target).await?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        conn.pending.lock().insert(request_id, tx);

        let frame = Envelope::Request {
            request_id,
            from: self.node_id,
            body: request,
        };
        if conn.outbound.send(frame.to_bytes()).is_err() {
            conn.pending.lock().remove(&request_id);
            self.drop_connection(target);
            return Err(TransportError::Unreachable(target));
        }

        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.drop_connection(target);
                Err(TransportError::Connection(format!("connection to node {} closed", target)))
            }
            Err(_) => {
                conn.pending.lock().remove(&request_id);
                Err(TransportError::Timeout(target))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{SyncRequest, SyncResponse};

    struct Hint(NodeId);

    #[async_trait]
    impl RpcHandler for Hint {
        async fn handle(&self, from: NodeId, request: RpcRequest) -> RpcResponse {
            match request {
                RpcRequest::Sync(req) => RpcResponse::Sync(SyncResponse {
                    success: req.node_id == from,
                    leader_hint: Some(self.0),
                }),
                other => RpcResponse::Error(format!("unsupported {}", other.kind())),
            }
        }
    }

    #[tokio::test]
    async fn test_request_roundtrip_over_websocket() {
        let addr = RpcServer::start("127.0.0.1:0", Arc::new(Hint(7))).await.unwrap();
        let peers = HashMap::from([(2, addr.to_string())]);
        let transport = WsTransport::new(5, peers, Duration::from_secs(2));

        for _ in 0..3 {
            let response = transport
                .send(2, RpcRequest::Sync(SyncRequest { node_id: 5 }))
                .await
                .unwrap();
            assert_eq!(
                response,
                RpcResponse::Sync(SyncResponse { success: true, leader_hint: Some(7) })
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let transport = WsTransport::new(1, HashMap::new(), Duration::from_millis(100));
        let result = transport.send(9, RpcRequest::Sync(SyncRequest { node_id: 1 })).await;
        assert!(matches!(result, Err(TransportError::UnknownPeer(9))));
    }
}
