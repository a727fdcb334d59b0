//! Transport seams between nodes
//!
//! [`RaftTransport`] sends one request and waits for its response;
//! [`RpcHandler`] serves inbound requests. [`LocalNetwork`] wires handlers
//! together in-process and can cut links to simulate partitions.

use crate::error::TransportError;
use crate::rpc::{RpcRequest, RpcResponse};
use async_trait::async_trait;
use parking_lot::RwLock;
use sequencer_types::NodeId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

/// Outbound request/response channel to other nodes
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn send(&self, target: NodeId, request: RpcRequest) -> Result<RpcResponse, TransportError>;
}

/// Inbound request processing
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, from: NodeId, request: RpcRequest) -> RpcResponse;
}

#[derive(Default)]
struct NetworkState {
    handlers: HashMap<NodeId, Weak<dyn RpcHandler>>,
    /// Unordered pairs that cannot talk
    cut: HashSet<(NodeId, NodeId)>,
}

/// In-process network shared by all nodes of a test cluster
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `handler` reachable as `node_id`
    pub fn register(&self, node_id: NodeId, handler: Weak<dyn RpcHandler>) {
        self.state.write().handlers.insert(node_id, handler);
    }

    pub fn unregister(&self, node_id: NodeId) {
        self.state.write().handlers.remove(&node_id);
    }

    /// Transport used by `node_id` to reach the others
    pub fn transport_for(&self, node_id: NodeId) -> Arc<dyn RaftTransport> {
        Arc::new(LocalTransport {
            from: node_id,
            network: self.clone(),
        })
    }

    fn pair(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
        (a.min(b), a.max(b))
    }

    /// Cut the link between two nodes in both directions
    pub fn partition(&self, a: NodeId, b: NodeId) {
        self.state.write().cut.insert(Self::pair(a, b));
    }

    /// Cut `node` off from every other registered node
    pub fn isolate(&self, node: NodeId) {
        let mut state = self.state.write();
        let others: Vec<NodeId> = state.handlers.keys().copied().filter(|&n| n != node).collect();
        for other in others {
            state.cut.insert(Self::pair(node, other));
        }
        tracing::info!("Network: isolated node {}", node);
    }

    /// Restore every link
    pub fn heal(&self) {
        self.state.write().cut.clear();
        tracing::info!("Network: healed all partitions");
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<Arc<dyn RpcHandler>, TransportError> {
        let state = self.state.read();
        if state.cut.contains(&Self::pair(from, to)) {
            return Err(TransportError::Unreachable(to));
        }
        state
            .handlers
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or(TransportError::Unreachable(to))
    }
}

struct LocalTransport {
    from: NodeId,
    network: LocalNetwork,
}

#[async_trait]
impl RaftTransport for LocalTransport {
    async fn send(&self, target: NodeId, request: RpcRequest) -> Result<RpcResponse, TransportError> {
        let handler = self.network.route(self.from, target)?;
        let response = handler.handle(self.from, request).await;
        // A partition raised while the request was in flight drops the reply
        self.network.route(target, self.from)?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{SyncRequest, SyncResponse};

    struct Echo(NodeId);

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, from: NodeId, _request: RpcRequest) -> RpcResponse {
            RpcResponse::Sync(SyncResponse {
                success: from != self.0,
                leader_hint: Some(self.0),
            })
        }
    }

    fn sync() -> RpcRequest {
        RpcRequest::Sync(SyncRequest { node_id: 1 })
    }

    #[tokio::test]
    async fn test_partition_and_heal() {
        let network = LocalNetwork::new();
        let a: Arc<dyn RpcHandler> = Arc::new(Echo(1));
        let b: Arc<dyn RpcHandler> = Arc::new(Echo(2));
        network.register(1, Arc::downgrade(&a));
        network.register(2, Arc::downgrade(&b));

        let from_a = network.transport_for(1);
        let response = from_a.send(2, sync()).await.unwrap();
        assert_eq!(
            response,
            RpcResponse::Sync(SyncResponse { success: true, leader_hint: Some(2) })
        );

        network.isolate(1);
        assert!(matches!(
            from_a.send(2, sync()).await,
            Err(TransportError::Unreachable(2))
        ));

        network.heal();
        assert!(from_a.send(2, sync()).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_handler_is_unreachable() {
        let network = LocalNetwork::new();
        let b: Arc<dyn RpcHandler> = Arc::new(Echo(2));
        network.register(2, Arc::downgrade(&b));
        drop(b);

        assert!(network.transport_for(1).send(2, sync()).await.is_err());
    }
}
