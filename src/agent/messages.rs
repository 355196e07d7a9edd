//! Request/reply envelopes exchanged with the reconfiguration agent.

use crate::proxy::{
    ConfigurationStage, FailoverUnitDescription, InstanceId, ProxyErrorCode,
    ProxyState, ReplicaDescription, ReplicaId, ReplicaRole,
    ReplicatorQueryInfo, ReplicatorStatus, ServiceDescription,
};

use serde::{Deserialize, Serialize};

/// Message action demultiplexed by the dispatcher.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize,
)]
pub enum ProxyMessageAction {
    Open,
    Close,
    Reopen,
    UpdateConfiguration,
    BuildIdleReplica,
    RemoveIdleReplica,
    GetStatus,
    UpdateEpochAndGetStatus,
    CancelCatchup,
    Query,
    UpdateServiceDescription,

    /// RA's ack of a replica-endpoint-updated notification. Never replied to.
    ReplicaEndpointUpdatedReply,

    /// RA's ack of a read-write-status-revoked notification. Never replied
    /// to.
    ReadWriteStatusRevokedReply,
}

/// Message-specific flags carried alongside the action.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize, Default,
)]
pub struct MessageFlags {
    /// Close should abort rather than drain gracefully.
    pub abort: bool,

    /// Close should drop the replica (terminal removal) rather than leave
    /// it recoverable.
    pub drop: bool,

    /// Configuration update requires catchup before acknowledging.
    pub catchup: bool,

    /// Configuration update finishes a reconfiguration (demote completion).
    pub end_reconfiguration: bool,
}

/// Inbound request envelope from RA, correlated by failover unit ID.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub action: ProxyMessageAction,
    pub failover_unit: FailoverUnitDescription,

    /// The local replica this request targets.
    pub local_replica: ReplicaDescription,

    /// The rest of the configuration's replicas, where relevant (idle build
    /// targets, catchup/current replica sets).
    pub remote_replicas: Vec<ReplicaDescription>,

    pub service: ServiceDescription,
    pub flags: MessageFlags,

    /// Overall timeout budget for this message, in milliseconds; primitive
    /// calls inherit the derived deadline.
    pub timeout_ms: u64,
}

/// Notification kinds the proxy originates towards RA (fire-and-forget,
/// acked by the two reply-only message actions).
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize,
)]
pub enum ProxyNotification {
    ReplicaEndpointUpdated,
    ReadWriteStatusRevoked,
}

/// Per-replica detail assembled for the query surface.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct DeployedReplicaDetail {
    pub replica_id: ReplicaId,
    pub instance_id: InstanceId,
    pub proxy_state: ProxyState,
    pub current_service_role: ReplicaRole,
    pub current_replicator_role: ReplicaRole,
    pub configuration_stage: ConfigurationStage,
    pub service_location: String,
    pub replication_endpoint: String,

    /// Merged in from the replicator's query surface when the replica is
    /// open and stateful.
    pub replicator: Option<ReplicatorQueryInfo>,
}

/// Optional payload carried by some reply kinds.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ReplyBody {
    ReplicatorStatus(ReplicatorStatus),
    Query(DeployedReplicaDetail),
}

/// Outbound reply envelope mirroring the request shape plus an outcome
/// code. Some message kinds intentionally produce no reply.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ProxyReply {
    pub action: ProxyMessageAction,
    pub failover_unit: FailoverUnitDescription,
    pub local_replica: ReplicaDescription,
    pub remote_replicas: Vec<ReplicaDescription>,
    pub flags: MessageFlags,
    pub error: ProxyErrorCode,
    pub body: Option<ReplyBody>,

    /// Set when this envelope is a proxy-originated notification rather
    /// than a reply to an RA request.
    pub notification: Option<ProxyNotification>,
}

impl ProxyReply {
    /// Builds a reply from the original request's descriptor shape. The
    /// dispatcher augments the local replica with proxy-known endpoint and
    /// progress values before sending.
    pub fn for_request(
        request: &ProxyRequest,
        error: ProxyErrorCode,
    ) -> ProxyReply {
        ProxyReply {
            action: request.action,
            failover_unit: request.failover_unit.clone(),
            local_replica: request.local_replica.clone(),
            remote_replicas: request.remote_replicas.clone(),
            flags: request.flags,
            error,
            body: None,
            notification: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::FailoverUnitId;

    #[test]
    fn reply_mirrors_request() {
        let req = ProxyRequest {
            action: ProxyMessageAction::Open,
            failover_unit: FailoverUnitDescription::new(
                FailoverUnitId::new_random(),
            ),
            local_replica: ReplicaDescription {
                replica_id: 7,
                instance_id: 3,
                ..Default::default()
            },
            remote_replicas: vec![],
            service: ServiceDescription::default(),
            flags: MessageFlags {
                abort: true,
                ..Default::default()
            },
            timeout_ms: 5000,
        };
        let reply = ProxyReply::for_request(&req, ProxyErrorCode::Success);
        assert_eq!(reply.action, ProxyMessageAction::Open);
        assert_eq!(reply.failover_unit, req.failover_unit);
        assert_eq!(reply.local_replica.replica_id, 7);
        assert!(reply.flags.abort);
        assert!(reply.body.is_none());
        assert!(reply.notification.is_none());
    }
}
