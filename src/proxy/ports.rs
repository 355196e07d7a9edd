//! Ports onto the hosted service, its replicator, and the local side-car
//! sinks. The proxy treats all of these as opaque asynchronous collaborators
//! with defined completion contracts.

use std::sync::Arc;

use crate::proxy::descript::{
    Epoch, FailoverUnitId, Lsn, ProxyErrorCode, ReplicaDescription,
    ReplicaId, ReplicaOpenMode, ReplicaRole, ServiceDescription,
};

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

/// Replication progress snapshot from the replicator.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ReplicatorStatus {
    /// Oldest log sequence number still retained.
    pub first_lsn: Lsn,

    /// Latest log sequence number acknowledged.
    pub last_lsn: Lsn,
}

/// Replicator-internal detail exposed through the query surface.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Default)]
pub struct ReplicatorQueryInfo {
    /// Replication progress snapshot.
    pub status: ReplicatorStatus,

    /// Number of operations sitting in the replication queue.
    pub queue_length: u64,

    /// Whether the replicator currently grants write status.
    pub write_status_granted: bool,
}

/// Which flavor of catchup to drive on the primary's replicator.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum CatchupMode {
    /// Bring a write quorum of the new configuration up to date.
    Quorum,

    /// Revoke write status first, then catch the quorum up; used when
    /// demoting the primary.
    WriteStatusRevoke,
}

/// Terminal outcome of a catchup round.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum CatchupOutcome {
    /// Quorum is consistent; safe to acknowledge the configuration change.
    Completed,

    /// The replica set reported losing state; carries the latest LSN the
    /// local replicator had acknowledged.
    DataLoss { last_lsn: Lsn },
}

/// Asynchronous port onto the replicator owned by a stateful replica.
///
/// Every call may complete synchronously or suspend; an elapsed deadline or
/// infrastructure failure surfaces as a `ProxyErrorCode`, never a panic.
#[async_trait]
pub trait ReplicatorPort: Send + Sync {
    /// Opens the replicator; returns its replication endpoint address.
    async fn open(&self) -> Result<String, ProxyErrorCode>;

    /// Gracefully closes the replicator.
    async fn close(&self) -> Result<(), ProxyErrorCode>;

    /// Forcibly tears the replicator down. Must not block.
    fn abort(&self);

    /// Transitions the replicator to the given role under the given epoch.
    async fn change_role(
        &self,
        epoch: Epoch,
        role: ReplicaRole,
    ) -> Result<(), ProxyErrorCode>;

    /// Installs a new epoch without a role change.
    async fn update_epoch(&self, epoch: Epoch) -> Result<(), ProxyErrorCode>;

    /// Declares the configuration to catch up against (previous + current
    /// replica sets).
    async fn update_catchup_configuration(
        &self,
        current: &[ReplicaDescription],
        previous: &[ReplicaDescription],
    ) -> Result<(), ProxyErrorCode>;

    /// Declares the now-current replica set.
    async fn update_current_configuration(
        &self,
        current: &[ReplicaDescription],
    ) -> Result<(), ProxyErrorCode>;

    /// Drives catchup to quorum consistency.
    async fn catchup_replica_set(
        &self,
        mode: CatchupMode,
    ) -> Result<CatchupOutcome, ProxyErrorCode>;

    /// Cancels an in-flight catchup round.
    async fn cancel_catchup(&self) -> Result<(), ProxyErrorCode>;

    /// Starts seeding the given idle replica from the primary.
    async fn build_idle_replica(
        &self,
        idle: &ReplicaDescription,
    ) -> Result<(), ProxyErrorCode>;

    /// Stops replicating to the given idle replica.
    async fn remove_idle_replica(
        &self,
        replica_id: ReplicaId,
    ) -> Result<(), ProxyErrorCode>;

    /// Reads the current replication progress.
    async fn get_status(&self) -> Result<ReplicatorStatus, ProxyErrorCode>;

    /// Reads the replicator-internal query detail.
    async fn get_query(&self) -> Result<ReplicatorQueryInfo, ProxyErrorCode>;
}

/// Asynchronous port onto a stateful service replica.
#[async_trait]
pub trait StatefulServicePort: Send + Sync {
    /// Opens the replica; returns the service location address.
    async fn open(
        &self,
        mode: ReplicaOpenMode,
    ) -> Result<String, ProxyErrorCode>;

    /// Transitions the replica to the given role; returns the (possibly
    /// changed) service location address.
    async fn change_role(
        &self,
        role: ReplicaRole,
    ) -> Result<String, ProxyErrorCode>;

    /// Gracefully closes the replica.
    async fn close(&self) -> Result<(), ProxyErrorCode>;

    /// Forcibly tears the replica down. Must not block.
    fn abort(&self);

    /// Applies an updated service description.
    async fn update_description(
        &self,
        service: &ServiceDescription,
    ) -> Result<(), ProxyErrorCode>;
}

/// Asynchronous port onto a stateless service instance.
#[async_trait]
pub trait StatelessServicePort: Send + Sync {
    /// Opens the instance; returns the service location address.
    async fn open(&self) -> Result<String, ProxyErrorCode>;

    /// Gracefully closes the instance.
    async fn close(&self) -> Result<(), ProxyErrorCode>;

    /// Forcibly tears the instance down. Must not block.
    fn abort(&self);
}

/// Factory port onto the service host, instantiating replica/replicator
/// pairs (stateful) or instances (stateless) on demand.
#[async_trait]
pub trait ServiceHost: Send + Sync {
    async fn create_stateful(
        &self,
        service: &ServiceDescription,
        replica: &ReplicaDescription,
    ) -> Result<
        (Arc<dyn StatefulServicePort>, Arc<dyn ReplicatorPort>),
        ProxyErrorCode,
    >;

    async fn create_stateless(
        &self,
        service: &ServiceDescription,
        replica: &ReplicaDescription,
    ) -> Result<Arc<dyn StatelessServicePort>, ProxyErrorCode>;
}

/// One load metric sample reported for a replica.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LoadMetric {
    pub name: String,
    pub value: u64,
}

/// Health event kinds reported for a replica.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ReplicaHealthEvent {
    OpenFailed,
    CloseFailed,
    Aborted,
}

/// Outbound message sink towards RA. Fire-and-forget: returns whether the
/// proxy transport was open enough to accept the send; `false` is not an
/// error and the caller proceeds without blocking.
pub trait RaMessageSink: Send + Sync {
    fn send_message_to_ra(&self, reply: crate::agent::ProxyReply) -> bool;
}

/// Load report sink. Fire-and-forget, same acceptance contract as
/// [`RaMessageSink`].
pub trait LoadReportSink: Send + Sync {
    fn report_load(
        &self,
        failover_unit: FailoverUnitId,
        service_name: &str,
        is_stateful: bool,
        role: ReplicaRole,
        metrics: &[LoadMetric],
    ) -> bool;
}

/// Health report sink. Fire-and-forget, same acceptance contract as
/// [`RaMessageSink`].
pub trait HealthReportSink: Send + Sync {
    fn report_replica_health(
        &self,
        failover_unit: FailoverUnitId,
        replica_id: ReplicaId,
        event: ReplicaHealthEvent,
    ) -> bool;
}
