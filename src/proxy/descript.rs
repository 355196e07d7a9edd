//! Descriptor types shared between RA and the proxy.

use std::fmt;

use serde::{Deserialize, Serialize};

use uuid::Uuid;

/// Replica ID type (stable across replica re-creations).
pub type ReplicaId = u64;

/// Replica instance ID type, monotonic per replica creation. The staleness
/// discriminator for lifecycle requests.
pub type InstanceId = u64;

/// Log sequence number type for replication progress tracking.
pub type Lsn = u64;

/// Opaque identifier of a partition's failover unit. Immutable once assigned.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Serialize,
    Deserialize,
)]
pub struct FailoverUnitId(pub Uuid);

impl FailoverUnitId {
    /// Generates a fresh random failover unit ID.
    pub fn new_random() -> Self {
        FailoverUnitId(Uuid::new_v4())
    }
}

impl fmt::Display for FailoverUnitId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing configuration-version marker used to detect stale
/// reconfiguration messages. Ordering is data-loss number major.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Serialize,
    Deserialize,
)]
pub struct Epoch {
    /// Bumped every time the partition loses data and recovers.
    pub data_loss_number: u64,

    /// Bumped on every reconfiguration within a data-loss era.
    pub configuration_number: u64,
}

impl Epoch {
    /// The null epoch, smaller than any assigned epoch.
    pub const NULL: Epoch = Epoch {
        data_loss_number: 0,
        configuration_number: 0,
    };

    pub fn new(data_loss_number: u64, configuration_number: u64) -> Self {
        Epoch {
            data_loss_number,
            configuration_number,
        }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.data_loss_number, self.configuration_number)
    }
}

/// Configuration role of a replica. Ordering reflects authority: `None` <
/// `Idle` < `Secondary` < `Primary`.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Serialize,
    Deserialize, Default,
)]
pub enum ReplicaRole {
    #[default]
    None,
    Idle,
    Secondary,
    Primary,
}

/// Lifecycle state of a replica as known to RA.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize, Default,
)]
pub enum ReplicaState {
    #[default]
    InBuild,
    Ready,
    StandBy,
    Dropped,
}

/// Whether the underlying service open call is told this is a fresh replica
/// or one recovered from persisted state.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize, Default,
)]
pub enum ReplicaOpenMode {
    #[default]
    New,
    Existing,
}

/// Description of one replica of a failover unit.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Default)]
pub struct ReplicaDescription {
    /// Stable replica ID.
    pub replica_id: ReplicaId,

    /// Monotonic per-creation instance ID.
    pub instance_id: InstanceId,

    /// Intended configuration role.
    pub current_role: ReplicaRole,

    /// Role in the previous configuration.
    pub previous_role: ReplicaRole,

    /// Lifecycle state.
    pub state: ReplicaState,

    /// Address the service listens on, filled in by the hosting side.
    pub service_location: String,

    /// Address the replicator listens on, filled in by the hosting side.
    pub replication_endpoint: String,

    /// Latest log sequence number acknowledged by this replica's replicator.
    pub last_acknowledged_lsn: Option<Lsn>,
}

/// Description of a partition's failover unit with its configuration epochs.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct FailoverUnitDescription {
    pub id: FailoverUnitId,
    pub previous_epoch: Epoch,
    pub current_epoch: Epoch,
}

impl FailoverUnitDescription {
    pub fn new(id: FailoverUnitId) -> Self {
        FailoverUnitDescription {
            id,
            previous_epoch: Epoch::NULL,
            current_epoch: Epoch::NULL,
        }
    }
}

/// Description of the service a failover unit belongs to.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Default)]
pub struct ServiceDescription {
    /// Fully qualified service name.
    pub name: String,

    /// Stateful services carry a replicator; stateless ones only host
    /// instances.
    pub is_stateful: bool,

    /// Whether the service keeps durable local state across replica
    /// instances.
    pub has_persisted_state: bool,

    /// Intended replica set size.
    pub target_replica_set_size: u32,

    /// Minimum replica set size for write availability.
    pub min_replica_set_size: u32,

    /// Version of this description; governs update-service-description
    /// staleness.
    pub update_version: u64,
}

/// Outcome code carried in proxy replies back to RA.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize, Default,
)]
pub enum ProxyErrorCode {
    #[default]
    Success,

    /// The target replica's proxy is closed or already removed.
    ObjectClosed,

    /// Request observed the proxy in a state it cannot act from.
    InvalidState,

    /// The executing action list was canceled; RA will resend.
    OperationCanceled,

    /// The per-message deadline budget elapsed.
    Timeout,

    /// Replicator lost its write quorum; transient.
    WriteQuorumLost,

    /// A reconfiguration is already pending below; transient.
    ReconfigurationPending,

    /// Catchup observed data loss for this epoch; sticky per epoch.
    StateChangedOnDataLoss,

    /// The service host reported a hard local failure.
    ServiceHostFailure,
}

impl ProxyErrorCode {
    #[inline]
    pub fn is_success(&self) -> bool {
        *self == ProxyErrorCode::Success
    }

    /// Transient codes are replied as-is; RA retries without the proxy
    /// aborting the replica.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProxyErrorCode::Timeout
                | ProxyErrorCode::WriteQuorumLost
                | ProxyErrorCode::ReconfigurationPending
        )
    }
}

impl fmt::Display for ProxyErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_ordering() {
        let e00 = Epoch::NULL;
        let e12 = Epoch::new(1, 2);
        let e13 = Epoch::new(1, 3);
        let e20 = Epoch::new(2, 0);
        assert!(e00 < e12);
        assert!(e12 < e13);
        // data-loss number dominates the configuration number
        assert!(e13 < e20);
        assert_eq!(e12, Epoch::new(1, 2));
    }

    #[test]
    fn transient_codes() {
        assert!(ProxyErrorCode::Timeout.is_transient());
        assert!(ProxyErrorCode::WriteQuorumLost.is_transient());
        assert!(ProxyErrorCode::ReconfigurationPending.is_transient());
        assert!(!ProxyErrorCode::Success.is_transient());
        assert!(!ProxyErrorCode::StateChangedOnDataLoss.is_transient());
        assert!(ProxyErrorCode::Success.is_success());
    }

    #[test]
    fn failover_unit_ids_distinct() {
        assert_ne!(FailoverUnitId::new_random(), FailoverUnitId::new_random());
    }
}
