//! Per-replica failover unit proxy: the state machine owning current
//! replica/replicator/service role state, configuration stage, and the
//! currently-executing action list admission control.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::proxy::actions::ActionListTag;
use crate::proxy::descript::{
    FailoverUnitDescription, FailoverUnitId, ReplicaDescription,
    ReplicaOpenMode, ReplicaRole, ServiceDescription,
};
use crate::proxy::ports::{
    ReplicatorPort, StatefulServicePort, StatelessServicePort,
};

use serde::{Deserialize, Serialize};

use tokio::sync::watch;

/// Lifecycle state of a failover unit proxy.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize, Default,
)]
pub enum ProxyState {
    #[default]
    Closed,
    Opening,
    Opened,
    Closing,
}

/// Where the proxy stands with respect to the configuration RA last pushed.
/// Drives whether an incoming configuration update triggers catchup, a
/// replica-list update, or is a no-op ACK.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize, Default,
)]
pub enum ConfigurationStage {
    #[default]
    Current,
    CurrentPending,
    PreWriteStatusRevokeCatchupPending,
    CatchupPending,
}

/// Sticky record of how the last catchup round for the current epoch ended.
/// Allows replay of the same catchup message to be answered without
/// re-running catchup.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize, Default,
)]
pub enum CatchupResult {
    #[default]
    NotStarted,
    CatchupCompleted,
    DataLossReported,
}

/// Admission decision for a request wanting to execute an action list.
#[derive(Debug)]
pub enum AdmissionOutcome {
    /// Admitted; carries the cancellation watch scoped to this logical list.
    Admitted(watch::Receiver<bool>),

    /// Incompatible work in progress; drop the message, RA retries.
    Rejected,

    /// Incompatible work in progress, but the incoming message supersedes
    /// it; the caller must release the lock and issue cancellation.
    CancelNeeded,
}

/// Mutable per-proxy fields. Only ever touched through
/// [`LockedFailoverUnitProxy`].
pub struct FupFields {
    pub(crate) state: ProxyState,
    pub(crate) replica: ReplicaDescription,
    pub(crate) service: ServiceDescription,
    pub(crate) failover_unit: FailoverUnitDescription,

    /// Role actually applied to the replicator so far. Drift between this
    /// and the intended configuration role is what retried messages
    /// re-classify from.
    pub(crate) replicator_role: ReplicaRole,

    /// Role actually applied to the service so far.
    pub(crate) service_role: ReplicaRole,

    pub(crate) configuration_stage: ConfigurationStage,
    pub(crate) catchup_result: CatchupResult,

    /// Replica set last applied to the replicator; compared against incoming
    /// configuration bodies to decide replay vs. replica-list update.
    pub(crate) configuration_replicas: Vec<ReplicaDescription>,

    pub(crate) open_mode: ReplicaOpenMode,

    /// Set once terminally removed; all message handling drops silently
    /// after this.
    pub(crate) is_deleted: bool,

    pub(crate) marked_for_abort: bool,

    /// Unacknowledged replica-endpoint-updated notification to RA.
    pub(crate) endpoint_update_pending: bool,

    /// Unacknowledged read-write-status-revoked notification to RA.
    pub(crate) write_status_revoked_pending: bool,

    /// Tags admitted under the one currently-executing logical action list.
    /// More than one entry only ever happens through the merge rules below.
    executing: Vec<ActionListTag>,

    /// Cancellation signal scoped to the currently-executing logical list.
    cancel_tx: Option<watch::Sender<bool>>,

    pub(crate) service_port: Option<Arc<dyn StatefulServicePort>>,
    pub(crate) stateless_port: Option<Arc<dyn StatelessServicePort>>,
    pub(crate) replicator_port: Option<Arc<dyn ReplicatorPort>>,

    cleaned_up: bool,
}

impl FupFields {
    fn new(id: FailoverUnitId) -> Self {
        FupFields {
            state: ProxyState::Closed,
            replica: ReplicaDescription::default(),
            service: ServiceDescription::default(),
            failover_unit: FailoverUnitDescription::new(id),
            replicator_role: ReplicaRole::None,
            service_role: ReplicaRole::None,
            configuration_stage: ConfigurationStage::Current,
            catchup_result: CatchupResult::NotStarted,
            configuration_replicas: Vec::new(),
            open_mode: ReplicaOpenMode::New,
            is_deleted: false,
            marked_for_abort: false,
            endpoint_update_pending: false,
            write_status_revoked_pending: false,
            executing: Vec::new(),
            cancel_tx: None,
            service_port: None,
            stateless_port: None,
            replicator_port: None,
            cleaned_up: false,
        }
    }

    /// Merges an incoming replica description, preserving the locally-known
    /// service location and replication endpoint, and enforcing that the
    /// instance ID never decreases.
    pub(crate) fn merge_replica(&mut self, incoming: &ReplicaDescription) {
        assert!(
            incoming.instance_id >= self.replica.instance_id,
            "instance id went backwards: {} < {}",
            incoming.instance_id,
            self.replica.instance_id
        );
        let service_location = self.replica.service_location.clone();
        let replication_endpoint = self.replica.replication_endpoint.clone();
        let last_lsn = self.replica.last_acknowledged_lsn;
        self.replica = incoming.clone();
        if !service_location.is_empty() {
            self.replica.service_location = service_location;
        }
        if !replication_endpoint.is_empty() {
            self.replica.replication_endpoint = replication_endpoint;
        }
        if self.replica.last_acknowledged_lsn.is_none() {
            self.replica.last_acknowledged_lsn = last_lsn;
        }
    }

    /// Raises the recorded epochs to the incoming ones. The current epoch
    /// never decreases across the proxy's lifetime.
    pub(crate) fn advance_epoch(&mut self, desc: &FailoverUnitDescription) {
        if desc.current_epoch > self.failover_unit.current_epoch {
            self.failover_unit.previous_epoch = desc.previous_epoch;
            self.failover_unit.current_epoch = desc.current_epoch;
        }
    }

    /// Whether any action list is currently admitted.
    pub(crate) fn is_executing(&self) -> bool {
        !self.executing.is_empty()
    }

    /// Whether the given tag is currently admitted.
    pub(crate) fn is_executing_tag(&self, tag: ActionListTag) -> bool {
        self.executing.contains(&tag)
    }
}

/// The per-replica failover unit proxy. All mutable state lives behind an
/// exclusive lock scoped narrowly around field access and admission; the
/// lock is never held across an await point or an outbound send.
pub struct FailoverUnitProxy {
    id: FailoverUnitId,
    fields: Mutex<FupFields>,
}

/// Scoped guard over a proxy's mutable fields. Field access is only possible
/// while the guard is alive.
pub struct LockedFailoverUnitProxy<'a> {
    guard: MutexGuard<'a, FupFields>,
}

impl FailoverUnitProxy {
    /// Creates a fresh, zero-initialized, closed proxy.
    pub fn new(id: FailoverUnitId) -> Self {
        FailoverUnitProxy {
            id,
            fields: Mutex::new(FupFields::new(id)),
        }
    }

    pub fn id(&self) -> FailoverUnitId {
        self.id
    }

    /// Takes the proxy's exclusive lock.
    pub fn lock(&self) -> LockedFailoverUnitProxy<'_> {
        LockedFailoverUnitProxy {
            // a poisoned lock means a defect inside the state machine
            guard: self.fields.lock().expect("failover unit proxy lock poisoned"),
        }
    }

    /// Signals cancellation to the currently-executing action list, if any.
    /// Called outside any lock held by the caller; completion of the
    /// canceled list still drives its `done_executing` bookkeeping.
    pub fn cancel_operations(&self) {
        let locked = self.lock();
        if let Some(tx) = locked.guard.cancel_tx.as_ref() {
            let _ = tx.send(true);
        }
    }

    /// Marks the proxy for abort. Returns false if it is already marked or
    /// already deleted, in which case the caller must not abort it again.
    pub fn try_mark_for_abort(&self) -> bool {
        let mut locked = self.lock();
        if locked.guard.is_deleted || locked.guard.marked_for_abort {
            return false;
        }
        locked.guard.marked_for_abort = true;
        true
    }

    /// Forces all owned resources to abort and cancels in-flight work. With
    /// `keep_open_for_cleanup` the proxy object stays addressable so the
    /// dispatcher can still perform the paired `cleanup()` under lock.
    pub fn abort(&self, keep_open_for_cleanup: bool) {
        let (service, stateless, replicator) = {
            let mut locked = self.lock();
            locked.guard.state = ProxyState::Closed;
            if let Some(tx) = locked.guard.cancel_tx.as_ref() {
                let _ = tx.send(true);
            }
            (
                locked.guard.service_port.take(),
                locked.guard.stateless_port.take(),
                locked.guard.replicator_port.take(),
            )
        };

        // port aborts are synchronous fire-and-forget; run them outside the
        // lock
        if let Some(replicator) = replicator {
            replicator.abort();
        }
        if let Some(service) = service {
            service.abort();
        }
        if let Some(stateless) = stateless {
            stateless.abort();
        }

        if !keep_open_for_cleanup {
            self.cleanup();
        }
    }

    /// Idempotent teardown of per-proxy resources. Always called once the
    /// proxy is finally discarded.
    pub fn cleanup(&self) {
        let mut locked = self.lock();
        if locked.guard.cleaned_up {
            return;
        }
        locked.guard.cleaned_up = true;
        locked.guard.is_deleted = true;
        locked.guard.cancel_tx = None;
        locked.guard.service_port = None;
        locked.guard.stateless_port = None;
        locked.guard.replicator_port = None;
        pf_debug!("fup {} cleaned up", self.id);
    }

    /// Releases admission for a finished list, unblocking the next
    /// compatible request. Fatal if the tag was never admitted.
    pub fn done_executing(&self, tag: ActionListTag) {
        let mut locked = self.lock();
        let pos = locked
            .guard
            .executing
            .iter()
            .position(|t| *t == tag)
            .unwrap_or_else(|| {
                panic!("done_executing({}) without matching admission", tag)
            });
        locked.guard.executing.remove(pos);
        if locked.guard.executing.is_empty() {
            locked.guard.cancel_tx = None;
        }
    }
}

impl<'a> LockedFailoverUnitProxy<'a> {
    /// Atomic admission check for one action list. At most one logical list
    /// is admitted at a time; the merge rules below fold compatible work
    /// into the executing one. `supersedes` marks messages (close with
    /// abort/drop) whose correct remedial action on conflict is cancelling
    /// the in-flight list rather than a plain drop.
    pub fn try_add_to_executing(
        &mut self,
        tag: ActionListTag,
        supersedes: bool,
    ) -> AdmissionOutcome {
        let fields = &mut *self.guard;

        if fields.executing.is_empty() {
            let (tx, rx) = watch::channel(false);
            fields.cancel_tx = Some(tx);
            fields.executing.push(tag);
            return AdmissionOutcome::Admitted(rx);
        }

        // merge rules: cancel-catchup joins an executing catchup list;
        // a replica-list update joins an executing catchup while the stage
        // is catchup-pending
        let catchup_running =
            fields.executing.iter().any(|t| t.is_catchup());
        let mergeable = match tag {
            ActionListTag::CancelCatchupReplicaSet => catchup_running,
            ActionListTag::ReplicatorUpdateReplicas => {
                catchup_running
                    && matches!(
                        fields.configuration_stage,
                        ConfigurationStage::CatchupPending
                            | ConfigurationStage::PreWriteStatusRevokeCatchupPending
                    )
            }
            _ => false,
        };
        if mergeable && !fields.executing.contains(&tag) {
            let rx = fields
                .cancel_tx
                .as_ref()
                .expect("executing list without cancel channel")
                .subscribe();
            fields.executing.push(tag);
            return AdmissionOutcome::Admitted(rx);
        }

        if supersedes
            && fields.executing.iter().any(|t| t.impacts_availability())
        {
            AdmissionOutcome::CancelNeeded
        } else {
            // either nothing availability-impacting to tear down (let it
            // finish) or the message does not supersede; RA retries
            AdmissionOutcome::Rejected
        }
    }
}

impl<'a> Deref for LockedFailoverUnitProxy<'a> {
    type Target = FupFields;

    fn deref(&self) -> &FupFields {
        &self.guard
    }
}

impl<'a> DerefMut for LockedFailoverUnitProxy<'a> {
    fn deref_mut(&mut self) -> &mut FupFields {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::descript::Epoch;

    fn new_fup() -> FailoverUnitProxy {
        FailoverUnitProxy::new(FailoverUnitId::new_random())
    }

    #[test]
    fn admission_exclusive() {
        let fup = new_fup();
        let mut locked = fup.lock();
        assert!(matches!(
            locked.try_add_to_executing(
                ActionListTag::StatefulServiceOpenIdle,
                false
            ),
            AdmissionOutcome::Admitted(_)
        ));
        assert!(matches!(
            locked.try_add_to_executing(
                ActionListTag::ReplicatorGetStatus,
                false
            ),
            AdmissionOutcome::Rejected
        ));
        drop(locked);

        fup.done_executing(ActionListTag::StatefulServiceOpenIdle);
        let mut locked = fup.lock();
        assert!(matches!(
            locked.try_add_to_executing(
                ActionListTag::ReplicatorGetStatus,
                false
            ),
            AdmissionOutcome::Admitted(_)
        ));
    }

    #[test]
    fn admission_cancel_needed_when_superseding() {
        let fup = new_fup();
        let mut locked = fup.lock();
        assert!(matches!(
            locked.try_add_to_executing(
                ActionListTag::StatefulServiceOpenIdle,
                false
            ),
            AdmissionOutcome::Admitted(_)
        ));
        assert!(matches!(
            locked.try_add_to_executing(ActionListTag::StatefulServiceDrop, true),
            AdmissionOutcome::CancelNeeded
        ));
    }

    #[test]
    fn admission_merges_cancel_catchup() {
        let fup = new_fup();
        let mut locked = fup.lock();
        assert!(matches!(
            locked.try_add_to_executing(
                ActionListTag::ReplicatorUpdateAndCatchupQuorum,
                false
            ),
            AdmissionOutcome::Admitted(_)
        ));
        assert!(matches!(
            locked.try_add_to_executing(
                ActionListTag::CancelCatchupReplicaSet,
                false
            ),
            AdmissionOutcome::Admitted(_)
        ));
        drop(locked);

        fup.done_executing(ActionListTag::CancelCatchupReplicaSet);
        fup.done_executing(ActionListTag::ReplicatorUpdateAndCatchupQuorum);
        assert!(!fup.lock().is_executing());
    }

    #[test]
    fn admission_merges_update_replicas_only_while_catchup_pending() {
        let fup = new_fup();
        let mut locked = fup.lock();
        assert!(matches!(
            locked.try_add_to_executing(
                ActionListTag::ReplicatorUpdateAndCatchupQuorum,
                false
            ),
            AdmissionOutcome::Admitted(_)
        ));
        // stage not yet catchup-pending: no merge
        assert!(matches!(
            locked.try_add_to_executing(
                ActionListTag::ReplicatorUpdateReplicas,
                false
            ),
            AdmissionOutcome::Rejected
        ));
        locked.configuration_stage = ConfigurationStage::CatchupPending;
        assert!(matches!(
            locked.try_add_to_executing(
                ActionListTag::ReplicatorUpdateReplicas,
                false
            ),
            AdmissionOutcome::Admitted(_)
        ));
    }

    #[test]
    #[should_panic(expected = "without matching admission")]
    fn done_executing_unadmitted_is_fatal() {
        let fup = new_fup();
        fup.done_executing(ActionListTag::ReplicatorGetStatus);
    }

    #[test]
    fn cancel_signal_observed_by_admitted_list() {
        let fup = new_fup();
        let rx = {
            let mut locked = fup.lock();
            match locked.try_add_to_executing(
                ActionListTag::StatefulServiceOpenIdle,
                false,
            ) {
                AdmissionOutcome::Admitted(rx) => rx,
                other => panic!("unexpected admission outcome {:?}", other),
            }
        };
        assert!(!*rx.borrow());
        fup.cancel_operations();
        assert!(*rx.borrow());
    }

    #[test]
    #[should_panic(expected = "instance id went backwards")]
    fn merge_replica_rejects_decreasing_instance() {
        let fup = new_fup();
        let mut locked = fup.lock();
        let mut desc = ReplicaDescription {
            instance_id: 5,
            ..Default::default()
        };
        locked.merge_replica(&desc);
        desc.instance_id = 4;
        locked.merge_replica(&desc);
    }

    #[test]
    fn merge_replica_preserves_local_endpoints() {
        let fup = new_fup();
        let mut locked = fup.lock();
        locked.merge_replica(&ReplicaDescription {
            instance_id: 5,
            ..Default::default()
        });
        locked.replica.service_location = "host:1234".into();
        locked.replica.replication_endpoint = "host:4321".into();
        locked.merge_replica(&ReplicaDescription {
            instance_id: 6,
            ..Default::default()
        });
        assert_eq!(locked.replica.instance_id, 6);
        assert_eq!(locked.replica.service_location, "host:1234");
        assert_eq!(locked.replica.replication_endpoint, "host:4321");
    }

    #[test]
    fn epoch_never_decreases() {
        let fup = new_fup();
        let mut locked = fup.lock();
        let id = fup.id();
        let mut desc = FailoverUnitDescription::new(id);
        desc.current_epoch = Epoch::new(1, 5);
        locked.advance_epoch(&desc);
        assert_eq!(locked.failover_unit.current_epoch, Epoch::new(1, 5));

        desc.current_epoch = Epoch::new(1, 3);
        locked.advance_epoch(&desc);
        assert_eq!(locked.failover_unit.current_epoch, Epoch::new(1, 5));

        desc.current_epoch = Epoch::new(2, 0);
        desc.previous_epoch = Epoch::new(1, 5);
        locked.advance_epoch(&desc);
        assert_eq!(locked.failover_unit.current_epoch, Epoch::new(2, 0));
        assert_eq!(locked.failover_unit.previous_epoch, Epoch::new(1, 5));
    }

    #[test]
    fn cleanup_idempotent() {
        let fup = new_fup();
        fup.cleanup();
        fup.cleanup();
        assert!(fup.lock().is_deleted);
    }
}
