//! Replication-surface message handling: BuildIdleReplica,
//! RemoveIdleReplica, GetStatus, UpdateEpochAndGetStatus, CancelCatchup.

use super::*;

use crate::proxy::{
    ActionListExecutor, AdmissionOutcome, ConfigurationStage,
    ExecutionContext, FailoverUnitProxy, FupFields, ProxyState, ReplicaRole,
    ReplicatorStatus,
};

/// Pure classification of idle-replica build/remove requests. Both only
/// make sense on an open stateful primary.
pub(crate) fn classify_idle_replica(
    fields: &FupFields,
    request: &ProxyRequest,
) -> Decision {
    if fields.state != ProxyState::Opened {
        return Decision::Drop("replica not open");
    }
    if request.local_replica.instance_id != fields.replica.instance_id {
        return Decision::Drop("instance id mismatch");
    }
    if !fields.service.is_stateful {
        return Decision::Drop("stateless service has no idle replicas");
    }
    if fields.replicator_role != ReplicaRole::Primary {
        return Decision::Reply(ProxyErrorCode::InvalidState);
    }
    if request.remote_replicas.is_empty() {
        return Decision::Reply(ProxyErrorCode::InvalidState);
    }
    Decision::Execute(
        if request.action == ProxyMessageAction::BuildIdleReplica {
            ActionListTag::ReplicatorBuildIdleReplica
        } else {
            ActionListTag::ReplicatorRemoveIdleReplica
        },
    )
}

/// Pure classification of GetStatus / UpdateEpochAndGetStatus requests.
pub(crate) fn classify_get_status(
    fields: &FupFields,
    request: &ProxyRequest,
) -> Decision {
    if fields.state == ProxyState::Closed {
        return Decision::Reply(ProxyErrorCode::ObjectClosed);
    }
    if fields.state != ProxyState::Opened {
        return Decision::Drop("replica not open");
    }
    if request.local_replica.instance_id != fields.replica.instance_id {
        return Decision::Drop("instance id mismatch");
    }
    if !fields.service.is_stateful {
        return Decision::Reply(ProxyErrorCode::InvalidState);
    }
    if request.action == ProxyMessageAction::UpdateEpochAndGetStatus {
        if request.failover_unit.current_epoch
            < fields.failover_unit.current_epoch
        {
            return Decision::Drop("stale epoch");
        }
        Decision::Execute(ActionListTag::ReplicatorUpdateEpochAndGetStatus)
    } else {
        Decision::Execute(ActionListTag::ReplicatorGetStatus)
    }
}

/// Pure classification of CancelCatchup requests.
pub(crate) fn classify_cancel_catchup(
    fields: &FupFields,
    request: &ProxyRequest,
) -> Decision {
    if fields.state != ProxyState::Opened {
        return Decision::Drop("replica not open");
    }
    if request.local_replica.instance_id != fields.replica.instance_id {
        return Decision::Drop("instance id mismatch");
    }
    if !fields.service.is_stateful {
        return Decision::Drop("stateless service has no catchup");
    }
    let catchup_active = fields
        .is_executing_tag(ActionListTag::ReplicatorUpdateAndCatchupQuorum)
        || matches!(
            fields.configuration_stage,
            ConfigurationStage::CatchupPending
                | ConfigurationStage::PreWriteStatusRevokeCatchupPending
        );
    if catchup_active {
        Decision::Execute(ActionListTag::CancelCatchupReplicaSet)
    } else {
        // nothing in flight to cancel; ACK so RA proceeds
        Decision::Reply(ProxyErrorCode::Success)
    }
}

impl ProxyContext {
    /// Handler of BuildIdleReplica and RemoveIdleReplica requests.
    pub(crate) fn handle_idle_replica(
        ctx: &Arc<ProxyContext>,
        request: ProxyRequest,
    ) {
        let fup = match ctx.registry.find(request.failover_unit.id) {
            Some(fup) => fup,
            None => {
                pf_debug!(
                    "dropping {:?} for unknown fup {}",
                    request.action,
                    request.failover_unit.id
                );
                return;
            }
        };
        let mut locked = fup.lock();
        if locked.is_deleted {
            return;
        }
        match classify_idle_replica(&locked, &request) {
            Decision::Drop(reason) => {
                pf_debug!(
                    "dropping {:?} for fup {}: {}",
                    request.action,
                    fup.id(),
                    reason
                );
            }
            Decision::Reply(code) => {
                drop(locked);
                let reply = ctx.build_reply(&request, code, None, Some(&fup));
                ctx.send_reply(reply);
            }
            Decision::ReplyDataLoss => {
                unreachable!("data loss never classifies for idle replicas")
            }
            Decision::Execute(tag) => {
                match locked.try_add_to_executing(tag, false) {
                    AdmissionOutcome::Admitted(cancel) => {
                        drop(locked);
                        let ctx = ctx.clone();
                        let fup = fup.clone();
                        tokio::spawn(async move {
                            Self::execute_replication_list(
                                ctx, fup, request, tag, cancel,
                            )
                            .await;
                        });
                    }
                    AdmissionOutcome::Rejected => {
                        pf_debug!(
                            "dropping {:?} for fup {}: work in progress",
                            request.action,
                            fup.id()
                        );
                    }
                    AdmissionOutcome::CancelNeeded => {
                        unreachable!("idle replica work never supersedes")
                    }
                }
            }
        }
    }

    /// Handler of GetStatus and UpdateEpochAndGetStatus requests. Never
    /// removes the proxy.
    pub(crate) fn handle_get_status(
        ctx: &Arc<ProxyContext>,
        request: ProxyRequest,
    ) {
        let fup = match ctx.registry.find(request.failover_unit.id) {
            Some(fup) => fup,
            None => {
                let reply = ProxyReply::for_request(
                    &request,
                    ProxyErrorCode::ObjectClosed,
                );
                ctx.send_reply(reply);
                return;
            }
        };
        let mut locked = fup.lock();
        if locked.is_deleted {
            return;
        }
        match classify_get_status(&locked, &request) {
            Decision::Drop(reason) => {
                pf_debug!(
                    "dropping {:?} for fup {}: {}",
                    request.action,
                    fup.id(),
                    reason
                );
            }
            Decision::Reply(code) => {
                drop(locked);
                let reply = ctx.build_reply(&request, code, None, Some(&fup));
                ctx.send_reply(reply);
            }
            Decision::ReplyDataLoss => {
                unreachable!("data loss never classifies for status reads")
            }
            Decision::Execute(tag) => {
                match locked.try_add_to_executing(tag, false) {
                    AdmissionOutcome::Admitted(cancel) => {
                        if tag == ActionListTag::ReplicatorUpdateEpochAndGetStatus
                        {
                            locked.merge_replica(&request.local_replica);
                        }
                        drop(locked);
                        let ctx = ctx.clone();
                        let fup = fup.clone();
                        tokio::spawn(async move {
                            Self::execute_get_status(
                                ctx, fup, request, tag, cancel,
                            )
                            .await;
                        });
                    }
                    AdmissionOutcome::Rejected => {
                        pf_debug!(
                            "dropping {:?} for fup {}: work in progress",
                            request.action,
                            fup.id()
                        );
                    }
                    AdmissionOutcome::CancelNeeded => {
                        unreachable!("status reads never supersede")
                    }
                }
            }
        }
    }

    /// Handler of CancelCatchup requests. The cancel list is admitted
    /// alongside the executing catchup (merged admission); the replicator's
    /// cancel primitive unblocks the pending catchup call, whose own list
    /// then unwinds as canceled.
    pub(crate) fn handle_cancel_catchup(
        ctx: &Arc<ProxyContext>,
        request: ProxyRequest,
    ) {
        let fup = match ctx.registry.find(request.failover_unit.id) {
            Some(fup) => fup,
            None => {
                pf_debug!(
                    "dropping cancel catchup for unknown fup {}",
                    request.failover_unit.id
                );
                return;
            }
        };
        let mut locked = fup.lock();
        if locked.is_deleted {
            return;
        }
        match classify_cancel_catchup(&locked, &request) {
            Decision::Drop(reason) => {
                pf_debug!(
                    "dropping cancel catchup for fup {}: {}",
                    fup.id(),
                    reason
                );
            }
            Decision::Reply(code) => {
                drop(locked);
                let reply = ctx.build_reply(&request, code, None, Some(&fup));
                ctx.send_reply(reply);
            }
            Decision::ReplyDataLoss => {
                unreachable!("data loss never classifies for cancel catchup")
            }
            Decision::Execute(tag) => {
                match locked.try_add_to_executing(tag, false) {
                    AdmissionOutcome::Admitted(cancel) => {
                        drop(locked);
                        let ctx = ctx.clone();
                        let fup = fup.clone();
                        tokio::spawn(async move {
                            Self::execute_replication_list(
                                ctx, fup, request, tag, cancel,
                            )
                            .await;
                        });
                    }
                    AdmissionOutcome::Rejected => {
                        pf_debug!(
                            "dropping cancel catchup for fup {}: \
                             incompatible work in progress",
                            fup.id()
                        );
                    }
                    AdmissionOutcome::CancelNeeded => {
                        unreachable!("cancel catchup merges, never supersedes")
                    }
                }
            }
        }
    }

    /// Shared completion for idle-replica and cancel-catchup lists.
    async fn execute_replication_list(
        ctx: Arc<ProxyContext>,
        fup: Arc<FailoverUnitProxy>,
        request: ProxyRequest,
        tag: ActionListTag,
        cancel: tokio::sync::watch::Receiver<bool>,
    ) {
        let deadline = ctx.deadline_for(&request);
        let outcome = ActionListExecutor::run(ExecutionContext {
            tag,
            fup: fup.clone(),
            host: ctx.host.clone(),
            request: request.clone(),
            deadline,
            cancel,
        })
        .await;
        fup.done_executing(tag);

        match outcome.error {
            ProxyErrorCode::OperationCanceled => {}
            code => {
                let reply = ctx.build_reply(&request, code, None, Some(&fup));
                ctx.send_reply(reply);
            }
        }
    }

    async fn execute_get_status(
        ctx: Arc<ProxyContext>,
        fup: Arc<FailoverUnitProxy>,
        request: ProxyRequest,
        tag: ActionListTag,
        cancel: tokio::sync::watch::Receiver<bool>,
    ) {
        let deadline = ctx.deadline_for(&request);
        let outcome = ActionListExecutor::run(ExecutionContext {
            tag,
            fup: fup.clone(),
            host: ctx.host.clone(),
            request: request.clone(),
            deadline,
            cancel,
        })
        .await;
        fup.done_executing(tag);

        match outcome.error {
            ProxyErrorCode::Success => {
                let body = ReplyBody::ReplicatorStatus(
                    outcome.status.unwrap_or(ReplicatorStatus::default()),
                );
                let reply = ctx.build_reply(
                    &request,
                    ProxyErrorCode::Success,
                    Some(body),
                    Some(&fup),
                );
                ctx.send_reply(reply);
            }
            ProxyErrorCode::OperationCanceled => {}
            code => {
                let reply = ctx.build_reply(&request, code, None, Some(&fup));
                ctx.send_reply(reply);
            }
        }
    }
}
