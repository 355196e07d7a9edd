//! UpdateConfiguration message handling: the branch table deciding between
//! catchup, role changes, replica-list updates, and replay ACKs.

use super::*;

use crate::proxy::{
    ActionListExecutor, AdmissionOutcome, CatchupResult, ConfigurationStage,
    ExecutionContext, FupFields, ProxyState, ReplicaDescription, ReplicaRole,
};

use crate::agent::lifecycle::role_achieved;

/// True if the request's replica set differs from the one last applied to
/// the replicator. Order-insensitive on (replica, instance, role).
fn replica_set_differs(fields: &FupFields, request: &ProxyRequest) -> bool {
    fn key(r: &ReplicaDescription) -> (u64, u64, ReplicaRole) {
        (r.replica_id, r.instance_id, r.current_role)
    }
    let mut have: Vec<_> =
        fields.configuration_replicas.iter().map(key).collect();
    let mut want: Vec<_> = request.remote_replicas.iter().map(key).collect();
    have.sort_unstable();
    want.sort_unstable();
    have != want
}

/// Pure classification of an UpdateConfiguration request. Branch precedence
/// is fixed: not-Opened, stale epoch, and instance mismatch drop; then the
/// catchup flag group (data-loss sticky answer, replay ACK or replica-list
/// delta, fresh catchup); then the end-reconfiguration group; then the plain
/// group deriving remaining role steps from the actual drift.
pub(crate) fn classify_update_configuration(
    fields: &FupFields,
    request: &ProxyRequest,
) -> Decision {
    if fields.state != ProxyState::Opened {
        return Decision::Drop("replica not open");
    }
    if request.failover_unit.current_epoch < fields.failover_unit.current_epoch
    {
        return Decision::Drop("stale epoch");
    }
    if request.local_replica.instance_id != fields.replica.instance_id {
        return Decision::Drop("instance id mismatch");
    }
    if !fields.service.is_stateful {
        return Decision::Drop("stateless service has no configuration");
    }

    let same_epoch = request.failover_unit.current_epoch
        == fields.failover_unit.current_epoch;

    if request.flags.catchup {
        if same_epoch {
            match fields.catchup_result {
                CatchupResult::DataLossReported => {
                    return Decision::ReplyDataLoss;
                }
                CatchupResult::CatchupCompleted => {
                    // replayed catchup for an epoch already caught up: only
                    // the replica-list delta (if any) still needs applying
                    return if replica_set_differs(fields, request) {
                        Decision::Execute(
                            ActionListTag::ReplicatorUpdateReplicas,
                        )
                    } else {
                        Decision::Reply(ProxyErrorCode::Success)
                    };
                }
                CatchupResult::NotStarted => {}
            }
        }
        return Decision::Execute(
            ActionListTag::ReplicatorUpdateAndCatchupQuorum,
        );
    }

    let target = request.local_replica.current_role;
    let need_replicator = !role_achieved(fields.replicator_role, target);
    let need_service = !role_achieved(fields.service_role, target);

    if request.flags.end_reconfiguration {
        // demote completion; drift decides which halves still need doing
        return match (need_service, need_replicator) {
            (false, false) => Decision::Reply(ProxyErrorCode::Success),
            (true, true) => Decision::Execute(
                ActionListTag::StatefulServiceDemoteToSecondary,
            ),
            (true, false) => Decision::Execute(
                ActionListTag::StatefulServiceEndRoleChange,
            ),
            (false, true) => {
                Decision::Execute(ActionListTag::ReplicatorEndRoleChange)
            }
        };
    }

    match (need_replicator, need_service) {
        (false, false) => {
            if replica_set_differs(fields, request) {
                Decision::Execute(ActionListTag::ReplicatorUpdateReplicas)
            } else {
                Decision::Reply(ProxyErrorCode::Success)
            }
        }
        (true, true) => {
            if fields.service_role == ReplicaRole::Primary
                && target != ReplicaRole::Primary
            {
                Decision::Execute(
                    ActionListTag::StatefulServiceDemoteToSecondary,
                )
            } else if target == ReplicaRole::Primary {
                Decision::Execute(
                    ActionListTag::StatefulServicePromoteToPrimary,
                )
            } else {
                Decision::Execute(ActionListTag::StatefulServiceChangeRole)
            }
        }
        (false, true) => {
            Decision::Execute(ActionListTag::StatefulServiceEndRoleChange)
        }
        (true, false) => {
            Decision::Execute(ActionListTag::ReplicatorEndRoleChange)
        }
    }
}

impl ProxyContext {
    /// Handler of UpdateConfiguration requests.
    pub(crate) fn handle_update_configuration(
        ctx: &Arc<ProxyContext>,
        request: ProxyRequest,
    ) {
        let fup = match ctx.registry.find(request.failover_unit.id) {
            Some(fup) => fup,
            None => {
                pf_debug!(
                    "dropping update configuration for unknown fup {}",
                    request.failover_unit.id
                );
                return;
            }
        };
        let mut locked = fup.lock();
        if locked.is_deleted {
            return;
        }

        match classify_update_configuration(&locked, &request) {
            Decision::Drop(reason) => {
                pf_debug!(
                    "dropping update configuration for fup {}: {}",
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
                drop(locked);
                // sticky per epoch: answered locally with the last
                // acknowledged LSN, without touching the replicator
                let reply = ctx.build_reply(
                    &request,
                    ProxyErrorCode::StateChangedOnDataLoss,
                    None,
                    Some(&fup),
                );
                ctx.send_reply(reply);
            }
            Decision::Execute(tag) => {
                match locked.try_add_to_executing(tag, false) {
                    AdmissionOutcome::Admitted(cancel) => {
                        if request.failover_unit.current_epoch
                            > locked.failover_unit.current_epoch
                        {
                            // data-loss/completion records are per epoch
                            locked.catchup_result = CatchupResult::NotStarted;
                        }
                        locked.merge_replica(&request.local_replica);
                        locked.advance_epoch(&request.failover_unit);
                        locked.configuration_stage = match tag {
                            ActionListTag::ReplicatorUpdateAndCatchupQuorum => {
                                if locked.service_role == ReplicaRole::Primary
                                    && request.local_replica.current_role
                                        != ReplicaRole::Primary
                                {
                                    ConfigurationStage::PreWriteStatusRevokeCatchupPending
                                } else {
                                    ConfigurationStage::CatchupPending
                                }
                            }
                            // merged under an executing catchup: keep its stage
                            ActionListTag::ReplicatorUpdateReplicas => {
                                locked.configuration_stage
                            }
                            _ => ConfigurationStage::CurrentPending,
                        };
                        drop(locked);

                        let ctx = ctx.clone();
                        let fup = fup.clone();
                        tokio::spawn(async move {
                            Self::execute_update_configuration(
                                ctx, fup, request, tag, cancel,
                            )
                            .await;
                        });
                    }
                    AdmissionOutcome::Rejected => {
                        pf_debug!(
                            "dropping update configuration for fup {}: \
                             work in progress",
                            fup.id()
                        );
                    }
                    AdmissionOutcome::CancelNeeded => {
                        unreachable!(
                            "update configuration never supersedes work"
                        )
                    }
                }
            }
        }
    }

    async fn execute_update_configuration(
        ctx: Arc<ProxyContext>,
        fup: Arc<crate::proxy::FailoverUnitProxy>,
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

        let role_changed = matches!(
            tag,
            ActionListTag::StatefulServicePromoteToPrimary
                | ActionListTag::StatefulServiceDemoteToSecondary
                | ActionListTag::StatefulServiceChangeRole
                | ActionListTag::StatefulServiceEndRoleChange
                | ActionListTag::ReplicatorEndRoleChange
        );

        match outcome.error {
            ProxyErrorCode::Success => {
                {
                    let mut locked = fup.lock();
                    if locked.configuration_stage
                        == ConfigurationStage::CurrentPending
                    {
                        locked.configuration_stage = ConfigurationStage::Current;
                    }
                }
                if role_changed {
                    ctx.report_default_load(&fup);
                }
                let reply = ctx.build_reply(
                    &request,
                    ProxyErrorCode::Success,
                    None,
                    Some(&fup),
                );
                ctx.send_reply(reply);
            }
            ProxyErrorCode::OperationCanceled => {
                // suppressed; RA resends and re-classifies from the
                // durable partial progress
            }
            code => {
                let reply = ctx.build_reply(&request, code, None, Some(&fup));
                ctx.send_reply(reply);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{
        Epoch, FailoverUnitDescription, FailoverUnitId, FailoverUnitProxy,
        LockedFailoverUnitProxy, ServiceDescription,
    };

    fn uc_request(
        fup: &FailoverUnitProxy,
        epoch: Epoch,
        target: ReplicaRole,
        catchup: bool,
        end_reconfiguration: bool,
    ) -> ProxyRequest {
        ProxyRequest {
            action: ProxyMessageAction::UpdateConfiguration,
            failover_unit: FailoverUnitDescription {
                id: fup.id(),
                previous_epoch: Epoch::NULL,
                current_epoch: epoch,
            },
            local_replica: ReplicaDescription {
                replica_id: 1,
                instance_id: 7,
                current_role: target,
                ..Default::default()
            },
            remote_replicas: vec![],
            service: ServiceDescription {
                is_stateful: true,
                ..Default::default()
            },
            flags: MessageFlags {
                catchup,
                end_reconfiguration,
                ..Default::default()
            },
            timeout_ms: 5000,
        }
    }

    fn opened_fup() -> FailoverUnitProxy {
        let fup = FailoverUnitProxy::new(FailoverUnitId::new_random());
        {
            let mut locked = fup.lock();
            locked.state = ProxyState::Opened;
            locked.service.is_stateful = true;
            locked.replica.instance_id = 7;
            locked.failover_unit.current_epoch = Epoch::new(1, 3);
        }
        fup
    }

    fn set_roles(
        locked: &mut LockedFailoverUnitProxy<'_>,
        replicator: ReplicaRole,
        service: ReplicaRole,
    ) {
        locked.replicator_role = replicator;
        locked.service_role = service;
    }

    #[test]
    fn not_opened_drops() {
        let fup = opened_fup();
        fup.lock().state = ProxyState::Closing;
        let req =
            uc_request(&fup, Epoch::new(1, 3), ReplicaRole::Primary, false, false);
        assert!(matches!(
            classify_update_configuration(&fup.lock(), &req),
            Decision::Drop(_)
        ));
    }

    #[test]
    fn stale_epoch_drops() {
        let fup = opened_fup();
        let req =
            uc_request(&fup, Epoch::new(1, 2), ReplicaRole::Primary, false, false);
        assert!(matches!(
            classify_update_configuration(&fup.lock(), &req),
            Decision::Drop(_)
        ));
    }

    #[test]
    fn instance_mismatch_drops() {
        let fup = opened_fup();
        let mut req =
            uc_request(&fup, Epoch::new(1, 3), ReplicaRole::Primary, false, false);
        req.local_replica.instance_id = 6;
        assert!(matches!(
            classify_update_configuration(&fup.lock(), &req),
            Decision::Drop(_)
        ));
    }

    #[test]
    fn catchup_branch_table() {
        let fup = opened_fup();
        {
            let mut locked = fup.lock();
            set_roles(&mut locked, ReplicaRole::Primary, ReplicaRole::Primary);
        }
        let same = Epoch::new(1, 3);
        let newer = Epoch::new(1, 4);

        // fresh catchup at the current epoch
        let req = uc_request(&fup, same, ReplicaRole::Primary, true, false);
        assert_eq!(
            classify_update_configuration(&fup.lock(), &req),
            Decision::Execute(ActionListTag::ReplicatorUpdateAndCatchupQuorum)
        );

        // data loss reported: sticky local answer for the same epoch
        fup.lock().catchup_result = CatchupResult::DataLossReported;
        assert_eq!(
            classify_update_configuration(&fup.lock(), &req),
            Decision::ReplyDataLoss
        );
        // a newer epoch runs catchup again
        let req_newer =
            uc_request(&fup, newer, ReplicaRole::Primary, true, false);
        assert_eq!(
            classify_update_configuration(&fup.lock(), &req_newer),
            Decision::Execute(ActionListTag::ReplicatorUpdateAndCatchupQuorum)
        );

        // completed: replay ACK when the replica set matches...
        fup.lock().catchup_result = CatchupResult::CatchupCompleted;
        assert_eq!(
            classify_update_configuration(&fup.lock(), &req),
            Decision::Reply(ProxyErrorCode::Success)
        );
        // ...and only the cheap replica-list update when it differs
        let mut req_differs =
            uc_request(&fup, same, ReplicaRole::Primary, true, false);
        req_differs.remote_replicas.push(ReplicaDescription {
            replica_id: 9,
            instance_id: 1,
            current_role: ReplicaRole::Secondary,
            ..Default::default()
        });
        assert_eq!(
            classify_update_configuration(&fup.lock(), &req_differs),
            Decision::Execute(ActionListTag::ReplicatorUpdateReplicas)
        );
    }

    #[test]
    fn end_reconfiguration_branch_table() {
        let same = Epoch::new(1, 3);
        let cases = [
            // (replicator, service, expected)
            (
                ReplicaRole::Primary,
                ReplicaRole::Primary,
                Decision::Execute(
                    ActionListTag::StatefulServiceDemoteToSecondary,
                ),
            ),
            (
                ReplicaRole::Secondary,
                ReplicaRole::Primary,
                Decision::Execute(ActionListTag::StatefulServiceEndRoleChange),
            ),
            (
                ReplicaRole::Primary,
                ReplicaRole::Secondary,
                Decision::Execute(ActionListTag::ReplicatorEndRoleChange),
            ),
            (
                ReplicaRole::Secondary,
                ReplicaRole::Secondary,
                Decision::Reply(ProxyErrorCode::Success),
            ),
        ];
        for (replicator, service, expected) in cases {
            let fup = opened_fup();
            {
                let mut locked = fup.lock();
                set_roles(&mut locked, replicator, service);
            }
            let req =
                uc_request(&fup, same, ReplicaRole::Secondary, false, true);
            assert_eq!(
                classify_update_configuration(&fup.lock(), &req),
                expected,
                "case ({:?}, {:?})",
                replicator,
                service
            );
        }
    }

    #[test]
    fn plain_update_branch_table() {
        let same = Epoch::new(1, 3);
        let cases = [
            // (replicator, service, target, expected)
            (
                ReplicaRole::Secondary,
                ReplicaRole::Secondary,
                ReplicaRole::Primary,
                Decision::Execute(
                    ActionListTag::StatefulServicePromoteToPrimary,
                ),
            ),
            (
                ReplicaRole::Primary,
                ReplicaRole::Secondary,
                ReplicaRole::Primary,
                Decision::Execute(ActionListTag::StatefulServiceEndRoleChange),
            ),
            (
                ReplicaRole::Secondary,
                ReplicaRole::Primary,
                ReplicaRole::Primary,
                Decision::Execute(ActionListTag::ReplicatorEndRoleChange),
            ),
            (
                ReplicaRole::Primary,
                ReplicaRole::Primary,
                ReplicaRole::Secondary,
                Decision::Execute(
                    ActionListTag::StatefulServiceDemoteToSecondary,
                ),
            ),
            (
                ReplicaRole::None,
                ReplicaRole::None,
                ReplicaRole::Secondary,
                Decision::Execute(ActionListTag::StatefulServiceChangeRole),
            ),
            (
                ReplicaRole::Primary,
                ReplicaRole::Primary,
                ReplicaRole::Primary,
                Decision::Reply(ProxyErrorCode::Success),
            ),
        ];
        for (replicator, service, target, expected) in cases {
            let fup = opened_fup();
            {
                let mut locked = fup.lock();
                set_roles(&mut locked, replicator, service);
            }
            let req = uc_request(&fup, same, target, false, false);
            assert_eq!(
                classify_update_configuration(&fup.lock(), &req),
                expected,
                "case ({:?}, {:?} -> {:?})",
                replicator,
                service,
                target
            );
        }
    }

    #[test]
    fn settled_roles_with_list_delta_updates_replicas() {
        let fup = opened_fup();
        {
            let mut locked = fup.lock();
            set_roles(&mut locked, ReplicaRole::Primary, ReplicaRole::Primary);
        }
        let mut req = uc_request(
            &fup,
            Epoch::new(1, 3),
            ReplicaRole::Primary,
            false,
            false,
        );
        req.remote_replicas.push(ReplicaDescription {
            replica_id: 4,
            instance_id: 2,
            current_role: ReplicaRole::Secondary,
            ..Default::default()
        });
        assert_eq!(
            classify_update_configuration(&fup.lock(), &req),
            Decision::Execute(ActionListTag::ReplicatorUpdateReplicas)
        );
    }
}
