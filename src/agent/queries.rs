//! Query surface, service description updates, and the two reply-only
//! notification acknowledgements.

use super::*;

use crate::proxy::{
    ActionListExecutor, AdmissionOutcome, ExecutionContext, FailoverUnitProxy,
    ProxyState,
};

impl ProxyContext {
    /// Handler of Query requests. Read-only: never mutates lifecycle state
    /// and never removes the proxy. When the replica is open and stateful,
    /// the replicator's own query surface is merged into the snapshot.
    pub(crate) fn handle_query(ctx: &Arc<ProxyContext>, request: ProxyRequest) {
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
        let detail = DeployedReplicaDetail {
            replica_id: locked.replica.replica_id,
            instance_id: locked.replica.instance_id,
            proxy_state: locked.state,
            current_service_role: locked.service_role,
            current_replicator_role: locked.replicator_role,
            configuration_stage: locked.configuration_stage,
            service_location: locked.replica.service_location.clone(),
            replication_endpoint: locked.replica.replication_endpoint.clone(),
            replicator: None,
        };
        let runnable = locked.service.is_stateful
            && locked.state == ProxyState::Opened
            && locked.replicator_port.is_some();

        if !runnable {
            drop(locked);
            let reply = ctx.build_reply(
                &request,
                ProxyErrorCode::Success,
                Some(ReplyBody::Query(detail)),
                Some(&fup),
            );
            ctx.send_reply(reply);
            return;
        }

        match locked
            .try_add_to_executing(ActionListTag::ReplicatorGetQuery, false)
        {
            AdmissionOutcome::Admitted(cancel) => {
                drop(locked);
                let ctx = ctx.clone();
                let fup = fup.clone();
                tokio::spawn(async move {
                    Self::execute_query(ctx, fup, request, detail, cancel)
                        .await;
                });
            }
            _ => {
                // don't wait on in-flight work; answer from the snapshot
                drop(locked);
                let reply = ctx.build_reply(
                    &request,
                    ProxyErrorCode::Success,
                    Some(ReplyBody::Query(detail)),
                    Some(&fup),
                );
                ctx.send_reply(reply);
            }
        }
    }

    async fn execute_query(
        ctx: Arc<ProxyContext>,
        fup: Arc<FailoverUnitProxy>,
        request: ProxyRequest,
        detail: DeployedReplicaDetail,
        cancel: tokio::sync::watch::Receiver<bool>,
    ) {
        let deadline = ctx.deadline_for(&request);
        let (outcome, detail) = ActionListExecutor::run_replica_query(
            ExecutionContext {
                tag: ActionListTag::ReplicatorGetQuery,
                fup: fup.clone(),
                host: ctx.host.clone(),
                request: request.clone(),
                deadline,
                cancel,
            },
            detail,
        )
        .await;
        fup.done_executing(ActionListTag::ReplicatorGetQuery);

        match outcome.error {
            ProxyErrorCode::OperationCanceled => {}
            code => {
                let reply = ctx.build_reply(
                    &request,
                    code,
                    Some(ReplyBody::Query(detail)),
                    Some(&fup),
                );
                ctx.send_reply(reply);
            }
        }
    }

    /// Handler of UpdateServiceDescription requests, versioned by
    /// `update_version`.
    pub(crate) fn handle_update_service_description(
        ctx: &Arc<ProxyContext>,
        request: ProxyRequest,
    ) {
        let fup = match ctx.registry.find(request.failover_unit.id) {
            Some(fup) => fup,
            None => {
                pf_debug!(
                    "dropping service description update for unknown fup {}",
                    request.failover_unit.id
                );
                return;
            }
        };
        let mut locked = fup.lock();
        if locked.is_deleted {
            return;
        }

        if request.service.update_version <= locked.service.update_version {
            // stale or duplicate: the description applied is at least as new
            drop(locked);
            let reply = ctx.build_reply(
                &request,
                ProxyErrorCode::Success,
                None,
                Some(&fup),
            );
            ctx.send_reply(reply);
            return;
        }

        if locked.state != ProxyState::Opened || !locked.service.is_stateful {
            // nothing hosted to notify; just adopt the newer description
            locked.service = request.service.clone();
            drop(locked);
            let reply = ctx.build_reply(
                &request,
                ProxyErrorCode::Success,
                None,
                Some(&fup),
            );
            ctx.send_reply(reply);
            return;
        }

        match locked.try_add_to_executing(
            ActionListTag::UpdateServiceDescription,
            false,
        ) {
            AdmissionOutcome::Admitted(cancel) => {
                drop(locked);
                let ctx = ctx.clone();
                let fup = fup.clone();
                tokio::spawn(async move {
                    Self::execute_update_service_description(
                        ctx, fup, request, cancel,
                    )
                    .await;
                });
            }
            AdmissionOutcome::Rejected => {
                pf_debug!(
                    "dropping service description update for fup {}: \
                     work in progress",
                    fup.id()
                );
            }
            AdmissionOutcome::CancelNeeded => {
                unreachable!("service description update never supersedes")
            }
        }
    }

    async fn execute_update_service_description(
        ctx: Arc<ProxyContext>,
        fup: Arc<FailoverUnitProxy>,
        request: ProxyRequest,
        cancel: tokio::sync::watch::Receiver<bool>,
    ) {
        let tag = ActionListTag::UpdateServiceDescription;
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

    /// Handler of the two reply-only notification acks. Clears the pending
    /// flag after a staleness check; never produces a reply.
    pub(crate) fn handle_notification_reply(
        ctx: &Arc<ProxyContext>,
        request: ProxyRequest,
    ) {
        let fup = match ctx.registry.find(request.failover_unit.id) {
            Some(fup) => fup,
            None => return,
        };
        let mut locked = fup.lock();
        if locked.is_deleted {
            return;
        }
        if request.local_replica.instance_id != locked.replica.instance_id {
            pf_debug!(
                "ignoring stale notification ack for fup {}",
                fup.id()
            );
            return;
        }
        match request.action {
            ProxyMessageAction::ReplicaEndpointUpdatedReply => {
                locked.endpoint_update_pending = false;
            }
            ProxyMessageAction::ReadWriteStatusRevokedReply => {
                locked.write_status_revoked_pending = false;
            }
            _ => unreachable!("not a notification ack"),
        }
    }
}
