//! Action list executor: runs one named action list against one failover
//! unit proxy to completion, producing an aggregated outcome code and the
//! reply payload pieces.
//!
//! Execution is strictly sequential. Every primitive call runs under the
//! enclosing message's deadline budget and races the admission-scoped
//! cancellation signal. Primitives that complete successfully durably
//! advance the proxy's role/stage/catchup fields under its lock, so a
//! retried message re-classifies from how far a partially-failed list got.

use std::future::Future;
use std::sync::Arc;

use crate::agent::{DeployedReplicaDetail, ProxyRequest};
use crate::proxy::actions::{ActionListTag, ProxyAction};
use crate::proxy::descript::{ProxyErrorCode, ReplicaRole};
use crate::proxy::fup::{
    CatchupResult, ConfigurationStage, FailoverUnitProxy, ProxyState,
};
use crate::proxy::ports::{
    CatchupMode, CatchupOutcome, ReplicatorPort, ReplicatorQueryInfo,
    ReplicatorStatus, ServiceHost, StatefulServicePort, StatelessServicePort,
};

use tokio::sync::watch;
use tokio::time::{self, Instant};

/// Everything one action list execution needs.
pub(crate) struct ExecutionContext {
    pub(crate) tag: ActionListTag,
    pub(crate) fup: Arc<FailoverUnitProxy>,
    pub(crate) host: Arc<dyn ServiceHost>,
    pub(crate) request: ProxyRequest,
    pub(crate) deadline: Instant,
    pub(crate) cancel: watch::Receiver<bool>,
}

/// Aggregated result of one action list execution.
#[derive(Debug, Clone)]
pub(crate) struct ExecutionOutcome {
    pub(crate) error: ProxyErrorCode,
    pub(crate) status: Option<ReplicatorStatus>,
    pub(crate) query: Option<ReplicatorQueryInfo>,
}

pub(crate) struct ActionListExecutor;

impl ActionListExecutor {
    /// Runs the context's action list to completion. First failure
    /// short-circuits unless the list is marked continue-on-failure, in
    /// which case later cleanup actions still run and the first real error
    /// is the combined status. Cancellation always stops the list.
    pub(crate) async fn run(mut ctx: ExecutionContext) -> ExecutionOutcome {
        let continue_on_failure = ctx.tag.continue_on_failure();
        let mut outcome = ExecutionOutcome {
            error: ProxyErrorCode::Success,
            status: None,
            query: None,
        };

        pf_trace!("fup {} executing list {}", ctx.fup.id(), ctx.tag);
        for &action in ctx.tag.actions() {
            match Self::run_action(&mut ctx, action, &mut outcome).await {
                Ok(()) => {}
                Err(code) => {
                    pf_debug!(
                        "fup {} list {} action {:?} failed: {}",
                        ctx.fup.id(),
                        ctx.tag,
                        action,
                        code
                    );
                    if outcome.error.is_success() {
                        outcome.error = code;
                    }
                    if code == ProxyErrorCode::OperationCanceled
                        || !continue_on_failure
                    {
                        break;
                    }
                }
            }
        }
        outcome
    }

    /// The specialized query flavor: carries a pre-fetched proxy snapshot
    /// and merges the replicator's query result into it upon completion.
    pub(crate) async fn run_replica_query(
        ctx: ExecutionContext,
        mut detail: DeployedReplicaDetail,
    ) -> (ExecutionOutcome, DeployedReplicaDetail) {
        let outcome = Self::run(ctx).await;
        if let Some(info) = outcome.query.clone() {
            detail.replicator = Some(info);
        }
        (outcome, detail)
    }

    async fn run_action(
        ctx: &mut ExecutionContext,
        action: ProxyAction,
        outcome: &mut ExecutionOutcome,
    ) -> Result<(), ProxyErrorCode> {
        match action {
            ProxyAction::OpenStatelessInstance => {
                if ctx.fup.lock().stateless_port.is_none() {
                    let (service, replica) = {
                        let locked = ctx.fup.lock();
                        (locked.service.clone(), locked.replica.clone())
                    };
                    let host = ctx.host.clone();
                    let port = guarded(
                        ctx.deadline,
                        &mut ctx.cancel,
                        host.create_stateless(&service, &replica),
                    )
                    .await?;
                    ctx.fup.lock().stateless_port = Some(port);
                }
                let port = Self::stateless_port(&ctx.fup)?;
                let location =
                    guarded(ctx.deadline, &mut ctx.cancel, port.open()).await?;
                ctx.fup.lock().replica.service_location = location;
                Ok(())
            }

            ProxyAction::CloseStatelessInstance => {
                let port = match ctx.fup.lock().stateless_port.clone() {
                    Some(port) => port,
                    None => return Ok(()), // nothing left to close
                };
                guarded(ctx.deadline, &mut ctx.cancel, port.close()).await?;
                ctx.fup.lock().stateless_port = None;
                Ok(())
            }

            ProxyAction::AbortStatelessInstance => {
                let port = ctx.fup.lock().stateless_port.take();
                if let Some(port) = port {
                    port.abort();
                }
                Ok(())
            }

            ProxyAction::OpenReplica => {
                if ctx.fup.lock().service_port.is_none() {
                    let (service, replica) = {
                        let locked = ctx.fup.lock();
                        (locked.service.clone(), locked.replica.clone())
                    };
                    let host = ctx.host.clone();
                    let (service_port, replicator_port) = guarded(
                        ctx.deadline,
                        &mut ctx.cancel,
                        host.create_stateful(&service, &replica),
                    )
                    .await?;
                    let mut locked = ctx.fup.lock();
                    locked.service_port = Some(service_port);
                    locked.replicator_port = Some(replicator_port);
                }
                let (port, mode) = {
                    let locked = ctx.fup.lock();
                    (Self::service_of(&locked)?, locked.open_mode)
                };
                let location =
                    guarded(ctx.deadline, &mut ctx.cancel, port.open(mode))
                        .await?;
                let mut locked = ctx.fup.lock();
                locked.replica.service_location = location;
                locked.service_role = ReplicaRole::None;
                Ok(())
            }

            ProxyAction::OpenReplicator => {
                let port = Self::replicator_port(&ctx.fup)?;
                let endpoint =
                    guarded(ctx.deadline, &mut ctx.cancel, port.open()).await?;
                let mut locked = ctx.fup.lock();
                locked.replica.replication_endpoint = endpoint;
                locked.replicator_role = ReplicaRole::None;
                Ok(())
            }

            ProxyAction::ChangeReplicatorRole => {
                let port = Self::replicator_port(&ctx.fup)?;
                let epoch = ctx.fup.lock().failover_unit.current_epoch;
                let target = Self::target_role(ctx);
                guarded(
                    ctx.deadline,
                    &mut ctx.cancel,
                    port.change_role(epoch, target),
                )
                .await?;
                ctx.fup.lock().replicator_role = target;
                Ok(())
            }

            ProxyAction::ChangeServiceRole => {
                let port = Self::service_port(&ctx.fup)?;
                let target = Self::target_role(ctx);
                let location = guarded(
                    ctx.deadline,
                    &mut ctx.cancel,
                    port.change_role(target),
                )
                .await?;
                let mut locked = ctx.fup.lock();
                locked.service_role = target;
                if !location.is_empty()
                    && location != locked.replica.service_location
                {
                    locked.replica.service_location = location;
                    // RA learns new locations through a notification, not
                    // through this list's reply
                    if locked.state == ProxyState::Opened {
                        locked.endpoint_update_pending = true;
                    }
                }
                Ok(())
            }

            ProxyAction::CloseReplica => {
                let port = match ctx.fup.lock().service_port.clone() {
                    Some(port) => port,
                    None => return Ok(()),
                };
                guarded(ctx.deadline, &mut ctx.cancel, port.close()).await?;
                let mut locked = ctx.fup.lock();
                locked.service_port = None;
                locked.service_role = ReplicaRole::None;
                Ok(())
            }

            ProxyAction::AbortReplica => {
                let port = ctx.fup.lock().service_port.take();
                if let Some(port) = port {
                    port.abort();
                }
                ctx.fup.lock().service_role = ReplicaRole::None;
                Ok(())
            }

            ProxyAction::UpdateServiceDescription => {
                let port = Self::service_port(&ctx.fup)?;
                let service = ctx.request.service.clone();
                guarded(
                    ctx.deadline,
                    &mut ctx.cancel,
                    port.update_description(&service),
                )
                .await?;
                ctx.fup.lock().service = service;
                Ok(())
            }

            ProxyAction::CloseReplicator => {
                let port = match ctx.fup.lock().replicator_port.clone() {
                    Some(port) => port,
                    None => return Ok(()),
                };
                guarded(ctx.deadline, &mut ctx.cancel, port.close()).await?;
                let mut locked = ctx.fup.lock();
                locked.replicator_port = None;
                locked.replicator_role = ReplicaRole::None;
                Ok(())
            }

            ProxyAction::AbortReplicator => {
                let port = ctx.fup.lock().replicator_port.take();
                if let Some(port) = port {
                    port.abort();
                }
                ctx.fup.lock().replicator_role = ReplicaRole::None;
                Ok(())
            }

            ProxyAction::ReplicatorUpdateEpoch => {
                let port = Self::replicator_port(&ctx.fup)?;
                let epoch = ctx.request.failover_unit.current_epoch;
                guarded(
                    ctx.deadline,
                    &mut ctx.cancel,
                    port.update_epoch(epoch),
                )
                .await?;
                ctx.fup.lock().advance_epoch(&ctx.request.failover_unit);
                Ok(())
            }

            ProxyAction::ReplicatorUpdateCatchupConfiguration => {
                let port = Self::replicator_port(&ctx.fup)?;
                let current = ctx.request.remote_replicas.clone();
                let previous = ctx.fup.lock().configuration_replicas.clone();
                guarded(
                    ctx.deadline,
                    &mut ctx.cancel,
                    port.update_catchup_configuration(&current, &previous),
                )
                .await?;
                Ok(())
            }

            ProxyAction::ReplicatorUpdateCurrentConfiguration => {
                let port = Self::replicator_port(&ctx.fup)?;
                let current = ctx.request.remote_replicas.clone();
                guarded(
                    ctx.deadline,
                    &mut ctx.cancel,
                    port.update_current_configuration(&current),
                )
                .await?;
                let mut locked = ctx.fup.lock();
                locked.configuration_replicas = current;
                locked.configuration_stage = ConfigurationStage::Current;
                Ok(())
            }

            ProxyAction::ReplicatorCatchupReplicaSet => {
                let port = Self::replicator_port(&ctx.fup)?;
                let mode = if ctx.fup.lock().configuration_stage
                    == ConfigurationStage::PreWriteStatusRevokeCatchupPending
                {
                    CatchupMode::WriteStatusRevoke
                } else {
                    CatchupMode::Quorum
                };
                let result = guarded(
                    ctx.deadline,
                    &mut ctx.cancel,
                    port.catchup_replica_set(mode),
                )
                .await?;
                let mut locked = ctx.fup.lock();
                match result {
                    CatchupOutcome::Completed => {
                        locked.catchup_result = CatchupResult::CatchupCompleted;
                        locked.configuration_replicas =
                            ctx.request.remote_replicas.clone();
                        locked.configuration_stage = ConfigurationStage::Current;
                        if mode == CatchupMode::WriteStatusRevoke {
                            locked.write_status_revoked_pending = true;
                        }
                        Ok(())
                    }
                    CatchupOutcome::DataLoss { last_lsn } => {
                        // sticky for this epoch; replays answered without
                        // touching the replicator again
                        locked.catchup_result = CatchupResult::DataLossReported;
                        locked.replica.last_acknowledged_lsn = Some(last_lsn);
                        Err(ProxyErrorCode::StateChangedOnDataLoss)
                    }
                }
            }

            ProxyAction::ReplicatorCancelCatchup => {
                let port = Self::replicator_port(&ctx.fup)?;
                guarded(ctx.deadline, &mut ctx.cancel, port.cancel_catchup())
                    .await?;
                let mut locked = ctx.fup.lock();
                if matches!(
                    locked.configuration_stage,
                    ConfigurationStage::CatchupPending
                        | ConfigurationStage::PreWriteStatusRevokeCatchupPending
                ) {
                    locked.configuration_stage = ConfigurationStage::Current;
                }
                Ok(())
            }

            ProxyAction::ReplicatorBuildIdleReplica => {
                let idle = ctx
                    .request
                    .remote_replicas
                    .first()
                    .cloned()
                    .ok_or(ProxyErrorCode::InvalidState)?;
                let port = Self::replicator_port(&ctx.fup)?;
                guarded(
                    ctx.deadline,
                    &mut ctx.cancel,
                    port.build_idle_replica(&idle),
                )
                .await?;
                Ok(())
            }

            ProxyAction::ReplicatorRemoveIdleReplica => {
                let idle = ctx
                    .request
                    .remote_replicas
                    .first()
                    .cloned()
                    .ok_or(ProxyErrorCode::InvalidState)?;
                let port = Self::replicator_port(&ctx.fup)?;
                guarded(
                    ctx.deadline,
                    &mut ctx.cancel,
                    port.remove_idle_replica(idle.replica_id),
                )
                .await?;
                Ok(())
            }

            ProxyAction::ReplicatorGetStatus => {
                let port = Self::replicator_port(&ctx.fup)?;
                let status =
                    guarded(ctx.deadline, &mut ctx.cancel, port.get_status())
                        .await?;
                ctx.fup.lock().replica.last_acknowledged_lsn =
                    Some(status.last_lsn);
                outcome.status = Some(status);
                Ok(())
            }

            ProxyAction::ReplicatorGetQuery => {
                let port = Self::replicator_port(&ctx.fup)?;
                let info =
                    guarded(ctx.deadline, &mut ctx.cancel, port.get_query())
                        .await?;
                outcome.query = Some(info);
                Ok(())
            }
        }
    }

    /// Role the list drives towards: the request's intended role, except
    /// drop lists which always demote to `None` before closing.
    fn target_role(ctx: &ExecutionContext) -> ReplicaRole {
        if ctx.tag == ActionListTag::StatefulServiceDrop {
            ReplicaRole::None
        } else {
            ctx.request.local_replica.current_role
        }
    }

    fn service_of(
        locked: &crate::proxy::fup::LockedFailoverUnitProxy<'_>,
    ) -> Result<Arc<dyn StatefulServicePort>, ProxyErrorCode> {
        locked
            .service_port
            .clone()
            .ok_or(ProxyErrorCode::InvalidState)
    }

    fn service_port(
        fup: &FailoverUnitProxy,
    ) -> Result<Arc<dyn StatefulServicePort>, ProxyErrorCode> {
        Self::service_of(&fup.lock())
    }

    fn replicator_port(
        fup: &FailoverUnitProxy,
    ) -> Result<Arc<dyn ReplicatorPort>, ProxyErrorCode> {
        fup.lock()
            .replicator_port
            .clone()
            .ok_or(ProxyErrorCode::InvalidState)
    }

    fn stateless_port(
        fup: &FailoverUnitProxy,
    ) -> Result<Arc<dyn StatelessServicePort>, ProxyErrorCode> {
        fup.lock()
            .stateless_port
            .clone()
            .ok_or(ProxyErrorCode::InvalidState)
    }
}

/// Awaits one primitive under the message's deadline budget, racing the
/// admission-scoped cancellation signal. Synchronously-completing
/// primitives resolve inline on first poll.
async fn guarded<T>(
    deadline: Instant,
    cancel: &mut watch::Receiver<bool>,
    fut: impl Future<Output = Result<T, ProxyErrorCode>>,
) -> Result<T, ProxyErrorCode> {
    if *cancel.borrow() {
        return Err(ProxyErrorCode::OperationCanceled);
    }
    tokio::select! {
        result = time::timeout_at(deadline, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(ProxyErrorCode::Timeout),
        },
        _ = cancel.changed() => Err(ProxyErrorCode::OperationCanceled),
    }
}
