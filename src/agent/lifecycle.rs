//! Replica lifecycle message handling: Open, Reopen, Close.

use super::*;

use crate::proxy::{
    ActionListExecutor, AdmissionOutcome, ExecutionContext, FupFields,
    ProxyState, ReplicaOpenMode, ReplicaRole, ReplicaState,
};

/// True if the role actually applied already satisfies the requested one.
/// Opening a replica as Idle leaves both roles at `None` until RA drives a
/// later role change, so `None` satisfies an `Idle` target.
pub(crate) fn role_achieved(actual: ReplicaRole, target: ReplicaRole) -> bool {
    actual == target
        || (target == ReplicaRole::Idle && actual == ReplicaRole::None)
}

/// Pure classification of an Open/Reopen request against the proxy's
/// current fields.
pub(crate) fn classify_open(
    fields: &FupFields,
    request: &ProxyRequest,
) -> Decision {
    let incoming = &request.local_replica;
    match fields.state {
        ProxyState::Closed => {
            if fields.replica.instance_id > 0
                && incoming.instance_id <= fields.replica.instance_id
            {
                // stale retry of an instance that already closed or failed
                Decision::Reply(ProxyErrorCode::ObjectClosed)
            } else {
                Decision::Execute(open_list_tag(request))
            }
        }
        ProxyState::Opening => Decision::Drop("open already in progress"),
        ProxyState::Opened => {
            if incoming.instance_id < fields.replica.instance_id {
                Decision::Drop("stale instance id")
            } else if incoming.instance_id > fields.replica.instance_id {
                Decision::Drop("instance ahead of opened replica")
            } else if open_satisfied(fields, request) {
                Decision::Reply(ProxyErrorCode::Success)
            } else {
                Decision::Execute(open_list_tag(request))
            }
        }
        ProxyState::Closing => Decision::Drop("close in progress"),
    }
}

/// Duplicate-open check: same instance with all requested roles already
/// achieved on both replicator and service.
fn open_satisfied(fields: &FupFields, request: &ProxyRequest) -> bool {
    if !request.service.is_stateful {
        return true;
    }
    let target = request.local_replica.current_role;
    role_achieved(fields.replicator_role, target)
        && role_achieved(fields.service_role, target)
}

fn open_list_tag(request: &ProxyRequest) -> ActionListTag {
    if !request.service.is_stateful {
        ActionListTag::StatelessServiceOpen
    } else if request.action == ProxyMessageAction::Reopen {
        ActionListTag::StatefulServiceReopen
    } else if request.local_replica.current_role == ReplicaRole::Primary {
        ActionListTag::StatefulServiceOpenPrimary
    } else {
        ActionListTag::StatefulServiceOpenIdle
    }
}

/// Pure classification of a Close request.
pub(crate) fn classify_close(
    fields: &FupFields,
    request: &ProxyRequest,
) -> Decision {
    if request.local_replica.instance_id < fields.replica.instance_id {
        return Decision::Drop("stale instance id");
    }
    match fields.state {
        // close of an already-closed record: ACK and tear it down
        ProxyState::Closed => Decision::Reply(ProxyErrorCode::Success),
        ProxyState::Closing => Decision::Drop("close already in progress"),
        ProxyState::Opening | ProxyState::Opened => {
            Decision::Execute(close_list_tag(fields, request))
        }
    }
}

fn close_list_tag(
    fields: &FupFields,
    request: &ProxyRequest,
) -> ActionListTag {
    if !fields.service.is_stateful {
        if request.flags.abort {
            ActionListTag::StatelessServiceAbort
        } else {
            ActionListTag::StatelessServiceClose
        }
    } else if request.flags.abort {
        ActionListTag::StatefulServiceAbort
    } else if request.flags.drop {
        ActionListTag::StatefulServiceDrop
    } else {
        ActionListTag::StatefulServiceClose
    }
}

impl ProxyContext {
    /// Handler of Open and Reopen requests.
    pub(crate) fn handle_open(ctx: &Arc<ProxyContext>, request: ProxyRequest) {
        let fup = ctx.registry.find_or_insert(request.failover_unit.id);
        let mut locked = fup.lock();
        if locked.is_deleted {
            return; // record is on its way out of the registry
        }

        match classify_open(&locked, &request) {
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
                if code == ProxyErrorCode::ObjectClosed {
                    // stale retry of a closed instance: tear the record down
                    ctx.remove_and_cleanup(fup.id());
                }
                let reply = ctx.build_reply(&request, code, None, Some(&fup));
                ctx.send_reply(reply);
            }
            Decision::ReplyDataLoss => {
                unreachable!("data loss never classifies for open")
            }
            Decision::Execute(tag) => {
                match locked.try_add_to_executing(tag, false) {
                    AdmissionOutcome::Admitted(cancel) => {
                        locked.merge_replica(&request.local_replica);
                        locked.service = request.service.clone();
                        locked.advance_epoch(&request.failover_unit);
                        locked.open_mode = if request.action
                            == ProxyMessageAction::Reopen
                        {
                            ReplicaOpenMode::Existing
                        } else {
                            ReplicaOpenMode::New
                        };
                        locked.state = ProxyState::Opening;
                        drop(locked);

                        let ctx = ctx.clone();
                        let fup = fup.clone();
                        tokio::spawn(async move {
                            Self::execute_open(ctx, fup, request, tag, cancel)
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
                        unreachable!("open never supersedes in-flight work")
                    }
                }
            }
        }
    }

    async fn execute_open(
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
                {
                    let mut locked = fup.lock();
                    locked.state = ProxyState::Opened;
                    locked.replica.state =
                        if request.action == ProxyMessageAction::Reopen {
                            ReplicaState::StandBy
                        } else {
                            ReplicaState::Ready
                        };
                }
                ctx.report_default_load(&fup);
                let reply = ctx.build_reply(
                    &request,
                    ProxyErrorCode::Success,
                    None,
                    Some(&fup),
                );
                ctx.send_reply(reply);
            }
            ProxyErrorCode::OperationCanceled => {
                // a superseding close is on its way; put down whatever got
                // half-created and leave the record addressable for it
                fup.abort(true);
            }
            code => {
                let standby =
                    fup.lock().replica.state == ReplicaState::StandBy;
                if standby || code.is_transient() {
                    // recoverable: the persisted replica awaits a reopen, a
                    // transient failure awaits RA's retry
                    fup.lock().state = ProxyState::Closed;
                } else if fup.try_mark_for_abort() {
                    fup.abort(true);
                    ctx.report_health(&fup, ReplicaHealthEvent::OpenFailed);
                    ctx.remove_and_cleanup(fup.id());
                }
                let reply = ctx.build_reply(&request, code, None, Some(&fup));
                ctx.send_reply(reply);
            }
        }
    }

    /// Handler of Close requests (graceful, drop, or abort flavors).
    pub(crate) fn handle_close(ctx: &Arc<ProxyContext>, request: ProxyRequest) {
        let fup = match ctx.registry.find(request.failover_unit.id) {
            Some(fup) => fup,
            None => {
                // already removed; ACK so RA converges
                let reply =
                    ProxyReply::for_request(&request, ProxyErrorCode::Success);
                ctx.send_reply(reply);
                return;
            }
        };
        let mut locked = fup.lock();
        if locked.is_deleted {
            return; // another close owns the removal
        }

        match classify_close(&locked, &request) {
            Decision::Drop(reason) => {
                pf_debug!(
                    "dropping close for fup {}: {}",
                    fup.id(),
                    reason
                );
            }
            Decision::Reply(code) => {
                drop(locked);
                ctx.remove_and_cleanup(fup.id());
                let reply = ctx.build_reply(&request, code, None, Some(&fup));
                ctx.send_reply(reply);
            }
            Decision::ReplyDataLoss => {
                unreachable!("data loss never classifies for close")
            }
            Decision::Execute(tag) => {
                let supersedes = request.flags.abort || request.flags.drop;
                match locked.try_add_to_executing(tag, supersedes) {
                    AdmissionOutcome::Admitted(cancel) => {
                        locked.merge_replica(&request.local_replica);
                        locked.state = ProxyState::Closing;
                        drop(locked);

                        let ctx = ctx.clone();
                        let fup = fup.clone();
                        tokio::spawn(async move {
                            Self::execute_close(ctx, fup, request, tag, cancel)
                                .await;
                        });
                    }
                    AdmissionOutcome::Rejected => {
                        pf_debug!(
                            "dropping close for fup {}: work in progress",
                            fup.id()
                        );
                    }
                    AdmissionOutcome::CancelNeeded => {
                        drop(locked);
                        pf_debug!(
                            "close supersedes in-flight work for fup {}",
                            fup.id()
                        );
                        // issued outside the lock; the canceled list still
                        // drives its own done bookkeeping, then RA's close
                        // retry gets admitted
                        fup.cancel_operations();
                    }
                }
            }
        }
    }

    async fn execute_close(
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
                {
                    let mut locked = fup.lock();
                    locked.state = ProxyState::Closed;
                    locked.replica.state = if request.flags.drop
                        || request.flags.abort
                        || !locked.service.has_persisted_state
                    {
                        ReplicaState::Dropped
                    } else {
                        ReplicaState::StandBy
                    };
                }
                if request.flags.abort {
                    ctx.report_health(&fup, ReplicaHealthEvent::Aborted);
                }
                let reply = ctx.build_reply(
                    &request,
                    ProxyErrorCode::Success,
                    None,
                    Some(&fup),
                );
                ctx.remove_and_cleanup(fup.id());
                ctx.send_reply(reply);
            }
            ProxyErrorCode::OperationCanceled => {
                // superseded by an abort-flavored close; leave the record
                // addressable for it
                fup.lock().state = ProxyState::Opened;
            }
            code => {
                // graceful close failed: force whatever remains down
                if fup.try_mark_for_abort() {
                    fup.abort(true);
                    ctx.report_health(&fup, ReplicaHealthEvent::CloseFailed);
                }
                fup.lock().state = ProxyState::Closed;
                let reply = ctx.build_reply(&request, code, None, Some(&fup));
                if request.flags.abort || request.flags.drop || !ctx.is_open()
                {
                    ctx.remove_and_cleanup(fup.id());
                }
                ctx.send_reply(reply);
            }
        }
    }
}
