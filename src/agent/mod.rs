//! The reconfiguration agent proxy: single entry point for all inbound
//! requests from RA, demultiplexing by message action, guarding staleness
//! and duplication, and routing to action-list execution.

mod configure;
mod lifecycle;
mod messages;
mod queries;
mod replication;

pub use messages::{
    DeployedReplicaDetail, MessageFlags, ProxyMessageAction, ProxyNotification,
    ProxyReply, ProxyRequest, ReplyBody,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::proxy::{
    ActionListTag, FailoverUnitId, FailoverUnitProxy, HealthReportSink,
    LoadMetric, LoadReportSink, LocalFailoverUnitProxyMap, ProxyErrorCode,
    RaMessageSink, ReplicaHealthEvent, ServiceHost,
};
use crate::utils::{RapError, Timer, ME};

use futures::future::join_all;

use rand::prelude::*;

use serde::Deserialize;

use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Capacity of the inbound request channel.
    pub request_channel_cap: usize,

    /// Timeout budget in millisecs applied to messages that carry none.
    pub default_timeout_ms: u64,

    /// Min interval of the unacknowledged-notification resend sweep in
    /// millisecs.
    pub notify_retry_min_ms: u64,
    /// Max interval of the unacknowledged-notification resend sweep in
    /// millisecs.
    pub notify_retry_max_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            request_channel_cap: 4096,
            default_timeout_ms: 30_000,
            notify_retry_min_ms: 500,
            notify_retry_max_ms: 1500,
        }
    }
}

/// Classification of one inbound message computed under the proxy's lock.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Silent drop; RA retries or has moved on.
    Drop(&'static str),

    /// Immediate reply with the given code, no action list executed.
    Reply(ProxyErrorCode),

    /// Immediate data-loss reply carrying the last acknowledged LSN.
    ReplyDataLoss,

    /// Admit and execute the given action list.
    Execute(ActionListTag),
}

/// Process-scoped dependencies shared by the dispatcher and its spawned
/// completions.
pub(crate) struct ProxyContext {
    pub(crate) config: ProxyConfig,
    pub(crate) registry: LocalFailoverUnitProxyMap,
    pub(crate) host: Arc<dyn ServiceHost>,
    pub(crate) ra_sink: Arc<dyn RaMessageSink>,
    pub(crate) load_sink: Arc<dyn LoadReportSink>,
    pub(crate) health_sink: Arc<dyn HealthReportSink>,

    /// Flipped off at close; messages observed afterwards are dropped.
    pub(crate) open: AtomicBool,
}

impl ProxyContext {
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Deadline budget for one message, derived from its overall timeout.
    pub(crate) fn deadline_for(&self, request: &ProxyRequest) -> Instant {
        let ms = if request.timeout_ms > 0 {
            request.timeout_ms
        } else {
            self.config.default_timeout_ms
        };
        Instant::now() + Duration::from_millis(ms)
    }

    /// Builds a reply from the original request's shape, augmented with the
    /// proxy-known service location, replication endpoint, and LSN.
    pub(crate) fn build_reply(
        &self,
        request: &ProxyRequest,
        error: ProxyErrorCode,
        body: Option<ReplyBody>,
        fup: Option<&Arc<FailoverUnitProxy>>,
    ) -> ProxyReply {
        let mut reply = ProxyReply::for_request(request, error);
        if let Some(fup) = fup {
            let locked = fup.lock();
            reply.local_replica.service_location =
                locked.replica.service_location.clone();
            reply.local_replica.replication_endpoint =
                locked.replica.replication_endpoint.clone();
            reply.local_replica.last_acknowledged_lsn =
                locked.replica.last_acknowledged_lsn;
        }
        reply.body = body;
        reply
    }

    pub(crate) fn send_reply(&self, reply: ProxyReply) {
        if !self.ra_sink.send_message_to_ra(reply) {
            pf_warn!("reply dropped: message sink not accepting");
        }
    }

    /// Removes a proxy from the registry and performs the paired cleanup.
    /// The registry removal gates cleanup so it happens exactly once.
    pub(crate) fn remove_and_cleanup(&self, id: FailoverUnitId) -> bool {
        match self.registry.remove(id) {
            Some(fup) => {
                fup.cleanup();
                true
            }
            None => false,
        }
    }

    /// Reports the replica's default load metrics after an open or role
    /// change. Fire-and-forget.
    pub(crate) fn report_default_load(&self, fup: &FailoverUnitProxy) {
        let (name, stateful, role) = {
            let locked = fup.lock();
            (
                locked.service.name.clone(),
                locked.service.is_stateful,
                locked.service_role,
            )
        };
        let metrics = [LoadMetric {
            name: "replica-count".into(),
            value: 1,
        }];
        if !self
            .load_sink
            .report_load(fup.id(), &name, stateful, role, &metrics)
        {
            pf_trace!("load report dropped for fup {}", fup.id());
        }
    }

    pub(crate) fn report_health(
        &self,
        fup: &FailoverUnitProxy,
        event: ReplicaHealthEvent,
    ) {
        let replica_id = fup.lock().replica.replica_id;
        if !self
            .health_sink
            .report_replica_health(fup.id(), replica_id, event)
        {
            pf_trace!("health report dropped for fup {}", fup.id());
        }
    }

    /// Sends one proxy-originated notification towards RA.
    pub(crate) fn send_notification(
        &self,
        fup: &FailoverUnitProxy,
        kind: ProxyNotification,
    ) {
        let (failover_unit, local_replica) = {
            let locked = fup.lock();
            (locked.failover_unit.clone(), locked.replica.clone())
        };
        let action = match kind {
            ProxyNotification::ReplicaEndpointUpdated => {
                ProxyMessageAction::ReplicaEndpointUpdatedReply
            }
            ProxyNotification::ReadWriteStatusRevoked => {
                ProxyMessageAction::ReadWriteStatusRevokedReply
            }
        };
        let notification = ProxyReply {
            action,
            failover_unit,
            local_replica,
            remote_replicas: vec![],
            flags: MessageFlags::default(),
            error: ProxyErrorCode::Success,
            body: None,
            notification: Some(kind),
        };
        if !self.ra_sink.send_message_to_ra(notification) {
            pf_trace!("notification dropped for fup {}", fup.id());
        }
    }
}

/// The reconfiguration agent proxy shell driving the dispatcher event loop.
pub struct ReconfigurationAgentProxy {
    pub(crate) ctx: Arc<ProxyContext>,

    /// Receiver side of the inbound request channel.
    rx_request: mpsc::Receiver<ProxyRequest>,

    /// Timer for the unacknowledged-notification resend sweep.
    notify_timer: Timer,
}

impl ReconfigurationAgentProxy {
    /// Creates the proxy shell and the inbound request channel's sender
    /// handle for the transport layer to feed.
    pub fn new_and_setup(
        config_str: Option<&str>,
        host: Arc<dyn ServiceHost>,
        ra_sink: Arc<dyn RaMessageSink>,
        load_sink: Arc<dyn LoadReportSink>,
        health_sink: Arc<dyn HealthReportSink>,
    ) -> Result<(Self, mpsc::Sender<ProxyRequest>), RapError> {
        let _ = ME.set("rap".into());

        let config = parsed_config!(config_str => ProxyConfig;
                                    request_channel_cap, default_timeout_ms,
                                    notify_retry_min_ms, notify_retry_max_ms)?;
        if config.request_channel_cap == 0 {
            return logged_err!(
                "invalid config.request_channel_cap '{}'",
                config.request_channel_cap
            );
        }
        if config.default_timeout_ms == 0 {
            return logged_err!(
                "invalid config.default_timeout_ms '{}'",
                config.default_timeout_ms
            );
        }
        if config.notify_retry_min_ms == 0
            || config.notify_retry_max_ms < config.notify_retry_min_ms
        {
            return logged_err!(
                "invalid notification retry range {}..={}",
                config.notify_retry_min_ms,
                config.notify_retry_max_ms
            );
        }

        let (tx_request, rx_request) = mpsc::channel(config.request_channel_cap);
        let ctx = Arc::new(ProxyContext {
            config,
            registry: LocalFailoverUnitProxyMap::new(),
            host,
            ra_sink,
            load_sink,
            health_sink,
            open: AtomicBool::new(true),
        });

        Ok((
            ReconfigurationAgentProxy {
                ctx,
                rx_request,
                notify_timer: Timer::new(),
            },
            tx_request,
        ))
    }

    /// Main event loop logic of running this proxy.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), RapError> {
        self.kickoff_notify_timer()?;

        loop {
            tokio::select! {
                // inbound request from RA
                request = self.rx_request.recv() => {
                    match request {
                        Some(request) => self.handle_request(request),
                        None => {
                            pf_warn!("request channel closed");
                            self.close().await;
                            return Ok(());
                        }
                    }
                },

                // unacknowledged-notification resend sweep
                _ = self.notify_timer.timeout() => {
                    self.resend_pending_notifications();
                    self.kickoff_notify_timer()?;
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("proxy caught termination signal");
                    self.close().await;
                    return Ok(());
                }
            }
        }
    }

    /// Demultiplexes one inbound request to its per-action handler. The
    /// handler classifies and admits under the proxy's lock and spawns the
    /// action list execution asynchronously.
    pub(crate) fn handle_request(&self, request: ProxyRequest) {
        if !self.ctx.is_open() {
            pf_debug!("dropping {:?}: proxy not open", request.action);
            return;
        }
        pf_trace!(
            "request {:?} for fup {}",
            request.action,
            request.failover_unit.id
        );

        match request.action {
            ProxyMessageAction::Open | ProxyMessageAction::Reopen => {
                ProxyContext::handle_open(&self.ctx, request)
            }
            ProxyMessageAction::Close => {
                ProxyContext::handle_close(&self.ctx, request)
            }
            ProxyMessageAction::UpdateConfiguration => {
                ProxyContext::handle_update_configuration(&self.ctx, request)
            }
            ProxyMessageAction::BuildIdleReplica
            | ProxyMessageAction::RemoveIdleReplica => {
                ProxyContext::handle_idle_replica(&self.ctx, request)
            }
            ProxyMessageAction::GetStatus
            | ProxyMessageAction::UpdateEpochAndGetStatus => {
                ProxyContext::handle_get_status(&self.ctx, request)
            }
            ProxyMessageAction::CancelCatchup => {
                ProxyContext::handle_cancel_catchup(&self.ctx, request)
            }
            ProxyMessageAction::Query => {
                ProxyContext::handle_query(&self.ctx, request)
            }
            ProxyMessageAction::UpdateServiceDescription => {
                ProxyContext::handle_update_service_description(
                    &self.ctx, request,
                )
            }
            ProxyMessageAction::ReplicaEndpointUpdatedReply
            | ProxyMessageAction::ReadWriteStatusRevokedReply => {
                ProxyContext::handle_notification_reply(&self.ctx, request)
            }
        }
    }

    /// Resends notifications RA has not acknowledged yet.
    fn resend_pending_notifications(&self) {
        for fup in self.ctx.registry.snapshot() {
            let (endpoint, write_status) = {
                let locked = fup.lock();
                if locked.is_deleted {
                    continue;
                }
                (
                    locked.endpoint_update_pending,
                    locked.write_status_revoked_pending,
                )
            };
            if endpoint {
                self.ctx.send_notification(
                    &fup,
                    ProxyNotification::ReplicaEndpointUpdated,
                );
            }
            if write_status {
                self.ctx.send_notification(
                    &fup,
                    ProxyNotification::ReadWriteStatusRevoked,
                );
            }
        }
    }

    /// Chooses a random interval from the configured range and kicks off
    /// the notification resend timer.
    fn kickoff_notify_timer(&mut self) -> Result<(), RapError> {
        let ms = thread_rng().gen_range(
            self.ctx.config.notify_retry_min_ms
                ..=self.ctx.config.notify_retry_max_ms,
        );
        self.notify_timer.kickoff(Duration::from_millis(ms))
    }

    /// Flips the proxy closed and drains every live failover unit proxy:
    /// cancel in-flight work, abort owned resources, clean up.
    pub async fn close(&mut self) {
        if !self.ctx.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let drained = self.ctx.registry.privatize();
        pf_info!("closing proxy, draining {} fups", drained.len());

        let handles: Vec<_> = drained
            .into_values()
            .map(|fup| {
                tokio::spawn(async move {
                    fup.cancel_operations();
                    fup.abort(true);
                    fup.cleanup();
                })
            })
            .collect();
        for joined in join_all(handles).await {
            if let Err(e) = joined {
                pf_error!("error draining fup: {}", e);
            }
        }
    }
}

/// Bare dispatcher context over mock ports, for handler-level tests that
/// drive `ProxyContext` directly without the run loop.
#[cfg(test)]
pub(crate) fn test_context() -> (
    Arc<ProxyContext>,
    Arc<crate::proxy::mock::MockHost>,
    mpsc::UnboundedReceiver<ProxyReply>,
) {
    let host = crate::proxy::mock::MockHost::new();
    let (sink, rx_reply) = crate::proxy::mock::ChannelSink::new();
    let sinks = Arc::new(crate::proxy::mock::CountingSinks::default());
    let ctx = Arc::new(ProxyContext {
        config: ProxyConfig::default(),
        registry: LocalFailoverUnitProxyMap::new(),
        host: host.clone(),
        ra_sink: sink,
        load_sink: sinks.clone(),
        health_sink: sinks,
        open: AtomicBool::new(true),
    });
    (ctx, host, rx_reply)
}
