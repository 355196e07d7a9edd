//! Scripted port doubles for exercising the executor and dispatcher in
//! tests. Each double records its calls and can be told to fail, block, or
//! shape its results per primitive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::agent::ProxyReply;
use crate::proxy::descript::{
    Epoch, FailoverUnitId, ProxyErrorCode, ReplicaDescription, ReplicaId,
    ReplicaOpenMode, ReplicaRole, ServiceDescription,
};
use crate::proxy::ports::{
    CatchupMode, CatchupOutcome, HealthReportSink, LoadMetric, LoadReportSink,
    RaMessageSink, ReplicaHealthEvent, ReplicatorPort, ReplicatorQueryInfo,
    ReplicatorStatus, ServiceHost, StatefulServicePort, StatelessServicePort,
};

use async_trait::async_trait;

use tokio::sync::{mpsc, watch};

/// A gate a test can close to keep a scripted call suspended until released.
#[derive(Clone)]
pub(crate) struct Gate {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Gate {
    /// Creates an open gate.
    pub(crate) fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Gate {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub(crate) fn close(&self) {
        let _ = self.tx.send(true);
    }

    pub(crate) fn open(&self) {
        let _ = self.tx.send(false);
    }

    /// Suspends while the gate is closed.
    pub(crate) async fn pass(&self) {
        let mut rx = self.rx.clone();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Shared scripting state for one mock double.
#[derive(Default)]
struct Script {
    calls: Vec<String>,
    fail_on: HashMap<String, ProxyErrorCode>,
}

#[derive(Clone, Default)]
pub(crate) struct ScriptHandle {
    inner: Arc<Mutex<Script>>,
}

impl ScriptHandle {
    fn record(&self, call: &str) -> Result<(), ProxyErrorCode> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(call.to_string());
        match inner.fail_on.get(call) {
            Some(code) => Err(*code),
            None => Ok(()),
        }
    }

    pub(crate) fn fail_on(&self, call: &str, code: ProxyErrorCode) {
        self.inner
            .lock()
            .unwrap()
            .fail_on
            .insert(call.to_string(), code);
    }

    pub(crate) fn count(&self, call: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == call)
            .count()
    }
}

pub(crate) struct MockReplicator {
    pub(crate) script: ScriptHandle,
    pub(crate) gate: Gate,
    pub(crate) endpoint: String,
    pub(crate) status: Mutex<ReplicatorStatus>,
    pub(crate) catchup_outcome: Mutex<CatchupOutcome>,
}

impl MockReplicator {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MockReplicator {
            script: ScriptHandle::default(),
            gate: Gate::new(),
            endpoint: "mock://replicator".into(),
            status: Mutex::new(ReplicatorStatus {
                first_lsn: 1,
                last_lsn: 42,
            }),
            catchup_outcome: Mutex::new(CatchupOutcome::Completed),
        })
    }

    async fn call(&self, name: &str) -> Result<(), ProxyErrorCode> {
        self.gate.pass().await;
        self.script.record(name)
    }
}

#[async_trait]
impl ReplicatorPort for MockReplicator {
    async fn open(&self) -> Result<String, ProxyErrorCode> {
        self.call("open").await?;
        Ok(self.endpoint.clone())
    }

    async fn close(&self) -> Result<(), ProxyErrorCode> {
        self.call("close").await
    }

    fn abort(&self) {
        let _ = self.script.record("abort");
    }

    async fn change_role(
        &self,
        _epoch: Epoch,
        role: ReplicaRole,
    ) -> Result<(), ProxyErrorCode> {
        self.call(&format!("change_role:{:?}", role)).await
    }

    async fn update_epoch(&self, _epoch: Epoch) -> Result<(), ProxyErrorCode> {
        self.call("update_epoch").await
    }

    async fn update_catchup_configuration(
        &self,
        _current: &[ReplicaDescription],
        _previous: &[ReplicaDescription],
    ) -> Result<(), ProxyErrorCode> {
        self.call("update_catchup_configuration").await
    }

    async fn update_current_configuration(
        &self,
        _current: &[ReplicaDescription],
    ) -> Result<(), ProxyErrorCode> {
        self.call("update_current_configuration").await
    }

    async fn catchup_replica_set(
        &self,
        mode: CatchupMode,
    ) -> Result<CatchupOutcome, ProxyErrorCode> {
        self.call(&format!("catchup_replica_set:{:?}", mode)).await?;
        Ok(*self.catchup_outcome.lock().unwrap())
    }

    async fn cancel_catchup(&self) -> Result<(), ProxyErrorCode> {
        self.call("cancel_catchup").await
    }

    async fn build_idle_replica(
        &self,
        idle: &ReplicaDescription,
    ) -> Result<(), ProxyErrorCode> {
        self.call(&format!("build_idle_replica:{}", idle.replica_id))
            .await
    }

    async fn remove_idle_replica(
        &self,
        replica_id: ReplicaId,
    ) -> Result<(), ProxyErrorCode> {
        self.call(&format!("remove_idle_replica:{}", replica_id))
            .await
    }

    async fn get_status(&self) -> Result<ReplicatorStatus, ProxyErrorCode> {
        self.call("get_status").await?;
        Ok(*self.status.lock().unwrap())
    }

    async fn get_query(&self) -> Result<ReplicatorQueryInfo, ProxyErrorCode> {
        self.call("get_query").await?;
        Ok(ReplicatorQueryInfo {
            status: *self.status.lock().unwrap(),
            queue_length: 3,
            write_status_granted: true,
        })
    }
}

pub(crate) struct MockStatefulService {
    pub(crate) script: ScriptHandle,
    pub(crate) gate: Gate,
    pub(crate) location: Mutex<String>,
}

impl MockStatefulService {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MockStatefulService {
            script: ScriptHandle::default(),
            gate: Gate::new(),
            location: Mutex::new("mock://service".into()),
        })
    }

    pub(crate) fn set_location(&self, location: &str) {
        *self.location.lock().unwrap() = location.to_string();
    }

    async fn call(&self, name: &str) -> Result<(), ProxyErrorCode> {
        self.gate.pass().await;
        self.script.record(name)
    }
}

#[async_trait]
impl StatefulServicePort for MockStatefulService {
    async fn open(
        &self,
        mode: ReplicaOpenMode,
    ) -> Result<String, ProxyErrorCode> {
        self.call(&format!("open:{:?}", mode)).await?;
        Ok(self.location.lock().unwrap().clone())
    }

    async fn change_role(
        &self,
        role: ReplicaRole,
    ) -> Result<String, ProxyErrorCode> {
        self.call(&format!("change_role:{:?}", role)).await?;
        Ok(self.location.lock().unwrap().clone())
    }

    async fn close(&self) -> Result<(), ProxyErrorCode> {
        self.call("close").await
    }

    fn abort(&self) {
        let _ = self.script.record("abort");
    }

    async fn update_description(
        &self,
        _service: &ServiceDescription,
    ) -> Result<(), ProxyErrorCode> {
        self.call("update_description").await
    }
}

pub(crate) struct MockStatelessService {
    pub(crate) script: ScriptHandle,
    pub(crate) gate: Gate,
    pub(crate) location: Mutex<String>,
}

impl MockStatelessService {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MockStatelessService {
            script: ScriptHandle::default(),
            gate: Gate::new(),
            location: Mutex::new("mock://instance".into()),
        })
    }

    async fn call(&self, name: &str) -> Result<(), ProxyErrorCode> {
        self.gate.pass().await;
        self.script.record(name)
    }
}

#[async_trait]
impl StatelessServicePort for MockStatelessService {
    async fn open(&self) -> Result<String, ProxyErrorCode> {
        self.call("open").await?;
        Ok(self.location.lock().unwrap().clone())
    }

    async fn close(&self) -> Result<(), ProxyErrorCode> {
        self.call("close").await
    }

    fn abort(&self) {
        let _ = self.script.record("abort");
    }
}

/// Host double handing out pre-built port doubles so tests keep handles to
/// the same scripted instances.
pub(crate) struct MockHost {
    pub(crate) script: ScriptHandle,
    pub(crate) service: Arc<MockStatefulService>,
    pub(crate) replicator: Arc<MockReplicator>,
    pub(crate) stateless: Arc<MockStatelessService>,
}

impl MockHost {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MockHost {
            script: ScriptHandle::default(),
            service: MockStatefulService::new(),
            replicator: MockReplicator::new(),
            stateless: MockStatelessService::new(),
        })
    }
}

#[async_trait]
impl ServiceHost for MockHost {
    async fn create_stateful(
        &self,
        _service: &ServiceDescription,
        _replica: &ReplicaDescription,
    ) -> Result<
        (Arc<dyn StatefulServicePort>, Arc<dyn ReplicatorPort>),
        ProxyErrorCode,
    > {
        self.script.record("create_stateful")?;
        Ok((self.service.clone(), self.replicator.clone()))
    }

    async fn create_stateless(
        &self,
        _service: &ServiceDescription,
        _replica: &ReplicaDescription,
    ) -> Result<Arc<dyn StatelessServicePort>, ProxyErrorCode> {
        self.script.record("create_stateless")?;
        Ok(self.stateless.clone())
    }
}

/// Reply sink pushing into an unbounded channel so tests can await replies.
pub(crate) struct ChannelSink {
    tx: mpsc::UnboundedSender<ProxyReply>,
}

impl ChannelSink {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ProxyReply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink { tx }), rx)
    }
}

impl RaMessageSink for ChannelSink {
    fn send_message_to_ra(&self, reply: ProxyReply) -> bool {
        self.tx.send(reply).is_ok()
    }
}

/// Counting load/health sinks.
#[derive(Default)]
pub(crate) struct CountingSinks {
    pub(crate) loads: Mutex<Vec<(FailoverUnitId, ReplicaRole)>>,
    pub(crate) healths: Mutex<Vec<(FailoverUnitId, ReplicaHealthEvent)>>,
}

impl LoadReportSink for CountingSinks {
    fn report_load(
        &self,
        failover_unit: FailoverUnitId,
        _service_name: &str,
        _is_stateful: bool,
        role: ReplicaRole,
        _metrics: &[LoadMetric],
    ) -> bool {
        self.loads.lock().unwrap().push((failover_unit, role));
        true
    }
}

impl HealthReportSink for CountingSinks {
    fn report_replica_health(
        &self,
        failover_unit: FailoverUnitId,
        _replica_id: ReplicaId,
        event: ReplicaHealthEvent,
    ) -> bool {
        self.healths.lock().unwrap().push((failover_unit, event));
        true
    }
}
