//! Core proxy-side structures: descriptors, ports, the failover unit proxy
//! state machine, the action-list catalog and executor, and the process-wide
//! proxy registry.

mod actions;
mod descript;
mod executor;
mod fup;
mod ports;
mod registry;

#[cfg(test)]
pub(crate) mod mock;

pub use actions::{ActionListTag, ProxyAction};
pub use descript::{
    Epoch, FailoverUnitDescription, FailoverUnitId, InstanceId, Lsn,
    ProxyErrorCode, ReplicaDescription, ReplicaId, ReplicaOpenMode,
    ReplicaRole, ReplicaState, ServiceDescription,
};
pub use fup::{
    AdmissionOutcome, CatchupResult, ConfigurationStage, FailoverUnitProxy,
    FupFields, LockedFailoverUnitProxy, ProxyState,
};
pub use ports::{
    CatchupMode, CatchupOutcome, HealthReportSink, LoadMetric, LoadReportSink,
    RaMessageSink, ReplicaHealthEvent, ReplicatorPort, ReplicatorQueryInfo,
    ReplicatorStatus, ServiceHost, StatefulServicePort, StatelessServicePort,
};
pub use registry::LocalFailoverUnitProxyMap;

pub(crate) use executor::{ActionListExecutor, ExecutionContext, ExecutionOutcome};
