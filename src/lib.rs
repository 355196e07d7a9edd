//! Reconfiguration agent proxy (RAP) core library.
//!
//! The proxy sits between a node's reconfiguration agent (RA) and the hosted
//! service replica, its replicator, and the service host. It receives replica
//! lifecycle requests over an in-process channel, serializes them per failover
//! unit through admission control, drives multi-step action lists against the
//! replicator and service ports, and reports outcomes back to RA under strict
//! staleness and idempotency rules.

#[macro_use]
pub mod utils;

pub mod proxy;

pub mod agent;

pub use crate::utils::{logger_init, RapError, ME};

pub use crate::proxy::{
    CatchupMode, CatchupOutcome, CatchupResult, ConfigurationStage, Epoch,
    FailoverUnitDescription, FailoverUnitId, FailoverUnitProxy,
    HealthReportSink, LoadMetric, LoadReportSink, LocalFailoverUnitProxyMap,
    ProxyErrorCode, ProxyState, RaMessageSink, ReplicaDescription,
    ReplicaOpenMode, ReplicaRole, ReplicaState, ReplicatorPort,
    ReplicatorQueryInfo, ReplicatorStatus, ServiceDescription, ServiceHost,
    StatefulServicePort, StatelessServicePort,
};

pub use crate::agent::{
    DeployedReplicaDetail, MessageFlags, ProxyConfig, ProxyMessageAction,
    ProxyNotification, ProxyReply, ProxyRequest, ReconfigurationAgentProxy,
    ReplyBody,
};
