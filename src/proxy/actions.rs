//! Catalog of named action lists: ordered sequences of primitive replicator/
//! service operations executed to realize one lifecycle transition.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Primitive action against the replicator or the service host ports.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ProxyAction {
    OpenStatelessInstance,
    CloseStatelessInstance,
    AbortStatelessInstance,

    OpenReplica,
    ChangeServiceRole,
    CloseReplica,
    AbortReplica,
    UpdateServiceDescription,

    OpenReplicator,
    ChangeReplicatorRole,
    CloseReplicator,
    AbortReplicator,

    ReplicatorUpdateEpoch,
    ReplicatorUpdateCatchupConfiguration,
    ReplicatorUpdateCurrentConfiguration,
    ReplicatorCatchupReplicaSet,
    ReplicatorCancelCatchup,
    ReplicatorBuildIdleReplica,
    ReplicatorRemoveIdleReplica,
    ReplicatorGetStatus,
    ReplicatorGetQuery,
}

/// Scenario tag naming one action list in the catalog.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize,
)]
pub enum ActionListTag {
    Empty,

    StatelessServiceOpen,
    StatelessServiceClose,
    StatelessServiceAbort,

    StatefulServiceOpenIdle,
    StatefulServiceOpenPrimary,
    StatefulServiceReopen,
    StatefulServicePromoteToPrimary,
    StatefulServiceDemoteToSecondary,
    StatefulServiceChangeRole,
    StatefulServiceEndRoleChange,
    ReplicatorEndRoleChange,
    StatefulServiceClose,
    StatefulServiceDrop,
    StatefulServiceAbort,

    ReplicatorBuildIdleReplica,
    ReplicatorRemoveIdleReplica,
    ReplicatorGetStatus,
    ReplicatorUpdateEpochAndGetStatus,
    ReplicatorUpdateReplicas,
    ReplicatorUpdateAndCatchupQuorum,
    CancelCatchupReplicaSet,

    UpdateServiceDescription,
    ReplicatorGetQuery,
}

impl ActionListTag {
    /// The ordered primitive actions this scenario executes.
    pub fn actions(self) -> &'static [ProxyAction] {
        use ProxyAction::*;
        match self {
            ActionListTag::Empty => &[],

            ActionListTag::StatelessServiceOpen => &[OpenStatelessInstance],
            ActionListTag::StatelessServiceClose => &[CloseStatelessInstance],
            ActionListTag::StatelessServiceAbort => &[AbortStatelessInstance],

            ActionListTag::StatefulServiceOpenIdle => {
                &[OpenReplica, OpenReplicator]
            }
            ActionListTag::StatefulServiceOpenPrimary => &[
                OpenReplica,
                OpenReplicator,
                ChangeReplicatorRole,
                ChangeServiceRole,
            ],
            ActionListTag::StatefulServiceReopen => {
                &[OpenReplica, OpenReplicator]
            }
            ActionListTag::StatefulServicePromoteToPrimary => &[
                ChangeReplicatorRole,
                ReplicatorUpdateCurrentConfiguration,
                ChangeServiceRole,
            ],
            // leaving Primary: the service gives up write status before the
            // replicator demotes
            ActionListTag::StatefulServiceDemoteToSecondary => {
                &[ChangeServiceRole, ChangeReplicatorRole]
            }
            ActionListTag::StatefulServiceChangeRole => {
                &[ChangeReplicatorRole, ChangeServiceRole]
            }
            ActionListTag::StatefulServiceEndRoleChange => &[ChangeServiceRole],
            ActionListTag::ReplicatorEndRoleChange => &[ChangeReplicatorRole],
            ActionListTag::StatefulServiceClose => {
                &[CloseReplicator, CloseReplica]
            }
            ActionListTag::StatefulServiceDrop => {
                &[ChangeServiceRole, CloseReplicator, CloseReplica]
            }
            ActionListTag::StatefulServiceAbort => {
                &[AbortReplicator, AbortReplica]
            }

            ActionListTag::ReplicatorBuildIdleReplica => {
                &[ReplicatorBuildIdleReplica]
            }
            ActionListTag::ReplicatorRemoveIdleReplica => {
                &[ReplicatorRemoveIdleReplica]
            }
            ActionListTag::ReplicatorGetStatus => &[ReplicatorGetStatus],
            ActionListTag::ReplicatorUpdateEpochAndGetStatus => {
                &[ReplicatorUpdateEpoch, ReplicatorGetStatus]
            }
            ActionListTag::ReplicatorUpdateReplicas => {
                &[ReplicatorUpdateCurrentConfiguration]
            }
            ActionListTag::ReplicatorUpdateAndCatchupQuorum => &[
                ReplicatorUpdateCatchupConfiguration,
                ReplicatorCatchupReplicaSet,
            ],
            ActionListTag::CancelCatchupReplicaSet => {
                &[ReplicatorCancelCatchup]
            }

            ActionListTag::UpdateServiceDescription => {
                &[UpdateServiceDescription]
            }
            ActionListTag::ReplicatorGetQuery => &[ReplicatorGetQuery],
        }
    }

    /// Abort-style lists keep running later cleanup actions even if an
    /// earlier one failed.
    pub fn continue_on_failure(self) -> bool {
        matches!(
            self,
            ActionListTag::StatelessServiceAbort
                | ActionListTag::StatefulServiceAbort
        )
    }

    /// Whether executing this list can take availability away from the
    /// replica (role changes, closes, catchup). Recorded at admission.
    pub fn impacts_availability(self) -> bool {
        !matches!(
            self,
            ActionListTag::Empty
                | ActionListTag::ReplicatorGetStatus
                | ActionListTag::ReplicatorGetQuery
                | ActionListTag::ReplicatorBuildIdleReplica
                | ActionListTag::ReplicatorRemoveIdleReplica
                | ActionListTag::UpdateServiceDescription
                | ActionListTag::ReplicatorUpdateReplicas
        )
    }

    /// Whether this list is a catchup scenario; used by the merged-admission
    /// compatibility rules.
    pub fn is_catchup(self) -> bool {
        self == ActionListTag::ReplicatorUpdateAndCatchupQuorum
    }
}

impl fmt::Display for ActionListTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_primary_orders_replicator_first() {
        let actions = ActionListTag::StatefulServiceOpenPrimary.actions();
        let repl_role = actions
            .iter()
            .position(|a| *a == ProxyAction::ChangeReplicatorRole)
            .unwrap();
        let svc_role = actions
            .iter()
            .position(|a| *a == ProxyAction::ChangeServiceRole)
            .unwrap();
        assert!(repl_role < svc_role);
    }

    #[test]
    fn demote_orders_service_first() {
        let actions = ActionListTag::StatefulServiceDemoteToSecondary.actions();
        assert_eq!(
            actions,
            &[
                ProxyAction::ChangeServiceRole,
                ProxyAction::ChangeReplicatorRole
            ]
        );
    }

    #[test]
    fn only_abort_lists_continue_on_failure() {
        assert!(ActionListTag::StatefulServiceAbort.continue_on_failure());
        assert!(ActionListTag::StatelessServiceAbort.continue_on_failure());
        assert!(!ActionListTag::StatefulServiceClose.continue_on_failure());
        assert!(!ActionListTag::StatefulServiceOpenIdle.continue_on_failure());
    }

    #[test]
    fn queries_do_not_impact_availability() {
        assert!(!ActionListTag::ReplicatorGetStatus.impacts_availability());
        assert!(!ActionListTag::ReplicatorGetQuery.impacts_availability());
        assert!(ActionListTag::StatefulServiceClose.impacts_availability());
        assert!(ActionListTag::ReplicatorUpdateAndCatchupQuorum
            .impacts_availability());
    }

    #[test]
    fn catchup_list_contains_catchup_action() {
        assert!(ActionListTag::ReplicatorUpdateAndCatchupQuorum
            .actions()
            .contains(&ProxyAction::ReplicatorCatchupReplicaSet));
        assert!(ActionListTag::ReplicatorUpdateAndCatchupQuorum.is_catchup());
        assert!(!ActionListTag::ReplicatorUpdateReplicas.is_catchup());
    }
}
