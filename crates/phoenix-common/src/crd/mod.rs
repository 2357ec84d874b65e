//! Typed control-plane resources read and written during recovery

mod cluster_operator;
mod condition;
mod machine;
mod machine_config_pool;
mod static_pod_operator;

pub use cluster_operator::{
    ClusterOperator, ClusterOperatorSpec, ClusterOperatorStatus, OperandVersion, RelatedObject,
    OPERATOR_VERSION_NAME,
};
pub use condition::{
    condition_status, find_condition, is_condition_false, is_condition_true, Condition,
    ConditionStatus, CONDITION_AVAILABLE, CONDITION_DEGRADED,
    CONDITION_NODE_INSTALLER_PROGRESSING, CONDITION_PROGRESSING, CONDITION_UPDATED,
    CONDITION_UPDATING, REASON_ALL_NODES_AT_LATEST_REVISION,
};
pub use machine::{
    parse_machine_reference, Machine, MachineSpec, MachineStatus, MACHINE_ANNOTATION,
    MACHINE_NAMESPACE, MACHINE_PHASE_RUNNING,
};
pub use machine_config_pool::{
    MachineConfigPool, MachineConfigPoolSpec, MachineConfigPoolStatus, CONTROL_PLANE_POOL,
};
pub use static_pod_operator::{
    NodeStatus, Operand, StaticPodOperatorStatus, FORCE_REDEPLOYMENT_FIELD,
    OPERATOR_API_VERSION, OPERATOR_OBJECT_NAME,
};
