//! Audit event catalog for operation lifecycles.
//!
//! Codes follow the `G000NI`/`G000NE` convention and are keyed by operation
//! type and terminal status. The catalog is opaque to the FSM core; events
//! are emitted through the operator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ops::{Operation, OperationType};

pub const OPERATION_STARTED: &str = "operation.started";
pub const OPERATION_COMPLETED: &str = "operation.completed";
pub const OPERATION_FAILED: &str = "operation.failed";

pub const SEVERITY_INFO: &str = "info";
pub const SEVERITY_ERROR: &str = "error";

/// A catalog entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuditCode {
    pub name: &'static str,
    pub code: &'static str,
    pub severity: &'static str,
}

/// Emitted when a cluster installation starts.
pub const OPERATION_INSTALL_START: AuditCode = AuditCode {
    name: OPERATION_STARTED,
    code: "G0001I",
    severity: SEVERITY_INFO,
};

/// Emitted when a cluster installation successfully completes.
pub const OPERATION_INSTALL_COMPLETE: AuditCode = AuditCode {
    name: OPERATION_COMPLETED,
    code: "G0002I",
    severity: SEVERITY_INFO,
};

/// Emitted when a cluster installation fails.
pub const OPERATION_INSTALL_FAILURE: AuditCode = AuditCode {
    name: OPERATION_FAILED,
    code: "G0003E",
    severity: SEVERITY_ERROR,
};

/// Emitted when a new node starts joining the cluster.
pub const OPERATION_EXPAND_START: AuditCode = AuditCode {
    name: OPERATION_STARTED,
    code: "G0004I",
    severity: SEVERITY_INFO,
};

/// Emitted when a node has successfully joined the cluster.
pub const OPERATION_EXPAND_COMPLETE: AuditCode = AuditCode {
    name: OPERATION_COMPLETED,
    code: "G0005I",
    severity: SEVERITY_INFO,
};

/// Emitted when a node fails to join the cluster.
pub const OPERATION_EXPAND_FAILURE: AuditCode = AuditCode {
    name: OPERATION_FAILED,
    code: "G0006E",
    severity: SEVERITY_ERROR,
};

/// Catalog entry for an operation start.
pub fn start_event(op_type: OperationType) -> &'static AuditCode {
    match op_type {
        OperationType::Install => &OPERATION_INSTALL_START,
        OperationType::Expand => &OPERATION_EXPAND_START,
    }
}

/// Catalog entry for an operation's terminal status.
pub fn terminal_event(op_type: OperationType, success: bool) -> &'static AuditCode {
    match (op_type, success) {
        (OperationType::Install, true) => &OPERATION_INSTALL_COMPLETE,
        (OperationType::Install, false) => &OPERATION_INSTALL_FAILURE,
        (OperationType::Expand, true) => &OPERATION_EXPAND_COMPLETE,
        (OperationType::Expand, false) => &OPERATION_EXPAND_FAILURE,
    }
}

/// A concrete audit event as persisted in the cluster audit log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub code: String,
    pub name: String,
    pub severity: String,
    /// Operation id
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub cluster: String,
    pub user: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub time: DateTime<Utc>,
}

/// Builds an audit event for the given operation.
pub fn for_operation(operation: &Operation, code: &AuditCode) -> AuditEvent {
    let server = operation.servers.first();
    AuditEvent {
        code: code.code.to_string(),
        name: code.name.to_string(),
        severity: code.severity.to_string(),
        id: operation.id.clone(),
        op_type: operation.op_type,
        cluster: operation.cluster_domain.clone(),
        user: operation.created_by.clone(),
        ip: server.map(|s| s.advertise_ip.clone()),
        hostname: server.map(|s| s.hostname.clone()),
        role: server.map(|s| s.role.clone()),
        time: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lookup() {
        assert_eq!(start_event(OperationType::Install).code, "G0001I");
        assert_eq!(terminal_event(OperationType::Install, true).code, "G0002I");
        assert_eq!(terminal_event(OperationType::Install, false).code, "G0003E");
        assert_eq!(start_event(OperationType::Expand).code, "G0004I");
        assert_eq!(terminal_event(OperationType::Expand, true).code, "G0005I");
        assert_eq!(terminal_event(OperationType::Expand, false).code, "G0006E");
    }

    #[test]
    fn test_failure_events_are_errors() {
        assert_eq!(
            terminal_event(OperationType::Expand, false).severity,
            SEVERITY_ERROR
        );
        assert_eq!(terminal_event(OperationType::Expand, false).name, OPERATION_FAILED);
    }
}
