//! Kubernetes Event recording
//!
//! Wraps `kube::runtime::events::Recorder` so reconcilers can attach
//! user-actionable warnings and lifecycle notices to KevaDatabase objects,
//! visible via `kubectl describe`. Publishing is fire-and-forget: a failed
//! event never breaks reconciliation.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Well-known event reason strings, shown under REASON in `kubectl get events`
pub mod reasons {
    /// Spec failed topology or policy validation
    pub const INVALID: &str = "Invalid";
    /// Kubernetes objects are being created
    pub const CREATING: &str = "Creating";
    /// Offshoot created or patched successfully
    pub const SUCCESSFUL: &str = "Successful";
    /// Offshoot creation failed
    pub const FAILED_TO_CREATE: &str = "FailedToCreate";
    /// Status or offshoot update failed
    pub const FAILED_TO_UPDATE: &str = "FailedToUpdate";
    /// Offshoot deletion failed
    pub const FAILED_TO_DELETE: &str = "FailedToDelete";
    /// Database is being halted
    pub const HALTING: &str = "Halting";
    /// Halt was requested with an incompatible termination policy
    pub const FAILED_TO_HALT: &str = "FailedToHalt";
    /// Database is being parked into a DormantDatabase
    pub const PAUSING: &str = "Pausing";
    /// Re-creation did not match the parked origin spec
    pub const DORMANT_MISMATCH: &str = "DormantDatabaseMismatch";
    /// Monitoring agent wiring changed or failed (best effort)
    pub const MONITOR: &str = "MonitoringAgent";
    /// One-shot initialization completed
    pub const INITIALIZED: &str = "SuccessfulInitialize";
}

/// Event publisher bound to one controller identity
pub struct EventRecorder {
    recorder: Recorder,
}

impl EventRecorder {
    /// Create a recorder reporting as the given controller name
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    /// Publish a Normal event on the given object
    pub async fn normal(&self, obj_ref: &ObjectReference, reason: &str, note: impl Into<String>) {
        self.publish(obj_ref, EventType::Normal, reason, note.into())
            .await;
    }

    /// Publish a Warning event on the given object
    pub async fn warning(&self, obj_ref: &ObjectReference, reason: &str, note: impl Into<String>) {
        self.publish(obj_ref, EventType::Warning, reason, note.into())
            .await;
    }

    async fn publish(&self, obj_ref: &ObjectReference, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, obj_ref).await {
            warn!(reason, error = %e, "failed to publish Kubernetes event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::INVALID, "Invalid");
        assert_eq!(reasons::FAILED_TO_CREATE, "FailedToCreate");
        assert_eq!(reasons::DORMANT_MISMATCH, "DormantDatabaseMismatch");
    }
}
