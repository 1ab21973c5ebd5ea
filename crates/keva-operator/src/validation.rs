//! Topology and policy validation
//!
//! Pure decision functions checking a KevaDatabase spec for structural
//! consistency before it is admitted. No I/O happens here; the admission
//! layer fetches the version catalog and storage-class names and passes
//! them in. Failures are structured rejections, never panics.

use crate::crd::{AgentType, KevaDatabase, KevaDatabaseSpec, KevaMode, TerminationPolicy};
use validator::Validate;

/// A structured admission rejection with a human-readable reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    /// Dotted path of the offending field (e.g. "spec.cluster.master")
    pub field: String,
    /// Why the value was rejected
    pub reason: String,
}

impl ValidationFailure {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Result of a validation pass
pub type ValidationResult = std::result::Result<(), ValidationFailure>;

/// A catalog entry the validator resolves versions against
#[derive(Debug, Clone)]
pub struct CatalogVersion {
    pub name: String,
    pub deprecated: bool,
}

/// Validate a candidate database spec for admission.
///
/// `versions` is the installed KevaVersion catalog; `storage_classes` the
/// cluster's StorageClass names. Checks run in a fixed order and the first
/// failure wins.
pub fn validate_database(
    db: &KevaDatabase,
    versions: &[CatalogVersion],
    storage_classes: &[String],
) -> ValidationResult {
    let spec = &db.spec;

    // field-level constraints first (quantities, name formats, port ranges)
    if let Err(e) = spec.validate() {
        return Err(ValidationFailure::new("spec", e.to_string()));
    }

    if spec.version.is_empty() {
        return Err(ValidationFailure::new("spec.version", "version is missing"));
    }
    match versions.iter().find(|v| v.name == spec.version) {
        None => {
            return Err(ValidationFailure::new(
                "spec.version",
                format!("version '{}' not found in catalog", spec.version),
            ))
        }
        Some(v) if v.deprecated => {
            return Err(ValidationFailure::new(
                "spec.version",
                format!("version '{}' is deprecated and cannot be used", spec.version),
            ))
        }
        Some(_) => {}
    }

    if let Some(storage) = &spec.storage {
        if let Some(class) = &storage.storage_class_name {
            if !storage_classes.iter().any(|c| c == class) {
                return Err(ValidationFailure::new(
                    "spec.storage.storageClassName",
                    format!("storage class '{}' not found", class),
                ));
            }
        }
    }

    validate_topology(spec)?;

    if let Some(monitor) = &spec.monitor {
        if monitor.agent == AgentType::PrometheusOperator && monitor.exporter.is_none() {
            return Err(ValidationFailure::new(
                "spec.monitor.exporter",
                "agent prometheus.io/operator requires an exporter port",
            ));
        }
    }

    Ok(())
}

/// Validate the mode/topology block alone
fn validate_topology(spec: &KevaDatabaseSpec) -> ValidationResult {
    match spec.mode {
        KevaMode::Standalone => {
            if spec.cluster.is_some() {
                return Err(ValidationFailure::new(
                    "spec.cluster",
                    "cluster topology must not be set in Standalone mode",
                ));
            }
            if let Some(replicas) = spec.replicas {
                if replicas != 1 {
                    return Err(ValidationFailure::new(
                        "spec.replicas",
                        format!("standalone replicas must be 1, got {}", replicas),
                    ));
                }
            }
        }
        KevaMode::Cluster => {
            let Some(cluster) = &spec.cluster else {
                return Err(ValidationFailure::new(
                    "spec.cluster",
                    "cluster topology is required in Cluster mode",
                ));
            };
            if cluster.master < 3 {
                return Err(ValidationFailure::new(
                    "spec.cluster.master",
                    format!("cluster needs at least 3 masters, got {}", cluster.master),
                ));
            }
            if cluster.replicas < 1 {
                return Err(ValidationFailure::new(
                    "spec.cluster.replicas",
                    format!(
                        "cluster needs at least 1 replica per master, got {}",
                        cluster.replicas
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// Validate an update against the previously persisted spec.
///
/// `version` is immutable once set; every other field may change.
pub fn validate_update(new: &KevaDatabaseSpec, old: &KevaDatabaseSpec) -> ValidationResult {
    if new.version != old.version {
        return Err(ValidationFailure::new(
            "spec.version",
            format!(
                "version is immutable: cannot change '{}' to '{}'",
                old.version, new.version
            ),
        ));
    }
    Ok(())
}

/// Validate a delete request against the live object.
///
/// Rejected unconditionally, regardless of requester, while the policy is
/// DoNotTerminate (or the legacy doNotPause lock is set).
pub fn validate_delete(db: &KevaDatabase) -> ValidationResult {
    if db.spec.termination_policy == TerminationPolicy::DoNotTerminate {
        return Err(ValidationFailure::new(
            "spec.terminationPolicy",
            "database cannot be deleted while terminationPolicy is DoNotTerminate",
        ));
    }
    if db.spec.do_not_pause {
        return Err(ValidationFailure::new(
            "spec.doNotPause",
            "database is locked; unset spec.doNotPause to delete",
        ));
    }
    Ok(())
}
