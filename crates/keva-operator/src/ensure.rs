//! Idempotent resource application
//!
//! One code path covers create, update and no-op for every offshoot kind.
//! Desired objects carry a hash of their generating inputs in an annotation;
//! when the live object's hash matches, the ensurer performs zero writes.
//! Existing objects that are not labeled as ours are never adopted or
//! overwritten.

use crate::crd::{ANNOTATION_SPEC_HASH, LABEL_DATABASE_NAME, MANAGED_BY};
use crate::error::{OperatorError, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use tracing::{debug, info};

/// Field manager name used for all server-side apply patches
pub const FIELD_MANAGER: &str = "keva-operator";

/// Maximum optimistic-concurrency attempts for status writes
const STATUS_RETRY_ATTEMPTS: u32 = 5;

/// What the ensurer did to bring an offshoot to the desired state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbType {
    /// Object did not exist and was created
    Created,
    /// Object existed and was patched
    Patched,
    /// Object already matched; no write was performed
    Unchanged,
}

/// Hash of the desired object's serialized form, stamped into the spec-hash
/// annotation so a later reconcile can skip the write entirely
pub fn desired_hash<T: Serialize>(desired: &T) -> Result<String> {
    let bytes = serde_json::to_vec(desired)?;
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    Ok(format!("{:x}", hasher.finish()))
}

/// Check that an existing object was created by this operator for this
/// database. Anything else is a naming conflict the user must resolve;
/// foreign objects are never adopted.
pub fn verify_ownership(
    kind: &str,
    name: &str,
    meta: &ObjectMeta,
    database_name: &str,
) -> Result<()> {
    let labels = meta.labels.as_ref();
    let managed = labels
        .and_then(|l| l.get("app.kubernetes.io/managed-by"))
        .is_some_and(|v| v == MANAGED_BY);
    let owned = labels
        .and_then(|l| l.get(LABEL_DATABASE_NAME))
        .is_some_and(|v| v == database_name);
    if managed && owned {
        Ok(())
    } else {
        Err(OperatorError::NamingConflict {
            kind: kind.to_string(),
            name: name.to_string(),
        })
    }
}

fn live_hash(meta: &ObjectMeta) -> Option<&String> {
    meta.annotations.as_ref()?.get(ANNOTATION_SPEC_HASH)
}

/// Apply a desired object, returning what had to change.
///
/// The hash annotation is computed over the desired object before the
/// annotation itself is attached, so the check is stable across reconciles.
pub async fn ensure<K>(api: &Api<K>, database_name: &str, mut desired: K) -> Result<VerbType>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let kind = K::kind(&()).to_string();
    let name = desired.name_any();

    let hash = desired_hash(&desired)?;
    desired
        .meta_mut()
        .annotations
        .get_or_insert_with(Default::default)
        .insert(ANNOTATION_SPEC_HASH.to_string(), hash.clone());

    let params = PatchParams::apply(FIELD_MANAGER).force();
    match api.get_opt(&name).await? {
        None => {
            api.patch(&name, &params, &Patch::Apply(&desired)).await?;
            info!(kind, name, "created");
            Ok(VerbType::Created)
        }
        Some(existing) => {
            verify_ownership(&kind, &name, existing.meta(), database_name)?;
            if live_hash(existing.meta()) == Some(&hash) {
                debug!(kind, name, "unchanged");
                return Ok(VerbType::Unchanged);
            }
            api.patch(&name, &params, &Patch::Apply(&desired)).await?;
            info!(kind, name, "patched");
            Ok(VerbType::Patched)
        }
    }
}

/// Patch an object's status subresource with bounded retry on write
/// conflicts. The transform runs against a freshly fetched object each
/// attempt so the merge is computed from current state.
pub async fn patch_status_with_retry<K, F>(api: &Api<K>, name: &str, transform: F) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
    F: Fn(&K) -> serde_json::Value,
{
    let mut last_message = String::new();
    for attempt in 1..=STATUS_RETRY_ATTEMPTS {
        let current = api.get(name).await?;
        let patch = serde_json::json!({ "status": transform(&current) });
        match api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(updated) => return Ok(updated),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(name, attempt, "status write conflict, retrying");
                last_message = ae.message;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(OperatorError::WriteConflict {
        attempts: STATUS_RETRY_ATTEMPTS,
        message: last_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn owned_meta(db: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(db.to_string()),
            labels: Some(BTreeMap::from([
                (
                    "app.kubernetes.io/managed-by".to_string(),
                    MANAGED_BY.to_string(),
                ),
                (LABEL_DATABASE_NAME.to_string(), db.to_string()),
            ])),
            ..Default::default()
        }
    }

    #[test]
    fn hash_is_deterministic() {
        let a = serde_json::json!({"replicas": 3, "image": "keva:4.0"});
        let b = serde_json::json!({"replicas": 3, "image": "keva:4.0"});
        assert_eq!(desired_hash(&a).unwrap(), desired_hash(&b).unwrap());
    }

    #[test]
    fn hash_changes_with_content() {
        let a = serde_json::json!({"replicas": 3});
        let b = serde_json::json!({"replicas": 4});
        assert_ne!(desired_hash(&a).unwrap(), desired_hash(&b).unwrap());
    }

    #[test]
    fn ownership_accepts_our_objects() {
        let meta = owned_meta("mydb");
        assert!(verify_ownership("Service", "mydb", &meta, "mydb").is_ok());
    }

    #[test]
    fn ownership_rejects_unlabeled_objects() {
        let meta = ObjectMeta {
            name: Some("mydb".to_string()),
            ..Default::default()
        };
        let err = verify_ownership("StatefulSet", "mydb", &meta, "mydb").unwrap_err();
        assert!(matches!(err, OperatorError::NamingConflict { .. }));
    }

    #[test]
    fn ownership_rejects_other_databases_objects() {
        let meta = owned_meta("otherdb");
        let err = verify_ownership("Service", "mydb", &meta, "mydb").unwrap_err();
        assert!(matches!(err, OperatorError::NamingConflict { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn live_hash_reads_annotation() {
        let mut meta = owned_meta("mydb");
        assert!(live_hash(&meta).is_none());
        meta.annotations = Some(BTreeMap::from([(
            ANNOTATION_SPEC_HASH.to_string(),
            "abc123".to_string(),
        )]));
        assert_eq!(live_hash(&meta), Some(&"abc123".to_string()));
    }
}
