//! Termination policy engine
//!
//! Decides, per termination policy, what happens to the storage, credentials
//! and connection binding a deleted database leaves behind. Kubernetes
//! garbage collection does the actual deleting: dependents that must die with
//! the database get an owner reference pointing at it, dependents that must
//! survive get that reference removed before the database object goes away.

use crate::crd::{
    AppBinding, DormantDatabase, DormantDatabasePhase, KevaDatabase, TerminationPolicy,
};
use crate::dormant::build_dormant_database;
use crate::ensure::patch_status_with_retry;
use crate::error::{OperatorError, Result};
use crate::validation::validate_delete;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, info};

/// Whether dependents of a kind are bound to or detached from the database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerRefAction {
    /// Attach an owner reference so garbage collection deletes the object
    Bind,
    /// Strip our owner reference so the object survives deletion
    Release,
}

/// Resolved consequences of deleting a database under a given policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPlan {
    /// What to do with persistent volume claims
    pub storage: OwnerRefAction,
    /// What to do with credential secrets
    pub credentials: OwnerRefAction,
    /// Whether to park a DormantDatabase preserving the origin spec
    pub park_dormant: bool,
    /// Whether to delete the AppBinding explicitly
    pub delete_app_binding: bool,
}

/// Policy table. `DoNotTerminate` has no plan: deletion of such a database
/// is refused at admission and never reaches the executor.
pub fn plan_for(policy: TerminationPolicy) -> Option<TerminationPlan> {
    match policy {
        TerminationPolicy::DoNotTerminate => None,
        TerminationPolicy::Halt | TerminationPolicy::Pause => Some(TerminationPlan {
            storage: OwnerRefAction::Release,
            credentials: OwnerRefAction::Release,
            park_dormant: true,
            delete_app_binding: false,
        }),
        TerminationPolicy::Delete => Some(TerminationPlan {
            storage: OwnerRefAction::Bind,
            credentials: OwnerRefAction::Release,
            park_dormant: false,
            delete_app_binding: false,
        }),
        TerminationPolicy::WipeOut => Some(TerminationPlan {
            storage: OwnerRefAction::Bind,
            credentials: OwnerRefAction::Bind,
            park_dormant: false,
            delete_app_binding: true,
        }),
    }
}

/// Deletion guard mirroring the admission check; a failure here is a user
/// error that keeps the finalizer in place instead of retrying.
fn ensure_deletable(db: &KevaDatabase) -> Result<()> {
    validate_delete(db).map_err(|f| OperatorError::InvalidSpec(f.to_string()))
}

/// Owner reference pointing at the database, as stamped on dependents
pub fn database_owner_reference(db: &KevaDatabase) -> OwnerReference {
    OwnerReference {
        api_version: "keva.dev/v1alpha1".to_string(),
        kind: "KevaDatabase".to_string(),
        name: db.offshoot_name(),
        uid: db.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Add the reference if no reference with the same UID is present
pub fn upsert_owner_ref(refs: &mut Vec<OwnerReference>, owner: &OwnerReference) -> bool {
    if refs.iter().any(|r| r.uid == owner.uid) {
        return false;
    }
    refs.push(owner.clone());
    true
}

/// Remove any reference with the owner's UID
pub fn remove_owner_ref(refs: &mut Vec<OwnerReference>, owner: &OwnerReference) -> bool {
    let before = refs.len();
    refs.retain(|r| r.uid != owner.uid);
    refs.len() != before
}

/// Executes termination plans against the cluster
pub struct TerminationExecutor {
    client: Client,
}

impl TerminationExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Carry out the plan for this database's policy. Called from the
    /// finalizer cleanup path, before the database object itself is released.
    ///
    /// The deletion guard runs again here even though the webhook enforces
    /// it too: the operator can run with the webhook disabled, and a locked
    /// database must keep its finalizer rather than complete the delete.
    pub async fn execute(&self, db: &KevaDatabase) -> Result<()> {
        ensure_deletable(db)?;
        let Some(plan) = plan_for(db.spec.termination_policy) else {
            // unreachable past the guard; refuse rather than release
            return Err(OperatorError::InvalidSpec(
                "deletion refused by termination policy".to_string(),
            ));
        };
        let namespace = db
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let owner = database_owner_reference(db);
        let selector = db.offshoot_selector_string();

        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        self.apply_owner_ref_action(&pvcs, &selector, plan.storage, &owner)
            .await?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        self.apply_owner_ref_action(&secrets, &selector, plan.credentials, &owner)
            .await?;

        if plan.park_dormant {
            self.park_dormant(db, &namespace).await?;
        }
        if plan.delete_app_binding {
            let bindings: Api<AppBinding> = Api::namespaced(self.client.clone(), &namespace);
            match bindings
                .delete(&db.offshoot_name(), &Default::default())
                .await
            {
                Ok(_) => info!(db = %db.offshoot_name(), "deleted app binding"),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn apply_owner_ref_action<K>(
        &self,
        api: &Api<K>,
        selector: &str,
        action: OwnerRefAction,
        owner: &OwnerReference,
    ) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
    {
        let kind = K::kind(&()).to_string();
        let list = api.list(&ListParams::default().labels(selector)).await?;
        for obj in list.items {
            let name = obj.name_any();
            let mut refs = obj.meta().owner_references.clone().unwrap_or_default();
            let changed = match action {
                OwnerRefAction::Bind => upsert_owner_ref(&mut refs, owner),
                OwnerRefAction::Release => remove_owner_ref(&mut refs, owner),
            };
            if !changed {
                continue;
            }
            let patch = serde_json::json!({
                "metadata": { "ownerReferences": refs }
            });
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            info!(kind, name, ?action, "adjusted owner reference");
        }
        Ok(())
    }

    /// Create the dormant record; an existing one is left untouched since a
    /// repeated cleanup must not overwrite the first snapshot.
    async fn park_dormant(&self, db: &KevaDatabase, namespace: &str) -> Result<()> {
        let dormant = build_dormant_database(db)?;
        let api: Api<DormantDatabase> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), &dormant).await {
            Ok(_) => {
                info!(db = %db.offshoot_name(), "parked dormant database");
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(db = %db.offshoot_name(), "dormant database already parked");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        patch_status_with_retry(&api, &db.offshoot_name(), |_| {
            serde_json::json!({
                "phase": DormantDatabasePhase::Paused,
                "lastUpdated": chrono::Utc::now().to_rfc3339(),
            })
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{KevaDatabaseSpec, KevaMode, StorageSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn sample_database(policy: TerminationPolicy) -> KevaDatabase {
        KevaDatabase {
            metadata: ObjectMeta {
                name: Some("mydb".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: KevaDatabaseSpec {
                mode: KevaMode::Standalone,
                cluster: None,
                replicas: None,
                version: "4.0".to_string(),
                storage: Some(StorageSpec::default()),
                termination_policy: policy,
                halted: false,
                do_not_pause: false,
                monitor: None,
                auth_secret: None,
                init: None,
                resources: None,
                node_selector: BTreeMap::new(),
                pod_annotations: BTreeMap::new(),
            },
            status: None,
        }
    }

    #[test]
    fn do_not_terminate_has_no_plan() {
        assert!(plan_for(TerminationPolicy::DoNotTerminate).is_none());
    }

    #[test]
    fn locked_database_refuses_termination_with_user_error() {
        let db = sample_database(TerminationPolicy::DoNotTerminate);
        let err = ensure_deletable(&db).unwrap_err();
        assert!(err.is_user_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn legacy_lock_refuses_termination() {
        let mut db = sample_database(TerminationPolicy::Halt);
        db.spec.do_not_pause = true;
        assert!(ensure_deletable(&db).is_err());
    }

    #[test]
    fn unlocked_database_may_terminate() {
        let db = sample_database(TerminationPolicy::Halt);
        assert!(ensure_deletable(&db).is_ok());
        let db = sample_database(TerminationPolicy::WipeOut);
        assert!(ensure_deletable(&db).is_ok());
    }

    #[test]
    fn halt_releases_everything_and_parks() {
        let plan = plan_for(TerminationPolicy::Halt).unwrap();
        assert_eq!(plan.storage, OwnerRefAction::Release);
        assert_eq!(plan.credentials, OwnerRefAction::Release);
        assert!(plan.park_dormant);
        assert!(!plan.delete_app_binding);
    }

    #[test]
    fn pause_is_a_synonym_of_halt() {
        assert_eq!(
            plan_for(TerminationPolicy::Pause),
            plan_for(TerminationPolicy::Halt)
        );
    }

    #[test]
    fn delete_cascades_storage_but_keeps_credentials() {
        let plan = plan_for(TerminationPolicy::Delete).unwrap();
        assert_eq!(plan.storage, OwnerRefAction::Bind);
        assert_eq!(plan.credentials, OwnerRefAction::Release);
        assert!(!plan.park_dormant);
    }

    #[test]
    fn wipe_out_cascades_everything() {
        let plan = plan_for(TerminationPolicy::WipeOut).unwrap();
        assert_eq!(plan.storage, OwnerRefAction::Bind);
        assert_eq!(plan.credentials, OwnerRefAction::Bind);
        assert!(!plan.park_dormant);
        assert!(plan.delete_app_binding);
    }

    fn owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "keva.dev/v1alpha1".to_string(),
            kind: "KevaDatabase".to_string(),
            name: "mydb".to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn upsert_is_idempotent_by_uid() {
        let mut refs = Vec::new();
        assert!(upsert_owner_ref(&mut refs, &owner("u1")));
        assert!(!upsert_owner_ref(&mut refs, &owner("u1")));
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn remove_only_strips_matching_uid() {
        let mut refs = vec![owner("u1"), owner("u2")];
        assert!(remove_owner_ref(&mut refs, &owner("u1")));
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, "u2");
        assert!(!remove_owner_ref(&mut refs, &owner("u1")));
    }
}
