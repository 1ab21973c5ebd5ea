//! DormantDatabase matching and construction
//!
//! When a database with a preserving termination policy is deleted, its spec
//! is parked in a DormantDatabase record. A later re-creation under the same
//! name must present an equivalent spec before the preserved storage is
//! attached to it; anything else is refused so stale data is never served
//! under a different configuration.

use crate::crd::{
    default_auth_secret_name, AppBinding, DormantDatabase, DormantDatabasePhase,
    DormantDatabaseSpec, InitSpec, KevaDatabase, KevaDatabaseSpec, KevaMode, Origin,
    ANNOTATION_INIT_SPEC, LABEL_DATABASE_KIND, LABEL_DATABASE_NAME,
};
use crate::ensure::patch_status_with_retry;
use crate::error::{OperatorError, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Normalize a spec for comparison purposes.
///
/// One-shot init directives are not expected to survive a pause, so they are
/// stripped. Fields the controller fills with defaults (the auth secret name,
/// the legacy standalone replica count) are filled the same way here so a
/// spec that omitted them still compares equal to one that spelled them out.
pub fn normalized(spec: &KevaDatabaseSpec, db_name: &str) -> KevaDatabaseSpec {
    let mut s = spec.clone();
    s.init = None;
    if s.auth_secret.is_none() {
        s.auth_secret = Some(default_auth_secret_name(db_name));
    }
    if s.mode == KevaMode::Standalone && s.replicas.is_none() {
        s.replicas = Some(1);
    }
    s
}

/// Decide whether an incoming database may resume the given dormant record.
///
/// Returns `DormantMismatch` when the normalized specs differ, when the
/// record was parked by a different resource kind, or when the incoming
/// init directives differ from the ones preserved on the record. The caller
/// surfaces this as a warning event and refuses to reconcile until the user
/// fixes the spec or removes the dormant record.
pub fn specs_match(incoming: &KevaDatabase, dormant: &DormantDatabase) -> Result<()> {
    let name = incoming.offshoot_name();

    let parked_kind = dormant
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_DATABASE_KIND));
    if parked_kind.map(String::as_str) != Some("KevaDatabase") {
        return Err(OperatorError::DormantMismatch(format!(
            "DormantDatabase '{}' was not parked from a KevaDatabase",
            name
        )));
    }

    let ours = normalized(&incoming.spec, &name);
    let theirs = normalized(&dormant.spec.origin.spec, &name);
    if ours != theirs {
        return Err(OperatorError::DormantMismatch(format!(
            "KevaDatabase '{}' does not match the spec preserved in its dormant record; \
             delete the DormantDatabase or restore the original spec",
            name
        )));
    }

    // init is stripped from the normalized compare, but a re-creation that
    // declares init must declare the same init the record was parked with
    if incoming.spec.init.is_some() {
        if let Some(parked_init) = preserved_init(dormant)? {
            if incoming.spec.init.as_ref() != Some(&parked_init) {
                return Err(OperatorError::DormantMismatch(format!(
                    "KevaDatabase '{}' declares init directives that differ from the ones \
                     preserved in its dormant record",
                    name
                )));
            }
        }
    }
    Ok(())
}

/// Init directives preserved on the dormant record, if the origin had any
pub fn preserved_init(dormant: &DormantDatabase) -> Result<Option<InitSpec>> {
    let Some(raw) = dormant
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_INIT_SPEC))
    else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_str(raw)?))
}

/// Build the dormant record parking a database that is being deleted.
///
/// The origin spec is stored with init stripped; the raw init directives are
/// tucked into an annotation so a resume can still report what the database
/// was originally seeded from.
pub fn build_dormant_database(db: &KevaDatabase) -> Result<DormantDatabase> {
    let name = db.offshoot_name();
    let namespace = db
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());

    let mut annotations = BTreeMap::new();
    if let Some(init) = &db.spec.init {
        annotations.insert(
            ANNOTATION_INIT_SPEC.to_string(),
            serde_json::to_string(init)?,
        );
    }

    let mut origin_spec = db.spec.clone();
    origin_spec.init = None;

    Ok(DormantDatabase {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(BTreeMap::from([(
                LABEL_DATABASE_KIND.to_string(),
                "KevaDatabase".to_string(),
            )])),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations)
            },
            ..Default::default()
        },
        spec: DormantDatabaseSpec {
            origin: Origin {
                name,
                namespace,
                labels: db.metadata.labels.clone().unwrap_or_default(),
                annotations: db.metadata.annotations.clone().unwrap_or_default(),
                spec: origin_spec,
            },
            resume: false,
            wipe_out: false,
        },
        status: None,
    })
}

/// Run the DormantDatabase controller until shutdown.
///
/// Dormant records are inert until a user either re-creates the database
/// (handled by the database controller) or sets `spec.wipeOut`, which
/// destroys the preserved storage, credentials and binding.
pub async fn run(client: Client, namespace: Option<&str>) -> Result<()> {
    let dormants: Api<DormantDatabase> = match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    Controller::new(dormants, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(client))
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(object = %obj, "reconciled dormant record"),
                Err(e) => warn!(error = %e, "dormant reconciliation error"),
            }
        })
        .await;
    Ok(())
}

async fn reconcile(dormant: Arc<DormantDatabase>, client: Arc<Client>) -> Result<Action> {
    let phase = dormant.status.as_ref().and_then(|s| s.phase);
    if !dormant.spec.wipe_out || dormant.spec.resume || phase == Some(DormantDatabasePhase::WipedOut)
    {
        return Ok(Action::await_change());
    }

    let name = dormant.name_any();
    let namespace = dormant.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<DormantDatabase> = Api::namespaced((*client).clone(), &namespace);

    patch_status_with_retry(&api, &name, |_| {
        serde_json::json!({
            "phase": DormantDatabasePhase::WipingOut,
            "lastUpdated": chrono::Utc::now().to_rfc3339(),
        })
    })
    .await?;

    wipe_preserved_objects(&client, &namespace, &dormant.spec.origin).await?;
    info!(dormant = %name, "wiped out preserved objects");

    patch_status_with_retry(&api, &name, |_| {
        serde_json::json!({
            "phase": DormantDatabasePhase::WipedOut,
            "lastUpdated": chrono::Utc::now().to_rfc3339(),
        })
    })
    .await?;
    Ok(Action::await_change())
}

/// Delete the label-selected PVCs and secrets the termination engine kept,
/// plus the AppBinding. User-supplied secrets never carry our labels and
/// are left alone.
async fn wipe_preserved_objects(client: &Client, namespace: &str, origin: &Origin) -> Result<()> {
    let selector = format!("{}={}", LABEL_DATABASE_NAME, origin.name);
    let params = ListParams::default().labels(&selector);

    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    pvcs.delete_collection(&DeleteParams::default(), &params)
        .await?;

    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets
        .delete_collection(&DeleteParams::default(), &params)
        .await?;

    let bindings: Api<AppBinding> = Api::namespaced(client.clone(), namespace);
    match bindings.delete(&origin.name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn error_policy(dormant: Arc<DormantDatabase>, err: &OperatorError, _client: Arc<Client>) -> Action {
    warn!(dormant = %dormant.name_any(), error = %err, "dormant reconcile failed");
    Action::requeue(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{StorageSpec, TerminationPolicy};

    fn sample_database(name: &str) -> KevaDatabase {
        KevaDatabase {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: KevaDatabaseSpec {
                mode: KevaMode::Standalone,
                cluster: None,
                replicas: None,
                version: "4.0".to_string(),
                storage: Some(StorageSpec::default()),
                termination_policy: TerminationPolicy::Halt,
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
    fn identical_specs_match() {
        let db = sample_database("mydb");
        let dormant = build_dormant_database(&db).unwrap();
        assert!(specs_match(&db, &dormant).is_ok());
    }

    #[test]
    fn init_differences_are_ignored() {
        let mut db = sample_database("mydb");
        db.spec.init = Some(InitSpec {
            script_path: Some("/seed.sh".to_string()),
            snapshot_name: None,
        });
        let dormant = build_dormant_database(&db).unwrap();

        let mut recreated = sample_database("mydb");
        recreated.spec.init = None;
        assert!(specs_match(&recreated, &dormant).is_ok());
    }

    #[test]
    fn differing_init_directives_are_a_mismatch() {
        let mut db = sample_database("mydb");
        db.spec.init = Some(InitSpec {
            script_path: Some("/seed-a.sh".to_string()),
            snapshot_name: None,
        });
        let dormant = build_dormant_database(&db).unwrap();

        let mut recreated = sample_database("mydb");
        recreated.spec.init = Some(InitSpec {
            script_path: Some("/seed-b.sh".to_string()),
            snapshot_name: None,
        });
        let err = specs_match(&recreated, &dormant).unwrap_err();
        assert!(matches!(err, OperatorError::DormantMismatch(_)));
    }

    #[test]
    fn identical_init_directives_match() {
        let init = InitSpec {
            script_path: Some("/seed.sh".to_string()),
            snapshot_name: None,
        };
        let mut db = sample_database("mydb");
        db.spec.init = Some(init.clone());
        let dormant = build_dormant_database(&db).unwrap();

        let mut recreated = sample_database("mydb");
        recreated.spec.init = Some(init);
        assert!(specs_match(&recreated, &dormant).is_ok());
    }

    #[test]
    fn record_parked_by_another_kind_is_refused() {
        let db = sample_database("mydb");
        let mut dormant = build_dormant_database(&db).unwrap();
        dormant
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(LABEL_DATABASE_KIND.to_string(), "OtherDatabase".to_string());
        let err = specs_match(&db, &dormant).unwrap_err();
        assert!(matches!(err, OperatorError::DormantMismatch(_)));
    }

    #[test]
    fn defaulted_auth_secret_matches_explicit() {
        let mut db = sample_database("mydb");
        db.spec.auth_secret = Some("mydb-auth".to_string());
        let dormant = build_dormant_database(&db).unwrap();

        let recreated = sample_database("mydb");
        assert!(recreated.spec.auth_secret.is_none());
        assert!(specs_match(&recreated, &dormant).is_ok());
    }

    #[test]
    fn version_change_is_a_mismatch() {
        let db = sample_database("mydb");
        let dormant = build_dormant_database(&db).unwrap();

        let mut recreated = sample_database("mydb");
        recreated.spec.version = "5.0".to_string();
        let err = specs_match(&recreated, &dormant).unwrap_err();
        assert!(matches!(err, OperatorError::DormantMismatch(_)));
        assert!(err.is_user_error());
    }

    #[test]
    fn storage_change_is_a_mismatch() {
        let db = sample_database("mydb");
        let dormant = build_dormant_database(&db).unwrap();

        let mut recreated = sample_database("mydb");
        recreated.spec.storage = Some(StorageSpec {
            size: "50Gi".to_string(),
            ..Default::default()
        });
        assert!(specs_match(&recreated, &dormant).is_err());
    }

    #[test]
    fn init_spec_preserved_in_annotation() {
        let mut db = sample_database("mydb");
        db.spec.init = Some(InitSpec {
            script_path: None,
            snapshot_name: Some("nightly-42".to_string()),
        });
        let dormant = build_dormant_database(&db).unwrap();

        assert!(dormant.spec.origin.spec.init.is_none());
        let init = preserved_init(&dormant).unwrap().unwrap();
        assert_eq!(init.snapshot_name.as_deref(), Some("nightly-42"));
    }

    #[test]
    fn no_init_means_no_annotation() {
        let db = sample_database("mydb");
        let dormant = build_dormant_database(&db).unwrap();
        assert!(dormant.metadata.annotations.is_none());
        assert!(preserved_init(&dormant).unwrap().is_none());
    }
}
