//! Validating admission webhook
//!
//! Serves `POST /validate` for KevaDatabase AdmissionReview requests.
//! Create and update requests are checked against the version catalog, the
//! installed storage classes and the topology rules; delete requests are
//! refused while the termination policy forbids them. Admission runs before
//! anything is persisted, so a rejected object never reaches the controller.

use crate::crd::{KevaDatabase, KevaVersion};
use crate::validation::{
    validate_database, validate_delete, validate_update, CatalogVersion,
};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::ListParams;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use kube::{Api, Client, ResourceExt};
use tracing::{info, warn};

/// Shared state for the webhook router
#[derive(Clone)]
pub struct WebhookState {
    client: Client,
}

/// Build the admission router
pub fn router(client: Client) -> Router {
    Router::new()
        .route("/validate", post(validate_handler))
        .with_state(WebhookState { client })
}

async fn validate_handler(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<KevaDatabase>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<KevaDatabase> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "malformed admission review");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let mut resp = AdmissionResponse::from(&req);
    let verdict = decide(&state, &req).await;
    if let Err(reason) = verdict {
        info!(
            operation = ?req.operation,
            name = req.name,
            namespace = req.namespace.as_deref().unwrap_or(""),
            reason,
            "admission denied"
        );
        resp = resp.deny(reason);
    }
    Json(resp.into_review())
}

async fn decide(state: &WebhookState, req: &AdmissionRequest<KevaDatabase>) -> Result<(), String> {
    match req.operation {
        Operation::Create => {
            let db = req.object.as_ref().ok_or("missing object in request")?;
            let (versions, classes) = fetch_cluster_context(&state.client).await?;
            validate_database(db, &versions, &classes).map_err(|f| f.to_string())
        }
        Operation::Update => {
            let db = req.object.as_ref().ok_or("missing object in request")?;
            if let Some(old) = req.old_object.as_ref() {
                validate_update(&db.spec, &old.spec).map_err(|f| f.to_string())?;
            }
            let (versions, classes) = fetch_cluster_context(&state.client).await?;
            validate_database(db, &versions, &classes).map_err(|f| f.to_string())
        }
        Operation::Delete => {
            // the object being deleted rides along as old_object; when it is
            // already gone there is nothing left to protect
            match req.old_object.as_ref() {
                Some(db) => validate_delete(db).map_err(|f| f.to_string()),
                None => Ok(()),
            }
        }
        Operation::Connect => Ok(()),
    }
}

/// Fetch the version catalog and storage-class names validation needs.
/// Failing to read them fails closed: the object is rejected with the
/// API error so nothing unvalidated slips through.
async fn fetch_cluster_context(
    client: &Client,
) -> Result<(Vec<CatalogVersion>, Vec<String>), String> {
    let versions_api: Api<KevaVersion> = Api::all(client.clone());
    let versions = versions_api
        .list(&ListParams::default())
        .await
        .map_err(|e| format!("failed to list KevaVersions: {}", e))?
        .items
        .into_iter()
        .map(|v| CatalogVersion {
            name: v.spec.version.clone(),
            deprecated: v.spec.deprecated,
        })
        .collect();

    let classes_api: Api<StorageClass> = Api::all(client.clone());
    let classes = classes_api
        .list(&ListParams::default())
        .await
        .map_err(|e| format!("failed to list StorageClasses: {}", e))?
        .items
        .into_iter()
        .map(|c| c.name_any())
        .collect();

    Ok((versions, classes))
}
