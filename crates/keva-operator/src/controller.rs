//! KevaDatabase lifecycle controller
//!
//! Level-triggered reconciliation: every pass re-derives the full desired
//! state from the spec and converges the cluster toward it, so a missed or
//! duplicated event never corrupts anything. A finalizer keeps the database
//! object alive until the termination engine has adjusted the fate of its
//! dependents.

use crate::crd::{
    DatabasePhase, DormantDatabase, DormantDatabasePhase, KevaDatabase, KevaMode, KevaVersion,
    TerminationPolicy,
};
use crate::dormant::specs_match;
use crate::ensure::{ensure, patch_status_with_retry, VerbType};
use crate::error::{OperatorError, Result};
use crate::events::{reasons, EventRecorder};
use crate::monitor::MonitorManager;
use crate::resources::ResourceBuilder;
use crate::termination::TerminationExecutor;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Finalizer keeping databases pinned until cleanup has run
pub const FINALIZER: &str = "keva.dev/database-finalizer";

/// Requeue interval once a database is converged
const STABLE_REQUEUE: Duration = Duration::from_secs(300);

/// Requeue interval while waiting for pods to come up or drain
const PENDING_REQUEUE: Duration = Duration::from_secs(10);

/// Counters exposed through the Prometheus endpoint
#[derive(Clone, Default)]
pub struct ControllerMetrics;

impl ControllerMetrics {
    pub fn reconcile_success(&self) {
        metrics::counter!("keva_reconciliations_total", "outcome" => "success").increment(1);
    }

    pub fn reconcile_failure(&self) {
        metrics::counter!("keva_reconciliations_total", "outcome" => "failure").increment(1);
    }

    pub fn offshoot_write(&self, kind: &'static str, verb: VerbType) {
        let verb = match verb {
            VerbType::Created => "created",
            VerbType::Patched => "patched",
            VerbType::Unchanged => return,
        };
        metrics::counter!("keva_offshoot_writes_total", "kind" => kind, "verb" => verb)
            .increment(1);
    }

    pub fn database_terminated(&self) {
        metrics::counter!("keva_databases_terminated_total").increment(1);
    }

    pub fn reconcile_duration(&self, elapsed: Duration) {
        metrics::histogram!("keva_reconcile_duration_seconds").record(elapsed.as_secs_f64());
    }
}

/// Operator-level settings from the CLI
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Provision per-database ServiceAccounts, Roles and RoleBindings
    pub rbac_enabled: bool,
    /// Suffix of the governing (headless) service name
    pub governing_service_suffix: String,
    /// Override tag for the catalog's exporter image
    pub exporter_tag: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            rbac_enabled: true,
            governing_service_suffix: "pods".to_string(),
            exporter_tag: None,
        }
    }
}

/// Shared state handed to every reconcile invocation
pub struct Context {
    pub client: Client,
    pub recorder: EventRecorder,
    pub monitor: MonitorManager,
    pub terminator: TerminationExecutor,
    pub metrics: ControllerMetrics,
    pub config: OperatorConfig,
    retry_counts: DashMap<String, u32>,
}

impl Context {
    pub fn new(client: Client, controller_name: &str, config: OperatorConfig) -> Self {
        Self {
            recorder: EventRecorder::new(client.clone(), controller_name),
            monitor: MonitorManager::new(client.clone()),
            terminator: TerminationExecutor::new(client.clone()),
            metrics: ControllerMetrics,
            config,
            retry_counts: DashMap::new(),
            client,
        }
    }
}

/// Run the controller until shutdown
pub async fn run(ctx: Arc<Context>, namespace: Option<&str>) -> Result<()> {
    let (databases, statefulsets, services): (Api<KevaDatabase>, Api<StatefulSet>, Api<Service>) =
        match namespace {
            Some(ns) => (
                Api::namespaced(ctx.client.clone(), ns),
                Api::namespaced(ctx.client.clone(), ns),
                Api::namespaced(ctx.client.clone(), ns),
            ),
            None => (
                Api::all(ctx.client.clone()),
                Api::all(ctx.client.clone()),
                Api::all(ctx.client.clone()),
            ),
        };

    Controller::new(databases, watcher::Config::default())
        .owns(statefulsets, watcher::Config::default())
        .owns(services, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => info!(object = %obj, "reconciled"),
                Err(e) => error!(error = %e, "reconciliation error"),
            }
        })
        .await;
    Ok(())
}

#[instrument(skip(ctx, db), fields(name = %db.name_any(), namespace = db.namespace().unwrap_or_default()))]
async fn reconcile(db: Arc<KevaDatabase>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = db.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<KevaDatabase> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER, db, |event| async {
        match event {
            Finalizer::Apply(db) => apply(db, ctx.clone()).await,
            Finalizer::Cleanup(db) => cleanup(db, ctx.clone()).await,
        }
    })
    .await
    .map_err(unwrap_finalizer_error)
}

/// Unwrap reconciler errors from the finalizer wrapper so retryability
/// classification survives into `error_policy`; finalizer bookkeeping
/// failures themselves stay retryable.
fn unwrap_finalizer_error(
    err: kube::runtime::finalizer::Error<OperatorError>,
) -> OperatorError {
    use kube::runtime::finalizer::Error as FinalizerError;
    match err {
        FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e,
        other => OperatorError::ReconcileFailed(other.to_string()),
    }
}

/// Forward reconciliation: converge offshoots toward the spec
async fn apply(db: Arc<KevaDatabase>, ctx: Arc<Context>) -> Result<Action> {
    if db.is_ignored() {
        info!(db = %db.name_any(), "skipping ignored database");
        return Ok(Action::await_change());
    }

    let name = db.offshoot_name();
    let namespace = db.namespace().unwrap_or_else(|| "default".to_string());
    let obj_ref = db.object_ref(&());

    let started = std::time::Instant::now();
    let result = apply_database(&db, &namespace, &ctx).await;
    ctx.metrics.reconcile_duration(started.elapsed());
    match &result {
        Ok(_) => {
            ctx.metrics.reconcile_success();
            ctx.retry_counts.remove(&format!("{}/{}", namespace, name));
        }
        Err(e) => {
            ctx.metrics.reconcile_failure();
            let reason = if e.is_user_error() {
                reasons::INVALID
            } else {
                reasons::FAILED_TO_UPDATE
            };
            ctx.recorder.warning(&obj_ref, reason, e.to_string()).await;
        }
    }
    result
}

async fn apply_database(db: &KevaDatabase, namespace: &str, ctx: &Context) -> Result<Action> {
    let client = &ctx.client;
    let name = db.offshoot_name();
    let obj_ref = db.object_ref(&());
    let databases: Api<KevaDatabase> = Api::namespaced(client.clone(), namespace);

    // resolve images from the installed version catalog
    let versions: Api<KevaVersion> = Api::all(client.clone());
    let version = versions
        .get_opt(&db.spec.version)
        .await?
        .ok_or_else(|| {
            OperatorError::InvalidSpec(format!(
                "version '{}' not found in catalog",
                db.spec.version
            ))
        })?;
    if version.spec.deprecated {
        return Err(OperatorError::InvalidSpec(format!(
            "version '{}' is deprecated",
            db.spec.version
        )));
    }

    // a dormant record under our name gates everything else
    let dormants: Api<DormantDatabase> = Api::namespaced(client.clone(), namespace);
    let dormant = dormants.get_opt(&name).await?;
    if let Some(dormant) = &dormant {
        if let Err(e) = specs_match(db, dormant) {
            ctx.recorder
                .warning(&obj_ref, reasons::DORMANT_MISMATCH, e.to_string())
                .await;
            return Err(e);
        }
        mark_resuming(&dormants, &name).await?;
        info!(db = %name, "resuming from dormant record");
    }

    let exporter_image = db.spec.monitor.as_ref().map(|_| {
        match &ctx.config.exporter_tag {
            Some(tag) => rewrite_image_tag(&version.spec.exporter.image, tag),
            None => version.spec.exporter.image.clone(),
        }
    });
    let builder = ResourceBuilder::new(db, version.spec.db.image.clone(), exporter_image)?
        .governing_service_suffix(&ctx.config.governing_service_suffix);

    if db.spec.halted {
        if !matches!(
            db.spec.termination_policy,
            TerminationPolicy::Halt | TerminationPolicy::Pause
        ) {
            ctx.recorder
                .warning(
                    &obj_ref,
                    reasons::FAILED_TO_HALT,
                    "halted requires terminationPolicy Halt or Pause",
                )
                .await;
            return Ok(Action::await_change());
        }
        return halt_database(db, namespace, ctx, &builder).await;
    }

    if db.phase().is_none() {
        ctx.recorder
            .normal(&obj_ref, reasons::CREATING, "creating database resources")
            .await;
        set_phase(&databases, &name, DatabasePhase::Creating, None).await?;
    }

    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    let verb = ensure(&services, &name, builder.build_governing_service()).await?;
    ctx.metrics.offshoot_write("Service", verb);

    if ctx.config.rbac_enabled {
        let (sa, role, binding) = builder.build_rbac();
        let verb = ensure(&Api::namespaced(client.clone(), namespace), &name, sa).await?;
        ctx.metrics.offshoot_write("ServiceAccount", verb);
        let verb = ensure(&Api::namespaced(client.clone(), namespace), &name, role).await?;
        ctx.metrics.offshoot_write("Role", verb);
        let verb = ensure(&Api::namespaced(client.clone(), namespace), &name, binding).await?;
        ctx.metrics.offshoot_write("RoleBinding", verb);
    }

    if db.spec.mode == KevaMode::Cluster {
        let verb = ensure(
            &Api::namespaced(client.clone(), namespace),
            &name,
            builder.build_config_map(),
        )
        .await?;
        ctx.metrics.offshoot_write("ConfigMap", verb);
    }

    ensure_auth_secret(db, namespace, &databases, &builder, ctx).await?;

    let verb = ensure(&services, &name, builder.build_client_service()).await?;
    ctx.metrics.offshoot_write("Service", verb);

    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    let verb = ensure(
        &statefulsets,
        &name,
        builder.build_statefulset(ctx.config.rbac_enabled),
    )
    .await?;
    ctx.metrics.offshoot_write("StatefulSet", verb);

    // readiness drives the phase; requeue until the workload converges
    let ready = statefulsets
        .get_opt(&name)
        .await?
        .and_then(|sts| sts.status)
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    let total = db.total_replicas();
    let phase = derive_phase(false, db.spec.init.is_some(), ready, total);

    if phase != DatabasePhase::Running {
        set_phase(
            &databases,
            &name,
            phase,
            Some(format!("{}/{} replicas ready", ready, total)),
        )
        .await?;
        return Ok(Action::requeue(PENDING_REQUEUE));
    }

    // best effort from here on: monitoring must never wedge the database
    if let Err(e) = ctx.monitor.reconcile(db, &builder).await {
        ctx.recorder
            .warning(&obj_ref, reasons::MONITOR, e.to_string())
            .await;
    }

    let bindings = Api::namespaced(client.clone(), namespace);
    let verb = ensure(&bindings, &name, builder.build_app_binding(&version.spec.version)).await?;
    ctx.metrics.offshoot_write("AppBinding", verb);

    if dormant.is_some() {
        dormants.delete(&name, &Default::default()).await?;
        ctx.recorder
            .normal(&obj_ref, reasons::SUCCESSFUL, "resumed from dormant record")
            .await;
    }
    if db.spec.init.is_some() && db.phase() == Some(DatabasePhase::Initializing) {
        ctx.recorder
            .normal(&obj_ref, reasons::INITIALIZED, "initialization complete")
            .await;
    }

    set_phase(&databases, &name, DatabasePhase::Running, None).await?;
    Ok(Action::requeue(STABLE_REQUEUE))
}

/// Scale the workload to zero while keeping storage and credentials.
/// The zero-replica desired state goes through the same ensurer so the
/// spec-hash annotation tracks it and un-halting patches back cleanly.
async fn halt_database(
    db: &KevaDatabase,
    namespace: &str,
    ctx: &Context,
    builder: &ResourceBuilder<'_>,
) -> Result<Action> {
    let name = db.offshoot_name();
    let obj_ref = db.object_ref(&());
    let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), namespace);
    let databases: Api<KevaDatabase> = Api::namespaced(ctx.client.clone(), namespace);

    if let Some(sts) = statefulsets.get_opt(&name).await? {
        let verb = ensure(
            &statefulsets,
            &name,
            builder.build_statefulset(ctx.config.rbac_enabled),
        )
        .await?;
        ctx.metrics.offshoot_write("StatefulSet", verb);
        if verb != VerbType::Unchanged {
            ctx.recorder
                .normal(&obj_ref, reasons::HALTING, "scaling workload to zero")
                .await;
        }
        let ready = sts.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
        if ready > 0 {
            return Ok(Action::requeue(PENDING_REQUEUE));
        }
    }

    set_phase(&databases, &name, DatabasePhase::Halted, None).await?;
    Ok(Action::await_change())
}

/// Provision credentials when no secret exists yet. A user-named secret
/// that is missing is a spec error; an auto-provisioned name is created
/// and recorded back into the spec as a system-managed field.
async fn ensure_auth_secret(
    db: &KevaDatabase,
    namespace: &str,
    databases: &Api<KevaDatabase>,
    builder: &ResourceBuilder<'_>,
    ctx: &Context,
) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let secret_name = db.auth_secret_name();
    if secrets.get_opt(&secret_name).await?.is_some() {
        return Ok(());
    }
    if db.spec.auth_secret.is_some() {
        return Err(OperatorError::InvalidSpec(format!(
            "auth secret '{}' does not exist",
            secret_name
        )));
    }

    let verb = ensure(&secrets, &db.offshoot_name(), builder.build_auth_secret()).await?;
    ctx.metrics.offshoot_write("Secret", verb);

    let patch = serde_json::json!({ "spec": { "authSecret": secret_name } });
    databases
        .patch(
            &db.offshoot_name(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
    Ok(())
}

async fn mark_resuming(dormants: &Api<DormantDatabase>, name: &str) -> Result<()> {
    let patch = serde_json::json!({ "spec": { "resume": true } });
    dormants
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    patch_status_with_retry(dormants, name, |_| {
        serde_json::json!({
            "phase": DormantDatabasePhase::Resuming,
            "lastUpdated": chrono::Utc::now().to_rfc3339(),
        })
    })
    .await?;
    Ok(())
}

async fn set_phase(
    databases: &Api<KevaDatabase>,
    name: &str,
    phase: DatabasePhase,
    message: Option<String>,
) -> Result<()> {
    patch_status_with_retry(databases, name, |db: &KevaDatabase| {
        build_status_patch(phase, message.as_deref(), db.metadata.generation)
    })
    .await?;
    Ok(())
}

/// Status merge patch for a phase transition. The observed generation is
/// stamped only once the pass has fully reconciled (Running or Halted);
/// intermediate phases leave the previous value untouched.
fn build_status_patch(
    phase: DatabasePhase,
    message: Option<&str>,
    generation: Option<i64>,
) -> serde_json::Value {
    let mut status = serde_json::json!({
        "phase": phase,
        "message": message,
        "lastUpdated": chrono::Utc::now().to_rfc3339(),
    });
    if matches!(phase, DatabasePhase::Running | DatabasePhase::Halted) {
        status["observedGeneration"] = generation.unwrap_or(0).into();
    }
    status
}

/// Phase derivation from workload readiness
fn derive_phase(halted: bool, has_init: bool, ready: i32, total: i32) -> DatabasePhase {
    if halted {
        DatabasePhase::Halted
    } else if ready >= total && total > 0 {
        DatabasePhase::Running
    } else if has_init {
        DatabasePhase::Initializing
    } else {
        DatabasePhase::Creating
    }
}

/// Finalizer cleanup: run the termination plan, then release the object
async fn cleanup(db: Arc<KevaDatabase>, ctx: Arc<Context>) -> Result<Action> {
    let obj_ref = db.object_ref(&());
    ctx.recorder
        .normal(&obj_ref, reasons::PAUSING, "running termination plan")
        .await;

    // monitoring wiring goes away under every policy
    let namespace = db.namespace().unwrap_or_else(|| "default".to_string());
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    match services
        .delete(&db.stats_service_name(), &Default::default())
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    match ctx.terminator.execute(&db).await {
        Ok(()) => {
            ctx.metrics.database_terminated();
            info!(db = %db.name_any(), policy = ?db.spec.termination_policy, "terminated");
            Ok(Action::await_change())
        }
        Err(e) => {
            ctx.recorder
                .warning(&obj_ref, reasons::FAILED_TO_DELETE, e.to_string())
                .await;
            Err(e)
        }
    }
}

/// Swap the tag of an image reference, e.g. `repo/exporter:v1` -> `repo/exporter:v2`
fn rewrite_image_tag(image: &str, tag: &str) -> String {
    // only a colon after the last slash is a tag separator; registries
    // with ports (host:5000/img) must not be split
    let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_slash..].rfind(':') {
        Some(i) => format!("{}:{}", &image[..last_slash + i], tag),
        None => format!("{}:{}", image, tag),
    }
}

/// Exponential backoff delay for a given consecutive failure count
fn backoff_delay(retries: u32) -> Duration {
    let secs = 5u64.saturating_mul(2u64.saturating_pow(retries.min(6)));
    Duration::from_secs(secs.min(300))
}

fn error_policy(db: Arc<KevaDatabase>, err: &OperatorError, ctx: Arc<Context>) -> Action {
    let key = format!(
        "{}/{}",
        db.namespace().unwrap_or_default(),
        db.name_any()
    );

    if !err.is_retryable() {
        warn!(db = %key, error = %err, "not retryable, waiting for spec change");
        ctx.retry_counts.remove(&key);
        return Action::await_change();
    }

    let retries = {
        let mut entry = ctx.retry_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };
    let delay = backoff_delay(retries);
    warn!(db = %key, error = %err, retries, ?delay, "reconcile failed, backing off");
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_halted_wins() {
        assert_eq!(derive_phase(true, false, 3, 3), DatabasePhase::Halted);
    }

    #[test]
    fn phase_running_when_all_ready() {
        assert_eq!(derive_phase(false, false, 1, 1), DatabasePhase::Running);
        assert_eq!(derive_phase(false, true, 6, 6), DatabasePhase::Running);
    }

    #[test]
    fn phase_creating_while_pods_come_up() {
        assert_eq!(derive_phase(false, false, 0, 1), DatabasePhase::Creating);
        assert_eq!(derive_phase(false, false, 2, 6), DatabasePhase::Creating);
    }

    #[test]
    fn phase_initializing_with_init_directives() {
        assert_eq!(derive_phase(false, true, 0, 1), DatabasePhase::Initializing);
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(10));
        assert_eq!(backoff_delay(2), Duration::from_secs(20));
        assert!(backoff_delay(3) > backoff_delay(2));
        assert_eq!(backoff_delay(20), Duration::from_secs(300));
    }

    #[test]
    fn finalizer_name_is_group_scoped() {
        assert!(FINALIZER.starts_with("keva.dev/"));
    }

    #[test]
    fn user_errors_keep_classification_through_finalizer() {
        use kube::runtime::finalizer::Error as FinalizerError;

        let err = unwrap_finalizer_error(FinalizerError::ApplyFailed(
            OperatorError::InvalidSpec("cluster.master must be >= 3".into()),
        ));
        assert!(matches!(err, OperatorError::InvalidSpec(_)));
        assert!(!err.is_retryable());

        let err = unwrap_finalizer_error(FinalizerError::CleanupFailed(
            OperatorError::InvalidSpec("deletion refused".into()),
        ));
        assert!(!err.is_retryable());

        let err = unwrap_finalizer_error(FinalizerError::UnnamedObject);
        assert!(err.is_retryable());
    }

    #[test]
    fn observed_generation_only_stamped_on_terminal_phases() {
        let patch = build_status_patch(DatabasePhase::Creating, Some("0/3 replicas ready"), Some(4));
        assert!(patch.get("observedGeneration").is_none());

        let patch = build_status_patch(DatabasePhase::Initializing, None, Some(4));
        assert!(patch.get("observedGeneration").is_none());

        let patch = build_status_patch(DatabasePhase::Running, None, Some(4));
        assert_eq!(patch["observedGeneration"], 4);

        let patch = build_status_patch(DatabasePhase::Halted, None, Some(7));
        assert_eq!(patch["observedGeneration"], 7);
    }

    #[test]
    fn image_tag_rewrite_handles_registries_with_ports() {
        assert_eq!(rewrite_image_tag("keva/exporter:v1", "v2"), "keva/exporter:v2");
        assert_eq!(rewrite_image_tag("keva/exporter", "v2"), "keva/exporter:v2");
        assert_eq!(
            rewrite_image_tag("registry:5000/keva/exporter:v1", "v2"),
            "registry:5000/keva/exporter:v2"
        );
        assert_eq!(
            rewrite_image_tag("registry:5000/keva/exporter", "v2"),
            "registry:5000/keva/exporter:v2"
        );
    }
}
