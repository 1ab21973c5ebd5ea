//! Custom Resource Definitions for the Keva operator
//!
//! Defines the `KevaDatabase` CRD describing a desired Keva key-value
//! database, the `DormantDatabase` CRD preserving the configuration of a
//! paused database, the `AppBinding` connection-info projection, and the
//! `KevaVersion` catalog entry. Field names and enum values here are the
//! wire contract consumed by backup tooling and dashboards.

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group for all Keva resources
pub const API_GROUP: &str = "keva.dev";

/// Port the database serves clients on
pub const DATABASE_PORT: i32 = 6380;

/// Port used for peer gossip between cluster nodes
pub const GOSSIP_PORT: i32 = 16380;

/// Default port the metrics exporter sidecar listens on
pub const EXPORTER_PORT: i32 = 56790;

/// Value of the `app.kubernetes.io/managed-by` label on every offshoot
pub const MANAGED_BY: &str = "keva-operator";

/// Label carrying the owning database name on every offshoot
pub const LABEL_DATABASE_NAME: &str = "keva.dev/name";

/// Label carrying the resource kind on dormant records
pub const LABEL_DATABASE_KIND: &str = "keva.dev/kind";

/// Annotation holding the JSON-encoded one-shot init spec on a dormant record
pub const ANNOTATION_INIT_SPEC: &str = "keva.dev/init-spec";

/// Annotation telling the controller to skip an object entirely
pub const ANNOTATION_IGNORE: &str = "keva.dev/ignore";

/// Annotation on offshoots holding the hash of the desired state they were
/// built from; used for zero-write idempotence checks
pub const ANNOTATION_SPEC_HASH: &str = "keva.dev/spec-hash";

/// Annotation on the stats service recording the wired monitoring agent type
pub const ANNOTATION_AGENT_TYPE: &str = "keva.dev/agent-type";

/// Regex for validating Kubernetes resource quantities (e.g., "10Gi", "100Mi")
static QUANTITY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?(Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E)?$").unwrap());

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Validate a Kubernetes resource quantity string
fn validate_quantity(value: &str) -> Result<(), ValidationError> {
    if QUANTITY_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_quantity")
            .with_message(format!("'{}' is not a valid Kubernetes quantity", value).into()))
    }
}

/// Validate an optional Kubernetes name (RFC 1123 subdomain)
fn validate_optional_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// KevaDatabase custom resource definition
///
/// Represents a desired Keva database deployment. The operator watches these
/// resources and reconciles Services, StatefulSets, Secrets and AppBindings
/// to match the declared topology. The controller never mutates the spec
/// except for system-managed fields (`authSecret` auto-provisioning).
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "keva.dev",
    version = "v1alpha1",
    kind = "KevaDatabase",
    plural = "kevadatabases",
    shortname = "kvdb",
    namespaced,
    status = "KevaDatabaseStatus",
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KevaDatabaseSpec {
    /// Deployment mode (Standalone or Cluster)
    #[serde(default)]
    pub mode: KevaMode,

    /// Cluster topology; required iff mode is Cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub cluster: Option<ClusterTopology>,

    /// Legacy standalone replica count; only the value 1 is accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Keva version to deploy; must name a KevaVersion catalog entry.
    /// Immutable once set.
    #[validate(length(min = 1, max = 64, message = "version must be 1-64 characters"))]
    pub version: String,

    /// Persistent storage configuration; absent means ephemeral (emptyDir)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub storage: Option<StorageSpec>,

    /// What happens to dependent objects when this database is deleted
    #[serde(default)]
    pub termination_policy: TerminationPolicy,

    /// Scale the database down to zero while keeping its record
    #[serde(default)]
    pub halted: bool,

    /// Legacy lock flag; treated like terminationPolicy=DoNotTerminate
    #[serde(default)]
    pub do_not_pause: bool,

    /// Observability agent wiring
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub monitor: Option<MonitorSpec>,

    /// Name of the secret holding database credentials; auto-provisioned
    /// as `<name>-auth` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_optional_k8s_name"))]
    pub auth_secret: Option<String>,

    /// One-shot initialization directives; not expected to survive a pause
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitSpec>,

    /// Resource requirements for database containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub resources: Option<ResourceRequirements>,

    /// Node selector for pod scheduling
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Additional pod annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_annotations: BTreeMap<String, String>,
}

/// Deployment mode of a KevaDatabase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum KevaMode {
    /// Single node, no sharding
    #[default]
    Standalone,
    /// Sharded cluster with replicated masters
    Cluster,
}

/// Shard/replica topology for cluster mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    /// Number of independent shards ("masters"); minimum 3
    pub master: i32,

    /// Replicas per shard; minimum 1
    pub replicas: i32,
}

/// Rule governing what happens to dependent storage/credentials/bindings
/// when the database is deleted.
///
/// `Pause` is a wire-compatible synonym of `Halt` kept for older specs;
/// the termination engine treats the two identically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum TerminationPolicy {
    /// Delete requests on the live object are refused
    DoNotTerminate,
    /// Detach and keep storage/credentials, park a DormantDatabase
    #[default]
    Halt,
    /// Synonym of Halt
    Pause,
    /// Cascade-delete storage, keep credentials
    Delete,
    /// Cascade-delete storage, credentials and the AppBinding
    WipeOut,
}

/// Persistent storage configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Requested capacity (e.g., "10Gi")
    #[serde(default = "default_storage_size")]
    #[validate(custom(function = "validate_quantity"))]
    pub size: String,

    /// Storage class; must exist at admission time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_optional_k8s_name"))]
    pub storage_class_name: Option<String>,

    /// Access modes for the volume claim
    #[serde(default = "default_access_modes")]
    pub access_modes: Vec<String>,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: default_storage_size(),
            storage_class_name: None,
            access_modes: default_access_modes(),
        }
    }
}

/// Observability agent specification
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSpec {
    /// Which monitoring agent to wire
    pub agent: AgentType,

    /// Exporter sidecar settings; required for the PrometheusOperator agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub exporter: Option<ExporterSpec>,
}

/// Supported monitoring agent types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum AgentType {
    /// Scrape annotations on the stats service, no extra objects
    PrometheusBuiltin,
    /// ServiceMonitor-based wiring; requires an explicit exporter port
    PrometheusOperator,
}

impl AgentType {
    /// Stable string form stored in the stats-service annotation
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::PrometheusBuiltin => "prometheus.io/builtin",
            AgentType::PrometheusOperator => "prometheus.io/operator",
        }
    }
}

/// Metrics exporter sidecar settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ExporterSpec {
    /// Port the exporter listens on
    #[validate(range(min = 1024, max = 65535, message = "port must be 1024-65535"))]
    pub port: i32,
}

/// One-shot initialization directives applied on first creation
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitSpec {
    /// Path to a startup script baked into the data volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_path: Option<String>,

    /// Name of a snapshot to restore from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_name: Option<String>,
}

/// Status of a KevaDatabase resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KevaDatabaseStatus {
    /// Current lifecycle phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DatabasePhase>,

    /// Last spec generation fully reconciled
    #[serde(default)]
    pub observed_generation: i64,

    /// Human-readable detail for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the status was updated (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/// Lifecycle phase of a database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum DatabasePhase {
    /// Infrastructure objects are being created
    Creating,
    /// One-shot initialization is running
    Initializing,
    /// Workload and endpoint exist and are ready
    Running,
    /// Workload scaled to zero on user request
    Halted,
}

impl KevaDatabase {
    /// Name shared by the offshoot Service and StatefulSet
    pub fn offshoot_name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    /// Name of the headless service governing peer discovery
    pub fn governing_service_name(&self) -> String {
        format!("{}-pods", self.offshoot_name())
    }

    /// Name of the monitoring stats service
    pub fn stats_service_name(&self) -> String {
        format!("{}-stats", self.offshoot_name())
    }

    /// Name of the cluster configuration ConfigMap
    pub fn config_map_name(&self) -> String {
        format!("{}-config", self.offshoot_name())
    }

    /// Effective credentials secret name (user-supplied or auto-provisioned)
    pub fn auth_secret_name(&self) -> String {
        self.spec
            .auth_secret
            .clone()
            .unwrap_or_else(|| default_auth_secret_name(&self.offshoot_name()))
    }

    /// Labels applied to every offshoot object
    pub fn offshoot_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.offshoot_selectors();
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            MANAGED_BY.to_string(),
        );
        labels
    }

    /// Selector labels used to discover offshoots without a persisted pointer
    pub fn offshoot_selectors(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_DATABASE_NAME.to_string(), self.offshoot_name());
        labels.insert(LABEL_DATABASE_KIND.to_string(), "KevaDatabase".to_string());
        labels
    }

    /// Label selector string for list calls against offshoots
    pub fn offshoot_selector_string(&self) -> String {
        format!("{}={}", LABEL_DATABASE_NAME, self.offshoot_name())
    }

    /// Total pod count for the workload object:
    /// 1 for standalone, master * (1 + replicas) for cluster mode
    pub fn total_replicas(&self) -> i32 {
        match self.spec.mode {
            KevaMode::Standalone => 1,
            KevaMode::Cluster => self
                .spec
                .cluster
                .map(|c| c.master * (1 + c.replicas))
                .unwrap_or(0),
        }
    }

    /// Current status phase, if any has been set
    pub fn phase(&self) -> Option<DatabasePhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Whether the ignore annotation is present
    pub fn is_ignored(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(ANNOTATION_IGNORE))
    }
}

/// Default name of the auto-provisioned credentials secret
pub fn default_auth_secret_name(db_name: &str) -> String {
    format!("{}-auth", db_name)
}

/// DormantDatabase custom resource definition
///
/// Created by the termination engine when a database with a preserving
/// termination policy is deleted. Holds a snapshot of the origin spec so a
/// later re-creation can be verified safe to resume.
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "keva.dev",
    version = "v1alpha1",
    kind = "DormantDatabase",
    plural = "dormantdatabases",
    shortname = "drmn",
    namespaced,
    status = "DormantDatabaseStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseSpec {
    /// Snapshot of the deleted database
    pub origin: Origin,

    /// Set when a matching re-creation is allowed to resume this record
    #[serde(default)]
    pub resume: bool,

    /// Set by a user to destroy the preserved storage and credentials
    #[serde(default)]
    pub wipe_out: bool,
}

/// Origin metadata and spec preserved from the deleted database
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    /// Original object name
    pub name: String,

    /// Original namespace
    pub namespace: String,

    /// Original labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Original annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Original spec with one-shot init directives stripped
    pub spec: KevaDatabaseSpec,
}

/// Status of a DormantDatabase record
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseStatus {
    /// Current phase of the dormant record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DormantDatabasePhase>,

    /// Last time the status was updated (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/// Phase of a dormant record's own lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum DormantDatabasePhase {
    /// Offshoots are being detached
    Pausing,
    /// Parked; storage and credentials preserved
    Paused,
    /// A matching re-creation is in progress
    Resuming,
    /// Preserved objects are being destroyed
    WipingOut,
    /// Nothing preserved remains
    WipedOut,
}

/// AppBinding custom resource definition
///
/// Read-only projection exposing connection coordinates for a running
/// database to other systems. Owned by the database and mirroring its
/// generation.
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "keva.dev",
    version = "v1alpha1",
    kind = "AppBinding",
    plural = "appbindings",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AppBindingSpec {
    /// Type tag consumed by tooling (e.g. "kevadatabases.keva.dev")
    #[serde(rename = "type")]
    pub type_: String,

    /// Resolved database engine version
    pub version: String,

    /// Connection coordinates
    pub client_config: ClientConfig,
}

/// Client connection configuration exposed through an AppBinding
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// In-cluster service reference
    pub service: ServiceReference,

    /// Whether TLS verification may be skipped
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

/// Reference to the client-facing service
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReference {
    /// URL scheme (always "keva")
    pub scheme: String,

    /// Service name
    pub name: String,

    /// Service port
    pub port: i32,
}

/// KevaVersion catalog entry
///
/// Cluster-scoped record mapping a version string to container images.
/// A KevaDatabase's `spec.version` must resolve to one of these.
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "keva.dev",
    version = "v1alpha1",
    kind = "KevaVersion",
    plural = "kevaversions",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Deprecated", "type":"boolean", "jsonPath":".spec.deprecated"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KevaVersionSpec {
    /// Engine version string
    pub version: String,

    /// Database container image
    pub db: VersionImage,

    /// Metrics exporter container image
    pub exporter: VersionImage,

    /// Deprecated versions are rejected at admission
    #[serde(default)]
    pub deprecated: bool,
}

/// A single container image reference inside a catalog entry
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct VersionImage {
    /// Full image reference including tag
    pub image: String,
}

fn default_storage_size() -> String {
    "1Gi".to_string()
}

fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteOnce".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn sample_database(name: &str) -> KevaDatabase {
        KevaDatabase {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-1234".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: KevaDatabaseSpec {
                mode: KevaMode::Standalone,
                cluster: None,
                replicas: Some(1),
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
    fn offshoot_names_are_deterministic() {
        let db = sample_database("mydb");
        assert_eq!(db.offshoot_name(), "mydb");
        assert_eq!(db.governing_service_name(), "mydb-pods");
        assert_eq!(db.stats_service_name(), "mydb-stats");
        assert_eq!(db.auth_secret_name(), "mydb-auth");
    }

    #[test]
    fn auth_secret_prefers_user_supplied_name() {
        let mut db = sample_database("mydb");
        db.spec.auth_secret = Some("custom-creds".to_string());
        assert_eq!(db.auth_secret_name(), "custom-creds");
    }

    #[test]
    fn total_replicas_standalone_is_one() {
        let db = sample_database("mydb");
        assert_eq!(db.total_replicas(), 1);
    }

    #[test]
    fn total_replicas_cluster_counts_masters_and_replicas() {
        let mut db = sample_database("mydb");
        db.spec.mode = KevaMode::Cluster;
        db.spec.cluster = Some(ClusterTopology {
            master: 3,
            replicas: 2,
        });
        assert_eq!(db.total_replicas(), 9);
    }

    #[test]
    fn offshoot_selectors_carry_name_and_kind() {
        let db = sample_database("mydb");
        let sel = db.offshoot_selectors();
        assert_eq!(sel.get(LABEL_DATABASE_NAME), Some(&"mydb".to_string()));
        assert_eq!(
            sel.get(LABEL_DATABASE_KIND),
            Some(&"KevaDatabase".to_string())
        );
        let labels = db.offshoot_labels();
        assert_eq!(
            labels.get("app.kubernetes.io/managed-by"),
            Some(&MANAGED_BY.to_string())
        );
    }

    #[test]
    fn termination_policy_defaults_to_halt() {
        assert_eq!(TerminationPolicy::default(), TerminationPolicy::Halt);
    }

    #[test]
    fn spec_roundtrips_through_json() {
        let db = sample_database("mydb");
        let json = serde_json::to_string(&db.spec).unwrap();
        let back: KevaDatabaseSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(db.spec, back);
        assert!(json.contains("\"terminationPolicy\":\"Halt\""));
        assert!(json.contains("\"mode\":\"Standalone\""));
    }

    #[test]
    fn ignore_annotation_detected() {
        let mut db = sample_database("mydb");
        assert!(!db.is_ignored());
        db.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_IGNORE.to_string(),
            String::new(),
        )]));
        assert!(db.is_ignored());
    }

    #[test]
    fn quantity_validation_accepts_standard_suffixes() {
        for q in ["1Gi", "500Mi", "2", "1.5Ti"] {
            assert!(validate_quantity(q).is_ok(), "{q} should be valid");
        }
        for q in ["", "abc", "-1Gi", "1GiB"] {
            assert!(validate_quantity(q).is_err(), "{q} should be invalid");
        }
    }
}
