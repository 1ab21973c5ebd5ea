//! Kubernetes resource builders
//!
//! Generates the offshoot manifests (Services, StatefulSet, Secret, RBAC,
//! ConfigMap, AppBinding) for a KevaDatabase. Every built object carries an
//! owner reference back to the database and the deterministic offshoot
//! label set so it can be rediscovered by selector alone.

use crate::crd::{
    AppBinding, AppBindingSpec, ClientConfig, KevaDatabase, KevaMode, ServiceReference,
    DATABASE_PORT, EXPORTER_PORT, GOSSIP_PORT,
};
use crate::error::{OperatorError, Result};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, ConfigMapVolumeSource,
    ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, SecretKeySelector, SecretVolumeSource, Service, ServiceAccount, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use rand::distr::{Alphanumeric, SampleString};
use std::collections::BTreeMap;

/// Builder for generating offshoot resources from a KevaDatabase
pub struct ResourceBuilder<'a> {
    db: &'a KevaDatabase,
    name: String,
    namespace: String,
    governing_service_name: String,
    db_image: String,
    exporter_image: Option<String>,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a builder; image references come from the resolved KevaVersion
    pub fn new(
        db: &'a KevaDatabase,
        db_image: impl Into<String>,
        exporter_image: Option<String>,
    ) -> Result<Self> {
        let name = db
            .metadata
            .name
            .clone()
            .ok_or_else(|| OperatorError::Internal("database name is required".to_string()))?;
        let namespace = db
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        Ok(Self {
            db,
            governing_service_name: db.governing_service_name(),
            name,
            namespace,
            db_image: db_image.into(),
            exporter_image,
        })
    }

    /// Override the suffix of the governing service name (operator flag)
    pub fn governing_service_suffix(mut self, suffix: &str) -> Self {
        self.governing_service_name = format!("{}-{}", self.name, suffix);
        self
    }

    /// Owner reference attached to every offshoot
    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: "keva.dev/v1alpha1".to_string(),
            kind: "KevaDatabase".to_string(),
            name: self.name.clone(),
            uid: self.db.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn metadata(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.db.offshoot_labels()),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    /// Headless service governing peer discovery among shard replicas
    pub fn build_governing_service(&self) -> Service {
        Service {
            metadata: self.metadata(self.governing_service_name.clone()),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(self.db.offshoot_selectors()),
                ports: Some(vec![
                    ServicePort {
                        name: Some("db".to_string()),
                        port: DATABASE_PORT,
                        target_port: Some(IntOrString::Int(DATABASE_PORT)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    },
                    ServicePort {
                        name: Some("gossip".to_string()),
                        port: GOSSIP_PORT,
                        target_port: Some(IntOrString::Int(GOSSIP_PORT)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    },
                ]),
                publish_not_ready_addresses: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Client-facing service
    pub fn build_client_service(&self) -> Service {
        Service {
            metadata: self.metadata(self.db.offshoot_name()),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(self.db.offshoot_selectors()),
                ports: Some(vec![ServicePort {
                    name: Some("db".to_string()),
                    port: DATABASE_PORT,
                    target_port: Some(IntOrString::Int(DATABASE_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Stats service the monitoring agent scrapes; annotated with the agent
    /// type so the monitor manager can diff against the prior wiring
    pub fn build_stats_service(&self, agent_annotation: &str) -> Service {
        let port = self
            .db
            .spec
            .monitor
            .as_ref()
            .and_then(|m| m.exporter.map(|e| e.port))
            .unwrap_or(EXPORTER_PORT);

        let mut metadata = self.metadata(self.db.stats_service_name());
        metadata.annotations = Some(BTreeMap::from([(
            crate::crd::ANNOTATION_AGENT_TYPE.to_string(),
            agent_annotation.to_string(),
        )]));

        Service {
            metadata,
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(self.db.offshoot_selectors()),
                ports: Some(vec![ServicePort {
                    name: Some("metrics".to_string()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Auth secret with a generated password; only built when the user did
    /// not supply their own credentials secret
    pub fn build_auth_secret(&self) -> Secret {
        let password = Alphanumeric.sample_string(&mut rand::rng(), 20);
        let mut data = BTreeMap::new();
        data.insert(
            "username".to_string(),
            ByteString("root".as_bytes().to_vec()),
        );
        data.insert("password".to_string(), ByteString(password.into_bytes()));

        Secret {
            metadata: self.metadata(self.db.auth_secret_name()),
            type_: Some("Opaque".to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    /// ConfigMap holding the cluster-mode configuration file
    pub fn build_config_map(&self) -> ConfigMap {
        let mut conf = String::new();
        conf.push_str("cluster-enabled yes\n");
        conf.push_str("cluster-config-file /data/nodes.conf\n");
        conf.push_str("cluster-node-timeout 5000\n");
        conf.push_str(&format!("port {}\n", DATABASE_PORT));

        let mut data = BTreeMap::new();
        data.insert("keva.conf".to_string(), conf);

        ConfigMap {
            metadata: self.metadata(self.db.config_map_name()),
            data: Some(data),
            ..Default::default()
        }
    }

    /// ServiceAccount, Role and RoleBinding letting database pods inspect
    /// their own StatefulSet and peers
    pub fn build_rbac(&self) -> (ServiceAccount, Role, RoleBinding) {
        let sa = ServiceAccount {
            metadata: self.metadata(self.db.offshoot_name()),
            ..Default::default()
        };
        let role = Role {
            metadata: self.metadata(self.db.offshoot_name()),
            rules: Some(vec![
                PolicyRule {
                    api_groups: Some(vec!["apps".to_string()]),
                    resources: Some(vec!["statefulsets".to_string()]),
                    verbs: vec!["get".to_string()],
                    ..Default::default()
                },
                PolicyRule {
                    api_groups: Some(vec!["".to_string()]),
                    resources: Some(vec!["pods".to_string()]),
                    verbs: vec!["get".to_string(), "list".to_string()],
                    ..Default::default()
                },
            ]),
        };
        let binding = RoleBinding {
            metadata: self.metadata(self.db.offshoot_name()),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: self.db.offshoot_name(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: self.db.offshoot_name(),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            }]),
        };
        (sa, role, binding)
    }

    /// The database workload object
    pub fn build_statefulset(&self, rbac_enabled: bool) -> StatefulSet {
        let spec = &self.db.spec;
        let selector_labels = self.db.offshoot_selectors();

        let mut pod_labels = selector_labels.clone();
        pod_labels.extend(self.db.offshoot_labels());

        let container = self.build_db_container();
        let mut containers = vec![container];
        if let Some(exporter) = self.build_exporter_container() {
            containers.push(exporter);
        }

        let mut volumes: Vec<Volume> = vec![Volume {
            name: "auth".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(self.db.auth_secret_name()),
                ..Default::default()
            }),
            ..Default::default()
        }];
        if spec.mode == KevaMode::Cluster {
            volumes.push(Volume {
                name: "config".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: self.db.config_map_name(),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        // Ephemeral databases get an emptyDir instead of a claim template
        let volume_claim_templates = spec.storage.as_ref().map(|s| {
            let mut requests = BTreeMap::new();
            requests.insert("storage".to_string(), Quantity(s.size.clone()));
            vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("data".to_string()),
                    labels: Some(self.db.offshoot_labels()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(s.access_modes.clone()),
                    storage_class_name: s.storage_class_name.clone(),
                    resources: Some(k8s_openapi::api::core::v1::VolumeResourceRequirements {
                        requests: Some(requests),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]
        });
        if volume_claim_templates.is_none() {
            volumes.push(Volume {
                name: "data".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }

        let pod_spec = PodSpec {
            containers,
            volumes: Some(volumes),
            node_selector: if spec.node_selector.is_empty() {
                None
            } else {
                Some(spec.node_selector.clone())
            },
            service_account_name: rbac_enabled.then(|| self.db.offshoot_name()),
            ..Default::default()
        };

        StatefulSet {
            metadata: self.metadata(self.db.offshoot_name()),
            spec: Some(StatefulSetSpec {
                service_name: self.governing_service_name.clone(),
                // halting keeps the object but drains it to zero pods
                replicas: Some(if spec.halted { 0 } else { self.db.total_replicas() }),
                selector: LabelSelector {
                    match_labels: Some(selector_labels),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        annotations: if spec.pod_annotations.is_empty() {
                            None
                        } else {
                            Some(spec.pod_annotations.clone())
                        },
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                volume_claim_templates,
                pod_management_policy: Some("OrderedReady".to_string()),
                update_strategy: Some(k8s_openapi::api::apps::v1::StatefulSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_db_container(&self) -> Container {
        let spec = &self.db.spec;

        let mut env = vec![
            EnvVar {
                name: "KEVA_POD_NAME".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.name".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            EnvVar {
                name: "KEVA_GOVERNING_SERVICE".to_string(),
                value: Some(self.governing_service_name.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "KEVA_PASSWORD".to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: self.db.auth_secret_name(),
                        key: "password".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];

        let mut args = vec![format!("--port={}", DATABASE_PORT)];
        let mut volume_mounts = vec![
            VolumeMount {
                name: "data".to_string(),
                mount_path: "/data".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "auth".to_string(),
                mount_path: "/etc/keva/auth".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ];

        if spec.mode == KevaMode::Cluster {
            args.push("--config=/etc/keva/keva.conf".to_string());
            volume_mounts.push(VolumeMount {
                name: "config".to_string(),
                mount_path: "/etc/keva".to_string(),
                ..Default::default()
            });
        }
        if let Some(init) = &spec.init {
            if let Some(script) = &init.script_path {
                args.push(format!("--init-script={}", script));
            }
            if let Some(snapshot) = &init.snapshot_name {
                env.push(EnvVar {
                    name: "KEVA_RESTORE_SNAPSHOT".to_string(),
                    value: Some(snapshot.clone()),
                    ..Default::default()
                });
            }
        }

        let mut ports = vec![ContainerPort {
            name: Some("db".to_string()),
            container_port: DATABASE_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }];
        if spec.mode == KevaMode::Cluster {
            ports.push(ContainerPort {
                name: Some("gossip".to_string()),
                container_port: GOSSIP_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }

        Container {
            name: "keva".to_string(),
            image: Some(self.db_image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            args: Some(args),
            env: Some(env),
            ports: Some(ports),
            resources: spec.resources.clone(),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        }
    }

    /// Exporter sidecar; only present when monitoring is requested
    fn build_exporter_container(&self) -> Option<Container> {
        let monitor = self.db.spec.monitor.as_ref()?;
        let image = self.exporter_image.clone()?;
        let port = monitor.exporter.map(|e| e.port).unwrap_or(EXPORTER_PORT);

        Some(Container {
            name: "exporter".to_string(),
            image: Some(image),
            image_pull_policy: Some("IfNotPresent".to_string()),
            args: Some(vec![
                "export".to_string(),
                format!("--address=:{}", port),
                format!("--db-addr=localhost:{}", DATABASE_PORT),
            ]),
            ports: Some(vec![ContainerPort {
                name: Some("metrics".to_string()),
                container_port: port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        })
    }

    /// Connection-info projection for other systems
    pub fn build_app_binding(&self, resolved_version: &str) -> AppBinding {
        AppBinding {
            metadata: self.metadata(self.db.offshoot_name()),
            spec: AppBindingSpec {
                type_: "kevadatabases.keva.dev".to_string(),
                version: resolved_version.to_string(),
                client_config: ClientConfig {
                    service: ServiceReference {
                        scheme: "keva".to_string(),
                        name: self.db.offshoot_name(),
                        port: DATABASE_PORT,
                    },
                    insecure_skip_tls_verify: false,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        AgentType, ClusterTopology, ExporterSpec, KevaDatabaseSpec, MonitorSpec, StorageSpec,
        TerminationPolicy,
    };

    fn sample_database(name: &str) -> KevaDatabase {
        KevaDatabase {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-123".to_string()),
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

    fn builder(db: &KevaDatabase) -> ResourceBuilder<'_> {
        ResourceBuilder::new(db, "keva/keva:4.0", Some("keva/exporter:v1".to_string())).unwrap()
    }

    #[test]
    fn governing_service_is_headless() {
        let db = sample_database("mydb");
        let svc = builder(&db).build_governing_service();
        assert_eq!(svc.metadata.name, Some("mydb-pods".to_string()));
        assert_eq!(
            svc.spec.as_ref().unwrap().cluster_ip,
            Some("None".to_string())
        );
        assert_eq!(
            svc.spec.as_ref().unwrap().publish_not_ready_addresses,
            Some(true)
        );
    }

    #[test]
    fn statefulset_standalone_has_one_replica() {
        let db = sample_database("mydb");
        let sts = builder(&db).build_statefulset(false);
        assert_eq!(sts.metadata.name, Some("mydb".to_string()));
        assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(1));
        assert_eq!(sts.spec.as_ref().unwrap().service_name, "mydb-pods");
        // durable storage: claim template, no emptyDir data volume
        assert!(sts.spec.as_ref().unwrap().volume_claim_templates.is_some());
    }

    #[test]
    fn statefulset_cluster_scales_by_topology() {
        let mut db = sample_database("mydb");
        db.spec.mode = KevaMode::Cluster;
        db.spec.cluster = Some(ClusterTopology {
            master: 3,
            replicas: 1,
        });
        let sts = builder(&db).build_statefulset(false);
        assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(6));
    }

    #[test]
    fn halted_database_drains_to_zero() {
        let mut db = sample_database("mydb");
        db.spec.halted = true;
        let sts = builder(&db).build_statefulset(false);
        assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(0));
    }

    #[test]
    fn governing_suffix_is_configurable() {
        let db = sample_database("mydb");
        let b = builder(&db).governing_service_suffix("gvr");
        let svc = b.build_governing_service();
        assert_eq!(svc.metadata.name, Some("mydb-gvr".to_string()));
        let sts = b.build_statefulset(false);
        assert_eq!(sts.spec.as_ref().unwrap().service_name, "mydb-gvr");
    }

    #[test]
    fn ephemeral_database_uses_empty_dir() {
        let mut db = sample_database("mydb");
        db.spec.storage = None;
        let sts = builder(&db).build_statefulset(false);
        let spec = sts.spec.as_ref().unwrap();
        assert!(spec.volume_claim_templates.is_none());
        let volumes = spec
            .template
            .spec
            .as_ref()
            .unwrap()
            .volumes
            .as_ref()
            .unwrap();
        assert!(volumes
            .iter()
            .any(|v| v.name == "data" && v.empty_dir.is_some()));
    }

    #[test]
    fn exporter_sidecar_added_when_monitored() {
        let mut db = sample_database("mydb");
        db.spec.monitor = Some(MonitorSpec {
            agent: AgentType::PrometheusBuiltin,
            exporter: Some(ExporterSpec { port: 4567 }),
        });
        let sts = builder(&db).build_statefulset(false);
        let containers = &sts
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers;
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[1].name, "exporter");
    }

    #[test]
    fn offshoots_carry_owner_reference() {
        let db = sample_database("mydb");
        let sts = builder(&db).build_statefulset(false);
        let refs = sts.metadata.owner_references.as_ref().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, "KevaDatabase");
        assert_eq!(refs[0].name, "mydb");
        assert_eq!(refs[0].controller, Some(true));
    }

    #[test]
    fn rbac_binding_references_role_and_account() {
        let db = sample_database("mydb");
        let (sa, role, binding) = builder(&db).build_rbac();
        assert_eq!(sa.metadata.name, Some("mydb".to_string()));
        assert_eq!(role.metadata.name, Some("mydb".to_string()));
        assert_eq!(binding.role_ref.name, "mydb");
        assert_eq!(binding.subjects.as_ref().unwrap()[0].kind, "ServiceAccount");
    }

    #[test]
    fn rbac_enables_service_account_on_pods() {
        let db = sample_database("mydb");
        let sts = builder(&db).build_statefulset(true);
        assert_eq!(
            sts.spec
                .unwrap()
                .template
                .spec
                .unwrap()
                .service_account_name,
            Some("mydb".to_string())
        );
    }

    #[test]
    fn app_binding_exposes_connection_coordinates() {
        let db = sample_database("mydb");
        let binding = builder(&db).build_app_binding("4.0.11");
        assert_eq!(binding.spec.client_config.service.scheme, "keva");
        assert_eq!(binding.spec.client_config.service.name, "mydb");
        assert_eq!(binding.spec.client_config.service.port, DATABASE_PORT);
        assert_eq!(binding.spec.version, "4.0.11");
    }

    #[test]
    fn auth_secret_has_credentials() {
        let db = sample_database("mydb");
        let secret = builder(&db).build_auth_secret();
        assert_eq!(secret.metadata.name, Some("mydb-auth".to_string()));
        let data = secret.data.as_ref().unwrap();
        assert!(data.contains_key("username"));
        assert_eq!(data.get("password").unwrap().0.len(), 20);
    }

    #[test]
    fn config_map_only_meaningful_for_cluster() {
        let db = sample_database("mydb");
        let cm = builder(&db).build_config_map();
        assert_eq!(cm.metadata.name, Some("mydb-config".to_string()));
        assert!(cm
            .data
            .as_ref()
            .unwrap()
            .get("keva.conf")
            .unwrap()
            .contains("cluster-enabled yes"));
    }
}
