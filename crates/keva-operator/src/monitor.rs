//! Monitoring agent reconciliation
//!
//! Keeps the stats service wired to the agent the spec asks for. The service
//! carries an annotation recording which agent it was wired for; when the
//! spec switches agents the old wiring is torn down before the new service is
//! applied, since the two agents expect different scrape configurations.
//!
//! Monitoring failures are reported to the caller but must never block the
//! database itself; the controller treats them as warnings.

use crate::crd::{AgentType, KevaDatabase, ANNOTATION_AGENT_TYPE};
use crate::ensure::{ensure, VerbType};
use crate::error::Result;
use crate::resources::ResourceBuilder;
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use kube::Client;
use tracing::info;

/// Whether the live stats service was wired for a different agent than the
/// one now requested
pub fn agent_changed(recorded: Option<&str>, desired: AgentType) -> bool {
    match recorded {
        Some(a) => a != desired.as_str(),
        None => false,
    }
}

/// Outcome of a monitor reconcile, surfaced in events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Stats service created or patched for the requested agent
    Configured(VerbType),
    /// Old agent wiring removed and the service rebuilt
    AgentReplaced,
    /// Monitoring not requested and no stale wiring found
    NotRequested,
    /// Stale stats service removed after monitoring was switched off
    Removed,
}

/// Reconciles monitoring wiring for databases
pub struct MonitorManager {
    client: Client,
}

impl MonitorManager {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn reconcile(
        &self,
        db: &KevaDatabase,
        builder: &ResourceBuilder<'_>,
    ) -> Result<MonitorOutcome> {
        let namespace = db
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let services: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        let stats_name = db.stats_service_name();

        let Some(monitor) = &db.spec.monitor else {
            // monitoring switched off: tear down any stale stats service
            return match services.delete(&stats_name, &Default::default()).await {
                Ok(_) => {
                    info!(db = %db.offshoot_name(), "removed stats service");
                    Ok(MonitorOutcome::Removed)
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(MonitorOutcome::NotRequested),
                Err(e) => Err(e.into()),
            };
        };

        let recorded = services
            .get_opt(&stats_name)
            .await?
            .and_then(|svc| svc.metadata.annotations)
            .and_then(|a| a.get(ANNOTATION_AGENT_TYPE).cloned());

        let replaced = agent_changed(recorded.as_deref(), monitor.agent);
        if replaced {
            info!(
                db = %db.offshoot_name(),
                from = recorded.as_deref().unwrap_or(""),
                to = monitor.agent.as_str(),
                "monitoring agent changed, rebuilding stats service"
            );
            services.delete(&stats_name, &Default::default()).await?;
        }

        let desired = builder.build_stats_service(monitor.agent.as_str());
        let verb = ensure(&services, &db.offshoot_name(), desired).await?;
        if replaced {
            Ok(MonitorOutcome::AgentReplaced)
        } else {
            Ok(MonitorOutcome::Configured(verb))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_wiring_is_not_a_change() {
        assert!(!agent_changed(None, AgentType::PrometheusBuiltin));
    }

    #[test]
    fn same_agent_is_not_a_change() {
        assert!(!agent_changed(
            Some("prometheus.io/builtin"),
            AgentType::PrometheusBuiltin
        ));
    }

    #[test]
    fn switching_agents_is_a_change() {
        assert!(agent_changed(
            Some("prometheus.io/builtin"),
            AgentType::PrometheusOperator
        ));
        assert!(agent_changed(
            Some("prometheus.io/operator"),
            AgentType::PrometheusBuiltin
        ));
    }
}
