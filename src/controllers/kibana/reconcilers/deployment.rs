//! The Deployment running the Kibana pods, its update strategy and the status derived from it.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use semver::Version;
use tracing::debug;

use crate::resources::kibanas::{Kibana, KibanaHealth, KibanaStatus};
use crate::{version, Error};

use super::{apply, deployment_name, label_selector, object_meta, selector_string, NAME_LABEL, VERSION_LABEL};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyType {
    RollingUpdate,
    Recreate,
}

impl StrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::RollingUpdate => "RollingUpdate",
            StrategyType::Recreate => "Recreate",
        }
    }
}

/// Kibana cannot run two versions side by side: as soon as one live pod runs another
/// version than `version`, or carries no version label at all, pods are replaced all at
/// once instead of rolled.
pub fn strategy_type(pods: &[Pod], version: &str) -> StrategyType {
    let mismatch = pods
        .iter()
        .any(|pod| pod.labels().get(VERSION_LABEL).is_none_or(|v| v != version));
    if mismatch {
        StrategyType::Recreate
    } else {
        StrategyType::RollingUpdate
    }
}

/// Pods currently belonging to the Kibana.
pub async fn list_pods(client: kube::Client, kb: &Kibana) -> Result<Vec<Pod>, Error> {
    let pods: Api<Pod> = Api::namespaced(client, &kb.namespace().unwrap_or_default());
    let selector = format!("{}={}", NAME_LABEL, kb.name_any());
    Ok(pods.list(&ListParams::default().labels(&selector)).await?.items)
}

pub struct DeploymentParams {
    pub replicas: i32,
    pub revision_history_limit: Option<i32>,
    pub pod_template: PodTemplateSpec,
    pub strategy: StrategyType,
}

pub fn new_deployment(kb: &Kibana, base_metadata: &ObjectMeta, params: DeploymentParams) -> Deployment {
    let kb_name = kb.name_any();
    Deployment {
        metadata: object_meta(base_metadata, deployment_name(&kb_name)),
        spec: Some(DeploymentSpec {
            replicas: Some(params.replicas),
            revision_history_limit: params.revision_history_limit,
            selector: label_selector(&kb_name),
            strategy: Some(DeploymentStrategy {
                type_: Some(params.strategy.as_str().into()),
                rolling_update: None,
            }),
            template: params.pod_template,
            ..Default::default()
        }),
        status: None,
    }
}

pub async fn reconcile_deployment(client: kube::Client, expected: &Deployment) -> Result<Deployment, Error> {
    let name = expected.name_any();
    let deployments: Api<Deployment> =
        Api::namespaced(client, expected.metadata.namespace.as_deref().unwrap_or_default());
    apply(&deployments, &name, expected).await
}

/// Lowest version among the pods' version labels. Pods without a parseable label are
/// skipped; without any, `current` is kept.
pub fn lowest_version_from_pods(current: Option<&str>, pods: &[Pod]) -> Option<String> {
    let lowest = pods
        .iter()
        .filter_map(|pod| {
            let raw = pod.labels().get(VERSION_LABEL)?;
            match version::parse(raw) {
                Ok(v) => Some((v, raw.clone())),
                Err(e) => {
                    debug!("Ignoring version label {} of pod {}: {}", raw, pod.name_any(), e);
                    None
                }
            }
        })
        .min_by(|(a, _): &(Version, String), (b, _)| a.cmp(b))
        .map(|(_, raw)| raw);
    lowest.or_else(|| current.map(str::to_string))
}

/// Folds the deployment and its pods into the Kibana status, keeping the fields owned by
/// others (association status, observed generation).
pub fn deployment_status(current: &KibanaStatus, deployment: &Deployment, pods: &[Pod]) -> KibanaStatus {
    let dep_status = deployment.status.as_ref();
    let available = dep_status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Available" && c.status == "True")
        });
    let selector = deployment
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.as_ref())
        .map(selector_string);

    KibanaStatus {
        available_nodes: Some(dep_status.and_then(|s| s.available_replicas).unwrap_or(0)),
        count: Some(dep_status.and_then(|s| s.replicas).unwrap_or(0)),
        selector,
        version: lowest_version_from_pods(current.version.as_deref(), pods),
        health: Some(if available {
            KibanaHealth::Green
        } else {
            KibanaHealth::Red
        }),
        ..current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};
    use std::collections::BTreeMap;

    fn pod(name: &str, version: Option<&str>) -> Pod {
        let mut labels = BTreeMap::from([(NAME_LABEL.to_string(), "test".to_string())]);
        if let Some(version) = version {
            labels.insert(VERSION_LABEL.into(), version.into());
        }
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn rolling_update_without_pods() {
        assert_eq!(strategy_type(&[], "7.17.0"), StrategyType::RollingUpdate);
    }

    #[test]
    fn rolling_update_when_versions_match() {
        let pods = vec![pod("a", Some("7.17.0")), pod("b", Some("7.17.0"))];
        assert_eq!(strategy_type(&pods, "7.17.0"), StrategyType::RollingUpdate);
    }

    #[test]
    fn recreate_on_version_change() {
        let pods = vec![
            pod("a", Some("7.5.0")),
            pod("b", Some("7.5.0")),
            pod("c", Some("7.5.0")),
        ];
        assert_eq!(strategy_type(&pods, "7.6.0"), StrategyType::Recreate);
    }

    #[test]
    fn recreate_on_missing_label() {
        let pods = vec![pod("a", Some("7.17.0")), pod("b", None)];
        assert_eq!(strategy_type(&pods, "7.17.0"), StrategyType::Recreate);
    }

    #[test]
    fn deployment_shape() {
        let mut kb = Kibana::new("test", Default::default());
        kb.metadata.namespace = Some("ns".into());
        let base = ObjectMeta {
            namespace: Some("ns".into()),
            ..Default::default()
        };
        let dep = new_deployment(
            &kb,
            &base,
            DeploymentParams {
                replicas: 3,
                revision_history_limit: Some(2),
                pod_template: PodTemplateSpec::default(),
                strategy: StrategyType::Recreate,
            },
        );
        assert_eq!(dep.metadata.name.as_deref(), Some("test-kb"));
        let spec = dep.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.revision_history_limit, Some(2));
        assert_eq!(spec.strategy.unwrap().type_.as_deref(), Some("Recreate"));
        assert_eq!(
            spec.selector.match_labels.unwrap()[NAME_LABEL],
            "test".to_string()
        );
    }

    #[test]
    fn lowest_version() {
        let pods = vec![
            pod("a", Some("7.17.0")),
            pod("b", Some("7.9.3")),
            pod("c", Some("not-a-version")),
            pod("d", None),
        ];
        assert_eq!(lowest_version_from_pods(Some("7.17.0"), &pods).as_deref(), Some("7.9.3"));
        assert_eq!(lowest_version_from_pods(Some("7.17.0"), &[]).as_deref(), Some("7.17.0"));
        assert_eq!(lowest_version_from_pods(None, &[]), None);
    }

    fn deployment(available: &str) -> Deployment {
        let mut kb = Kibana::new("test", Default::default());
        kb.metadata.namespace = Some("ns".into());
        let mut dep = new_deployment(
            &kb,
            &ObjectMeta::default(),
            DeploymentParams {
                replicas: 2,
                revision_history_limit: None,
                pod_template: PodTemplateSpec::default(),
                strategy: StrategyType::RollingUpdate,
            },
        );
        dep.status = Some(DeploymentStatus {
            replicas: Some(2),
            available_replicas: Some(1),
            conditions: Some(vec![DeploymentCondition {
                type_: "Available".into(),
                status: available.into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        dep
    }

    #[test]
    fn status_from_deployment() {
        let current = KibanaStatus {
            observed_generation: Some(4),
            ..Default::default()
        };
        let pods = vec![pod("a", Some("8.5.0"))];
        let status = deployment_status(&current, &deployment("True"), &pods);
        assert_eq!(status.available_nodes, Some(1));
        assert_eq!(status.count, Some(2));
        assert_eq!(status.health, Some(KibanaHealth::Green));
        assert_eq!(status.version.as_deref(), Some("8.5.0"));
        assert_eq!(
            status.selector.as_deref(),
            Some("common.k8s.elastic.co/type=kibana,kibana.k8s.elastic.co/name=test")
        );
        assert_eq!(status.observed_generation, Some(4));

        let status = deployment_status(&current, &deployment("False"), &pods);
        assert_eq!(status.health, Some(KibanaHealth::Red));
    }
}
