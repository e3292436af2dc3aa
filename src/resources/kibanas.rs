use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PodTemplateSpec, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{CustomResource, ResourceExt};
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{Error, Result};

pub static KIBANA_FINALIZER: &str = "kibana.k8s.elastic.co/finalizer";

/// Finalizers set by earlier operator releases; they are removed on sight.
pub static LEGACY_FINALIZERS: [&str; 2] = [
    "finalizer.kibana.k8s.elastic.co/secure-settings-secret",
    "finalizer.kibana.k8s.elastic.co/http-certificates-secret",
];

/// Set to "false" to pause reconciliation of a resource.
pub static MANAGED_ANNOTATION: &str = "eck.k8s.elastic.co/managed";
/// Set to "true" to allow `spec.version` to move backwards.
pub static DISABLE_DOWNGRADE_VALIDATION_ANNOTATION: &str =
    "eck.k8s.elastic.co/disable-downgrade-validation";
/// Resolved Elasticsearch association, written by the association controller.
pub static ES_ASSOCIATION_CONF_ANNOTATION: &str = "association.k8s.elastic.co/es-conf";
/// Resolved Enterprise Search association.
pub static ENT_ASSOCIATION_CONF_ANNOTATION: &str = "association.k8s.elastic.co/ent-conf";
pub static LAST_APPLIED_CONFIGURATION_ANNOTATION: &str =
    "kubectl.kubernetes.io/last-applied-configuration";

/// Kibana describes a Kibana deployment and its connection to Elasticsearch.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Kibana",
    group = "kibana.k8s.elastic.co",
    version = "v1",
    namespaced,
    category = "elastic",
    scale = r#"{"specReplicasPath": ".spec.count", "statusReplicasPath": ".status.count", "labelSelectorPath": ".status.selector"}"#,
    printcolumn = r#"{"name":"Health", "type":"string", "jsonPath":".status.health"}"#,
    printcolumn = r#"{"name":"Nodes", "type":"integer", "description": "Available nodes", "jsonPath":".status.availableNodes"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "description": "Kibana version", "jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "KibanaStatus", shortname = "kb")]
#[serde(rename_all = "camelCase")]
pub struct KibanaSpec {
    /// Version of Kibana.
    pub version: String,

    /// Image is the Kibana Docker image to deploy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Count of Kibana instances to deploy. Defaults to 1.
    #[serde(default = "default_count")]
    #[schemars(range(min = 0))]
    pub count: i32,

    /// ElasticsearchRef is a reference to an Elasticsearch cluster running in the same Kubernetes cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elasticsearch_ref: Option<ObjectSelector>,

    /// EnterpriseSearchRef is a reference to an EnterpriseSearch running in the same Kubernetes cluster.
    /// Kibana provides the default Enterprise Search UI starting version 7.14.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise_search_ref: Option<ObjectSelector>,

    /// Config holds the Kibana configuration. See: https://www.elastic.co/guide/en/kibana/current/settings.html
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "free_form_schema")]
    pub config: Option<serde_json::Value>,

    /// HTTP holds the HTTP layer configuration for Kibana.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfig>,

    /// PodTemplate provides customisation options (labels, annotations, affinity rules, resource requests, and so on) for the Kibana pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "free_form_schema")]
    pub pod_template: Option<PodTemplateSpec>,

    /// RevisionHistoryLimit is the number of revisions to retain to allow rollback in the underlying Deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,

    /// SecureSettings is a list of references to Kubernetes secrets containing sensitive configuration options for Kibana.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_settings: Option<Vec<SecretSource>>,

    /// ServiceAccountName is used to check access from the current resource to a resource (for ex. Elasticsearch) in a different namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Monitoring enables you to collect and ship log and monitoring data of this Kibana.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<Monitoring>,
}

fn default_count() -> i32 {
    1
}

fn free_form_schema(_g: &mut schemars::gen::SchemaGenerator) -> Schema {
    serde_json::from_value(json!({
        "type": "object",
        "nullable": true,
        "x-kubernetes-preserve-unknown-fields": true
    }))
    .unwrap()
}

/// ObjectSelector defines a reference to a Kubernetes object which can be an Elastic resource managed by the operator
/// or a Secret describing an external Elastic resource not managed by the operator.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSelector {
    /// Name of an existing Kubernetes object corresponding to an Elastic resource managed by ECK.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Namespace of the Kubernetes object. If empty, defaults to the current namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// ServiceName is the name of an existing Kubernetes service which is used to make requests to the referenced
    /// object. It has to be in the same namespace as the referenced resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    /// SecretName is the name of an existing Kubernetes secret that contains connection information for associating an
    /// Elastic resource not managed by the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

impl ObjectSelector {
    /// A reference is set when it points to anything at all.
    pub fn is_defined(&self) -> bool {
        non_empty(&self.name) || non_empty(&self.secret_name)
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    /// Service defines the template for the associated Kubernetes Service object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceTemplate>,
    /// TLS defines options for configuring TLS for HTTP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "free_form_schema")]
    pub metadata: Option<ObjectMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "free_form_schema")]
    pub spec: Option<ServiceSpec>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsOptions {
    /// SelfSignedCertificate allows configuring the self-signed certificate generated by the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_signed_certificate: Option<SelfSignedCertificate>,
    /// Certificate is a reference to a Kubernetes secret that contains the certificate and private key for enabling TLS.
    /// The referenced secret should contain the following:
    ///
    /// - `ca.crt`: The certificate authority (optional).
    /// - `tls.crt`: The certificate (or a chain).
    /// - `tls.key`: The private key to the first certificate in the certificate chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<SecretRef>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelfSignedCertificate {
    #[serde(
        default,
        rename = "subjectAltNames",
        skip_serializing_if = "Option::is_none"
    )]
    pub subject_alt_names: Option<Vec<SubjectAlternativeName>>,
    /// Disabled indicates that the provisioning of the self-signed certificate should be disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
pub struct SubjectAlternativeName {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub secret_name: String,
}

/// SecretSource defines a data source based on a Kubernetes Secret.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretSource {
    /// SecretName is the name of the secret.
    pub secret_name: String,
    /// Entries define how to project each key-value pair in the secret to filesystem paths.
    /// If not defined, all keys will be projected to similarly named paths in the filesystem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<KeyToPath>>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyToPath {
    /// Key is the key contained in the secret.
    pub key: String,
    /// Path is the relative file path to map the key to. Defaults to the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Monitoring {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MonitoringTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<MonitoringTarget>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringTarget {
    /// ElasticsearchRefs is a reference to a list of monitoring Elasticsearch clusters running in the same Kubernetes cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elasticsearch_refs: Option<Vec<ObjectSelector>>,
}

impl MonitoringTarget {
    pub fn refs(&self) -> &[ObjectSelector] {
        self.elasticsearch_refs.as_deref().unwrap_or_default()
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum KibanaHealth {
    #[default]
    Unknown,
    Red,
    Green,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum AssociationStatus {
    #[default]
    Unknown,
    Pending,
    Established,
    Failed,
}

/// Status of the Kibana. This is set and managed automatically.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KibanaStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_nodes: Option<i32>,
    /// Version of the stack resource currently running. During version upgrades, multiple versions may run
    /// in parallel: this value specifies the lowest version currently running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<KibanaHealth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association_status: Option<AssociationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise_search_association_status: Option<AssociationStatus>,
    /// ObservedGeneration is the most recent generation observed for this Kibana instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl KibanaStatus {
    /// Health went from green to anything else.
    pub fn is_degraded(&self, previous: Option<&KibanaStatus>) -> bool {
        previous.and_then(|p| p.health) == Some(KibanaHealth::Green)
            && self.health != Some(KibanaHealth::Green)
    }
}

/// Connection details resolved for an association, as recorded in the association annotation.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssociationConf {
    #[serde(default)]
    pub auth_secret_name: String,
    #[serde(default)]
    pub auth_secret_key: String,
    #[serde(default)]
    pub is_service_account: bool,
    #[serde(default)]
    pub ca_cert_provided: bool,
    #[serde(default)]
    pub ca_secret_name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub version: String,
}

/// Secret name used when the referenced cluster does not require authentication.
const NO_AUTH_REQUIRED: &str = "-";

impl AssociationConf {
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty()
    }

    pub fn auth_is_configured(&self) -> bool {
        !self.auth_secret_name.is_empty() && self.auth_secret_name != NO_AUTH_REQUIRED
    }

    pub fn ca_is_configured(&self) -> bool {
        !self.ca_secret_name.is_empty()
    }
}

impl Kibana {
    pub fn is_unmanaged(&self) -> bool {
        self.annotations()
            .get(MANAGED_ANNOTATION)
            .is_some_and(|v| v == "false")
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn tls(&self) -> Option<&TlsOptions> {
        self.spec.http.as_ref().and_then(|h| h.tls.as_ref())
    }

    /// User provided certificate secret, if any.
    pub fn custom_certificate(&self) -> Option<&str> {
        self.tls()
            .and_then(|t| t.certificate.as_ref())
            .map(|c| c.secret_name.as_str())
            .filter(|n| !n.is_empty())
    }

    /// TLS is on unless the self-signed certificate is disabled and no certificate was provided.
    pub fn tls_enabled(&self) -> bool {
        let self_signed_disabled = self
            .tls()
            .and_then(|t| t.self_signed_certificate.as_ref())
            .and_then(|s| s.disabled)
            .unwrap_or(false);
        !self_signed_disabled || self.custom_certificate().is_some()
    }

    pub fn protocol(&self) -> &'static str {
        if self.tls_enabled() {
            "https"
        } else {
            "http"
        }
    }

    pub fn user_subject_alt_names(&self) -> &[SubjectAlternativeName] {
        self.tls()
            .and_then(|t| t.self_signed_certificate.as_ref())
            .and_then(|s| s.subject_alt_names.as_deref())
            .unwrap_or_default()
    }

    /// Elasticsearch reference, if one is set.
    pub fn es_ref(&self) -> Option<&ObjectSelector> {
        self.spec
            .elasticsearch_ref
            .as_ref()
            .filter(|r| r.is_defined())
    }

    /// Enterprise Search reference, if one is set.
    pub fn ent_ref(&self) -> Option<&ObjectSelector> {
        self.spec
            .enterprise_search_ref
            .as_ref()
            .filter(|r| r.is_defined())
    }

    pub fn secure_settings(&self) -> &[SecretSource] {
        self.spec.secure_settings.as_deref().unwrap_or_default()
    }

    pub fn metrics_monitoring_refs(&self) -> &[ObjectSelector] {
        self.spec
            .monitoring
            .as_ref()
            .and_then(|m| m.metrics.as_ref())
            .map(MonitoringTarget::refs)
            .unwrap_or_default()
    }

    pub fn logs_monitoring_refs(&self) -> &[ObjectSelector] {
        self.spec
            .monitoring
            .as_ref()
            .and_then(|m| m.logs.as_ref())
            .map(MonitoringTarget::refs)
            .unwrap_or_default()
    }

    /// Resolved Elasticsearch association, `None` when the annotation is absent.
    pub fn es_association_conf(&self) -> Result<Option<AssociationConf>> {
        self.association_conf(ES_ASSOCIATION_CONF_ANNOTATION)
    }

    /// Resolved Enterprise Search association, `None` when the annotation is absent.
    pub fn ent_association_conf(&self) -> Result<Option<AssociationConf>> {
        self.association_conf(ENT_ASSOCIATION_CONF_ANNOTATION)
    }

    fn association_conf(&self, annotation: &str) -> Result<Option<AssociationConf>> {
        match self.annotations().get(annotation) {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => serde_json::from_str(raw).map(Some).map_err(|source| {
                Error::InvalidAssociationConf {
                    annotation: annotation.into(),
                    source,
                }
            }),
        }
    }

    /// Labels identifying the objects belonging to this Kibana.
    pub fn identity_labels(&self) -> BTreeMap<String, String> {
        crate::controllers::kibana::reconcilers::identity_labels(&self.name_any())
    }
}
