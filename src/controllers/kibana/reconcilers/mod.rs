use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, Preconditions};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::resources::kibanas::Kibana;
use crate::Error;

pub mod association;
pub mod certificates;
pub mod config;
pub mod deployment;
pub mod keystore;
pub mod pod;
pub mod quantity;
pub mod scripts;
pub mod service;

pub const FIELD_MANAGER: &str = "kibana-operator";

pub const TYPE_LABEL: &str = "common.k8s.elastic.co/type";
pub const KIBANA_TYPE: &str = "kibana";
pub const NAME_LABEL: &str = "kibana.k8s.elastic.co/name";
pub const VERSION_LABEL: &str = "kibana.k8s.elastic.co/version";
pub const CONFIG_HASH_ANNOTATION: &str = "kibana.k8s.elastic.co/config-hash";

pub const SOFT_OWNER_NAMESPACE_LABEL: &str = "eck.k8s.elastic.co/owner-namespace";
pub const SOFT_OWNER_NAME_LABEL: &str = "eck.k8s.elastic.co/owner-name";
pub const SOFT_OWNER_KIND_LABEL: &str = "eck.k8s.elastic.co/owner-kind";

/// Kibana listens on this port, with or without TLS.
pub const HTTP_PORT: i32 = 5601;

pub const REASON_ASSOCIATION_ERROR: &str = "AssociationError";
pub const REASON_ASSOCIATION_NOT_ESTABLISHED: &str = "AssociationNotEstablished";
pub const REASON_DELAYED: &str = "Delayed";
pub const REASON_RECONCILIATION_ERROR: &str = "ReconciliationError";
pub const REASON_VALIDATION: &str = "Validation";
pub const REASON_UNHEALTHY: &str = "Unhealthy";
pub const REASON_UNEXPECTED: &str = "Unexpected";

fn suffixed(kb_name: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        format!("{kb_name}-kb")
    } else {
        format!("{kb_name}-kb-{suffix}")
    }
}

pub fn deployment_name(kb_name: &str) -> String {
    suffixed(kb_name, "")
}

pub fn http_service_name(kb_name: &str) -> String {
    suffixed(kb_name, "http")
}

pub fn config_secret_name(kb_name: &str) -> String {
    suffixed(kb_name, "config")
}

pub fn scripts_config_map_name(kb_name: &str) -> String {
    suffixed(kb_name, "scripts")
}

pub fn ca_secret_name(kb_name: &str) -> String {
    suffixed(kb_name, "http-ca-internal")
}

pub fn internal_certs_secret_name(kb_name: &str) -> String {
    suffixed(kb_name, "http-certs-internal")
}

pub fn public_certs_secret_name(kb_name: &str) -> String {
    suffixed(kb_name, "http-certs-public")
}

pub fn secure_settings_secret_name(kb_name: &str) -> String {
    suffixed(kb_name, "secure-settings")
}

/// Labels selecting every object, pods included, that belongs to one Kibana.
pub fn identity_labels(kb_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from_iter([
        (TYPE_LABEL.into(), KIBANA_TYPE.into()),
        (NAME_LABEL.into(), kb_name.into()),
    ])
}

pub fn label_selector(kb_name: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(identity_labels(kb_name)),
        match_expressions: None,
    }
}

/// Renders labels as a selector string, `k1=v1,k2=v2`.
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Labels marking a secret as belonging to a Kibana without an owner reference.
pub fn soft_owner_labels(namespace: &str, kb_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from_iter([
        (SOFT_OWNER_NAMESPACE_LABEL.into(), namespace.into()),
        (SOFT_OWNER_NAME_LABEL.into(), kb_name.into()),
        (SOFT_OWNER_KIND_LABEL.into(), Kibana::kind(&()).into_owned()),
    ])
}

/// Metadata shared by every object derived from a Kibana: namespace, identity labels and
/// a controller reference so that the objects are collected with their owner.
pub fn base_metadata(kb: &Kibana) -> ObjectMeta {
    ObjectMeta {
        namespace: kb.namespace(),
        labels: Some(kb.identity_labels()),
        owner_references: kb.controller_owner_ref(&()).map(|oref| vec![oref]),
        ..Default::default()
    }
}

pub fn object_meta(base_metadata: &ObjectMeta, name: impl Into<String>) -> ObjectMeta {
    let mut meta = base_metadata.clone();
    meta.name = Some(name.into());
    meta
}

/// Server-side applies `obj`, taking ownership of every field it sets.
pub async fn apply<K>(api: &Api<K>, name: &str, obj: &K) -> Result<K, Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let params = PatchParams::apply(FIELD_MANAGER).force();
    debug!(
        "Applying {} {} in namespace {}",
        K::kind(&()),
        name,
        obj.meta().namespace.as_deref().unwrap_or_default()
    );
    Ok(api.patch(name, &params, &Patch::Apply(obj)).await?)
}

/// Deletes an object, treating an already missing object as success.
pub async fn delete<K>(api: &Api<K>, name: &str) -> Result<(), Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    debug!("Deleting {} {}", K::kind(&()), name);
    match api.delete(name, &DeleteParams::default()).await {
        Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => Ok(()),
        Err(err) => Err(err.into()),
        Ok(_) => Ok(()),
    }
}

/// Deletes secrets soft-owned by a Kibana that no longer exists.
pub async fn garbage_collect_soft_owned_secrets(
    secret_api: &Api<Secret>,
    namespace: &str,
    kb_name: &str,
) -> Result<(), Error> {
    let selector = selector_string(&soft_owner_labels(namespace, kb_name));
    let secrets = secret_api
        .list_metadata(&ListParams::default().labels(&selector))
        .await?;
    for secret in secrets {
        let name = secret.name_any();
        debug!(
            "Garbage collecting soft-owned Secret {} of Kibana {}/{}",
            name, namespace, kb_name
        );
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: secret.uid(),
                resource_version: None,
            }),
            ..Default::default()
        };
        match secret_api.delete(&name, &params).await {
            Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => {}
            Err(err) => return Err(err.into()),
            Ok(_) => {}
        }
    }
    Ok(())
}

/// Publishes an event on the Kibana; failing to do so is logged and otherwise ignored.
pub async fn emit_event(
    recorder: &Recorder,
    kb: &Kibana,
    type_: EventType,
    reason: &str,
    note: String,
) {
    let event = Event {
        type_,
        reason: reason.into(),
        note: Some(note),
        action: "Reconcile".into(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(&event, &kb.object_ref(&())).await {
        warn!("Failed to publish {} event: {}", reason, e);
    }
}

/// Reads a secret, `None` when it does not exist.
pub async fn get_secret(secret_api: &Api<Secret>, name: &str) -> Result<Option<Secret>, Error> {
    Ok(secret_api.get_opt(name).await?)
}

/// Raw bytes of one key of a secret.
pub fn secret_data<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|b| b.0.as_slice())
}
