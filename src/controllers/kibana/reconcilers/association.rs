//! Associations of a Kibana with Elasticsearch and Enterprise Search.
//!
//! Another controller resolves `spec.elasticsearchRef` and `spec.enterpriseSearchRef` into
//! connection details and records them in annotations on the Kibana. This module only reads
//! those records: it gates the reconciliation on them, reads the credentials they point to,
//! and keeps a watch on the referenced secrets so that rotated credentials roll the pods.

use fnv::FnvHasher;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::events::EventType;
use kube::{Api, ResourceExt};
use semver::Version;
use std::hash::Hasher;
use tracing::info;

use crate::controllers::kibana::controller::Context;
use crate::resources::kibanas::{AssociationConf, AssociationStatus, Kibana, ObjectSelector};
use crate::watches::{handler_name, NamedWatch, NamespacedName};
use crate::{version, Error};

use super::{emit_event, secret_data, REASON_ASSOCIATION_ERROR, REASON_ASSOCIATION_NOT_ESTABLISHED, REASON_DELAYED};

/// Key of the CA certificate in the association CA secret.
pub const CA_CERT_KEY: &str = "ca.crt";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssociationType {
    Elasticsearch,
    EnterpriseSearch,
}

impl AssociationType {
    pub const ALL: [AssociationType; 2] = [AssociationType::Elasticsearch, AssociationType::EnterpriseSearch];

    pub fn name(self) -> &'static str {
        match self {
            AssociationType::Elasticsearch => "elasticsearch",
            AssociationType::EnterpriseSearch => "ent",
        }
    }

    pub fn reference(self, kb: &Kibana) -> Option<&ObjectSelector> {
        match self {
            AssociationType::Elasticsearch => kb.es_ref(),
            AssociationType::EnterpriseSearch => kb.ent_ref(),
        }
    }

    pub fn conf(self, kb: &Kibana) -> Result<Option<AssociationConf>, Error> {
        match self {
            AssociationType::Elasticsearch => kb.es_association_conf(),
            AssociationType::EnterpriseSearch => kb.ent_association_conf(),
        }
    }

    fn watch_suffix(self) -> &'static str {
        match self {
            AssociationType::Elasticsearch => "es-association",
            AssociationType::EnterpriseSearch => "ent-association",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    ServiceAccountToken(String),
}

pub fn watch_name(namespace: &str, kb_name: &str, association_type: AssociationType) -> String {
    handler_name(namespace, kb_name, association_type.watch_suffix())
}

/// Association status derived from the reference and the association annotation.
pub fn association_status(kb: &Kibana, association_type: AssociationType) -> Option<AssociationStatus> {
    association_type.reference(kb)?;
    Some(match association_type.conf(kb) {
        Ok(Some(conf)) if conf.is_configured() => AssociationStatus::Established,
        Ok(_) => AssociationStatus::Pending,
        Err(_) => AssociationStatus::Failed,
    })
}

/// Resolved associations of a Kibana. A conf is only present when its reference is set and
/// the annotation carries a URL.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Associations {
    pub elasticsearch: Option<AssociationConf>,
    pub enterprise_search: Option<AssociationConf>,
}

impl Associations {
    pub fn configured(kb: &Kibana) -> Result<Self, Error> {
        Ok(Self {
            elasticsearch: configured_association(kb, AssociationType::Elasticsearch)?,
            enterprise_search: configured_association(kb, AssociationType::EnterpriseSearch)?,
        })
    }

    pub fn get(&self, association_type: AssociationType) -> Option<&AssociationConf> {
        match association_type {
            AssociationType::Elasticsearch => self.elasticsearch.as_ref(),
            AssociationType::EnterpriseSearch => self.enterprise_search.as_ref(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (AssociationType, &AssociationConf)> {
        AssociationType::ALL
            .into_iter()
            .filter_map(|t| self.get(t).map(|conf| (t, conf)))
    }
}

/// The association configuration if the reference is set and resolved.
pub fn configured_association(
    kb: &Kibana,
    association_type: AssociationType,
) -> Result<Option<AssociationConf>, Error> {
    if association_type.reference(kb).is_none() {
        return Ok(None);
    }
    Ok(association_type.conf(kb)?.filter(AssociationConf::is_configured))
}

/// False if the reference is set but not resolved yet.
pub async fn is_configured_if_set(
    ctx: &Context,
    kb: &Kibana,
    association_type: AssociationType,
) -> Result<bool, Error> {
    let Some(reference) = association_type.reference(kb) else {
        return Ok(true);
    };
    match association_type.conf(kb) {
        Err(e) => {
            emit_event(
                &ctx.recorder,
                kb,
                EventType::Warning,
                REASON_ASSOCIATION_ERROR,
                format!("Failed to read the {} association: {e}", association_type.name()),
            )
            .await;
            Err(e)
        }
        Ok(Some(conf)) if conf.is_configured() => Ok(true),
        Ok(_) => {
            let target = reference
                .name
                .as_deref()
                .or(reference.secret_name.as_deref())
                .unwrap_or_default();
            emit_event(
                &ctx.recorder,
                kb,
                EventType::Warning,
                REASON_ASSOCIATION_NOT_ESTABLISHED,
                format!(
                    "Association backend for {} {target} is not configured",
                    association_type.name()
                ),
            )
            .await;
            Ok(false)
        }
    }
}

/// Kibana may only run a version the associated resource can serve: the same minor,
/// or anything up to the associated version.
pub fn version_allowed(kb_version: &Version, reported: &str) -> Option<bool> {
    if reported.is_empty() {
        return None;
    }
    let associated_version = version::parse(reported).ok()?;
    Some(associated_version >= *kb_version || version::same_minor(&associated_version, kb_version))
}

/// Emits a `Delayed` warning and returns false when an association does not allow `kb_version` yet.
pub async fn allow_version(
    ctx: &Context,
    kb: &Kibana,
    kb_version: &Version,
    associations: &Associations,
) -> bool {
    for (association_type, conf) in associations.iter() {
        let note = match version_allowed(kb_version, &conf.version) {
            Some(true) => continue,
            Some(false) => format!(
                "Delaying deployment of version {kb_version} since the referenced {} is not upgraded yet",
                association_type.name()
            ),
            None => format!(
                "Delaying deployment of version {kb_version} since the referenced {} version is not reported yet",
                association_type.name()
            ),
        };
        info!("{}", note);
        emit_event(&ctx.recorder, kb, EventType::Warning, REASON_DELAYED, note).await;
        return false;
    }
    true
}

/// Credentials Kibana uses to reach Elasticsearch, read from the secret named in the association.
pub async fn credentials(
    secret_api: &Api<Secret>,
    conf: &AssociationConf,
) -> Result<Option<Credentials>, Error> {
    if !conf.auth_is_configured() {
        return Ok(None);
    }
    let secret = secret_api
        .get_opt(&conf.auth_secret_name)
        .await?
        .ok_or_else(|| Error::SecretNotFound(conf.auth_secret_name.clone()))?;
    let value = secret_data(&secret, &conf.auth_secret_key).ok_or_else(|| {
        Error::SecretKeyNotFound(conf.auth_secret_key.clone(), conf.auth_secret_name.clone())
    })?;
    let value = String::from_utf8_lossy(value).into_owned();
    Ok(Some(if conf.is_service_account {
        Credentials::ServiceAccountToken(value)
    } else {
        Credentials::Basic {
            username: conf.auth_secret_key.clone(),
            password: value,
        }
    }))
}

/// Feeds the association secrets that cannot be hot reloaded into the pod template hash.
pub async fn write_to_config_hash(
    secret_api: &Api<Secret>,
    conf: &AssociationConf,
    hasher: &mut FnvHasher,
) -> Result<(), Error> {
    if conf.auth_is_configured() {
        let secret = secret_api
            .get_opt(&conf.auth_secret_name)
            .await?
            .ok_or_else(|| Error::SecretNotFound(conf.auth_secret_name.clone()))?;
        if let Some(data) = secret_data(&secret, &conf.auth_secret_key) {
            hasher.write(data);
        }
    }
    if conf.ca_is_configured() {
        let secret = secret_api
            .get_opt(&conf.ca_secret_name)
            .await?
            .ok_or_else(|| Error::SecretNotFound(conf.ca_secret_name.clone()))?;
        if let Some(data) = secret_data(&secret, CA_CERT_KEY) {
            hasher.write(data);
        }
    }
    Ok(())
}

/// Keeps the dynamic watch on the association secrets in line with the current association.
pub fn reconcile_watch(
    ctx: &Context,
    kb: &Kibana,
    association_type: AssociationType,
    conf: Option<&AssociationConf>,
) {
    let namespace = kb.namespace().unwrap_or_default();
    let name = watch_name(&namespace, &kb.name_any(), association_type);
    let watched: Vec<NamespacedName> = conf
        .map(|conf| {
            let mut watched = vec![];
            if conf.auth_is_configured() {
                watched.push(NamespacedName::new(&namespace, &conf.auth_secret_name));
            }
            if conf.ca_is_configured() {
                watched.push(NamespacedName::new(&namespace, &conf.ca_secret_name));
            }
            watched
        })
        .unwrap_or_default();

    if watched.is_empty() {
        ctx.watches.remove_handler_for_key(&name);
    } else {
        ctx.watches.add_handler(NamedWatch {
            name,
            watched,
            watcher: NamespacedName::of(kb),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::kibanas::{ENT_ASSOCIATION_CONF_ANNOTATION, ES_ASSOCIATION_CONF_ANNOTATION};
    use serde_json::json;

    fn kibana(spec: serde_json::Value, conf: Option<&str>) -> Kibana {
        let mut kb: Kibana = serde_json::from_value(json!({
            "apiVersion": "kibana.k8s.elastic.co/v1",
            "kind": "Kibana",
            "metadata": {"name": "test", "namespace": "ns"},
            "spec": spec,
        }))
        .unwrap();
        if let Some(conf) = conf {
            kb.annotations_mut()
                .insert(ES_ASSOCIATION_CONF_ANNOTATION.into(), conf.into());
        }
        kb
    }

    #[test]
    fn status_follows_the_annotation() {
        let spec = json!({"version": "7.17.0", "elasticsearchRef": {"name": "es"}});
        assert_eq!(
            association_status(&kibana(json!({"version": "7.17.0"}), None), AssociationType::Elasticsearch),
            None
        );
        assert_eq!(
            association_status(&kibana(spec.clone(), None), AssociationType::Elasticsearch),
            Some(AssociationStatus::Pending)
        );
        assert_eq!(
            association_status(&kibana(spec.clone(), Some(r#"{"url":""}"#)), AssociationType::Elasticsearch),
            Some(AssociationStatus::Pending)
        );
        assert_eq!(
            association_status(&kibana(spec.clone(), Some(r#"{"url":"https://es:9200"}"#)), AssociationType::Elasticsearch),
            Some(AssociationStatus::Established)
        );
        assert_eq!(
            association_status(&kibana(spec, Some("garbage")), AssociationType::Elasticsearch),
            Some(AssociationStatus::Failed)
        );
    }

    #[test]
    fn configured_association_ignores_annotation_without_ref() {
        let kb = kibana(
            json!({"version": "7.17.0"}),
            Some(r#"{"url":"https://es:9200"}"#),
        );
        assert_eq!(
            configured_association(&kb, AssociationType::Elasticsearch).unwrap(),
            None
        );
    }

    #[test]
    fn associations_are_independent() {
        let mut kb = kibana(
            json!({"version": "8.5.0", "elasticsearchRef": {"name": "es"}, "enterpriseSearchRef": {"name": "ent"}}),
            Some(r#"{"url":"https://es:9200","version":"8.5.0"}"#),
        );
        assert_eq!(
            association_status(&kb, AssociationType::EnterpriseSearch),
            Some(AssociationStatus::Pending)
        );
        let associations = Associations::configured(&kb).unwrap();
        assert!(associations.enterprise_search.is_none());
        assert_eq!(
            associations.iter().map(|(t, _)| t).collect::<Vec<_>>(),
            vec![AssociationType::Elasticsearch]
        );

        kb.annotations_mut().insert(
            ENT_ASSOCIATION_CONF_ANNOTATION.into(),
            r#"{"url":"https://ent:3002","version":"8.5.0"}"#.into(),
        );
        assert_eq!(
            association_status(&kb, AssociationType::EnterpriseSearch),
            Some(AssociationStatus::Established)
        );
        let associations = Associations::configured(&kb).unwrap();
        assert_eq!(
            associations.get(AssociationType::EnterpriseSearch).map(|c| c.url.as_str()),
            Some("https://ent:3002")
        );
    }

    #[test]
    fn watch_names_differ_per_association() {
        assert_eq!(
            watch_name("ns", "test", AssociationType::Elasticsearch),
            "ns/test/es-association"
        );
        assert_eq!(
            watch_name("ns", "test", AssociationType::EnterpriseSearch),
            "ns/test/ent-association"
        );
    }

    /// Runs `allow_version` against a mock API server, returning the events it published.
    async fn allow_version_events(
        kb_version: &Version,
        associations: &Associations,
    ) -> (bool, Vec<serde_json::Value>) {
        use crate::controllers::{OperatorParams, State};
        use crate::Metrics;
        use http::{Request, Response};
        use kube::client::Body;

        let (mock_service, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let state = State::new(OperatorParams::default());
        let ctx = Context::new(kube::Client::new(mock_service, "default"), Metrics::default(), &state, Vec::new());
        let server = tokio::spawn(async move {
            let mut events = vec![];
            while let Some((request, send)) = handle.next_request().await {
                assert_eq!(request.method(), http::Method::POST);
                let body = request.into_body().collect_bytes().await.unwrap();
                send.send_response(Response::builder().body(Body::from(body.to_vec())).unwrap());
                events.push(serde_json::from_slice::<serde_json::Value>(&body).unwrap());
            }
            events
        });

        let kb = kibana(json!({"version": "7.17.0", "elasticsearchRef": {"name": "es"}}), None);
        let allowed = allow_version(&ctx, &kb, kb_version, associations).await;
        drop(ctx);
        (allowed, server.await.unwrap())
    }

    fn associated(version: &str) -> Option<AssociationConf> {
        Some(AssociationConf {
            url: "https://associated:443".into(),
            version: version.into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn delayed_version_is_a_warning() {
        let kb_version = Version::new(7, 17, 0);

        let (allowed, events) = allow_version_events(
            &kb_version,
            &Associations {
                elasticsearch: associated("7.16.3"),
                enterprise_search: None,
            },
        )
        .await;
        assert!(!allowed);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "Warning");
        assert_eq!(events[0]["reason"], "Delayed");
        assert_eq!(
            events[0]["note"],
            "Delaying deployment of version 7.17.0 since the referenced elasticsearch is not upgraded yet"
        );

        let (allowed, events) = allow_version_events(
            &kb_version,
            &Associations {
                elasticsearch: associated("7.17.0"),
                enterprise_search: associated(""),
            },
        )
        .await;
        assert!(!allowed);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "Warning");
        assert_eq!(
            events[0]["note"],
            "Delaying deployment of version 7.17.0 since the referenced ent version is not reported yet"
        );

        let (allowed, events) = allow_version_events(
            &kb_version,
            &Associations {
                elasticsearch: associated("8.0.0"),
                enterprise_search: associated("7.17.0"),
            },
        )
        .await;
        assert!(allowed);
        assert!(events.is_empty());
    }

    #[test]
    fn version_policy() {
        let kb_version = Version::new(7, 17, 0);
        assert_eq!(version_allowed(&kb_version, ""), None);
        assert_eq!(version_allowed(&kb_version, "7.17.0"), Some(true));
        assert_eq!(version_allowed(&kb_version, "8.1.0"), Some(true));
        // same minor, lower patch
        assert_eq!(
            version_allowed(&Version::new(7, 17, 3), "7.17.1"),
            Some(true)
        );
        assert_eq!(version_allowed(&kb_version, "7.16.3"), Some(false));
    }
}
