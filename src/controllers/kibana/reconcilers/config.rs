//! The `kibana.yml` file and the secret carrying it.
//!
//! Settings are built from layers merged in increasing precedence: base settings, the
//! random keys reused from the previous config, version defaults, TLS, the Enterprise Search
//! association, monitoring, the Elasticsearch association, and finally the user's `spec.config`. The result is
//! rendered with sorted keys so that an unchanged spec renders to the same bytes.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::{Api, ResourceExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use semver::Version;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::controllers::kibana::controller::Context;
use crate::controllers::{BuildInfo, IpFamily};
use crate::resources::kibanas::{AssociationConf, Kibana};
use crate::{version, Error};

use super::association::{Credentials, CA_CERT_KEY};
use super::certificates::{CERT_FILE_NAME, KEY_FILE_NAME};
use super::{apply, config_secret_name, object_meta, secret_data};

pub const SETTINGS_FILENAME: &str = "kibana.yml";
pub const TELEMETRY_FILENAME: &str = "telemetry.yml";

pub const HTTP_CERTS_MOUNT_PATH: &str = "/mnt/elastic-internal/http-certs";
pub const ES_CERTS_MOUNT_PATH: &str = "/usr/share/kibana/config/elasticsearch-certs";
pub const ENT_CERTS_MOUNT_PATH: &str = "/usr/share/kibana/config/ent-certs";

pub const SERVER_NAME: &str = "server.name";
pub const SERVER_HOST: &str = "server.host";
pub const SERVER_BASE_PATH: &str = "server.basePath";
pub const SERVER_REWRITE_BASE_PATH: &str = "server.rewriteBasePath";
pub const XPACK_MONITORING_UI_CONTAINER_ES_ENABLED: &str =
    "xpack.monitoring.ui.container.elasticsearch.enabled";
pub const MONITORING_UI_CONTAINER_ES_ENABLED: &str = "monitoring.ui.container.elasticsearch.enabled";
pub const MONITORING_KIBANA_COLLECTION_ENABLED: &str = "monitoring.kibana.collection.enabled";
pub const XPACK_LICENSE_MANAGEMENT_UI_ENABLED: &str = "xpack.license_management.ui.enabled";
pub const XPACK_SECURITY_ENCRYPTION_KEY: &str = "xpack.security.encryptionKey";
pub const XPACK_REPORTING_ENCRYPTION_KEY: &str = "xpack.reporting.encryptionKey";
pub const XPACK_ENCRYPTED_SAVED_OBJECTS: &str = "xpack.encryptedSavedObjects";
pub const XPACK_ENCRYPTED_SAVED_OBJECTS_ENCRYPTION_KEY: &str =
    "xpack.encryptedSavedObjects.encryptionKey";
pub const ELASTICSEARCH_HOSTS: &str = "elasticsearch.hosts";
pub const ELASTICSEARCH_USERNAME: &str = "elasticsearch.username";
pub const ELASTICSEARCH_PASSWORD: &str = "elasticsearch.password";
pub const ELASTICSEARCH_SERVICE_ACCOUNT_TOKEN: &str = "elasticsearch.serviceAccountToken";
pub const ELASTICSEARCH_SSL_CERTIFICATE_AUTHORITIES: &str =
    "elasticsearch.ssl.certificateAuthorities";
pub const ELASTICSEARCH_SSL_VERIFICATION_MODE: &str = "elasticsearch.ssl.verificationMode";
pub const ENTERPRISE_SEARCH_HOST: &str = "enterpriseSearch.host";
pub const ENTERPRISE_SEARCH_SSL_CERTIFICATE_AUTHORITIES: &str =
    "enterpriseSearch.ssl.certificateAuthorities";
pub const ENTERPRISE_SEARCH_SSL_VERIFICATION_MODE: &str = "enterpriseSearch.ssl.verificationMode";
pub const SERVER_SSL_ENABLED: &str = "server.ssl.enabled";
pub const SERVER_SSL_CERTIFICATE: &str = "server.ssl.certificate";
pub const SERVER_SSL_KEY: &str = "server.ssl.key";

const RANDOM_KEY_LENGTH: usize = 64;

/// A settings tree where every dotted key has been expanded into nested maps, so that
/// `a.b: 1` and `a: {b: 1}` are the same setting.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CanonicalConfig(Map<String, Value>);

impl CanonicalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizes an arbitrary value. `null` is the empty config; anything but a map is an error.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => {
                let mut cfg = Self::new();
                for (key, value) in map {
                    cfg.set(&key, value);
                }
                Ok(cfg)
            }
            other => Err(Error::InvalidKibanaConfig(format!(
                "expected a map of settings, got {other}"
            ))),
        }
    }

    pub fn from_yaml(raw: &[u8]) -> Result<Self, Error> {
        let value: Value = serde_yaml::from_slice(raw)?;
        Self::from_value(value)
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        let mut cfg = Self::new();
        for (key, value) in pairs {
            cfg.set(key, value);
        }
        cfg
    }

    /// Sets `dotted_key`, merging into whatever is already there when both sides are maps.
    pub fn set(&mut self, dotted_key: &str, value: Value) {
        let value = normalize(value);
        let mut parts = dotted_key.split('.').rev();
        let Some(last) = parts.next() else {
            return;
        };
        let mut nested = Map::new();
        nested.insert(last.to_string(), value);
        for part in parts {
            let mut parent = Map::new();
            parent.insert(part.to_string(), Value::Object(nested));
            nested = parent;
        }
        merge_maps(&mut self.0, nested);
    }

    pub fn get(&self, dotted_key: &str) -> Option<&Value> {
        let mut parts = dotted_key.split('.');
        let first = parts.next()?;
        parts.try_fold(self.0.get(first)?, |value, part| value.get(part))
    }

    pub fn get_str(&self, dotted_key: &str) -> Option<&str> {
        self.get(dotted_key).and_then(Value::as_str)
    }

    /// Removes a setting and everything below it.
    pub fn remove(&mut self, dotted_key: &str) {
        let (parent, last) = match dotted_key.rsplit_once('.') {
            Some((parent, last)) => (Some(parent), last),
            None => (None, dotted_key),
        };
        let map = match parent {
            None => Some(&mut self.0),
            Some(parent) => parent
                .split('.')
                .try_fold(&mut self.0, |map, part| map.get_mut(part)?.as_object_mut()),
        };
        if let Some(map) = map {
            map.remove(last);
        }
    }

    /// Deep merges `other` into this config, `other` winning on conflicts. Lists are replaced.
    pub fn merge(&mut self, other: CanonicalConfig) {
        merge_maps(&mut self.0, other.0);
    }

    pub fn merge_all(layers: impl IntoIterator<Item = CanonicalConfig>) -> Self {
        let mut cfg = Self::new();
        for layer in layers {
            cfg.merge(layer);
        }
        cfg
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// YAML with keys in lexicographic order at every level.
    pub fn render(&self) -> Result<Vec<u8>, Error> {
        let sorted = sorted_yaml(&Value::Object(self.0.clone()))?;
        Ok(serde_yaml::to_string(&sorted)?.into_bytes())
    }
}

fn sorted_yaml(value: &Value) -> Result<serde_yaml::Value, Error> {
    Ok(match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut mapping = serde_yaml::Mapping::new();
            for key in keys {
                mapping.insert(serde_yaml::Value::String(key.clone()), sorted_yaml(&map[key])?);
            }
            serde_yaml::Value::Mapping(mapping)
        }
        Value::Array(items) => serde_yaml::Value::Sequence(
            items.iter().map(sorted_yaml).collect::<Result<_, _>>()?,
        ),
        scalar => serde_yaml::to_value(scalar)?,
    })
}

fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut cfg = CanonicalConfig::new();
            for (key, value) in map {
                cfg.set(&key, value);
            }
            Value::Object(cfg.0)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        other => other,
    }
}

fn merge_maps(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_maps(existing, incoming)
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

fn random_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_KEY_LENGTH)
        .map(char::from)
        .collect()
}

/// Encryption keys carried over from `existing`, generating the ones that are missing.
/// The saved objects key only exists from 7.6.0 and is dropped for older versions.
pub fn reusable_settings(existing: Option<&CanonicalConfig>, kb_version: &Version) -> CanonicalConfig {
    let reuse = |key: &str| {
        existing
            .and_then(|cfg| cfg.get_str(key))
            .filter(|v| !v.is_empty())
            .map(String::from)
            .unwrap_or_else(random_key)
    };

    let mut cfg = CanonicalConfig::from_pairs([
        (XPACK_SECURITY_ENCRYPTION_KEY, json!(reuse(XPACK_SECURITY_ENCRYPTION_KEY))),
        (XPACK_REPORTING_ENCRYPTION_KEY, json!(reuse(XPACK_REPORTING_ENCRYPTION_KEY))),
    ]);
    if version::at_least(kb_version, &version::ENCRYPTED_SAVED_OBJECTS_SINCE) {
        cfg.set(
            XPACK_ENCRYPTED_SAVED_OBJECTS_ENCRYPTION_KEY,
            json!(reuse(XPACK_ENCRYPTED_SAVED_OBJECTS_ENCRYPTION_KEY)),
        );
    }
    cfg
}

fn base_settings(
    kb: &Kibana,
    kb_version: &Version,
    ip_family: IpFamily,
    association: Option<&AssociationConf>,
) -> CanonicalConfig {
    let mut cfg = CanonicalConfig::from_pairs([
        (SERVER_NAME, json!(kb.name_any())),
        (SERVER_HOST, json!(ip_family.any_address())),
    ]);
    if version::at_least(kb_version, &version::MONITORING_UI_WITHOUT_XPACK_SINCE) {
        cfg.set(MONITORING_UI_CONTAINER_ES_ENABLED, json!(true));
    } else {
        cfg.set(XPACK_MONITORING_UI_CONTAINER_ES_ENABLED, json!(true));
    }
    if let Some(conf) = association.filter(|c| !c.url.is_empty()) {
        cfg.set(ELASTICSEARCH_HOSTS, json!([conf.url]));
    }
    cfg
}

pub fn version_defaults(kb_version: &Version) -> CanonicalConfig {
    if version::at_least(kb_version, &version::LICENSE_MANAGEMENT_UI_SINCE) {
        CanonicalConfig::from_pairs([(XPACK_LICENSE_MANAGEMENT_UI_ENABLED, json!(false))])
    } else {
        CanonicalConfig::new()
    }
}

fn tls_settings(kb: &Kibana) -> CanonicalConfig {
    if !kb.tls_enabled() {
        return CanonicalConfig::new();
    }
    CanonicalConfig::from_pairs([
        (SERVER_SSL_ENABLED, json!(true)),
        (
            SERVER_SSL_CERTIFICATE,
            json!(format!("{HTTP_CERTS_MOUNT_PATH}/{CERT_FILE_NAME}")),
        ),
        (
            SERVER_SSL_KEY,
            json!(format!("{HTTP_CERTS_MOUNT_PATH}/{KEY_FILE_NAME}")),
        ),
    ])
}

/// Kibana stops collecting its own monitoring data once a metrics collector takes over.
fn monitoring_settings(kb: &Kibana) -> CanonicalConfig {
    if kb.metrics_monitoring_refs().is_empty() {
        return CanonicalConfig::new();
    }
    CanonicalConfig::from_pairs([(MONITORING_KIBANA_COLLECTION_ENABLED, json!(false))])
}

/// Verification mode is `certificate` since Kibana reaches Enterprise Search through the
/// internal service name, which a user provided certificate may not list.
fn enterprise_search_settings(conf: Option<&AssociationConf>) -> CanonicalConfig {
    let mut cfg = CanonicalConfig::new();
    let Some(conf) = conf else {
        return cfg;
    };
    if !conf.url.is_empty() {
        cfg.set(ENTERPRISE_SEARCH_HOST, json!(conf.url));
    }
    if conf.ca_cert_provided {
        cfg.set(
            ENTERPRISE_SEARCH_SSL_CERTIFICATE_AUTHORITIES,
            json!(format!("{ENT_CERTS_MOUNT_PATH}/{CA_CERT_KEY}")),
        );
        cfg.set(ENTERPRISE_SEARCH_SSL_VERIFICATION_MODE, json!("certificate"));
    }
    cfg
}

fn elasticsearch_tls_settings(conf: &AssociationConf) -> CanonicalConfig {
    let mut cfg =
        CanonicalConfig::from_pairs([(ELASTICSEARCH_SSL_VERIFICATION_MODE, json!("certificate"))]);
    if conf.ca_cert_provided {
        cfg.set(
            ELASTICSEARCH_SSL_CERTIFICATE_AUTHORITIES,
            json!(format!("{ES_CERTS_MOUNT_PATH}/{CA_CERT_KEY}")),
        );
    }
    cfg
}

fn credentials_settings(credentials: Option<&Credentials>) -> CanonicalConfig {
    match credentials {
        None => CanonicalConfig::new(),
        Some(Credentials::ServiceAccountToken(token)) => {
            CanonicalConfig::from_pairs([(ELASTICSEARCH_SERVICE_ACCOUNT_TOKEN, json!(token))])
        }
        Some(Credentials::Basic { username, password }) => CanonicalConfig::from_pairs([
            (ELASTICSEARCH_USERNAME, json!(username)),
            (ELASTICSEARCH_PASSWORD, json!(password)),
        ]),
    }
}

/// Everything the settings depend on besides the Kibana itself.
pub struct ConfigInputs<'a> {
    pub kb_version: &'a Version,
    pub ip_family: IpFamily,
    /// Settings currently stored in the config secret.
    pub existing: Option<&'a CanonicalConfig>,
    /// Established Elasticsearch association, if any.
    pub association: Option<&'a AssociationConf>,
    pub ent_association: Option<&'a AssociationConf>,
    pub credentials: Option<&'a Credentials>,
}

pub fn new_config_settings(kb: &Kibana, inputs: &ConfigInputs<'_>) -> Result<CanonicalConfig, Error> {
    let user = CanonicalConfig::from_value(kb.spec.config.clone().unwrap_or(Value::Null))?;

    let mut reused = reusable_settings(inputs.existing, inputs.kb_version);
    if !version::at_least(inputs.kb_version, &version::ENCRYPTED_SAVED_OBJECTS_SINCE) {
        reused.remove(XPACK_ENCRYPTED_SAVED_OBJECTS);
    }

    let mut layers = vec![
        base_settings(kb, inputs.kb_version, inputs.ip_family, inputs.association),
        reused,
        version_defaults(inputs.kb_version),
        tls_settings(kb),
        enterprise_search_settings(inputs.ent_association),
        monitoring_settings(kb),
    ];
    if let Some(conf) = inputs.association {
        layers.push(elasticsearch_tls_settings(conf));
        layers.push(credentials_settings(inputs.credentials));
    }
    layers.push(user);
    Ok(CanonicalConfig::merge_all(layers))
}

#[derive(Serialize)]
struct Telemetry<'a> {
    eck: TelemetryInfo<'a>,
}

#[derive(Serialize)]
struct TelemetryInfo<'a> {
    distribution: &'a str,
    version: &'a str,
    build_hash: &'a str,
    build_date: &'a str,
    build_snapshot: &'a str,
}

pub fn telemetry_yaml(build_info: &BuildInfo) -> Result<Vec<u8>, Error> {
    let telemetry = Telemetry {
        eck: TelemetryInfo {
            distribution: "kibana-operator",
            version: &build_info.version,
            build_hash: &build_info.hash,
            build_date: &build_info.date,
            build_snapshot: &build_info.snapshot,
        },
    };
    Ok(serde_yaml::to_string(&telemetry)?.into_bytes())
}

/// Settings stored in an existing config secret. A secret without the settings file
/// cannot have been written by this operator and is reported as an error.
pub fn existing_settings(secret: &Secret) -> Result<CanonicalConfig, Error> {
    let raw = secret_data(secret, SETTINGS_FILENAME).ok_or_else(|| {
        Error::SecretKeyNotFound(SETTINGS_FILENAME.into(), secret.name_any())
    })?;
    CanonicalConfig::from_yaml(raw)
}

pub fn config_secret(
    base_metadata: &ObjectMeta,
    kb_name: &str,
    settings: &CanonicalConfig,
    build_info: &BuildInfo,
) -> Result<Secret, Error> {
    Ok(Secret {
        metadata: object_meta(base_metadata, config_secret_name(kb_name)),
        data: Some(BTreeMap::from([
            (SETTINGS_FILENAME.to_string(), ByteString(settings.render()?)),
            (
                TELEMETRY_FILENAME.to_string(),
                ByteString(telemetry_yaml(build_info)?),
            ),
        ])),
        ..Default::default()
    })
}

/// Builds and applies the config secret. Returns the applied secret, whose settings
/// file feeds the pod template hash.
pub async fn reconcile_config_secret(
    ctx: &Context,
    kb: &Kibana,
    base_metadata: &ObjectMeta,
    inputs: ConfigInputs<'_>,
) -> Result<Secret, Error> {
    let kb_name = kb.name_any();
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &kb.namespace().unwrap_or_default());
    let name = config_secret_name(&kb_name);

    let existing = match secrets.get_opt(&name).await? {
        Some(secret) => Some(existing_settings(&secret)?),
        None => {
            debug!("Kibana config secret {} does not exist yet", name);
            None
        }
    };
    let inputs = ConfigInputs {
        existing: existing.as_ref(),
        ..inputs
    };
    let settings = new_config_settings(kb, &inputs)?;
    let secret = config_secret(base_metadata, &kb_name, &settings, &ctx.params.build_info)?;
    apply(&secrets, &name, &secret).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_include;

    fn kibana(spec: Value) -> Kibana {
        serde_json::from_value(json!({
            "apiVersion": "kibana.k8s.elastic.co/v1",
            "kind": "Kibana",
            "metadata": {"name": "test", "namespace": "ns"},
            "spec": spec,
        }))
        .unwrap()
    }

    fn inputs(kb_version: &Version) -> ConfigInputs<'_> {
        ConfigInputs {
            kb_version,
            ip_family: IpFamily::Ipv4,
            existing: None,
            association: None,
            ent_association: None,
            credentials: None,
        }
    }

    fn as_json(cfg: &CanonicalConfig) -> Value {
        Value::Object(cfg.0.clone())
    }

    #[test]
    fn dotted_keys_are_expanded() {
        let cfg = CanonicalConfig::from_value(json!({
            "server.basePath": "/kb",
            "server": {"rewriteBasePath": true},
            "xpack": {"security.encryptionKey": "k"},
        }))
        .unwrap();
        assert_eq!(
            as_json(&cfg),
            json!({
                "server": {"basePath": "/kb", "rewriteBasePath": true},
                "xpack": {"security": {"encryptionKey": "k"}},
            })
        );
        assert_eq!(cfg.get_str(SERVER_BASE_PATH), Some("/kb"));
        assert_eq!(cfg.get_str("xpack.security.encryptionKey"), Some("k"));
        assert_eq!(cfg.get("server.missing"), None);
    }

    #[test]
    fn non_map_config_is_rejected() {
        assert!(matches!(
            CanonicalConfig::from_value(json!(["a"])),
            Err(Error::InvalidKibanaConfig(_))
        ));
        assert!(CanonicalConfig::from_value(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn merge_is_deep_and_later_wins() {
        let mut cfg = CanonicalConfig::from_pairs([
            ("a.b", json!(1)),
            ("a.c", json!(2)),
            ("list", json!([1, 2])),
        ]);
        cfg.merge(CanonicalConfig::from_pairs([
            ("a.c", json!(3)),
            ("a.d", json!(4)),
            ("list", json!([3])),
        ]));
        assert_eq!(
            as_json(&cfg),
            json!({"a": {"b": 1, "c": 3, "d": 4}, "list": [3]})
        );
    }

    #[test]
    fn remove_drops_subtree() {
        let mut cfg = CanonicalConfig::from_pairs([
            ("xpack.encryptedSavedObjects.encryptionKey", json!("k")),
            ("xpack.security.encryptionKey", json!("s")),
        ]);
        cfg.remove(XPACK_ENCRYPTED_SAVED_OBJECTS);
        cfg.remove("does.not.exist");
        assert_eq!(as_json(&cfg), json!({"xpack": {"security": {"encryptionKey": "s"}}}));
    }

    #[test]
    fn render_is_sorted_and_stable() {
        let a = CanonicalConfig::from_pairs([("z", json!(1)), ("a.y", json!(2)), ("a.b", json!(3))]);
        let b = CanonicalConfig::from_pairs([("a.b", json!(3)), ("z", json!(1)), ("a.y", json!(2))]);
        let rendered = String::from_utf8(a.render().unwrap()).unwrap();
        assert_eq!(rendered, "a:\n  b: 3\n  y: 2\nz: 1\n");
        assert_eq!(a.render().unwrap(), b.render().unwrap());
        assert_eq!(CanonicalConfig::from_yaml(rendered.as_bytes()).unwrap(), a);
    }

    #[test]
    fn random_keys_are_generated_then_reused() {
        let v = Version::new(7, 17, 0);
        let first = reusable_settings(None, &v);
        for key in [
            XPACK_SECURITY_ENCRYPTION_KEY,
            XPACK_REPORTING_ENCRYPTION_KEY,
            XPACK_ENCRYPTED_SAVED_OBJECTS_ENCRYPTION_KEY,
        ] {
            let value = first.get_str(key).unwrap();
            assert_eq!(value.len(), 64);
            assert!(value.chars().all(|c| c.is_ascii_alphanumeric()));
        }
        let second = reusable_settings(Some(&first), &v);
        assert_eq!(first, second);
    }

    #[test]
    fn saved_objects_key_only_from_7_6() {
        let v = Version::new(7, 5, 2);
        let existing = CanonicalConfig::from_pairs([(
            XPACK_ENCRYPTED_SAVED_OBJECTS_ENCRYPTION_KEY,
            json!("old"),
        )]);
        assert!(reusable_settings(None, &v)
            .get(XPACK_ENCRYPTED_SAVED_OBJECTS)
            .is_none());

        let kb = kibana(json!({"version": "7.5.2"}));
        let cfg = new_config_settings(
            &kb,
            &ConfigInputs {
                existing: Some(&existing),
                ..inputs(&v)
            },
        )
        .unwrap();
        assert!(cfg.get(XPACK_ENCRYPTED_SAVED_OBJECTS).is_none());
        assert_eq!(cfg.get(XPACK_LICENSE_MANAGEMENT_UI_ENABLED), None);
    }

    #[test]
    fn default_settings() {
        let v = Version::new(7, 17, 0);
        let kb = kibana(json!({"version": "7.17.0"}));
        let cfg = new_config_settings(&kb, &inputs(&v)).unwrap();
        assert_json_include!(
            actual: as_json(&cfg),
            expected: json!({
                "server": {
                    "name": "test",
                    "host": "0.0.0.0",
                    "ssl": {
                        "enabled": true,
                        "certificate": "/mnt/elastic-internal/http-certs/tls.crt",
                        "key": "/mnt/elastic-internal/http-certs/tls.key",
                    },
                },
                "monitoring": {"ui": {"container": {"elasticsearch": {"enabled": true}}}},
                "xpack": {"license_management": {"ui": {"enabled": false}}},
            })
        );
        assert!(cfg.get(ELASTICSEARCH_HOSTS).is_none());
        assert!(cfg.get("xpack.monitoring").is_none());
    }

    #[test]
    fn old_versions_use_the_xpack_monitoring_flag() {
        let v = Version::new(7, 15, 0);
        let kb = kibana(json!({"version": "7.15.0"}));
        let cfg = new_config_settings(&kb, &inputs(&v)).unwrap();
        assert_eq!(
            cfg.get(XPACK_MONITORING_UI_CONTAINER_ES_ENABLED),
            Some(&json!(true))
        );
        assert!(cfg.get("monitoring.ui").is_none());
    }

    #[test]
    fn monitoring_ui_flag_moves_out_of_xpack_at_7_16() {
        for (raw, xpack) in [("7.15.2", true), ("7.16.0", false), ("7.17.0", false)] {
            let v = version::parse(raw).unwrap();
            let cfg = new_config_settings(&kibana(json!({"version": raw})), &inputs(&v)).unwrap();
            assert_eq!(cfg.get(XPACK_MONITORING_UI_CONTAINER_ES_ENABLED).is_some(), xpack, "{raw}");
            assert_eq!(cfg.get(MONITORING_UI_CONTAINER_ES_ENABLED).is_some(), !xpack, "{raw}");
        }
    }

    #[test]
    fn enterprise_search_settings_follow_the_association() {
        let v = Version::new(8, 5, 0);
        let kb = kibana(json!({"version": "8.5.0", "enterpriseSearchRef": {"name": "ent"}}));
        let conf = AssociationConf {
            auth_secret_name: "-".into(),
            ca_cert_provided: true,
            ca_secret_name: "ent-ca-secret".into(),
            url: "https://ent-url:3002".into(),
            version: "8.5.0".into(),
            ..Default::default()
        };
        let cfg = new_config_settings(
            &kb,
            &ConfigInputs {
                ent_association: Some(&conf),
                ..inputs(&v)
            },
        )
        .unwrap();
        assert_eq!(
            as_json(&cfg)["enterpriseSearch"],
            json!({
                "host": "https://ent-url:3002",
                "ssl": {
                    "certificateAuthorities": "/usr/share/kibana/config/ent-certs/ca.crt",
                    "verificationMode": "certificate",
                },
            })
        );
        assert!(cfg.get(ELASTICSEARCH_HOSTS).is_none());

        let without_ca = AssociationConf {
            ca_cert_provided: false,
            ..conf
        };
        let cfg = new_config_settings(
            &kb,
            &ConfigInputs {
                ent_association: Some(&without_ca),
                ..inputs(&v)
            },
        )
        .unwrap();
        assert_eq!(as_json(&cfg)["enterpriseSearch"], json!({"host": "https://ent-url:3002"}));
    }

    #[test]
    fn ipv6_and_tls_disabled() {
        let v = Version::new(8, 5, 0);
        let kb = kibana(json!({
            "version": "8.5.0",
            "http": {"tls": {"selfSignedCertificate": {"disabled": true}}},
        }));
        let cfg = new_config_settings(
            &kb,
            &ConfigInputs {
                ip_family: IpFamily::Ipv6,
                ..inputs(&v)
            },
        )
        .unwrap();
        assert_eq!(cfg.get_str(SERVER_HOST), Some("::"));
        assert!(cfg.get("server.ssl").is_none());
    }

    #[test]
    fn association_settings() {
        let v = Version::new(8, 5, 0);
        let kb = kibana(json!({"version": "8.5.0", "elasticsearchRef": {"name": "es"}}));
        let conf = AssociationConf {
            auth_secret_name: "es-user".into(),
            auth_secret_key: "ns-test-kibana-user".into(),
            ca_cert_provided: true,
            ca_secret_name: "es-ca".into(),
            url: "https://es-es-http.ns.svc:9200".into(),
            version: "8.5.0".into(),
            ..Default::default()
        };
        let credentials = Credentials::Basic {
            username: "ns-test-kibana-user".into(),
            password: "secret".into(),
        };
        let cfg = new_config_settings(
            &kb,
            &ConfigInputs {
                association: Some(&conf),
                credentials: Some(&credentials),
                ..inputs(&v)
            },
        )
        .unwrap();
        assert_json_include!(
            actual: as_json(&cfg),
            expected: json!({
                "elasticsearch": {
                    "hosts": ["https://es-es-http.ns.svc:9200"],
                    "username": "ns-test-kibana-user",
                    "password": "secret",
                    "ssl": {
                        "verificationMode": "certificate",
                        "certificateAuthorities": "/usr/share/kibana/config/elasticsearch-certs/ca.crt",
                    },
                },
            })
        );

        let token = Credentials::ServiceAccountToken("token".into());
        let cfg = new_config_settings(
            &kb,
            &ConfigInputs {
                association: Some(&conf),
                credentials: Some(&token),
                ..inputs(&v)
            },
        )
        .unwrap();
        assert_eq!(cfg.get_str(ELASTICSEARCH_SERVICE_ACCOUNT_TOKEN), Some("token"));
        assert!(cfg.get(ELASTICSEARCH_USERNAME).is_none());
    }

    #[test]
    fn user_config_wins() {
        let v = Version::new(8, 5, 0);
        let kb = kibana(json!({
            "version": "8.5.0",
            "config": {
                "server.name": "custom",
                "xpack.security.encryptionKey": "user-key",
                "monitoring.kibana.collection.enabled": true,
            },
            "monitoring": {"metrics": {"elasticsearchRefs": [{"name": "monitoring"}]}},
        }));
        let cfg = new_config_settings(&kb, &inputs(&v)).unwrap();
        assert_eq!(cfg.get_str(SERVER_NAME), Some("custom"));
        assert_eq!(cfg.get_str(XPACK_SECURITY_ENCRYPTION_KEY), Some("user-key"));
        assert_eq!(cfg.get(MONITORING_KIBANA_COLLECTION_ENABLED), Some(&json!(true)));
    }

    #[test]
    fn monitoring_disables_self_collection() {
        let v = Version::new(8, 5, 0);
        let kb = kibana(json!({
            "version": "8.5.0",
            "monitoring": {"metrics": {"elasticsearchRefs": [{"name": "monitoring"}]}},
        }));
        let cfg = new_config_settings(&kb, &inputs(&v)).unwrap();
        assert_eq!(cfg.get(MONITORING_KIBANA_COLLECTION_ENABLED), Some(&json!(false)));
    }

    /// Runs `reconcile_config_secret` against a mock API server holding `stored` as the
    /// current config secret, returning the settings that were applied.
    async fn applied_settings(stored: Option<Secret>) -> CanonicalConfig {
        use crate::controllers::{OperatorParams, State};
        use crate::Metrics;
        use http::{Request, Response, StatusCode};
        use kube::client::Body;

        let (mock_service, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let state = State::new(OperatorParams::default());
        let ctx = Context::new(kube::Client::new(mock_service, "default"), Metrics::default(), &state, Vec::new());

        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(request.uri().path(), "/api/v1/namespaces/ns/secrets/test-kb-config");
            let response = match stored {
                Some(secret) => Response::builder()
                    .body(Body::from(serde_json::to_vec(&secret).unwrap()))
                    .unwrap(),
                None => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from(
                        serde_json::to_vec(&json!({
                            "kind": "Status",
                            "apiVersion": "v1",
                            "status": "Failure",
                            "message": "secrets \"test-kb-config\" not found",
                            "reason": "NotFound",
                            "code": 404,
                        }))
                        .unwrap(),
                    ))
                    .unwrap(),
            };
            send.send_response(response);

            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(request.uri().path(), "/api/v1/namespaces/ns/secrets/test-kb-config");
            let body = request.into_body().collect_bytes().await.unwrap();
            send.send_response(Response::builder().body(Body::from(body.to_vec())).unwrap());
        });

        let kb = kibana(json!({"version": "8.5.0"}));
        let v = Version::new(8, 5, 0);
        let base = crate::controllers::kibana::reconcilers::base_metadata(&kb);
        let applied = reconcile_config_secret(&ctx, &kb, &base, inputs(&v)).await.unwrap();
        server.await.unwrap();
        existing_settings(&applied).unwrap()
    }

    #[tokio::test]
    async fn encryption_keys_survive_passes_and_regenerate_after_deletion() {
        let stored = CanonicalConfig::from_pairs([
            (XPACK_SECURITY_ENCRYPTION_KEY, json!("kept-security-key")),
            (XPACK_REPORTING_ENCRYPTION_KEY, json!("kept-reporting-key")),
            (XPACK_ENCRYPTED_SAVED_OBJECTS_ENCRYPTION_KEY, json!("kept-saved-objects-key")),
        ]);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("test-kb-config".into()),
                namespace: Some("ns".into()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                SETTINGS_FILENAME.to_string(),
                ByteString(stored.render().unwrap()),
            )])),
            ..Default::default()
        };

        let kept = applied_settings(Some(secret)).await;
        assert_eq!(kept.get_str(XPACK_SECURITY_ENCRYPTION_KEY), Some("kept-security-key"));
        assert_eq!(kept.get_str(XPACK_REPORTING_ENCRYPTION_KEY), Some("kept-reporting-key"));
        assert_eq!(
            kept.get_str(XPACK_ENCRYPTED_SAVED_OBJECTS_ENCRYPTION_KEY),
            Some("kept-saved-objects-key")
        );

        let fresh = applied_settings(None).await;
        for key in [
            XPACK_SECURITY_ENCRYPTION_KEY,
            XPACK_REPORTING_ENCRYPTION_KEY,
            XPACK_ENCRYPTED_SAVED_OBJECTS_ENCRYPTION_KEY,
        ] {
            let value = fresh.get_str(key).unwrap();
            assert_eq!(value.len(), 64);
            assert_ne!(value, kept.get_str(key).unwrap());
        }
    }

    #[test]
    fn telemetry_file() {
        let info = BuildInfo {
            version: "0.4.0".into(),
            hash: "abcdef".into(),
            date: "2024-01-01T00:00:00Z".into(),
            snapshot: "false".into(),
        };
        let rendered = String::from_utf8(telemetry_yaml(&info).unwrap()).unwrap();
        let parsed: Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(
            parsed,
            json!({"eck": {
                "distribution": "kibana-operator",
                "version": "0.4.0",
                "build_hash": "abcdef",
                "build_date": "2024-01-01T00:00:00Z",
                "build_snapshot": "false",
            }})
        );
    }

    #[test]
    fn config_secret_without_settings_file_is_an_error() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("test-kb-config".into()),
                ..Default::default()
            },
            data: Some(BTreeMap::new()),
            ..Default::default()
        };
        assert!(matches!(
            existing_settings(&secret),
            Err(Error::SecretKeyNotFound(key, name)) if key == "kibana.yml" && name == "test-kb-config"
        ));
    }

    #[test]
    fn config_secret_carries_both_files() {
        let kb = kibana(json!({"version": "8.5.0"}));
        let settings = CanonicalConfig::from_pairs([(SERVER_NAME, json!("test"))]);
        let secret = config_secret(
            &crate::controllers::kibana::reconcilers::base_metadata(&kb),
            "test",
            &settings,
            &BuildInfo::from_build_env(),
        )
        .unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("test-kb-config"));
        let data = secret.data.unwrap();
        assert_eq!(data[SETTINGS_FILENAME].0, b"server:\n  name: test\n");
        assert!(data.contains_key(TELEMETRY_FILENAME));
    }
}
