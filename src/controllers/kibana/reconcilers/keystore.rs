//! Secure settings end up in the Kibana keystore.
//!
//! Every secret listed in `spec.secureSettings` is copied into one aggregated secret,
//! mounted into an init container that creates the keystore before Kibana starts.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ResourceRequirements, Secret, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::runtime::events::EventType;
use kube::{Api, ResourceExt};
use tracing::debug;

use crate::controllers::kibana::controller::Context;
use crate::resources::kibanas::{Kibana, SecretSource};
use crate::watches::{handler_name, NamedWatch, NamespacedName};
use crate::Error;

use super::{apply, delete, emit_event, object_meta, secure_settings_secret_name, REASON_UNEXPECTED};

pub const SECURE_SETTINGS_VOLUME_NAME: &str = "elastic-internal-secure-settings";
pub const SECURE_SETTINGS_MOUNT_PATH: &str = "/mnt/elastic-internal/secure-settings";
pub const KEYSTORE_INIT_CONTAINER_NAME: &str = "elastic-internal-init-keystore";
const KEYSTORE_BIN: &str = "/usr/share/kibana/bin/kibana-keystore";
const KEYSTORE_CONFIG_PATH: &str = "/usr/share/kibana/config";

/// What the pod template needs to get a keystore.
#[derive(Clone, Debug, PartialEq)]
pub struct KeystoreResources {
    pub volume: Volume,
    pub init_container: Container,
    /// Changes whenever the aggregated secure settings change.
    pub version: String,
}

pub fn watch_name(namespace: &str, kb_name: &str) -> String {
    handler_name(namespace, kb_name, "secure-settings")
}

fn keystore_script() -> String {
    format!(
        r#"#!/usr/bin/env bash

set -eux

keystore_initialized_flag={KEYSTORE_CONFIG_PATH}/elastic-internal-init-keystore.ok

if [[ -f "${{keystore_initialized_flag}}" ]]; then
    echo "Keystore already initialized."
    exit 0
fi

echo "Initializing keystore."

{KEYSTORE_BIN} create

for filename in {SECURE_SETTINGS_MOUNT_PATH}/*; do
    [[ -e "$filename" ]] || continue # glob does not match
    key=$(basename "$filename")
    echo "Adding "$key" to the keystore."
    {KEYSTORE_BIN} add "$key" --stdin < "$filename"
done

touch "${{keystore_initialized_flag}}"
echo "Keystore initialization successful."
"#
    )
}

/// The keystore init container. Volume mounts of the config volume are added with the
/// other init container defaults when the pod template is built.
pub fn init_container(image: &str) -> Container {
    Container {
        name: KEYSTORE_INIT_CONTAINER_NAME.into(),
        image: Some(image.into()),
        command: Some(vec![
            "/usr/bin/env".into(),
            "bash".into(),
            "-c".into(),
            keystore_script(),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: SECURE_SETTINGS_VOLUME_NAME.into(),
            mount_path: SECURE_SETTINGS_MOUNT_PATH.into(),
            read_only: Some(true),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".into(), Quantity("100m".into())),
                ("memory".into(), Quantity("128Mi".into())),
            ])),
            limits: Some(BTreeMap::from([
                ("cpu".into(), Quantity("1000m".into())),
                ("memory".into(), Quantity("128Mi".into())),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn secure_settings_volume(kb_name: &str) -> Volume {
    Volume {
        name: SECURE_SETTINGS_VOLUME_NAME.into(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secure_settings_secret_name(kb_name)),
            optional: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Collects the entries selected by `source` out of `secret`. Without explicit entries,
/// every key is taken as is.
pub fn select_entries(
    source: &SecretSource,
    secret: &Secret,
) -> Result<BTreeMap<String, ByteString>, Error> {
    let data = secret.data.clone().unwrap_or_default();
    let Some(entries) = source.entries.as_ref().filter(|e| !e.is_empty()) else {
        return Ok(data);
    };
    entries
        .iter()
        .map(|entry| {
            let value = data.get(&entry.key).cloned().ok_or_else(|| {
                Error::SecretKeyNotFound(entry.key.clone(), source.secret_name.clone())
            })?;
            let key = entry
                .path
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| entry.key.clone());
            Ok((key, value))
        })
        .collect()
}

fn reconcile_watch(ctx: &Context, kb: &Kibana) {
    let namespace = kb.namespace().unwrap_or_default();
    let name = watch_name(&namespace, &kb.name_any());
    let watched: Vec<NamespacedName> = kb
        .secure_settings()
        .iter()
        .map(|s| NamespacedName::new(&namespace, &s.secret_name))
        .collect();
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

/// Aggregates the secure settings and returns what the pod needs to load them, or
/// `None` when the Kibana has no secure settings.
pub async fn reconcile_resources(
    ctx: &Context,
    kb: &Kibana,
    base_metadata: &ObjectMeta,
    image: &str,
) -> Result<Option<KeystoreResources>, Error> {
    let kb_name = kb.name_any();
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &kb.namespace().unwrap_or_default());
    let name = secure_settings_secret_name(&kb_name);

    reconcile_watch(ctx, kb);

    if kb.secure_settings().is_empty() {
        delete(&secrets, &name).await?;
        return Ok(None);
    }

    let mut data = BTreeMap::new();
    for source in kb.secure_settings() {
        let Some(secret) = secrets.get_opt(&source.secret_name).await? else {
            emit_event(
                &ctx.recorder,
                kb,
                EventType::Warning,
                REASON_UNEXPECTED,
                format!("Secure settings secret not found: {}", source.secret_name),
            )
            .await;
            return Err(Error::SecretNotFound(source.secret_name.clone()));
        };
        data.extend(select_entries(source, &secret)?);
    }

    let aggregated = Secret {
        metadata: object_meta(base_metadata, &name),
        data: Some(data),
        ..Default::default()
    };
    let applied = apply(&secrets, &name, &aggregated).await?;
    let version = applied.resource_version().unwrap_or_default();
    debug!("Secure settings secret {} at version {}", name, version);

    Ok(Some(KeystoreResources {
        volume: secure_settings_volume(&kb_name),
        init_container: init_container(image),
        version,
    }))
}
