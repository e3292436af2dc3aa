//! The ConfigMap holding the init container script.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, ConfigMapVolumeSource, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Api;

use crate::Error;

use super::{apply, object_meta, scripts_config_map_name};

pub const SCRIPTS_VOLUME_NAME: &str = "kibana-scripts";
pub const SCRIPTS_MOUNT_PATH: &str = "/mnt/elastic-internal/scripts";
pub const INIT_SCRIPT_NAME: &str = "init.sh";
const SCRIPTS_DEFAULT_MODE: i32 = 0o755;

pub const CONFIG_SECRET_MOUNT_PATH: &str = "/mnt/elastic-internal/kibana-config";
pub const CONFIG_LOCAL_INIT_MOUNT_PATH: &str = "/mnt/elastic-internal/kibana-config-local";
pub const PLUGINS_INIT_MOUNT_PATH: &str = "/mnt/elastic-internal/kibana-plugins-local";
pub const BUNDLED_PLUGINS_PATH: &str = "/usr/share/kibana/plugins";

/// Renders `init.sh`. Config files are linked from the config secret mount into the
/// writable config volume. With a read-only root filesystem the plugins directory is a
/// volume too, so the plugins shipped in the image are copied into it first.
pub fn init_script(copy_plugins: bool) -> String {
    let mut script = format!(
        r#"#!/usr/bin/env bash
set -eux

init_config_initialized_flag={CONFIG_LOCAL_INIT_MOUNT_PATH}/elastic-internal-init-config.ok

if [[ -f "${{init_config_initialized_flag}}" ]]; then
    echo "Kibana configuration already initialized."
    exit 0
fi

echo "Setup Kibana configuration"
ln -sf {CONFIG_SECRET_MOUNT_PATH}/* {CONFIG_LOCAL_INIT_MOUNT_PATH}/
"#
    );
    if copy_plugins {
        script.push_str(&format!(
            r#"
if [[ -d {BUNDLED_PLUGINS_PATH} ]] && [[ -n "$(ls -A {BUNDLED_PLUGINS_PATH})" ]]; then
    echo "Copying bundled plugins"
    cp -av {BUNDLED_PLUGINS_PATH}/. {PLUGINS_INIT_MOUNT_PATH}/
fi
"#
        ));
    }
    script.push_str(
        r#"
touch "${init_config_initialized_flag}"
echo "Kibana configuration successfully prepared."
"#,
    );
    script
}

pub fn scripts_config_map(base_metadata: &ObjectMeta, kb_name: &str, copy_plugins: bool) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(base_metadata, scripts_config_map_name(kb_name)),
        data: Some(BTreeMap::from([(
            INIT_SCRIPT_NAME.to_string(),
            init_script(copy_plugins),
        )])),
        ..Default::default()
    }
}

pub fn scripts_volume(kb_name: &str) -> Volume {
    Volume {
        name: SCRIPTS_VOLUME_NAME.into(),
        config_map: Some(ConfigMapVolumeSource {
            name: scripts_config_map_name(kb_name),
            default_mode: Some(SCRIPTS_DEFAULT_MODE),
            optional: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn scripts_volume_mount() -> VolumeMount {
    VolumeMount {
        name: SCRIPTS_VOLUME_NAME.into(),
        mount_path: SCRIPTS_MOUNT_PATH.into(),
        read_only: Some(true),
        ..Default::default()
    }
}

pub async fn reconcile_scripts_config_map(
    api: &Api<ConfigMap>,
    base_metadata: &ObjectMeta,
    kb_name: &str,
    copy_plugins: bool,
) -> Result<ConfigMap, Error> {
    let cm = scripts_config_map(base_metadata, kb_name, copy_plugins);
    apply(api, &scripts_config_map_name(kb_name), &cm).await
}
