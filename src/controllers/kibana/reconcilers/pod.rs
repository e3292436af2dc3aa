//! Pod template of the Kibana deployment.
//!
//! The user's `spec.podTemplate` is the starting point. Operator defaults only fill in
//! what the user left unset, except for the identity labels which are always enforced.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HTTPGetAction,
    PodSecurityContext, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SecretVolumeSource,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use semver::Version;
use tracing::warn;

use crate::resources::kibanas::{AssociationConf, Kibana};
use crate::{version, Error};

use super::config::{
    CanonicalConfig, ENT_CERTS_MOUNT_PATH, ES_CERTS_MOUNT_PATH, HTTP_CERTS_MOUNT_PATH, SERVER_BASE_PATH,
    SERVER_REWRITE_BASE_PATH,
};
use super::keystore::KeystoreResources;
use super::scripts::{
    scripts_volume, scripts_volume_mount, CONFIG_LOCAL_INIT_MOUNT_PATH, CONFIG_SECRET_MOUNT_PATH,
    INIT_SCRIPT_NAME, PLUGINS_INIT_MOUNT_PATH, SCRIPTS_MOUNT_PATH,
};
use super::{
    config_secret_name, internal_certs_secret_name, quantity, CONFIG_HASH_ANNOTATION, HTTP_PORT,
    VERSION_LABEL,
};

pub const KIBANA_CONTAINER_NAME: &str = "kibana";
pub const INIT_CONTAINER_NAME: &str = "elastic-internal-init";
pub const DEFAULT_IMAGE_REPOSITORY: &str = "docker.elastic.co/kibana/kibana";
pub const FILEBEAT_MODULE_ANNOTATION: &str = "co.elastic.logs/module";

pub const DATA_VOLUME_NAME: &str = "kibana-data";
pub const DATA_VOLUME_MOUNT_PATH: &str = "/usr/share/kibana/data";
pub const CONFIG_VOLUME_NAME: &str = "elastic-internal-kibana-config";
pub const CONFIG_LOCAL_VOLUME_NAME: &str = "elastic-internal-kibana-config-local";
pub const CONFIG_LOCAL_MOUNT_PATH: &str = "/usr/share/kibana/config";
pub const PLUGINS_VOLUME_NAME: &str = "kibana-plugins";
pub const PLUGINS_VOLUME_MOUNT_PATH: &str = "/usr/share/kibana/plugins";
pub const LOGS_VOLUME_NAME: &str = "kibana-logs";
pub const LOGS_VOLUME_MOUNT_PATH: &str = "/usr/share/kibana/logs";
pub const TEMP_VOLUME_NAME: &str = "temp-volume";
pub const TEMP_VOLUME_MOUNT_PATH: &str = "/tmp";
pub const ES_CERTS_VOLUME_NAME: &str = "elasticsearch-certs";
pub const ENT_CERTS_VOLUME_NAME: &str = "ent-certs";
pub const HTTP_CERTS_VOLUME_NAME: &str = "elastic-internal-http-certificates";

pub const ENV_NODE_OPTIONS: &str = "NODE_OPTIONS";
const ENV_BASE_PATH: &str = "SERVER_BASEPATH";
const ENV_REWRITE_BASE_PATH: &str = "SERVER_REWRITEBASEPATH";
const MAX_OLD_SPACE_PERCENTAGE: i64 = 75;
const MAX_OLD_SPACE_SIZE_OPTION: &str = "--max-old-space-size";

const DEFAULT_FS_USER: i64 = 1000;
const DEFAULT_FS_GROUP: i64 = 1000;

/// Hook for features that add to the pod template, stack monitoring sidecars for instance.
pub trait PodTemplateDecorator: Send + Sync {
    fn decorate(&self, kb: &Kibana, builder: PodTemplateBuilder) -> Result<PodTemplateBuilder, Error>;
}

/// A volume together with where the Kibana container mounts it.
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeWithMount {
    pub volume: Volume,
    pub mount: VolumeMount,
}

impl VolumeWithMount {
    fn empty_dir(name: &str, mount_path: &str) -> Self {
        Self {
            volume: Volume {
                name: name.into(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
            mount: mount(name, mount_path, false),
        }
    }

    fn secret(name: &str, secret_name: String, mount_path: &str) -> Self {
        Self {
            volume: Volume {
                name: name.into(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret_name),
                    optional: Some(false),
                    ..Default::default()
                }),
                ..Default::default()
            },
            mount: mount(name, mount_path, true),
        }
    }
}

fn mount(name: &str, mount_path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.into(),
        mount_path: mount_path.into(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn memory_resources(memory: &str, cpu: Option<&str>) -> ResourceRequirements {
    let mut quantities = BTreeMap::from([("memory".to_string(), Quantity(memory.into()))]);
    if let Some(cpu) = cpu {
        quantities.insert("cpu".into(), Quantity(cpu.into()));
    }
    ResourceRequirements {
        requests: Some(quantities.clone()),
        limits: Some(quantities),
        ..Default::default()
    }
}

pub fn default_resources() -> ResourceRequirements {
    memory_resources("1Gi", None)
}

fn is_unset(resources: Option<&ResourceRequirements>) -> bool {
    resources.is_none_or(|r| {
        r.limits.as_ref().is_none_or(BTreeMap::is_empty)
            && r.requests.as_ref().is_none_or(BTreeMap::is_empty)
    })
}

pub fn default_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".into()]),
            ..Default::default()
        }),
        privileged: Some(false),
        read_only_root_filesystem: Some(true),
        run_as_non_root: Some(true),
        run_as_user: Some(DEFAULT_FS_USER),
        run_as_group: Some(DEFAULT_FS_GROUP),
        ..Default::default()
    }
}

pub fn default_pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        fs_group: Some(DEFAULT_FS_GROUP),
        ..Default::default()
    }
}

fn merge_by_name<T: Clone>(
    existing: &mut Option<Vec<T>>,
    defaults: impl IntoIterator<Item = T>,
    same: impl Fn(&T, &T) -> bool,
) {
    let items = existing.get_or_insert_with(Vec::new);
    for item in defaults {
        if !items.iter().any(|e| same(e, &item)) {
            items.push(item);
        }
    }
}

fn merge_volume_mounts(existing: &mut Option<Vec<VolumeMount>>, defaults: impl IntoIterator<Item = VolumeMount>) {
    merge_by_name(existing, defaults, |a, b| {
        a.name == b.name || a.mount_path == b.mount_path
    });
}

fn merge_env(existing: &mut Option<Vec<EnvVar>>, defaults: impl IntoIterator<Item = EnvVar>) {
    merge_by_name(existing, defaults, |a, b| a.name == b.name);
}

/// Fills the unset fields of `user` from `defaults`. Used for containers the operator
/// and the user both declare under the same name.
fn merge_container(user: &mut Container, defaults: Container) {
    if user.image.as_deref().is_none_or(str::is_empty) {
        user.image = defaults.image;
    }
    if user.command.as_ref().is_none_or(Vec::is_empty) {
        user.command = defaults.command;
    }
    if user.args.as_ref().is_none_or(Vec::is_empty) {
        user.args = defaults.args;
    }
    if is_unset(user.resources.as_ref()) {
        user.resources = defaults.resources;
    }
    if user.security_context.is_none() {
        user.security_context = defaults.security_context;
    }
    merge_env(&mut user.env, defaults.env.unwrap_or_default());
    merge_volume_mounts(&mut user.volume_mounts, defaults.volume_mounts.unwrap_or_default());
}

/// Builds a pod template on top of the one provided by the user.
#[derive(Clone, Debug)]
pub struct PodTemplateBuilder {
    template: PodTemplateSpec,
    container_name: String,
}

impl PodTemplateBuilder {
    pub fn new(user: Option<&PodTemplateSpec>, container_name: &str) -> Self {
        let mut builder = Self {
            template: user.cloned().unwrap_or_default(),
            container_name: container_name.into(),
        };
        builder.main_container();
        builder
    }

    fn spec(&mut self) -> &mut PodSpec {
        self.template.spec.get_or_insert_with(PodSpec::default)
    }

    fn metadata(&mut self) -> &mut ObjectMeta {
        self.template.metadata.get_or_insert_with(ObjectMeta::default)
    }

    /// The main container, created if the user template does not declare it.
    pub fn main_container(&mut self) -> &mut Container {
        let name = self.container_name.clone();
        let containers = &mut self.spec().containers;
        let index = match containers.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                containers.insert(
                    0,
                    Container {
                        name,
                        ..Default::default()
                    },
                );
                0
            }
        };
        &mut containers[index]
    }

    /// Labels the operator relies on. They override user labels with the same key.
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.metadata()
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels);
        self
    }

    pub fn with_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        let existing = self.metadata().annotations.get_or_insert_with(BTreeMap::new);
        for (k, v) in annotations {
            existing.entry(k).or_insert(v);
        }
        self
    }

    /// Sets an annotation regardless of what the user set.
    pub fn with_forced_annotation(mut self, key: &str, value: String) -> Self {
        self.metadata()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        let container = self.main_container();
        if is_unset(container.resources.as_ref()) {
            container.resources = Some(resources);
        }
        self
    }

    /// `spec_image` wins over the user's container image, which wins over `default_image`.
    pub fn with_image(mut self, spec_image: Option<&str>, default_image: String) -> Self {
        let container = self.main_container();
        match spec_image.filter(|i| !i.is_empty()) {
            Some(image) => container.image = Some(image.into()),
            None if container.image.as_deref().is_none_or(str::is_empty) => {
                container.image = Some(default_image)
            }
            None => {}
        }
        self
    }

    pub fn with_readiness_probe(mut self, probe: Probe) -> Self {
        let container = self.main_container();
        if container.readiness_probe.is_none() {
            container.readiness_probe = Some(probe);
        }
        self
    }

    pub fn with_ports(mut self, ports: Vec<ContainerPort>) -> Self {
        merge_by_name(&mut self.main_container().ports, ports, |a, b| {
            a.name == b.name || a.container_port == b.container_port
        });
        self
    }

    pub fn with_env(mut self, env: Vec<EnvVar>) -> Self {
        merge_env(&mut self.main_container().env, env);
        self
    }

    pub fn with_volumes(mut self, volumes: Vec<Volume>) -> Self {
        merge_by_name(&mut self.spec().volumes, volumes, |a, b| a.name == b.name);
        self
    }

    pub fn with_volume_mounts(mut self, mounts: Vec<VolumeMount>) -> Self {
        merge_volume_mounts(&mut self.main_container().volume_mounts, mounts);
        self
    }

    pub fn with_volume_like(self, volumes: Vec<VolumeWithMount>) -> Self {
        let (volumes, mounts): (Vec<_>, Vec<_>) =
            volumes.into_iter().map(|v| (v.volume, v.mount)).unzip();
        self.with_volumes(volumes).with_volume_mounts(mounts)
    }

    /// Operator init containers run first, in the given order, followed by the user's own.
    /// A user init container named like an operator one customizes it.
    pub fn with_init_containers(mut self, init_containers: Vec<Container>) -> Self {
        let spec = self.spec();
        let mut user = spec.init_containers.take().unwrap_or_default();
        let mut merged = Vec::with_capacity(user.len() + init_containers.len());
        for default in init_containers {
            match user.iter().position(|c| c.name == default.name) {
                Some(index) => {
                    let mut container = user.remove(index);
                    merge_container(&mut container, default);
                    merged.push(container);
                }
                None => merged.push(default),
            }
        }
        merged.extend(user);
        spec.init_containers = Some(merged);
        self
    }

    /// Init containers without an image run the main image, and see the volumes the main
    /// container mounts, unless they mount the same volume elsewhere.
    pub fn with_init_container_defaults(mut self) -> Self {
        let main = self.main_container().clone();
        if let Some(init_containers) = self.spec().init_containers.as_mut() {
            for init in init_containers {
                if init.image.as_deref().is_none_or(str::is_empty) {
                    init.image = main.image.clone();
                }
                merge_volume_mounts(&mut init.volume_mounts, main.volume_mounts.clone().unwrap_or_default());
            }
        }
        self
    }

    pub fn with_containers_security_context(mut self, security_context: SecurityContext) -> Self {
        let container = self.main_container();
        if container.security_context.is_none() {
            container.security_context = Some(security_context);
        }
        self
    }

    pub fn with_pod_security_context(mut self, security_context: PodSecurityContext) -> Self {
        let spec = self.spec();
        if spec.security_context.is_none() {
            spec.security_context = Some(security_context);
        }
        self
    }

    pub fn with_automount_service_account_token(mut self) -> Self {
        let spec = self.spec();
        if spec.automount_service_account_token.is_none() {
            spec.automount_service_account_token = Some(false);
        }
        self
    }

    pub fn with_service_account_name(mut self, name: Option<&str>) -> Self {
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            let spec = self.spec();
            if spec.service_account_name.is_none() {
                spec.service_account_name = Some(name.into());
            }
        }
        self
    }

    /// Adds a sidecar container unless one with the same name exists.
    pub fn with_sidecar(mut self, container: Container) -> Self {
        let containers = &mut self.spec().containers;
        if !containers.iter().any(|c| c.name == container.name) {
            containers.push(container);
        }
        self
    }

    pub fn build(self) -> PodTemplateSpec {
        self.template
    }
}

/// `--max-old-space-size` for 75% of the memory limit, if there is one.
pub fn max_old_space_option(resources: Option<&ResourceRequirements>) -> Option<String> {
    let limit = resources?.limits.as_ref()?.get("memory")?;
    let bytes = match quantity::to_bytes(limit) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Cannot read memory limit {}: {}", limit.0, e);
            return None;
        }
    };
    if bytes <= 0 {
        return None;
    }
    let mib = bytes / (1024 * 1024);
    Some(format!(
        "{MAX_OLD_SPACE_SIZE_OPTION}={}",
        mib * MAX_OLD_SPACE_PERCENTAGE / 100
    ))
}

/// Adds `option` to `NODE_OPTIONS`, leaving a user chosen heap size alone.
pub fn merge_node_options(env: &mut Vec<EnvVar>, option: &str) {
    match env.iter_mut().find(|e| e.name == ENV_NODE_OPTIONS) {
        Some(var) => {
            let current = var.value.as_deref().unwrap_or_default().trim();
            if current.contains(MAX_OLD_SPACE_SIZE_OPTION) {
                return;
            }
            var.value = Some(if current.is_empty() {
                option.into()
            } else {
                format!("{current} {option}")
            });
        }
        None => env.push(EnvVar {
            name: ENV_NODE_OPTIONS.into(),
            value: Some(option.into()),
            ..Default::default()
        }),
    }
}

pub fn readiness_probe(use_tls: bool, base_path: &str) -> Probe {
    Probe {
        failure_threshold: Some(3),
        initial_delay_seconds: Some(10),
        period_seconds: Some(10),
        success_threshold: Some(1),
        timeout_seconds: Some(5),
        http_get: Some(HTTPGetAction {
            port: IntOrString::Int(HTTP_PORT),
            path: Some(format!("{base_path}/login")),
            scheme: Some(if use_tls { "HTTPS" } else { "HTTP" }.into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn base_path_from_env(kb: &Kibana) -> Result<Option<String>, Error> {
    let container = kb
        .spec
        .pod_template
        .as_ref()
        .and_then(|t| t.spec.as_ref())
        .and_then(|s| s.containers.iter().find(|c| c.name == KIBANA_CONTAINER_NAME));
    let env = container.and_then(|c| c.env.as_deref()).unwrap_or_default();
    let value = |name: &str| {
        env.iter()
            .find(|e| e.name == name)
            .map(|e| e.value.clone().unwrap_or_default())
    };

    let Some(rewrite) = value(ENV_REWRITE_BASE_PATH) else {
        return Ok(None);
    };
    let rewrite = parse_bool(&rewrite).ok_or_else(|| {
        Error::InvalidKibanaConfig(format!(
            "failed to parse {ENV_REWRITE_BASE_PATH} value {rewrite}"
        ))
    })?;
    Ok(rewrite.then(|| value(ENV_BASE_PATH).unwrap_or_default()))
}

/// Path prefix Kibana serves under: from the container env first, then from the config.
/// Only applies when base path rewriting is on.
pub fn base_path(kb: &Kibana) -> Result<String, Error> {
    if let Some(path) = base_path_from_env(kb)?.filter(|p| !p.is_empty()) {
        return Ok(path);
    }
    let Some(config) = kb.spec.config.clone() else {
        return Ok(String::new());
    };
    let config = CanonicalConfig::from_value(config)?;
    let rewrite = match config.get(SERVER_REWRITE_BASE_PATH) {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => parse_bool(s).unwrap_or(false),
        _ => false,
    };
    Ok(if rewrite {
        config.get_str(SERVER_BASE_PATH).unwrap_or_default().into()
    } else {
        String::new()
    })
}

pub fn default_image(kb_version: &Version) -> String {
    format!("{DEFAULT_IMAGE_REPOSITORY}:{kb_version}")
}

/// Whether pods run with the hardened security context and a read-only root filesystem.
pub fn hardened_security_context(kb_version: &Version, set_default_security_context: bool) -> bool {
    set_default_security_context
        && version::at_least(kb_version, &version::HARDENED_SECURITY_CONTEXT_SINCE)
}

/// The volumes mounted by the Kibana container.
pub fn volumes(
    kb: &Kibana,
    association: Option<&AssociationConf>,
    ent_association: Option<&AssociationConf>,
    hardened: bool,
) -> Vec<VolumeWithMount> {
    let kb_name = kb.name_any();
    let mut volumes = vec![
        VolumeWithMount::empty_dir(DATA_VOLUME_NAME, DATA_VOLUME_MOUNT_PATH),
        VolumeWithMount::empty_dir(CONFIG_LOCAL_VOLUME_NAME, CONFIG_LOCAL_MOUNT_PATH),
        VolumeWithMount::secret(
            CONFIG_VOLUME_NAME,
            config_secret_name(&kb_name),
            CONFIG_SECRET_MOUNT_PATH,
        ),
        VolumeWithMount {
            volume: scripts_volume(&kb_name),
            mount: scripts_volume_mount(),
        },
    ];
    if let Some(conf) = association.filter(|c| c.ca_is_configured()) {
        volumes.push(VolumeWithMount::secret(
            ES_CERTS_VOLUME_NAME,
            conf.ca_secret_name.clone(),
            ES_CERTS_MOUNT_PATH,
        ));
    }
    if let Some(conf) = ent_association.filter(|c| c.ca_is_configured()) {
        volumes.push(VolumeWithMount::secret(
            ENT_CERTS_VOLUME_NAME,
            conf.ca_secret_name.clone(),
            ENT_CERTS_MOUNT_PATH,
        ));
    }
    if kb.tls_enabled() {
        volumes.push(VolumeWithMount::secret(
            HTTP_CERTS_VOLUME_NAME,
            internal_certs_secret_name(&kb_name),
            HTTP_CERTS_MOUNT_PATH,
        ));
    }
    if hardened {
        volumes.push(VolumeWithMount::empty_dir(PLUGINS_VOLUME_NAME, PLUGINS_VOLUME_MOUNT_PATH));
        volumes.push(VolumeWithMount::empty_dir(LOGS_VOLUME_NAME, LOGS_VOLUME_MOUNT_PATH));
        volumes.push(VolumeWithMount::empty_dir(TEMP_VOLUME_NAME, TEMP_VOLUME_MOUNT_PATH));
    }
    volumes
}

/// The init container preparing the config directory, see the scripts ConfigMap.
pub fn init_container(hardened: bool) -> Container {
    let mut volume_mounts = vec![
        mount(CONFIG_LOCAL_VOLUME_NAME, CONFIG_LOCAL_INIT_MOUNT_PATH, false),
        mount(CONFIG_VOLUME_NAME, CONFIG_SECRET_MOUNT_PATH, true),
        scripts_volume_mount(),
    ];
    if hardened {
        volume_mounts.push(mount(PLUGINS_VOLUME_NAME, PLUGINS_INIT_MOUNT_PATH, false));
    }
    Container {
        name: INIT_CONTAINER_NAME.into(),
        command: Some(vec![
            "/usr/bin/env".into(),
            "bash".into(),
            "-c".into(),
            format!("{SCRIPTS_MOUNT_PATH}/{INIT_SCRIPT_NAME}"),
        ]),
        volume_mounts: Some(volume_mounts),
        resources: Some(memory_resources("50Mi", Some("100m"))),
        security_context: hardened.then(default_security_context),
        ..Default::default()
    }
}

pub struct PodTemplateParams<'a> {
    pub kb_version: &'a Version,
    pub keystore: Option<&'a KeystoreResources>,
    pub association: Option<&'a AssociationConf>,
    pub ent_association: Option<&'a AssociationConf>,
    pub base_path: &'a str,
    /// Digest of everything the pods read at startup only; a change rolls the pods.
    pub config_hash: &'a str,
    pub set_default_security_context: bool,
    pub decorators: &'a [Arc<dyn PodTemplateDecorator>],
}

pub fn new_pod_template_spec(kb: &Kibana, params: &PodTemplateParams<'_>) -> Result<PodTemplateSpec, Error> {
    let mut labels = kb.identity_labels();
    labels.insert(VERSION_LABEL.into(), kb.spec.version.clone());
    let hardened = hardened_security_context(params.kb_version, params.set_default_security_context);

    let mut builder = PodTemplateBuilder::new(kb.spec.pod_template.as_ref(), KIBANA_CONTAINER_NAME)
        .with_labels(labels)
        .with_annotations(BTreeMap::from([(
            FILEBEAT_MODULE_ANNOTATION.to_string(),
            "kibana".to_string(),
        )]))
        .with_forced_annotation(CONFIG_HASH_ANNOTATION, params.config_hash.to_string())
        .with_resources(default_resources())
        .with_image(kb.spec.image.as_deref(), default_image(params.kb_version))
        .with_readiness_probe(readiness_probe(kb.tls_enabled(), params.base_path))
        .with_ports(vec![ContainerPort {
            name: Some(kb.protocol().into()),
            container_port: HTTP_PORT,
            protocol: Some("TCP".into()),
            ..Default::default()
        }])
        .with_volume_like(volumes(kb, params.association, params.ent_association, hardened))
        .with_automount_service_account_token()
        .with_service_account_name(kb.spec.service_account_name.as_deref());

    let main = builder.main_container();
    if let Some(option) = max_old_space_option(main.resources.as_ref()) {
        merge_node_options(main.env.get_or_insert_with(Vec::new), &option);
    }

    if hardened {
        builder = builder
            .with_containers_security_context(default_security_context())
            .with_pod_security_context(default_pod_security_context());
    }

    let mut init_containers = vec![init_container(hardened)];
    if let Some(keystore) = params.keystore {
        builder = builder.with_volumes(vec![keystore.volume.clone()]);
        let mut keystore_init = keystore.init_container.clone();
        if hardened {
            keystore_init.security_context = Some(default_security_context());
        }
        init_containers.push(keystore_init);
    }
    builder = builder.with_init_containers(init_containers);

    for decorator in params.decorators {
        builder = decorator.decorate(kb, builder)?;
    }

    Ok(builder.with_init_container_defaults().build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::kibana::reconcilers::keystore;
    use serde_json::json;

    fn kibana(spec: serde_json::Value) -> Kibana {
        serde_json::from_value(json!({
            "apiVersion": "kibana.k8s.elastic.co/v1",
            "kind": "Kibana",
            "metadata": {"name": "test", "namespace": "ns"},
            "spec": spec,
        }))
        .unwrap()
    }

    fn params(kb_version: &Version) -> PodTemplateParams<'_> {
        PodTemplateParams {
            kb_version,
            keystore: None,
            association: None,
            ent_association: None,
            base_path: "",
            config_hash: "1234",
            set_default_security_context: true,
            decorators: &[],
        }
    }

    fn main_container(template: &PodTemplateSpec) -> &Container {
        template
            .spec
            .as_ref()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.name == KIBANA_CONTAINER_NAME)
            .unwrap()
    }

    fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .as_deref()
    }

    fn volume_names(template: &PodTemplateSpec) -> Vec<&str> {
        template
            .spec
            .as_ref()
            .unwrap()
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .map(|v| v.name.as_str())
            .collect()
    }

    #[test]
    fn defaults() {
        let v = Version::new(7, 17, 0);
        let kb = kibana(json!({"version": "7.17.0"}));
        let template = new_pod_template_spec(&kb, &params(&v)).unwrap();

        let meta = template.metadata.as_ref().unwrap();
        let labels = meta.labels.as_ref().unwrap();
        assert_eq!(labels["common.k8s.elastic.co/type"], "kibana");
        assert_eq!(labels["kibana.k8s.elastic.co/name"], "test");
        assert_eq!(labels[VERSION_LABEL], "7.17.0");
        let annotations = meta.annotations.as_ref().unwrap();
        assert_eq!(annotations[FILEBEAT_MODULE_ANNOTATION], "kibana");
        assert_eq!(annotations[CONFIG_HASH_ANNOTATION], "1234");

        let container = main_container(&template);
        assert_eq!(
            container.image.as_deref(),
            Some("docker.elastic.co/kibana/kibana:7.17.0")
        );
        assert_eq!(container.resources, Some(default_resources()));
        assert_eq!(env_value(container, ENV_NODE_OPTIONS), Some("--max-old-space-size=768"));
        let port = &container.ports.as_ref().unwrap()[0];
        assert_eq!(port.name.as_deref(), Some("https"));
        assert_eq!(port.container_port, 5601);
        let probe = container.readiness_probe.as_ref().unwrap().http_get.as_ref().unwrap();
        assert_eq!(probe.path.as_deref(), Some("/login"));
        assert_eq!(probe.scheme.as_deref(), Some("HTTPS"));
        assert_eq!(
            container.security_context.as_ref().unwrap().read_only_root_filesystem,
            Some(true)
        );

        let spec = template.spec.as_ref().unwrap();
        assert_eq!(spec.automount_service_account_token, Some(false));
        assert_eq!(spec.security_context.as_ref().unwrap().fs_group, Some(1000));
        assert_eq!(
            volume_names(&template),
            vec![
                DATA_VOLUME_NAME,
                CONFIG_LOCAL_VOLUME_NAME,
                CONFIG_VOLUME_NAME,
                "kibana-scripts",
                HTTP_CERTS_VOLUME_NAME,
                PLUGINS_VOLUME_NAME,
                LOGS_VOLUME_NAME,
                TEMP_VOLUME_NAME,
            ]
        );

        let init = &spec.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.name, INIT_CONTAINER_NAME);
        assert_eq!(init.image, container.image);
        let init_mounts = init.volume_mounts.as_ref().unwrap();
        let config_local = init_mounts.iter().find(|m| m.name == CONFIG_LOCAL_VOLUME_NAME).unwrap();
        assert_eq!(config_local.mount_path, CONFIG_LOCAL_INIT_MOUNT_PATH);
        assert!(init_mounts.iter().any(|m| m.name == DATA_VOLUME_NAME));
    }

    #[test]
    fn no_hardening_before_7_10() {
        let v = Version::new(7, 9, 3);
        let kb = kibana(json!({"version": "7.9.3", "http": {"tls": {"selfSignedCertificate": {"disabled": true}}}}));
        let template = new_pod_template_spec(&kb, &params(&v)).unwrap();
        let container = main_container(&template);
        assert!(container.security_context.is_none());
        assert!(template.spec.as_ref().unwrap().security_context.is_none());
        let names = volume_names(&template);
        assert!(!names.contains(&LOGS_VOLUME_NAME));
        assert!(!names.contains(&HTTP_CERTS_VOLUME_NAME));
        assert_eq!(container.ports.as_ref().unwrap()[0].name.as_deref(), Some("http"));
    }

    #[test]
    fn user_template_is_preserved() {
        let v = Version::new(8, 5, 0);
        let kb = kibana(json!({
            "version": "8.5.0",
            "podTemplate": {
                "metadata": {
                    "labels": {"team": "observability", "kibana.k8s.elastic.co/name": "hijack"},
                    "annotations": {"co.elastic.logs/module": "custom"},
                },
                "spec": {
                    "automountServiceAccountToken": true,
                    "containers": [{
                        "name": "kibana",
                        "image": "my-registry/kibana:8.5.0",
                        "resources": {"limits": {"memory": "2Gi"}},
                        "env": [{"name": "NODE_OPTIONS", "value": "--trace-warnings"}],
                    }],
                    "initContainers": [{"name": "user-init", "image": "busybox"}],
                },
            },
        }));
        let template = new_pod_template_spec(&kb, &params(&v)).unwrap();

        let meta = template.metadata.as_ref().unwrap();
        let labels = meta.labels.as_ref().unwrap();
        assert_eq!(labels["team"], "observability");
        assert_eq!(labels["kibana.k8s.elastic.co/name"], "test");
        assert_eq!(meta.annotations.as_ref().unwrap()[FILEBEAT_MODULE_ANNOTATION], "custom");

        let container = main_container(&template);
        assert_eq!(container.image.as_deref(), Some("my-registry/kibana:8.5.0"));
        assert_eq!(
            env_value(container, ENV_NODE_OPTIONS),
            Some("--trace-warnings --max-old-space-size=1536")
        );

        let spec = template.spec.as_ref().unwrap();
        assert_eq!(spec.automount_service_account_token, Some(true));
        let init_names: Vec<&str> = spec
            .init_containers
            .as_ref()
            .unwrap()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(init_names, vec![INIT_CONTAINER_NAME, "user-init"]);
    }

    #[test]
    fn spec_image_wins() {
        let v = Version::new(8, 5, 0);
        let kb = kibana(json!({
            "version": "8.5.0",
            "image": "override:1",
            "podTemplate": {"spec": {"containers": [{"name": "kibana", "image": "template:1"}]}},
        }));
        let template = new_pod_template_spec(&kb, &params(&v)).unwrap();
        assert_eq!(main_container(&template).image.as_deref(), Some("override:1"));
    }

    #[test]
    fn keystore_init_container_follows_the_config_init() {
        let v = Version::new(8, 5, 0);
        let kb = kibana(json!({"version": "8.5.0", "secureSettings": [{"secretName": "settings"}]}));
        let resources = KeystoreResources {
            volume: keystore::secure_settings_volume("test"),
            init_container: keystore::init_container("docker.elastic.co/kibana/kibana:8.5.0"),
            version: "42".into(),
        };
        let template = new_pod_template_spec(
            &kb,
            &PodTemplateParams {
                keystore: Some(&resources),
                ..params(&v)
            },
        )
        .unwrap();
        let spec = template.spec.as_ref().unwrap();
        let init = spec.init_containers.as_ref().unwrap();
        assert_eq!(init[1].name, keystore::KEYSTORE_INIT_CONTAINER_NAME);
        let config_mount = init[1]
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .find(|m| m.name == CONFIG_LOCAL_VOLUME_NAME)
            .unwrap();
        assert_eq!(config_mount.mount_path, CONFIG_LOCAL_MOUNT_PATH);
        assert!(volume_names(&template).contains(&keystore::SECURE_SETTINGS_VOLUME_NAME));
    }

    #[test]
    fn association_ca_is_mounted() {
        let v = Version::new(8, 5, 0);
        let kb = kibana(json!({"version": "8.5.0"}));
        let conf = AssociationConf {
            ca_secret_name: "es-ca".into(),
            ca_cert_provided: true,
            url: "https://es:9200".into(),
            ..Default::default()
        };
        let template = new_pod_template_spec(
            &kb,
            &PodTemplateParams {
                association: Some(&conf),
                ..params(&v)
            },
        )
        .unwrap();
        let mount = main_container(&template)
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .find(|m| m.name == ES_CERTS_VOLUME_NAME)
            .unwrap()
            .clone();
        assert_eq!(mount.mount_path, ES_CERTS_MOUNT_PATH);
        assert!(template
            .spec
            .as_ref()
            .unwrap()
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .all(|v| v.name != ENT_CERTS_VOLUME_NAME));
    }

    #[test]
    fn enterprise_search_ca_is_mounted() {
        let v = Version::new(8, 5, 0);
        let kb = kibana(json!({"version": "8.5.0"}));
        let conf = AssociationConf {
            ca_secret_name: "ent-ca-secret".into(),
            ca_cert_provided: true,
            url: "https://ent-url:3002".into(),
            ..Default::default()
        };
        let template = new_pod_template_spec(
            &kb,
            &PodTemplateParams {
                ent_association: Some(&conf),
                ..params(&v)
            },
        )
        .unwrap();
        let volume = template
            .spec
            .as_ref()
            .unwrap()
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == ENT_CERTS_VOLUME_NAME)
            .unwrap()
            .clone();
        assert_eq!(
            volume.secret.unwrap().secret_name.as_deref(),
            Some("ent-ca-secret")
        );
        let mount = main_container(&template)
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .find(|m| m.name == ENT_CERTS_VOLUME_NAME)
            .unwrap()
            .clone();
        assert_eq!(mount.mount_path, ENT_CERTS_MOUNT_PATH);
    }

    struct Sidecar;

    impl PodTemplateDecorator for Sidecar {
        fn decorate(&self, _kb: &Kibana, builder: PodTemplateBuilder) -> Result<PodTemplateBuilder, Error> {
            Ok(builder.with_sidecar(Container {
                name: "metricbeat".into(),
                image: Some("docker.elastic.co/beats/metricbeat:8.5.0".into()),
                ..Default::default()
            }))
        }
    }

    #[test]
    fn decorators_add_sidecars() {
        let v = Version::new(8, 5, 0);
        let kb = kibana(json!({"version": "8.5.0"}));
        let decorators: Vec<Arc<dyn PodTemplateDecorator>> = vec![Arc::new(Sidecar)];
        let template = new_pod_template_spec(
            &kb,
            &PodTemplateParams {
                decorators: &decorators,
                ..params(&v)
            },
        )
        .unwrap();
        let names: Vec<&str> = template
            .spec
            .as_ref()
            .unwrap()
            .containers
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["kibana", "metricbeat"]);
    }

    #[test]
    fn node_options() {
        let mut env = vec![];
        merge_node_options(&mut env, "--max-old-space-size=768");
        assert_eq!(env[0].value.as_deref(), Some("--max-old-space-size=768"));

        let mut env = vec![EnvVar {
            name: ENV_NODE_OPTIONS.into(),
            value: Some("--max-old-space-size=100".into()),
            ..Default::default()
        }];
        merge_node_options(&mut env, "--max-old-space-size=768");
        assert_eq!(env[0].value.as_deref(), Some("--max-old-space-size=100"));

        assert_eq!(max_old_space_option(None), None);
        assert_eq!(
            max_old_space_option(Some(&memory_resources("2G", None))),
            Some("--max-old-space-size=1430".into())
        );
    }

    #[test]
    fn base_path_sources() {
        let kb = kibana(json!({"version": "8.5.0"}));
        assert_eq!(base_path(&kb).unwrap(), "");

        let kb = kibana(json!({
            "version": "8.5.0",
            "config": {"server.basePath": "/monitoring/kibana", "server.rewriteBasePath": true},
        }));
        assert_eq!(base_path(&kb).unwrap(), "/monitoring/kibana");

        let kb = kibana(json!({
            "version": "8.5.0",
            "config": {"server": {"basePath": "/kb", "rewriteBasePath": false}},
        }));
        assert_eq!(base_path(&kb).unwrap(), "");

        let kb = kibana(json!({
            "version": "8.5.0",
            "config": {"server.basePath": "/from-config", "server.rewriteBasePath": true},
            "podTemplate": {"spec": {"containers": [{"name": "kibana", "env": [
                {"name": "SERVER_BASEPATH", "value": "/from-env"},
                {"name": "SERVER_REWRITEBASEPATH", "value": "true"},
            ]}]}},
        }));
        assert_eq!(base_path(&kb).unwrap(), "/from-env");

        let kb = kibana(json!({
            "version": "8.5.0",
            "podTemplate": {"spec": {"containers": [{"name": "kibana", "env": [
                {"name": "SERVER_REWRITEBASEPATH", "value": "maybe"},
            ]}]}},
        }));
        assert!(matches!(base_path(&kb), Err(Error::InvalidKibanaConfig(_))));
    }

    #[test]
    fn readiness_probe_follows_base_path() {
        let probe = readiness_probe(false, "/kb");
        let http = probe.http_get.unwrap();
        assert_eq!(http.path.as_deref(), Some("/kb/login"));
        assert_eq!(http.scheme.as_deref(), Some("HTTP"));
        assert_eq!(http.port, IntOrString::Int(5601));
    }
}
