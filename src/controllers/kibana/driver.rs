//! One pass over a Kibana: everything it needs, in dependency order.

use std::hash::Hasher;
use std::time::Duration;

use fnv::FnvHasher;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, ResourceExt};
use tracing::{debug, info};

use crate::resources::kibanas::{Kibana, KibanaStatus};
use crate::{version, Error, Result};

use super::controller::Context;
use super::reconcilers::certificates::{self, CERT_FILE_NAME};
use super::reconcilers::config::{self, ConfigInputs, SETTINGS_FILENAME};
use super::reconcilers::deployment::{self, DeploymentParams};
use super::reconcilers::association::{AssociationType, Associations};
use super::reconcilers::keystore::{self, KeystoreResources};
use super::reconcilers::pod::{self, PodTemplateParams};
use super::reconcilers::{
    association, base_metadata, internal_certs_secret_name, scripts, secret_data, service,
};

/// Digest of the inputs Kibana only reads at startup. Kept in a pod template annotation
/// so that any change to them rolls the pods.
async fn config_hash(
    secrets: &Api<Secret>,
    kb: &Kibana,
    keystore: Option<&KeystoreResources>,
    associations: &Associations,
    config_secret: &Secret,
) -> Result<String> {
    let mut hasher = FnvHasher::default();
    if let Some(keystore) = keystore {
        hasher.write(keystore.version.as_bytes());
    }
    for (_, conf) in associations.iter() {
        association::write_to_config_hash(secrets, conf, &mut hasher).await?;
    }
    if kb.tls_enabled() {
        let name = internal_certs_secret_name(&kb.name_any());
        let certs = secrets
            .get_opt(&name)
            .await?
            .ok_or(Error::SecretNotFound(name))?;
        if let Some(cert) = secret_data(&certs, CERT_FILE_NAME) {
            hasher.write(cert);
        }
    }
    if let Some(settings) = secret_data(config_secret, SETTINGS_FILENAME) {
        hasher.write(settings);
    }
    Ok(hasher.finish().to_string())
}

/// Reconciles every object derived from `kb` and records the observed deployment state
/// into `status`. Returns when certificates must be looked at again, if ever.
pub async fn reconcile(ctx: &Context, kb: &Kibana, status: &mut KibanaStatus) -> Result<Option<Duration>> {
    let kb_name = kb.name_any();
    let namespace = kb.namespace().unwrap_or_default();
    let kb_version = version::parse(&kb.spec.version).map_err(|message| Error::InvalidVersion {
        version: kb.spec.version.clone(),
        message,
    })?;

    status.association_status = association::association_status(kb, AssociationType::Elasticsearch);
    status.enterprise_search_association_status =
        association::association_status(kb, AssociationType::EnterpriseSearch);
    for association_type in AssociationType::ALL {
        if !association::is_configured_if_set(ctx, kb, association_type).await? {
            return Ok(None);
        }
    }
    let associations = Associations::configured(kb)?;
    for association_type in AssociationType::ALL {
        association::reconcile_watch(ctx, kb, association_type, associations.get(association_type));
    }
    let association = associations.elasticsearch.as_ref();

    let svc = service::reconcile_service(ctx.client.clone(), kb).await?;

    let base = base_metadata(kb);
    let rotate_in =
        certificates::reconcile(ctx, kb, Some(&svc), &base, &ctx.params.cert_rotation).await?;

    if !association::allow_version(ctx, kb, &kb_version, &associations).await {
        return Ok(rotate_in);
    }

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let credentials = match association {
        Some(conf) => association::credentials(&secrets, conf).await?,
        None => None,
    };
    let config_secret = config::reconcile_config_secret(
        ctx,
        kb,
        &base,
        ConfigInputs {
            kb_version: &kb_version,
            ip_family: ctx.params.ip_family,
            existing: None,
            association,
            ent_association: associations.enterprise_search.as_ref(),
            credentials: credentials.as_ref(),
        },
    )
    .await?;

    let hardened = pod::hardened_security_context(&kb_version, ctx.params.set_default_security_context);
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &namespace);
    scripts::reconcile_scripts_config_map(&config_maps, &base, &kb_name, hardened).await?;

    let image = kb
        .spec
        .image
        .clone()
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| pod::default_image(&kb_version));
    let keystore = keystore::reconcile_resources(ctx, kb, &base, &image).await?;

    let hash = config_hash(&secrets, kb, keystore.as_ref(), &associations, &config_secret).await?;
    debug!("Config hash of Kibana {}/{} is {}", namespace, kb_name, hash);

    let base_path = pod::base_path(kb)?;
    let pod_template = pod::new_pod_template_spec(
        kb,
        &PodTemplateParams {
            kb_version: &kb_version,
            keystore: keystore.as_ref(),
            association,
            ent_association: associations.enterprise_search.as_ref(),
            base_path: &base_path,
            config_hash: &hash,
            set_default_security_context: ctx.params.set_default_security_context,
            decorators: &ctx.decorators,
        },
    )?;

    let pods = deployment::list_pods(ctx.client.clone(), kb).await?;
    let strategy = deployment::strategy_type(&pods, &kb.spec.version);
    if strategy == deployment::StrategyType::Recreate && !pods.is_empty() {
        info!(
            "Recreating the pods of Kibana {}/{} to run version {}",
            namespace, kb_name, kb.spec.version
        );
    }

    let expected = deployment::new_deployment(
        kb,
        &base,
        DeploymentParams {
            replicas: kb.spec.count,
            revision_history_limit: kb.spec.revision_history_limit,
            pod_template,
            strategy,
        },
    );
    let reconciled = deployment::reconcile_deployment(ctx.client.clone(), &expected).await?;

    let pods = deployment::list_pods(ctx.client.clone(), kb).await?;
    *status = deployment::deployment_status(status, &reconciled, &pods);

    Ok(rotate_in)
}
