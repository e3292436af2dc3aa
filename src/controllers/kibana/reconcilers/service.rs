use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::{Api, ResourceExt};
use tracing::info;

use crate::resources::kibanas::Kibana;
use crate::Error;

use super::{apply, base_metadata, delete, http_service_name, HTTP_PORT};

/// The HTTP service of a Kibana, built on top of `spec.http.service`.
///
/// Name, namespace, owner and selector are always ours. User labels and annotations are
/// kept, with the identity labels taking precedence. User ports are kept as well; a port
/// named like the default one gets the default port number when it has none.
pub fn new_service(kb: &Kibana) -> Service {
    let template = kb.spec.http.as_ref().and_then(|h| h.service.as_ref());
    let user_meta = template.and_then(|t| t.metadata.clone()).unwrap_or_default();
    let mut spec = template.and_then(|t| t.spec.clone()).unwrap_or_default();

    let identity = kb.identity_labels();
    let mut metadata = base_metadata(kb);
    metadata.name = Some(http_service_name(&kb.name_any()));
    let mut labels = user_meta.labels.unwrap_or_default();
    labels.extend(identity.clone());
    metadata.labels = Some(labels);
    metadata.annotations = user_meta.annotations.filter(|a| !a.is_empty());

    let default_port = ServicePort {
        name: Some(kb.protocol().into()),
        protocol: Some("TCP".into()),
        port: HTTP_PORT,
        ..Default::default()
    };
    spec.ports = Some(match spec.ports.take().filter(|p| !p.is_empty()) {
        None => vec![default_port],
        Some(mut ports) => {
            for port in ports.iter_mut() {
                if port.name == default_port.name && port.port == 0 {
                    port.port = HTTP_PORT;
                }
            }
            ports
        }
    });
    spec.selector = Some(identity);

    Service {
        metadata,
        spec: Some(spec),
        status: None,
    }
}

fn service_type(spec: Option<&ServiceSpec>) -> &str {
    spec.and_then(|s| s.type_.as_deref()).unwrap_or("ClusterIP")
}

/// Some changes cannot be applied in place: a different cluster IP, or going back to
/// `ClusterIP` from a type that allocated node ports.
pub fn needs_recreate(expected: &Service, existing: &Service) -> bool {
    let expected_spec = expected.spec.as_ref();
    let existing_spec = existing.spec.as_ref();

    let expected_ip = expected_spec.and_then(|s| s.cluster_ip.as_deref()).filter(|ip| !ip.is_empty());
    let existing_ip = existing_spec.and_then(|s| s.cluster_ip.as_deref());
    if expected_ip.is_some() && existing_ip.is_some() && expected_ip != existing_ip {
        return true;
    }

    service_type(expected_spec) == "ClusterIP"
        && matches!(service_type(existing_spec), "NodePort" | "LoadBalancer")
}

/// Creates or updates the HTTP service and returns it as stored, cluster IPs included.
pub async fn reconcile_service(client: kube::Client, kb: &Kibana) -> Result<Service, Error> {
    let expected = new_service(kb);
    let name = http_service_name(&kb.name_any());
    let services: Api<Service> = Api::namespaced(client, &kb.namespace().unwrap_or_default());

    if let Some(existing) = services.get_opt(&name).await? {
        if needs_recreate(&expected, &existing) {
            info!("Recreating Service {} to change its type or cluster IP", name);
            delete(&services, &name).await?;
        }
    }
    apply(&services, &name, &expected).await
}
