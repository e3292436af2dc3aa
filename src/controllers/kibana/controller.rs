use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service, ServiceSpec};
use kube::runtime::events::{EventType, Recorder};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{metadata_watcher, predicates, watcher, Predicate, WatchStreamExt};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        finalizer::{finalizer, Event as Finalizer},
    },
    Resource,
};
use serde::Serialize;
use serde_json::json;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use crate::controllers::{Diagnostics, OperatorParams, State};
use crate::resources::kibanas::{Kibana, KibanaStatus, KIBANA_FINALIZER, LEGACY_FINALIZERS};
use crate::watches::{DynamicWatches, NamespacedName};
use crate::{telemetry, validation, Error, Metrics, Result};

use super::driver;
use super::reconcilers::association::AssociationType;
use super::reconcilers::pod::PodTemplateDecorator;
use super::reconcilers::{
    association, certificates, emit_event, garbage_collect_soft_owned_secrets, keystore,
    KIBANA_TYPE, NAME_LABEL, REASON_RECONCILIATION_ERROR, REASON_UNHEALTHY, REASON_VALIDATION,
    SOFT_OWNER_KIND_LABEL, SOFT_OWNER_NAMESPACE_LABEL, SOFT_OWNER_NAME_LABEL, TYPE_LABEL,
};

/// Resync period when nothing else asks for an earlier pass.
const DEFAULT_REQUEUE: Duration = Duration::from_secs(5 * 60);

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Secrets read on behalf of Kibana resources
    pub watches: DynamicWatches,
    pub params: Arc<OperatorParams>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Extra pod template mutations, applied in order after the built-in ones
    pub decorators: Vec<Arc<dyn PodTemplateDecorator>>,
    iteration: Arc<AtomicU64>,
}

impl Context {
    pub fn new(
        client: Client,
        metrics: Metrics,
        state: &State,
        decorators: Vec<Arc<dyn PodTemplateDecorator>>,
    ) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, "kibana-operator".into()),
            watches: state.watches.clone(),
            params: state.params(),
            diagnostics: state.diagnostics.clone(),
            metrics,
            decorators,
            iteration: Arc::new(AtomicU64::new(0)),
        })
    }
}

#[instrument(skip(ctx, kb), fields(trace_id))]
async fn reconcile(kb: Arc<Kibana>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<Kibana>();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let iteration = ctx.iteration.fetch_add(1, Ordering::Relaxed) + 1;

    let namespace = kb.namespace().unwrap_or_default();
    let name = kb.name_any();
    info!(namespace = %namespace, kibana_name = %name, iteration, "Starting reconciliation run");

    let kbs: Api<Kibana> = Api::namespaced(ctx.client.clone(), &namespace);

    // the cached object may already be gone
    let Some(kb) = kbs.get_opt(&name).await? else {
        debug!(namespace = %namespace, kibana_name = %name, "Kibana not found, cleaning up");
        on_delete(&ctx, &namespace, &name).await?;
        return Ok(Action::await_change());
    };

    if kb.is_unmanaged() && !kb.is_marked_for_deletion() {
        info!(
            namespace = %namespace,
            kibana_name = %name,
            "Object is currently not managed by this controller. Skipping reconciliation"
        );
        return Ok(Action::await_change());
    }

    let kb = remove_legacy_finalizers(&kbs, kb).await?;

    match finalizer(&kbs, KIBANA_FINALIZER, Arc::new(kb.clone()), |event| async {
        match event {
            Finalizer::Apply(kb) => do_reconcile(&ctx, &kb).await,
            Finalizer::Cleanup(kb) => {
                on_delete(&ctx, &namespace, &kb.name_any()).await?;
                Ok(Action::await_change())
            }
        }
    })
    .await
    {
        Ok(action) => {
            debug!(namespace = %namespace, kibana_name = %name, iteration, "Ending reconciliation run");
            Ok(action)
        }
        Err(err) => {
            warn!("reconcile failed: {:?}", err);
            let err = Error::FinalizerError(Box::new(err));
            ctx.metrics.reconcile_failure(&kb, &err);
            Err(err)
        }
    }
}

fn error_policy<K, C>(_kb: Arc<K>, _error: &Error, _ctx: C) -> Action {
    Action::requeue(Duration::from_secs(30))
}

/// Finalizers left over by older operator releases, `None` when there is nothing to strip.
fn without_legacy_finalizers(finalizers: &[String]) -> Option<Vec<String>> {
    if !finalizers
        .iter()
        .any(|f| LEGACY_FINALIZERS.contains(&f.as_str()))
    {
        return None;
    }
    Some(
        finalizers
            .iter()
            .filter(|f| !LEGACY_FINALIZERS.contains(&f.as_str()))
            .cloned()
            .collect(),
    )
}

async fn remove_legacy_finalizers(kbs: &Api<Kibana>, kb: Kibana) -> Result<Kibana> {
    let Some(remaining) = without_legacy_finalizers(kb.finalizers()) else {
        return Ok(kb);
    };
    debug!("Removing legacy finalizers from Kibana {}", kb.name_any());
    let patch = json!({
        "metadata": {
            "finalizers": remaining,
            "resourceVersion": kb.resource_version(),
        }
    });
    Ok(kbs
        .patch(&kb.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?)
}

/// Runs one pass and writes the observed status back, whatever the outcome of the pass.
async fn do_reconcile(ctx: &Context, kb: &Kibana) -> Result<Action> {
    let original = kb.status.clone();
    let mut status = KibanaStatus {
        observed_generation: kb.metadata.generation,
        ..original.clone().unwrap_or_default()
    };

    let result = reconcile_body(ctx, kb, &mut status).await;

    let status_result = if original.as_ref() == Some(&status) {
        Ok(())
    } else {
        update_status(ctx, kb, original.as_ref(), &status).await
    };
    if let Err(e) = &status_result {
        if is_conflict(e) {
            debug!("Conflict while updating the status of Kibana {}", kb.name_any());
            ctx.metrics.status_conflict::<Kibana>();
        }
    }

    aggregate(result, status_result)
}

async fn reconcile_body(ctx: &Context, kb: &Kibana, status: &mut KibanaStatus) -> Result<Option<Duration>> {
    if let Err(errors) = validation::validate_create(kb) {
        warn!("Kibana manifest validation failed: {}", errors);
        emit_event(&ctx.recorder, kb, EventType::Warning, REASON_VALIDATION, errors.to_string()).await;
        return Err(errors.into());
    }

    let result = driver::reconcile(ctx, kb, status).await;
    if let Err(e) = &result {
        emit_event(
            &ctx.recorder,
            kb,
            EventType::Warning,
            REASON_RECONCILIATION_ERROR,
            format!("Reconciliation error: {e}"),
        )
        .await;
    }
    result
}

async fn update_status(
    ctx: &Context,
    kb: &Kibana,
    original: Option<&KibanaStatus>,
    status: &KibanaStatus,
) -> Result<(), kube::Error> {
    if status.is_degraded(original) {
        emit_event(
            &ctx.recorder,
            kb,
            EventType::Warning,
            REASON_UNHEALTHY,
            "Kibana health degraded".into(),
        )
        .await;
    }
    let kbs: Api<Kibana> = Api::namespaced(ctx.client.clone(), &kb.namespace().unwrap_or_default());
    // carrying the resource version turns a concurrent change into a conflict
    let patch = json!({
        "metadata": { "resourceVersion": kb.resource_version() },
        "status": status,
    });
    kbs.patch_status(&kb.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(response) if response.code == 409)
}

fn requeue_action(rotate_in: Option<Duration>) -> Action {
    Action::requeue(rotate_in.map_or(DEFAULT_REQUEUE, |d| d.min(DEFAULT_REQUEUE)))
}

/// Folds the outcome of a pass and of its status write into one result. A status
/// conflict is not an error: the resource changed, so it is looked at again right away.
fn aggregate(result: Result<Option<Duration>>, status_result: Result<(), kube::Error>) -> Result<Action> {
    match (result, status_result) {
        (Ok(rotate_in), Ok(())) => Ok(requeue_action(rotate_in)),
        (Ok(_), Err(e)) if is_conflict(&e) => Ok(Action::requeue(Duration::ZERO)),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(status_error)) if is_conflict(&status_error) => Err(e),
        (Err(source), Err(status_error)) => Err(Error::StatusUpdate {
            source: Box::new(source),
            status_error,
        }),
    }
}

/// Forgets everything registered for a Kibana that is going away.
async fn on_delete(ctx: &Context, namespace: &str, name: &str) -> Result<()> {
    ctx.watches
        .remove_handler_for_key(&keystore::watch_name(namespace, name));
    ctx.watches
        .remove_handler_for_key(&certificates::custom_certificate_watch_name(namespace, name));
    for association_type in AssociationType::ALL {
        ctx.watches
            .remove_handler_for_key(&association::watch_name(namespace, name, association_type));
    }
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    garbage_collect_soft_owned_secrets(&secrets, namespace, name).await
}

/// Kibanas to requeue when a secret changes: the ones that registered a watch on it, and
/// the soft owner named in its labels.
fn secret_watchers<K: Resource>(watches: &DynamicWatches, secret: &K) -> Vec<ObjectRef<Kibana>> {
    let mut refs: Vec<ObjectRef<Kibana>> = watches
        .watchers_for(&NamespacedName::of(secret))
        .into_iter()
        .map(|w| ObjectRef::new(&w.name).within(&w.namespace))
        .collect();

    let labels = secret.labels();
    if labels.get(SOFT_OWNER_KIND_LABEL).map(String::as_str) == Some(Kibana::kind(&()).as_ref()) {
        if let (Some(ns), Some(name)) = (
            labels.get(SOFT_OWNER_NAMESPACE_LABEL),
            labels.get(SOFT_OWNER_NAME_LABEL),
        ) {
            let owner = ObjectRef::new(name).within(ns);
            if !refs.contains(&owner) {
                refs.push(owner);
            }
        }
    }
    refs
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let kb_api = Api::<Kibana>::all(client.clone());
    let deploy_api = Api::<Deployment>::all(client.clone());
    let svc_api = Api::<Service>::all(client.clone());
    let cm_api = Api::<ConfigMap>::all(client.clone());
    let secret_api = Api::<Secret>::all(client.clone());
    let pod_api = Api::<Pod>::all(client.clone());

    if let Err(e) = kb_api.list(&ListParams::default().limit(1)).await {
        error!("Kibana is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    // all resources we create have this label
    let cfg = watcher::Config::default().labels(&format!("{TYPE_LABEL}={KIBANA_TYPE}"));

    let deploy_watcher = watcher(deploy_api, cfg.clone())
        .map(ensure_deletion_change)
        .touched_objects()
        .predicate_filter(changed_predicate.combine(status_predicate_serde));

    let svc_watcher = watcher(svc_api, cfg.clone())
        .map(ensure_deletion_change)
        .touched_objects()
        // svc has no generation so we hash the spec to check for changes
        .predicate_filter(changed_predicate.combine(spec_predicate_serde));

    let cm_watcher = watcher(cm_api, cfg.clone())
        .map(ensure_deletion_change)
        .touched_objects()
        // cm has no generation so we hash the data to check for changes
        .predicate_filter(changed_predicate.combine(spec_predicate_serde));

    let owned_secret_watcher = watcher(secret_api.clone(), cfg.clone())
        .map(ensure_deletion_change)
        .touched_objects()
        .predicate_filter(changed_predicate.combine(spec_predicate_serde));

    // user secrets carry none of our labels, any of them may be referenced
    let referenced_secret_watcher = metadata_watcher(secret_api, watcher::Config::default())
        .touched_objects()
        .predicate_filter(predicates::resource_version);

    let pod_watcher = metadata_watcher(pod_api, watcher::Config::default().labels(NAME_LABEL))
        .map(ensure_deletion_change)
        .touched_objects()
        .predicate_filter(changed_predicate);

    let watches = state.watches.clone();
    let max_concurrent_reconciles = state.params().max_concurrent_reconciles;

    Controller::new(kb_api, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(max_concurrent_reconciles))
        .shutdown_on_signal()
        .owns_stream(deploy_watcher)
        .owns_stream(svc_watcher)
        .owns_stream(cm_watcher)
        .owns_stream(owned_secret_watcher)
        .watches_stream(pod_watcher, |pod| -> Option<ObjectRef<Kibana>> {
            let name = pod.labels().get(NAME_LABEL)?;
            Some(ObjectRef::new(name).within(&pod.namespace()?))
        })
        .watches_stream(referenced_secret_watcher, move |secret| {
            secret_watchers(&watches, &secret)
        })
        .run(
            reconcile,
            error_policy,
            Context::new(client, metrics, &state, Vec::new()),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

// deletion apparently doesn't lead to any change in metadata otherwise, which means the changed_predicate
// would drop them.
fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<kube::runtime::watcher::Event<K>, E>,
) -> Result<kube::runtime::watcher::Event<K>, E> {
    if let Ok(kube::runtime::watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        // covers spec but not metadata or status
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    // ignore status
    Some(hasher.finish())
}

trait MyHasStatus {
    type Status;

    fn status(&self) -> Option<&Self::Status>;
}

impl MyHasStatus for Deployment {
    type Status = DeploymentStatus;

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

fn status_predicate_serde<K: Resource + MyHasStatus>(obj: &K) -> Option<u64>
where
    K::Status: Serialize,
{
    let mut hasher = DefaultHasher::new();
    if let Some(s) = obj.status() {
        serde_hashkey::to_key(s).ok()?.hash(&mut hasher);
    }
    Some(hasher.finish())
}

pub trait MyHasSpec {
    type Spec;

    fn spec(&self) -> &Self::Spec;
}

impl MyHasSpec for Service {
    type Spec = Option<ServiceSpec>;

    fn spec(&self) -> &Self::Spec {
        &self.spec
    }
}

impl MyHasSpec for ConfigMap {
    type Spec = Option<std::collections::BTreeMap<String, String>>;

    fn spec(&self) -> &Self::Spec {
        &self.data
    }
}

impl MyHasSpec for Secret {
    type Spec = Option<std::collections::BTreeMap<String, k8s_openapi::ByteString>>;

    fn spec(&self) -> &Self::Spec {
        &self.data
    }
}

fn spec_predicate_serde<K: Resource + MyHasSpec>(obj: &K) -> Option<u64>
where
    K::Spec: Serialize,
{
    let mut hasher = DefaultHasher::new();
    serde_hashkey::to_key(obj.spec()).ok()?.hash(&mut hasher);
    Some(hasher.finish())
}
