use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::controllers::kibana::reconcilers::certificates::CertRotation;
use crate::watches::DynamicWatches;

pub mod kibana;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: kube::runtime::events::Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "kibana-operator".into(),
        }
    }
}

/// IP family of the cluster, deciding which any-address Kibana binds to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum IpFamily {
    #[default]
    Ipv4,
    Ipv6,
}

impl IpFamily {
    pub fn any_address(&self) -> &'static str {
        match self {
            IpFamily::Ipv4 => "0.0.0.0",
            IpFamily::Ipv6 => "::",
        }
    }
}

/// Identity of this operator build, rendered into the telemetry file of every Kibana.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    pub version: String,
    pub hash: String,
    pub date: String,
    pub snapshot: String,
}

impl BuildInfo {
    /// Build info baked in at compile time.
    pub fn from_build_env() -> Self {
        Self {
            version: option_env!("KIBANA_OPERATOR_VERSION")
                .unwrap_or(env!("CARGO_PKG_VERSION"))
                .into(),
            hash: option_env!("KIBANA_OPERATOR_BUILD_HASH")
                .unwrap_or("unknown")
                .into(),
            date: option_env!("KIBANA_OPERATOR_BUILD_DATE")
                .unwrap_or("unknown")
                .into(),
            snapshot: option_env!("KIBANA_OPERATOR_BUILD_SNAPSHOT")
                .unwrap_or("false")
                .into(),
        }
    }
}

/// Settings that apply to every Kibana this operator manages.
#[derive(Clone, Debug)]
pub struct OperatorParams {
    pub operator_namespace: String,
    pub ip_family: IpFamily,
    pub cert_rotation: CertRotation,
    pub set_default_security_context: bool,
    pub max_concurrent_reconciles: u16,
    pub build_info: BuildInfo,
}

impl Default for OperatorParams {
    fn default() -> Self {
        Self {
            operator_namespace: "elastic-system".into(),
            ip_family: IpFamily::default(),
            cert_rotation: CertRotation::default(),
            set_default_security_context: true,
            max_concurrent_reconciles: 3,
            build_info: BuildInfo::from_build_env(),
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    /// Secrets watched on behalf of Kibana resources
    pub watches: DynamicWatches,
    params: Arc<OperatorParams>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(params: OperatorParams) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            watches: DynamicWatches::new(),
            params: Arc::new(params),
        }
    }

    pub fn params(&self) -> Arc<OperatorParams> {
        self.params.clone()
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}
