use std::time::Duration;

use actix_web::{
    get, middleware,
    web::{self, Data},
    App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use anyhow::bail;
use clap::Parser;
use kube::core::admission::AdmissionReview;
use prometheus::{Encoder, TextEncoder};

use kibana_operator::controllers::kibana::reconcilers::certificates::{CertRotation, RotationParams};
use kibana_operator::controllers::IpFamily;
use kibana_operator::resources::kibanas::Kibana;
pub use kibana_operator::{self, telemetry, webhook, BuildInfo, Metrics, OperatorParams, State};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Namespace the operator runs in
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "elastic-system")]
    operator_namespace: String,

    /// Address of the metrics, health and webhook server
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    bind_address: String,

    /// Serve the validating admission webhook
    #[arg(long, env = "ENABLE_WEBHOOK", default_value_t = false)]
    enable_webhook: bool,

    #[arg(long, env = "IP_FAMILY", value_enum, default_value_t = IpFamily::Ipv4)]
    ip_family: IpFamily,

    #[arg(long, env = "CA_CERT_VALIDITY", value_parser = parse_duration, default_value = "8760h")]
    ca_cert_validity: Duration,

    #[arg(long, env = "CA_CERT_ROTATE_BEFORE", value_parser = parse_duration, default_value = "24h")]
    ca_cert_rotate_before: Duration,

    #[arg(long, env = "CERT_VALIDITY", value_parser = parse_duration, default_value = "8760h")]
    cert_validity: Duration,

    #[arg(long, env = "CERT_ROTATE_BEFORE", value_parser = parse_duration, default_value = "24h")]
    cert_rotate_before: Duration,

    /// How many Kibana resources are reconciled concurrently
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 3)]
    max_concurrent_reconciles: u16,

    /// Run Kibana with a hardened security context where the version allows it
    #[arg(
        long,
        env = "SET_DEFAULT_SECURITY_CONTEXT",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    set_default_security_context: bool,
}

impl Arguments {
    fn operator_params(&self) -> anyhow::Result<OperatorParams> {
        let ca = rotation("ca-cert", self.ca_cert_validity, self.ca_cert_rotate_before)?;
        let cert = rotation("cert", self.cert_validity, self.cert_rotate_before)?;
        Ok(OperatorParams {
            operator_namespace: self.operator_namespace.clone(),
            ip_family: self.ip_family,
            cert_rotation: CertRotation { ca, cert },
            set_default_security_context: self.set_default_security_context,
            max_concurrent_reconciles: self.max_concurrent_reconciles,
            build_info: BuildInfo::from_build_env(),
        })
    }
}

fn rotation(flag: &str, validity: Duration, rotate_before: Duration) -> anyhow::Result<RotationParams> {
    if validity <= rotate_before {
        bail!(
            "--{flag}-rotate-before ({rotate_before:?}) must be lower than --{flag}-validity ({validity:?})"
        );
    }
    Ok(RotationParams {
        validity,
        rotate_before,
    })
}

/// Parses `<n>[ms|s|m|h]`, a bare number being seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (value_str, unit) = match s.find(|c: char| c.is_alphabetic()) {
        Some(pos) => (&s[..pos], &s[pos..]),
        None => (s, "s"),
    };
    let value: u64 = value_str
        .parse()
        .map_err(|e| format!("Invalid duration value {s:?}: {e}"))?;

    let seconds = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("Duration {s:?} is too large"))
    };
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => seconds(60),
        "h" => seconds(3600),
        _ => Err(format!("Unknown duration unit: {unit}")),
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metrics, &mut buffer) {
        return HttpResponse::InternalServerError().body(e.to_string());
    }
    HttpResponse::Ok().body(buffer)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

async fn validate(review: web::Json<AdmissionReview<Kibana>>) -> impl Responder {
    HttpResponse::Ok().json(webhook::review(review.into_inner()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init()?;

    let args: Arguments = Arguments::parse();
    let params = args.operator_params()?;

    // Initiatilize Kubernetes controller state
    let state = State::new(params);
    let client = kube::Client::try_default().await?;
    let controller_metrics = Metrics::default().register(&state.registry)?;
    let controller = kibana_operator::run(client, controller_metrics, state.clone());
    tokio::pin!(controller);

    let enable_webhook = args.enable_webhook;

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
            .configure(|cfg| {
                if enable_webhook {
                    cfg.route(webhook::VALIDATE_PATH, web::post().to(validate));
                }
            })
    })
    .bind(&args.bind_address)?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    tokio::join!(controller, server).1?;
    Ok(())
}
