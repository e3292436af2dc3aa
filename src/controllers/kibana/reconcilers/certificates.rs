//! HTTP certificates for Kibana.
//!
//! A self-signed CA is kept in `<name>-kb-http-ca-internal` and issues the server
//! certificate mounted by the pods from `<name>-kb-http-certs-internal`. Users can bring
//! their own certificate through `spec.http.tls.certificate`, which is then copied as is.
//! `<name>-kb-http-certs-public` only carries what clients need to trust Kibana.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::runtime::events::EventType;
use kube::{Api, ResourceExt};
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, RsaKeySize, SanType,
};
use time::OffsetDateTime;
use tracing::{debug, info};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::controllers::kibana::controller::Context;
use crate::resources::kibanas::Kibana;
use crate::watches::{handler_name, NamedWatch, NamespacedName};
use crate::Error;

use super::{
    apply, ca_secret_name, delete, emit_event, http_service_name, internal_certs_secret_name,
    object_meta, public_certs_secret_name, secret_data, REASON_RECONCILIATION_ERROR,
};

pub const CERT_FILE_NAME: &str = "tls.crt";
pub const KEY_FILE_NAME: &str = "tls.key";
pub const CA_FILE_NAME: &str = "ca.crt";

/// Certificates are backdated to tolerate clock skew between the operator and clients.
const NOT_BEFORE_SKEW: Duration = Duration::from_secs(10 * 60);

#[derive(thiserror::Error, Debug)]
pub enum CertificateError {
    #[error("Failed to generate private key: {0}")]
    KeyGeneration(#[source] rcgen::Error),

    #[error("Failed to sign certificate: {0}")]
    Signing(#[source] rcgen::Error),

    #[error("Invalid subject alternative name {0}")]
    InvalidSubjectAltName(String),

    #[error("Failed to parse certificate: {0}")]
    Parse(String),

    #[error("Invalid certificate in Secret {secret}: {message}")]
    InvalidUserCertificate { secret: String, message: String },
}

/// How long certificates live and how early they are replaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RotationParams {
    pub validity: Duration,
    pub rotate_before: Duration,
}

impl Default for RotationParams {
    fn default() -> Self {
        Self {
            validity: Duration::from_secs(365 * 24 * 3600),
            rotate_before: Duration::from_secs(24 * 3600),
        }
    }
}

/// What the parts of the operator need to know about an x509 certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateInfo {
    pub der: Vec<u8>,
    pub common_name: Option<String>,
    pub organizational_units: Vec<String>,
    pub dns_names: BTreeSet<String>,
    pub ip_addresses: BTreeSet<IpAddr>,
    pub not_before: i64,
    pub not_after: i64,
}

impl CertificateInfo {
    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let (_, cert) =
            X509Certificate::from_der(der).map_err(|e| CertificateError::Parse(e.to_string()))?;

        let subject = cert.subject();
        let common_name = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(String::from);
        let organizational_units = subject
            .iter_organizational_unit()
            .filter_map(|ou| ou.as_str().ok())
            .map(String::from)
            .collect();

        let mut dns_names = BTreeSet::new();
        let mut ip_addresses = BTreeSet::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => {
                        dns_names.insert(dns.to_string());
                    }
                    GeneralName::IPAddress(raw) => {
                        if let Some(ip) = ip_from_bytes(raw) {
                            ip_addresses.insert(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            der: der.to_vec(),
            common_name,
            organizational_units,
            dns_names,
            ip_addresses,
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
        })
    }

    /// True if this certificate carries a valid signature from `issuer`.
    pub fn is_signed_by(&self, issuer: &CertificateInfo) -> bool {
        let (Ok((_, cert)), Ok((_, issuer))) = (
            X509Certificate::from_der(&self.der),
            X509Certificate::from_der(&issuer.der),
        ) else {
            return false;
        };
        cert.verify_signature(Some(issuer.public_key())).is_ok()
    }

    /// True once `now` is within `rotate_before` of the expiry date, or past it.
    pub fn expires_within(&self, rotate_before: Duration, now: i64) -> bool {
        now >= self.not_after.saturating_sub(rotate_before.as_secs() as i64) || now < self.not_before
    }

    /// Time left until the certificate should be replaced.
    pub fn rotate_in(&self, rotate_before: Duration, now: i64) -> Duration {
        let deadline = self.not_after.saturating_sub(rotate_before.as_secs() as i64);
        Duration::from_secs(deadline.saturating_sub(now).max(0) as u64)
    }
}

fn ip_from_bytes(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(raw).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Parses every `CERTIFICATE` block of a PEM bundle, in order.
pub fn parse_certificates(pem_data: &[u8]) -> Result<Vec<CertificateInfo>, CertificateError> {
    let blocks = pem::parse_many(pem_data).map_err(|e| CertificateError::Parse(e.to_string()))?;
    let certs = blocks
        .iter()
        .filter(|b| b.tag() == "CERTIFICATE")
        .map(|b| CertificateInfo::from_der(b.contents()))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(CertificateError::Parse("no certificate found".into()));
    }
    Ok(certs)
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

fn distinguished_name(common_name: &str, organizational_unit: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.into()));
    dn.push(
        DnType::OrganizationalUnitName,
        DnValue::Utf8String(organizational_unit.into()),
    );
    dn
}

fn generate_key() -> Result<KeyPair, CertificateError> {
    KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, RsaKeySize::_2048)
        .map_err(CertificateError::KeyGeneration)
}

/// A certificate authority as stored in the CA secret.
#[derive(Clone, Debug)]
pub struct Ca {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert: CertificateInfo,
}

impl Ca {
    /// Builds a CA valid for `validity`, reusing `key` when one is given.
    pub fn new_self_signed(
        kb_name: &str,
        validity: Duration,
        key: Option<KeyPair>,
    ) -> Result<Self, CertificateError> {
        let key = match key {
            Some(key) => key,
            None => generate_key()?,
        };

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&format!("{kb_name}-http"), kb_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = now();
        params.not_before = now - NOT_BEFORE_SKEW;
        params.not_after = now + validity;

        let cert = params.self_signed(&key).map_err(CertificateError::Signing)?;
        Self::from_pems(cert.pem(), key.serialize_pem())
    }

    pub fn from_pems(cert_pem: String, key_pem: String) -> Result<Self, CertificateError> {
        let cert = parse_certificates(cert_pem.as_bytes())?
            .into_iter()
            .next()
            .ok_or_else(|| CertificateError::Parse("empty CA certificate".into()))?;
        Ok(Self {
            cert_pem,
            key_pem,
            cert,
        })
    }

    /// Reads a CA back from its secret, `None` if anything is missing or unparseable.
    pub fn from_secret(secret: &Secret) -> Option<Self> {
        let cert_pem = String::from_utf8(secret_data(secret, CERT_FILE_NAME)?.to_vec()).ok()?;
        let key_pem = String::from_utf8(secret_data(secret, KEY_FILE_NAME)?.to_vec()).ok()?;
        KeyPair::from_pem(&key_pem).ok()?;
        Self::from_pems(cert_pem, key_pem).ok()
    }

    pub fn key_pair(&self) -> Result<KeyPair, CertificateError> {
        KeyPair::from_pem(&self.key_pem).map_err(|e| CertificateError::Parse(e.to_string()))
    }

    fn secret_data(&self) -> BTreeMap<String, ByteString> {
        BTreeMap::from([
            (CERT_FILE_NAME.into(), ByteString(self.cert_pem.clone().into_bytes())),
            (KEY_FILE_NAME.into(), ByteString(self.key_pem.clone().into_bytes())),
        ])
    }
}

/// Returns the CA to use: `existing` if it can still be used, a renewed one otherwise.
/// An expiring CA is renewed with its own key so that already issued certificates keep
/// verifying against the public key clients trust.
pub fn reconcile_ca(
    kb_name: &str,
    existing: Option<Ca>,
    rotation: RotationParams,
    now: i64,
) -> Result<(Ca, bool), CertificateError> {
    let Some(ca) = existing else {
        info!("No internal CA found for {}, creating a new one", kb_name);
        return Ok((Ca::new_self_signed(kb_name, rotation.validity, None)?, true));
    };
    if !ca.cert.expires_within(rotation.rotate_before, now) {
        return Ok((ca, false));
    }
    info!(
        "Internal CA of {} is expiring, renewing it from the existing private key",
        kb_name
    );
    let key = ca.key_pair().ok();
    Ok((Ca::new_self_signed(kb_name, rotation.validity, key)?, true))
}

/// Identity the HTTP certificate must carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpCertificateTemplate {
    pub common_name: String,
    pub organizational_unit: String,
    pub dns_names: BTreeSet<String>,
    pub ip_addresses: BTreeSet<IpAddr>,
}

impl HttpCertificateTemplate {
    pub fn new(kb: &Kibana, svc: Option<&Service>) -> Result<Self, CertificateError> {
        let kb_name = kb.name_any();
        let namespace = kb.namespace().unwrap_or_default();
        let svc_name = http_service_name(&kb_name);
        let common_name = format!("{svc_name}.{namespace}.kb.local");

        let mut dns_names = BTreeSet::from([
            common_name.clone(),
            svc_name.clone(),
            format!("{svc_name}.{namespace}"),
            format!("{svc_name}.{namespace}.svc"),
            format!("{svc_name}.{namespace}.svc.cluster.local"),
        ]);
        let mut ip_addresses: BTreeSet<IpAddr> = BTreeSet::new();

        if let Some(spec) = svc.and_then(|s| s.spec.as_ref()) {
            for ip in spec.cluster_ips.iter().flatten().chain(spec.cluster_ip.iter()) {
                if let Ok(ip) = ip.parse::<IpAddr>() {
                    ip_addresses.insert(ip);
                }
            }
            for ip in spec.external_ips.iter().flatten() {
                if let Ok(ip) = ip.parse::<IpAddr>() {
                    ip_addresses.insert(ip);
                }
            }
        }
        let ingresses = svc
            .and_then(|s| s.status.as_ref())
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref());
        for ingress in ingresses.into_iter().flatten() {
            if let Some(ip) = ingress.ip.as_deref().and_then(|ip| ip.parse::<IpAddr>().ok()) {
                ip_addresses.insert(ip);
            }
            if let Some(hostname) = ingress.hostname.as_ref().filter(|h| !h.is_empty()) {
                dns_names.insert(hostname.clone());
            }
        }

        for san in kb.user_subject_alt_names() {
            if let Some(dns) = san.dns.as_ref().filter(|d| !d.is_empty()) {
                dns_names.insert(dns.clone());
            }
            if let Some(ip) = san.ip.as_ref().filter(|ip| !ip.is_empty()) {
                let parsed = ip
                    .parse::<IpAddr>()
                    .map_err(|_| CertificateError::InvalidSubjectAltName(ip.clone()))?;
                ip_addresses.insert(parsed);
            }
        }

        Ok(Self {
            common_name,
            organizational_unit: kb_name,
            dns_names,
            ip_addresses,
        })
    }

    fn matches(&self, cert: &CertificateInfo) -> bool {
        cert.common_name.as_deref() == Some(self.common_name.as_str())
            && cert.organizational_units == [self.organizational_unit.clone()]
            && cert.dns_names == self.dns_names
            && cert.ip_addresses == self.ip_addresses
    }

    /// Signs a certificate for this template with the CA. Returns the certificate PEM.
    pub fn issue(
        &self,
        ca: &Ca,
        key: &KeyPair,
        validity: Duration,
    ) -> Result<String, CertificateError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&self.common_name, &self.organizational_unit);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut sans = Vec::with_capacity(self.dns_names.len() + self.ip_addresses.len());
        for dns in &self.dns_names {
            let name = Ia5String::try_from(dns.clone())
                .map_err(|_| CertificateError::InvalidSubjectAltName(dns.clone()))?;
            sans.push(SanType::DnsName(name));
        }
        sans.extend(self.ip_addresses.iter().copied().map(SanType::IpAddress));
        params.subject_alt_names = sans;

        let now = now();
        params.not_before = now - NOT_BEFORE_SKEW;
        params.not_after = now + validity;

        let ca_key = ca.key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)
            .map_err(|e| CertificateError::Parse(e.to_string()))?;
        let cert = params
            .signed_by(key, &issuer)
            .map_err(CertificateError::Signing)?;
        Ok(cert.pem())
    }
}

/// Returns the current leaf certificate if it can be kept: issued by `ca`, not about to
/// expire and carrying exactly the expected names.
pub fn reusable_certificate(
    chain_pem: Option<&[u8]>,
    template: &HttpCertificateTemplate,
    ca: &Ca,
    rotate_before: Duration,
    now: i64,
) -> Option<CertificateInfo> {
    let certs = parse_certificates(chain_pem?).ok()?;
    let cert = certs
        .into_iter()
        .find(|c| c.common_name.as_deref() == Some(template.common_name.as_str()))?;
    if !cert.is_signed_by(&ca.cert) {
        debug!("HTTP certificate is not signed by the current CA");
        return None;
    }
    if cert.expires_within(rotate_before, now) {
        debug!("HTTP certificate is expiring");
        return None;
    }
    if !template.matches(&cert) {
        debug!("HTTP certificate names do not match the expected ones");
        return None;
    }
    Some(cert)
}

/// Content of a user provided certificate secret, checked to be usable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserCertificate {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
    pub ca: Option<Vec<u8>>,
}

impl UserCertificate {
    pub fn from_secret(secret: &Secret) -> Result<Self, CertificateError> {
        let invalid = |message: &str| CertificateError::InvalidUserCertificate {
            secret: secret.name_any(),
            message: message.into(),
        };
        let cert = secret_data(secret, CERT_FILE_NAME)
            .ok_or_else(|| invalid("missing tls.crt"))?
            .to_vec();
        let key = secret_data(secret, KEY_FILE_NAME)
            .ok_or_else(|| invalid("missing tls.key"))?
            .to_vec();
        parse_certificates(&cert).map_err(|e| invalid(&e.to_string()))?;
        let ca = secret_data(secret, CA_FILE_NAME)
            .filter(|ca| !ca.is_empty())
            .map(<[u8]>::to_vec);
        Ok(Self { cert, key, ca })
    }
}

/// Data of the internal certificates secret.
fn internal_secret_data(
    cert_chain: Vec<u8>,
    key: Vec<u8>,
    ca: Vec<u8>,
) -> BTreeMap<String, ByteString> {
    BTreeMap::from([
        (CERT_FILE_NAME.into(), ByteString(cert_chain)),
        (KEY_FILE_NAME.into(), ByteString(key)),
        (CA_FILE_NAME.into(), ByteString(ca)),
    ])
}

/// Data of the public certificates secret: what clients need to trust Kibana and nothing
/// private. That is the CA when there is one, the served chain otherwise.
fn public_secret_data(ca: Option<&[u8]>, cert_chain: &[u8]) -> BTreeMap<String, ByteString> {
    BTreeMap::from([(
        CA_FILE_NAME.into(),
        ByteString(ca.unwrap_or(cert_chain).to_vec()),
    )])
}

fn secret(meta: ObjectMeta, data: BTreeMap<String, ByteString>) -> Secret {
    Secret {
        metadata: meta,
        data: Some(data),
        ..Default::default()
    }
}

pub fn custom_certificate_watch_name(namespace: &str, kb_name: &str) -> String {
    handler_name(namespace, kb_name, "http-certificate")
}

fn reconcile_custom_certificate_watch(ctx: &Context, kb: &Kibana) {
    let namespace = kb.namespace().unwrap_or_default();
    let name = custom_certificate_watch_name(&namespace, &kb.name_any());
    match kb.custom_certificate() {
        Some(secret_name) => ctx.watches.add_handler(NamedWatch {
            name,
            watched: vec![NamespacedName::new(&namespace, secret_name)],
            watcher: NamespacedName::of(kb),
        }),
        None => ctx.watches.remove_handler_for_key(&name),
    }
}

/// Ensures the CA, internal and public certificate secrets. Returns when the certificates
/// must be looked at again to be rotated, if ever.
pub async fn reconcile(
    ctx: &Context,
    kb: &Kibana,
    svc: Option<&Service>,
    base_metadata: &ObjectMeta,
    rotation: &CertRotation,
) -> Result<Option<Duration>, Error> {
    let result = reconcile_inner(ctx, kb, svc, base_metadata, rotation).await;
    if let Err(err) = &result {
        emit_event(
            &ctx.recorder,
            kb,
            EventType::Warning,
            REASON_RECONCILIATION_ERROR,
            format!("Certificate reconciliation error: {err}"),
        )
        .await;
    }
    result
}

/// Rotation settings of the CA and of the certificates it issues.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CertRotation {
    pub ca: RotationParams,
    pub cert: RotationParams,
}

async fn reconcile_inner(
    ctx: &Context,
    kb: &Kibana,
    svc: Option<&Service>,
    base_metadata: &ObjectMeta,
    rotation: &CertRotation,
) -> Result<Option<Duration>, Error> {
    let kb_name = kb.name_any();
    let namespace = kb.namespace().unwrap_or_default();
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);

    reconcile_custom_certificate_watch(ctx, kb);

    if !kb.tls_enabled() {
        for name in [
            ca_secret_name(&kb_name),
            internal_certs_secret_name(&kb_name),
            public_certs_secret_name(&kb_name),
        ] {
            delete(&secrets, &name).await?;
        }
        return Ok(None);
    }

    let now_ts = now().unix_timestamp();

    let existing_ca = secrets
        .get_opt(&ca_secret_name(&kb_name))
        .await?
        .as_ref()
        .and_then(Ca::from_secret);
    let (ca, ca_renewed) = reconcile_ca(&kb_name, existing_ca, rotation.ca, now_ts)?;
    if ca_renewed {
        let name = ca_secret_name(&kb_name);
        apply(&secrets, &name, &secret(object_meta(base_metadata, &name), ca.secret_data())).await?;
    }
    let mut requeue_in = ca.cert.rotate_in(rotation.ca.rotate_before, now_ts);

    let internal_name = internal_certs_secret_name(&kb_name);
    let (internal_data, provided_ca) = match kb.custom_certificate() {
        Some(secret_name) => {
            let user_secret = secrets
                .get_opt(secret_name)
                .await?
                .ok_or_else(|| Error::SecretNotFound(secret_name.into()))?;
            let user = UserCertificate::from_secret(&user_secret)?;
            let ca_pem = user
                .ca
                .clone()
                .unwrap_or_else(|| ca.cert_pem.clone().into_bytes());
            (internal_secret_data(user.cert, user.key, ca_pem), user.ca)
        }
        None => {
            let template = HttpCertificateTemplate::new(kb, svc)?;
            let current = secrets.get_opt(&internal_name).await?;
            let current_chain = current.as_ref().and_then(|s| secret_data(s, CERT_FILE_NAME));
            let current_key = current
                .as_ref()
                .and_then(|s| secret_data(s, KEY_FILE_NAME))
                .and_then(|k| std::str::from_utf8(k).ok())
                .and_then(|k| KeyPair::from_pem(k).ok());

            let reusable = match (&current_key, ca_renewed) {
                (Some(_), false) => reusable_certificate(
                    current_chain,
                    &template,
                    &ca,
                    rotation.cert.rotate_before,
                    now_ts,
                ),
                _ => None,
            };
            let (chain, key_pem, leaf_info) = match (reusable, current_key, current_chain) {
                (Some(info), Some(key), Some(chain)) => (chain.to_vec(), key.serialize_pem(), info),
                (_, key, _) => {
                    info!("Issuing a new HTTP certificate for Kibana {}/{}", namespace, kb_name);
                    let key = match key {
                        Some(key) => key,
                        None => generate_key()?,
                    };
                    let leaf = template.issue(&ca, &key, rotation.cert.validity)?;
                    let info = parse_certificates(leaf.as_bytes())?
                        .into_iter()
                        .next()
                        .ok_or_else(|| CertificateError::Parse("empty certificate".into()))?;
                    let chain = format!("{leaf}{}", ca.cert_pem).into_bytes();
                    (chain, key.serialize_pem(), info)
                }
            };
            requeue_in = requeue_in.min(leaf_info.rotate_in(rotation.cert.rotate_before, now_ts));

            (
                internal_secret_data(chain, key_pem.into_bytes(), ca.cert_pem.clone().into_bytes()),
                Some(ca.cert_pem.clone().into_bytes()),
            )
        }
    };

    let chain = internal_data
        .get(CERT_FILE_NAME)
        .map(|b| b.0.clone())
        .unwrap_or_default();
    apply(
        &secrets,
        &internal_name,
        &secret(object_meta(base_metadata, &internal_name), internal_data),
    )
    .await?;

    let public_name = public_certs_secret_name(&kb_name);
    apply(
        &secrets,
        &public_name,
        &secret(
            object_meta(base_metadata, &public_name),
            public_secret_data(provided_ca.as_deref(), &chain),
        ),
    )
    .await?;

    Ok(Some(requeue_in))
}
