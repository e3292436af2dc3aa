//! Rules a Kibana must satisfy before it is admitted or reconciled.
//!
//! Errors are reported as a list of field errors rendered the same way the
//! Kubernetes API server renders them, so that webhook rejections read like
//! any other invalid object.

use std::fmt;

use kube::{Resource, ResourceExt};
use serde_json::Value;

use crate::resources::kibanas::{
    Kibana, ObjectSelector, DISABLE_DOWNGRADE_VALIDATION_ANNOTATION,
    LAST_APPLIED_CONFIGURATION_ANNOTATION,
};
use crate::version;

/// Longest name a Kibana may have; derived object names append suffixes to it.
pub const MAX_NAME_LENGTH: usize = 36;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldErrorType {
    Invalid(String),
    Forbidden,
    Required,
    TooLong,
    Unknown,
}

impl FieldErrorType {
    /// Cause reason the API server reports for this kind of error.
    pub fn reason(&self) -> &'static str {
        match self {
            FieldErrorType::Invalid(_) => "FieldValueInvalid",
            FieldErrorType::Forbidden => "FieldValueForbidden",
            FieldErrorType::Required => "FieldValueRequired",
            FieldErrorType::TooLong => "FieldValueTooLong",
            FieldErrorType::Unknown => "FieldValueNotSupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub error_type: FieldErrorType,
    pub detail: String,
}

impl FieldError {
    pub fn invalid(path: impl Into<String>, value: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            error_type: FieldErrorType::Invalid(value.into()),
            detail: detail.into(),
        }
    }

    pub fn forbidden(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            error_type: FieldErrorType::Forbidden,
            detail: detail.into(),
        }
    }

    pub fn required(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            error_type: FieldErrorType::Required,
            detail: detail.into(),
        }
    }

    pub fn too_long(path: impl Into<String>, max: usize) -> Self {
        Self {
            path: path.into(),
            error_type: FieldErrorType::TooLong,
            detail: format!("must have at most {max} bytes"),
        }
    }

    pub fn unknown(field: &str) -> Self {
        Self {
            path: format!("{field:?}"),
            error_type: FieldErrorType::Unknown,
            detail: format!(
                "unknown field found in the {LAST_APPLIED_CONFIGURATION_ANNOTATION} annotation is unknown"
            ),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_type {
            FieldErrorType::Invalid(value) => {
                write!(f, "{}: Invalid value: {value:?}: {}", self.path, self.detail)
            }
            FieldErrorType::Forbidden => write!(f, "{}: Forbidden: {}", self.path, self.detail),
            FieldErrorType::Required => {
                write!(f, "{}: Required value: {}", self.path, self.detail)
            }
            FieldErrorType::TooLong => write!(f, "{}: Too long: {}", self.path, self.detail),
            FieldErrorType::Unknown => write!(f, "{}: {}", self.path, self.detail),
        }
    }
}

/// All field errors found on one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldErrors {
    pub name: String,
    pub errors: Vec<FieldError>,
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} {:?} is invalid: ",
            Kibana::kind(&()),
            Kibana::group(&()),
            self.name
        )?;
        match self.errors.as_slice() {
            [single] => write!(f, "{single}"),
            errors => {
                let rendered: Vec<String> = errors.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", rendered.join(", "))
            }
        }
    }
}

impl std::error::Error for FieldErrors {}

fn into_result(kb: &Kibana, errors: Vec<FieldError>) -> Result<(), FieldErrors> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(FieldErrors {
            name: kb.name_any(),
            errors,
        })
    }
}

type Check = fn(&Kibana) -> Vec<FieldError>;

const DEFAULT_CHECKS: [Check; 5] = [
    check_no_unknown_fields,
    check_name_length,
    check_supported_version,
    check_associations,
    check_monitoring,
];

/// Checks run on every create, and at the start of every reconciliation.
pub fn validate_create(kb: &Kibana) -> Result<(), FieldErrors> {
    let errors = DEFAULT_CHECKS.iter().flat_map(|check| check(kb)).collect();
    into_result(kb, errors)
}

/// Checks run on update: transition rules first, then the create checks.
pub fn validate_update(old: &Kibana, kb: &Kibana) -> Result<(), FieldErrors> {
    let errors = check_no_downgrade(old, kb);
    if !errors.is_empty() {
        return into_result(kb, errors);
    }
    validate_create(kb)
}

fn check_name_length(kb: &Kibana) -> Vec<FieldError> {
    if kb.name_any().len() > MAX_NAME_LENGTH {
        vec![FieldError::too_long("metadata.name", MAX_NAME_LENGTH)]
    } else {
        vec![]
    }
}

fn check_supported_version(kb: &Kibana) -> Vec<FieldError> {
    let raw = &kb.spec.version;
    match version::parse(raw) {
        Err(e) => vec![FieldError::invalid(
            "spec.version",
            raw.as_str(),
            format!("Invalid version: {e}"),
        )],
        Ok(v) => match version::supported(&v) {
            Ok(()) => vec![],
            Err(e) => vec![FieldError::invalid("spec.version", raw.as_str(), e)],
        },
    }
}

fn check_no_downgrade(old: &Kibana, kb: &Kibana) -> Vec<FieldError> {
    let waived = kb
        .annotations()
        .get(DISABLE_DOWNGRADE_VALIDATION_ANNOTATION)
        .is_some_and(|v| v == "true");
    if waived {
        return vec![];
    }
    let (Ok(previous), Ok(current)) = (
        version::parse(&old.spec.version),
        version::parse(&kb.spec.version),
    ) else {
        // unparseable versions are reported by the default checks
        return vec![];
    };
    if current < previous {
        vec![FieldError::forbidden(
            "spec.version",
            "Version downgrades are not supported",
        )]
    } else {
        vec![]
    }
}

fn check_reference(path: &str, reference: &ObjectSelector) -> Option<FieldError> {
    let set = |v: &Option<String>| v.as_deref().is_some_and(|v| !v.is_empty());
    let detail = if set(&reference.name) && set(&reference.secret_name) {
        "specify name or secretName, not both"
    } else if set(&reference.secret_name)
        && (set(&reference.namespace) || set(&reference.service_name))
    {
        "serviceName or namespace can only be used in combination with name, not with secretName"
    } else {
        return None;
    };
    Some(FieldError::forbidden(
        path,
        format!("Invalid association reference: {detail}"),
    ))
}

fn check_associations(kb: &Kibana) -> Vec<FieldError> {
    [
        ("spec.elasticsearchRef", kb.spec.elasticsearch_ref.as_ref()),
        ("spec.enterpriseSearchRef", kb.spec.enterprise_search_ref.as_ref()),
    ]
    .into_iter()
    .filter_map(|(path, reference)| reference.and_then(|r| check_reference(path, r)))
    .collect()
}

fn check_monitoring(kb: &Kibana) -> Vec<FieldError> {
    let metrics = kb.metrics_monitoring_refs();
    let logs = kb.logs_monitoring_refs();
    let mut errors = vec![];
    if metrics.is_empty() && logs.is_empty() {
        return errors;
    }

    if let Ok(v) = version::parse(&kb.spec.version) {
        if !version::at_least(&v, &version::STACK_MONITORING_SINCE) {
            errors.push(FieldError::invalid(
                "spec.version",
                kb.spec.version.as_str(),
                format!(
                    "Unsupported version for Stack Monitoring. Required >= {}.",
                    version::STACK_MONITORING_SINCE
                ),
            ));
        }
    }

    if !metrics.is_empty() && kb.es_ref().is_none() {
        errors.push(FieldError::required(
            "spec.elasticsearchRef",
            "Kibana must be associated to an Elasticsearch cluster through elasticsearchRef in order to enable monitoring metrics features",
        ));
    }

    errors.extend(
        metrics
            .iter()
            .filter_map(|r| check_reference("spec.monitoring.metrics", r)),
    );
    errors.extend(
        logs.iter()
            .filter_map(|r| check_reference("spec.monitoring.logs", r)),
    );
    errors
}

/// Reports fields of the last applied configuration that the Kibana type does not know.
///
/// Only applies when the annotation describes the same spec as the object, otherwise the
/// annotation is stale and says nothing about the object being validated.
fn check_no_unknown_fields(kb: &Kibana) -> Vec<FieldError> {
    let Some(raw) = kb.annotations().get(LAST_APPLIED_CONFIGURATION_ANNOTATION) else {
        return vec![];
    };
    let Ok(applied) = serde_json::from_str::<Value>(raw) else {
        return vec![];
    };
    let Ok(decoded) = serde_json::from_value::<Kibana>(applied.clone()) else {
        return vec![];
    };
    let same_spec = match (
        serde_json::to_value(&decoded.spec),
        serde_json::to_value(&kb.spec),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if !same_spec {
        return vec![];
    }
    let Ok(known) = serde_json::to_value(&decoded) else {
        return vec![];
    };

    let mut unknown = vec![];
    collect_unknown_fields(&applied, &known, &mut unknown);
    unknown.dedup();
    unknown.iter().map(|f| FieldError::unknown(f)).collect()
}

fn collect_unknown_fields(applied: &Value, known: &Value, unknown: &mut Vec<String>) {
    match (applied, known) {
        (Value::Object(applied), Value::Object(known)) => {
            for (key, value) in applied {
                match known.get(key) {
                    Some(known_value) => collect_unknown_fields(value, known_value, unknown),
                    None if value.is_null() => {}
                    None => unknown.push(key.clone()),
                }
            }
        }
        (Value::Array(applied), Value::Array(known)) => {
            for (a, k) in applied.iter().zip(known) {
                collect_unknown_fields(a, k, unknown);
            }
        }
        _ => {}
    }
}
