//! Validating admission webhook for Kibana.
//!
//! Creates run the default checks, updates additionally refuse version downgrades,
//! deletes are always admitted. Rejections carry one status cause per field error.

use kube::core::admission::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, ConvertAdmissionReviewError, Operation,
};
use kube::core::response::{StatusCause, StatusDetails};
use kube::core::DynamicObject;
use kube::{Resource, ResourceExt};
use thiserror::Error;
use tracing::{debug, warn};

use crate::resources::kibanas::Kibana;
use crate::validation::{self, FieldErrors};

/// Path the API server posts Kibana admission reviews to.
pub const VALIDATE_PATH: &str = "/validate-kibana-k8s-elastic-co-v1-kibana";

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("invalid admission request: {0}")]
    InvalidRequest(#[from] ConvertAdmissionReviewError),

    #[error("admission request for {0:?} carries no object")]
    MissingObject(Operation),

    #[error(transparent)]
    Rejected(#[from] FieldErrors),
}

/// Answers an admission review.
pub fn review(review: AdmissionReview<Kibana>) -> AdmissionReview<DynamicObject> {
    let req: AdmissionRequest<Kibana> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            let e = WebhookError::InvalidRequest(e);
            warn!("{}", e);
            return AdmissionResponse::invalid(e.to_string()).into_review();
        }
    };
    respond(&req, validate(&req)).into_review()
}

fn validate(req: &AdmissionRequest<Kibana>) -> Result<(), WebhookError> {
    let object = || req.object.as_ref().ok_or(WebhookError::MissingObject(req.operation.clone()));
    match req.operation {
        Operation::Create => {
            let kb = object()?;
            debug!("Validating create of Kibana {}", kb.name_any());
            validation::validate_create(kb)?;
        }
        Operation::Update => {
            let kb = object()?;
            let old = req
                .old_object
                .as_ref()
                .ok_or(WebhookError::MissingObject(Operation::Update))?;
            debug!("Validating update of Kibana {}", kb.name_any());
            validation::validate_update(old, kb)?;
        }
        Operation::Delete | Operation::Connect => {}
    }
    Ok(())
}

fn respond(req: &AdmissionRequest<Kibana>, result: Result<(), WebhookError>) -> AdmissionResponse {
    match result {
        Ok(()) => AdmissionResponse::from(req),
        Err(WebhookError::Rejected(errors)) => {
            warn!("Rejecting Kibana {}: {}", errors.name, errors);
            let mut response = AdmissionResponse::from(req).deny(errors.to_string());
            response.result.code = 422;
            response.result.reason = "Invalid".into();
            response.result.details = Some(StatusDetails {
                name: errors.name.clone(),
                group: Kibana::group(&()).into_owned(),
                kind: Kibana::kind(&()).into_owned(),
                uid: String::new(),
                causes: errors
                    .errors
                    .iter()
                    .map(|e| StatusCause {
                        reason: e.error_type.reason().into(),
                        message: e.to_string(),
                        field: e.path.clone(),
                    })
                    .collect(),
                retry_after_seconds: 0,
            });
            response
        }
        Err(e) => {
            warn!("{}", e);
            AdmissionResponse::from(req).deny(e.to_string())
        }
    }
}
