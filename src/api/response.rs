// ABOUTME: JSON response rendering for records, acknowledgements, and errors.
// ABOUTME: Record fields absent from the store render as the "MISSING" marker.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};
use serde_json::{Map, Value, json};

use super::routes::RouteError;
use crate::orchestrator::{ErrorKind, OrchestratorError};
use crate::record::ImageRecord;

pub const MISSING: &str = "MISSING";

pub type ApiResponse = Response<Full<Bytes>>;

/// The client-facing view of a record.
pub fn render_record(record: &ImageRecord) -> Value {
    let mut out = Map::new();
    out.insert("id".into(), json!(record.id));
    out.insert("system".into(), json!(record.system));
    out.insert("itype".into(), json!(record.itype));
    out.insert("tag".into(), json!(record.tag));
    out.insert("status".into(), json!(record.status));
    out.insert("userAcl".into(), json!(record.user_acl));
    out.insert("groupAcl".into(), json!(record.group_acl));
    out.insert("ENV".into(), or_missing(record.env.as_ref().map(|e| json!(e))));
    out.insert("ENTRY".into(), or_missing(record.entry.as_ref().map(|e| json!(e))));
    out.insert("WORKDIR".into(), or_missing(record.workdir.as_ref().map(|w| json!(w))));
    out.insert(
        "last_pull".into(),
        or_missing(record.last_pull.map(|t| json!(t.to_rfc3339()))),
    );
    Value::Object(out)
}

fn or_missing(value: Option<Value>) -> Value {
    value.unwrap_or_else(|| Value::String(MISSING.to_string()))
}

pub fn json_response(status: StatusCode, body: &Value) -> ApiResponse {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub fn text_response(status: StatusCode, body: &'static str) -> ApiResponse {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

pub fn error_body(status: StatusCode, error: &str, message: &str) -> ApiResponse {
    json_response(
        status,
        &json!({
            "status": status.as_u16(),
            "error": error,
            "message": message,
        }),
    )
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::AuthFailure => StatusCode::UNAUTHORIZED,
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::UnknownSystem | ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::DispatchFailure => StatusCode::BAD_GATEWAY,
        ErrorKind::StoreFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::AuthFailure => "auth_failure",
        ErrorKind::UnknownSystem => "unknown_system",
        ErrorKind::NotFound => "not_found",
        ErrorKind::DispatchFailure => "dispatch_failure",
        ErrorKind::ValidationError => "validation_error",
        ErrorKind::StoreFailure => "store_failure",
    }
}

pub fn orchestrator_error(err: &OrchestratorError) -> ApiResponse {
    let kind = err.kind();
    error_body(status_for(kind), kind_label(kind), &err.to_string())
}

pub fn route_error(err: &RouteError) -> ApiResponse {
    match err {
        RouteError::NotFound(_) => error_body(StatusCode::NOT_FOUND, "not_found", &err.to_string()),
        RouteError::MethodNotAllowed { .. } => error_body(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            &err.to_string(),
        ),
        RouteError::BadEncoding(_) => {
            error_body(StatusCode::BAD_REQUEST, "validation_error", &err.to_string())
        }
    }
}
