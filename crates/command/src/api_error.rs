//! Structured API errors and their cross-node encoding.
//!
//! An [`ApiError`] travels between controllers as a flat JSON object:
//!
//! ```json
//! {"code":"NOT_FOUND","status":404,"message":"...","cause":{...},"causeType":"NotFoundError"}
//! ```
//!
//! The receiving side rebuilds the typed cause through a [`CauseRegistry`].
//! Cause types without a registered parser come back as a [`GenericCause`]
//! holding the raw JSON.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use fabric_db::DbError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::CodecResult;

/// Code used for entity lookups that found nothing
pub const CODE_NOT_FOUND: &str = "NOT_FOUND";
/// Code used for field level validation failures
pub const CODE_INVALID_FIELD: &str = "COULD_NOT_VALIDATE";
/// Code used for malformed requests
pub const CODE_INVALID: &str = "INVALID";
/// Code used for unexpected failures
pub const CODE_INTERNAL: &str = "UNHANDLED";

/// Typed detail attached to an [`ApiError`]
pub trait ErrorCause: std::error::Error + Send + Sync + 'static {
    /// Discriminator written as `causeType`
    fn cause_type(&self) -> &str;

    /// JSON form written as `cause`
    fn to_json(&self) -> serde_json::Value;

    /// Downcasting support
    fn as_any(&self) -> &dyn Any;
}

/// An entity lookup failed
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{entity_type} with id {id} not found")]
pub struct NotFoundError {
    /// Kind of entity looked up
    pub entity_type: String,
    /// Id that was not found
    pub id: String,
}

impl NotFoundError {
    /// `causeType` discriminator
    pub const CAUSE_TYPE: &'static str = "NotFoundError";
}

impl ErrorCause for NotFoundError {
    fn cause_type(&self) -> &str {
        Self::CAUSE_TYPE
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "entityType": self.entity_type, "id": self.id })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A single field failed validation
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("the value '{value}' for '{field}' is invalid: {reason}")]
pub struct FieldError {
    /// Offending field
    pub field: String,
    /// Rejected value
    pub value: serde_json::Value,
    /// Why it was rejected
    pub reason: String,
}

impl FieldError {
    /// `causeType` discriminator
    pub const CAUSE_TYPE: &'static str = "FieldError";
}

impl ErrorCause for FieldError {
    fn cause_type(&self) -> &str {
        Self::CAUSE_TYPE
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "field": self.field, "value": self.value, "reason": self.reason })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A cause whose type has no registered parser
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{raw}")]
pub struct GenericCause {
    /// `causeType` as received, empty if none was sent
    pub cause_type: String,
    /// The cause re-serialized as JSON
    pub raw: String,
}

impl ErrorCause for GenericCause {
    fn cause_type(&self) -> &str {
        &self.cause_type
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.raw).unwrap_or_else(|_| serde_json::Value::String(self.raw.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Structured error returned by command validation and application
#[derive(Clone)]
pub struct ApiError {
    /// Stable machine readable code
    pub code: String,
    /// HTTP-style status
    pub status: u16,
    /// Human readable message
    pub message: String,
    /// Typed detail
    pub cause: Option<Arc<dyn ErrorCause>>,
}

impl ApiError {
    /// Create an error without a cause
    pub fn new(code: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            status,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach a cause
    pub fn with_cause(mut self, cause: impl ErrorCause) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Entity lookup failure
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        let cause = NotFoundError {
            entity_type: entity_type.into(),
            id: id.into(),
        };
        Self::new(CODE_NOT_FOUND, 404, cause.to_string()).with_cause(cause)
    }

    /// Field validation failure
    pub fn field(
        field: impl Into<String>,
        value: impl Into<serde_json::Value>,
        reason: impl Into<String>,
    ) -> Self {
        let cause = FieldError {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        };
        Self::new(CODE_INVALID_FIELD, 400, "the supplied request contains an invalid document")
            .with_cause(cause)
    }

    /// Malformed request
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(CODE_INVALID, 400, message)
    }

    /// Unexpected failure
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CODE_INTERNAL, 500, message)
    }

    /// Downcast the cause
    pub fn cause_as<T: ErrorCause>(&self) -> Option<&T> {
        self.cause.as_deref()?.as_any().downcast_ref::<T>()
    }

    /// Wire form
    pub fn to_payload(&self) -> ApiErrorPayload {
        ApiErrorPayload {
            code: self.code.clone(),
            status: self.status,
            message: self.message.clone(),
            cause: self.cause.as_ref().map(|c| c.to_json()),
            cause_type: self.cause.as_ref().map(|c| c.cause_type().to_string()),
        }
    }

    /// JSON encoding of the wire form
    pub fn to_json_bytes(&self) -> CodecResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_payload())?)
    }
}

impl fmt::Debug for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiError")
            .field("code", &self.code)
            .field("status", &self.status)
            .field("message", &self.message)
            .field("cause", &self.cause)
            .finish()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({cause})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        Self::internal(format!("storage failure: {e}"))
    }
}

/// Flat JSON form of an [`ApiError`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorPayload {
    /// Error code
    pub code: String,
    /// HTTP-style status
    pub status: u16,
    /// Message
    pub message: String,
    /// Cause JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<serde_json::Value>,
    /// Cause discriminator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause_type: Option<String>,
}

/// Parser turning a `cause` JSON value into a typed cause
pub type CauseParser = fn(serde_json::Value) -> Result<Arc<dyn ErrorCause>, serde_json::Error>;

fn parse_serde<T: ErrorCause + DeserializeOwned>(
    value: serde_json::Value,
) -> Result<Arc<dyn ErrorCause>, serde_json::Error> {
    Ok(Arc::new(serde_json::from_value::<T>(value)?))
}

/// Maps `causeType` strings to parsers
#[derive(Clone)]
pub struct CauseRegistry {
    parsers: HashMap<String, CauseParser>,
}

impl fmt::Debug for CauseRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.parsers.keys()).finish()
    }
}

impl Default for CauseRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl CauseRegistry {
    /// Registry with no parsers; every cause decodes as [`GenericCause`]
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Registry knowing [`NotFoundError`] and [`FieldError`]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register_serde::<NotFoundError>(NotFoundError::CAUSE_TYPE);
        registry.register_serde::<FieldError>(FieldError::CAUSE_TYPE);
        registry
    }

    /// Register a parser, replacing any previous one for `cause_type`
    pub fn register(&mut self, cause_type: impl Into<String>, parser: CauseParser) {
        self.parsers.insert(cause_type.into(), parser);
    }

    /// Register a cause that deserializes from its own JSON form
    pub fn register_serde<T: ErrorCause + DeserializeOwned>(&mut self, cause_type: impl Into<String>) {
        self.register(cause_type, parse_serde::<T>);
    }

    /// Rebuild an error from its wire form
    pub fn decode(&self, payload: ApiErrorPayload) -> ApiError {
        let cause = payload
            .cause
            .map(|value| self.decode_cause(payload.cause_type.as_deref(), value));

        ApiError {
            code: payload.code,
            status: payload.status,
            message: payload.message,
            cause,
        }
    }

    /// Rebuild an error from its JSON encoding
    pub fn decode_json(&self, bytes: &[u8]) -> CodecResult<ApiError> {
        Ok(self.decode(serde_json::from_slice(bytes)?))
    }

    fn decode_cause(&self, cause_type: Option<&str>, value: serde_json::Value) -> Arc<dyn ErrorCause> {
        if let Some(parser) = cause_type.and_then(|t| self.parsers.get(t)) {
            match parser(value.clone()) {
                Ok(cause) => return cause,
                Err(e) => warn!(
                    "failed to parse cause of type {}: {}",
                    cause_type.unwrap_or_default(),
                    e
                ),
            }
        }

        Arc::new(GenericCause {
            cause_type: cause_type.unwrap_or_default().to_string(),
            raw: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(err: &ApiError, registry: &CauseRegistry) -> ApiError {
        let bytes = err.to_json_bytes().unwrap();
        registry.decode_json(&bytes).unwrap()
    }

    #[test]
    fn test_wire_form_is_flat() {
        let err = ApiError::not_found("service", "s-1");
        let json: serde_json::Value = serde_json::from_slice(&err.to_json_bytes().unwrap()).unwrap();

        assert_eq!(json["code"], CODE_NOT_FOUND);
        assert_eq!(json["status"], 404);
        assert_eq!(json["causeType"], "NotFoundError");
        assert_eq!(json["cause"]["entityType"], "service");
        assert_eq!(json["cause"]["id"], "s-1");
    }

    #[test]
    fn test_registered_causes_keep_their_type() {
        let registry = CauseRegistry::with_defaults();

        let decoded = round_trip(&ApiError::field("port", 70000, "out of range"), &registry);
        assert_eq!(decoded.code, CODE_INVALID_FIELD);
        assert_eq!(decoded.status, 400);
        let field = decoded.cause_as::<FieldError>().unwrap();
        assert_eq!(field.field, "port");
        assert_eq!(field.value, serde_json::json!(70000));
        assert_eq!(field.reason, "out of range");

        let decoded = round_trip(&ApiError::not_found("router", "r-9"), &registry);
        let not_found = decoded.cause_as::<NotFoundError>().unwrap();
        assert_eq!(not_found.entity_type, "router");
        assert_eq!(not_found.id, "r-9");
    }

    #[test]
    fn test_unknown_cause_type_degrades_to_generic() {
        let payload = ApiErrorPayload {
            code: "QUOTA".to_string(),
            status: 429,
            message: "over quota".to_string(),
            cause: Some(serde_json::json!({"limit": 10})),
            cause_type: Some("QuotaError".to_string()),
        };

        let decoded = CauseRegistry::with_defaults().decode(payload);
        assert_eq!(decoded.code, "QUOTA");
        let generic = decoded.cause_as::<GenericCause>().unwrap();
        assert_eq!(generic.cause_type, "QuotaError");
        assert_eq!(generic.raw, r#"{"limit":10}"#);
        assert!(decoded.cause_as::<FieldError>().is_none());
    }

    #[test]
    fn test_malformed_registered_cause_degrades_to_generic() {
        let payload = ApiErrorPayload {
            code: CODE_NOT_FOUND.to_string(),
            status: 404,
            message: "missing".to_string(),
            cause: Some(serde_json::json!("just a string")),
            cause_type: Some(NotFoundError::CAUSE_TYPE.to_string()),
        };

        let decoded = CauseRegistry::with_defaults().decode(payload);
        assert!(decoded.cause_as::<GenericCause>().is_some());
    }

    #[test]
    fn test_empty_registry_never_fails() {
        let decoded = round_trip(&ApiError::not_found("service", "x"), &CauseRegistry::empty());
        assert!(decoded.cause_as::<NotFoundError>().is_none());
        assert!(decoded.to_string().contains("x"));
    }

    #[test]
    fn test_error_without_cause() {
        let decoded = round_trip(&ApiError::invalid("bad request"), &CauseRegistry::default());
        assert!(decoded.cause.is_none());
        assert_eq!(decoded.message, "bad request");
        assert_eq!(decoded.to_string(), "INVALID: bad request");
    }
}
