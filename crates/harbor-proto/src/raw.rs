use serde_json::{Map, Value};
use thiserror::Error;

use crate::endpoint::Role;
use crate::envelope::Envelope;

const TYPE_FIELD: &str = "type";
const CONTROLLER_FIELD: &str = "controllerId";
const TARGET_FIELD: &str = "targetId";

/// An envelope as the relay sees it: a JSON object with a `type`
/// discriminator and whatever else the endpoints put in it.
///
/// The relay only ever reads `type` (for logging) and the addressing fields;
/// the rest of the payload passes through untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEnvelope {
    fields: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum RawEnvelopeError {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("envelope must be a json object")]
    NotAnObject,
    #[error("envelope is missing a string 'type' field")]
    MissingType,
}

impl RawEnvelope {
    pub fn parse(text: &str) -> Result<Self, RawEnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, RawEnvelopeError> {
        let Value::Object(fields) = value else {
            return Err(RawEnvelopeError::NotAnObject);
        };
        if !matches!(fields.get(TYPE_FIELD), Some(Value::String(_))) {
            return Err(RawEnvelopeError::MissingType);
        }
        Ok(Self { fields })
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, RawEnvelopeError> {
        Self::from_value(serde_json::to_value(envelope)?)
    }

    pub fn kind(&self) -> &str {
        self.fields
            .get(TYPE_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Endpoint this envelope is addressed to, if the sender named one.
    /// Targets address controllers through `controllerId`; controllers may
    /// address a target through `targetId`.
    pub fn recipient(&self, sender: Role) -> Option<&str> {
        let field = match sender {
            Role::Target => CONTROLLER_FIELD,
            Role::Controller => TARGET_FIELD,
        };
        self.fields
            .get(field)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Overwrite `controllerId` with the identity the relay assigned.
    pub fn stamp_controller(&mut self, controller_id: &str) {
        self.fields.insert(
            CONTROLLER_FIELD.to_string(),
            Value::String(controller_id.to_string()),
        );
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn to_text(&self) -> String {
        Value::Object(self.fields.clone()).to_string()
    }

    pub fn into_envelope(self) -> Result<Envelope, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields))
    }
}
