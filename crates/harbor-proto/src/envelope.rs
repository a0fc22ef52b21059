use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::error::{CommandError, ErrorCode};
use crate::permission::PermissionKind;

/// Every message exchanged over the relay, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// Controller asks a target to run a command.
    Command(CommandEnvelope),
    /// Target answers exactly one command.
    Response(ResponseEnvelope),
    /// Target reports the outcome of a permission prompt.
    PermissionResponse(PermissionDecision),
    /// Relay tells targets that a controller came or went.
    ControllerStatus(ControllerStatus),
    /// Relay tells controllers that a target came or went.
    TargetStatus(TargetStatus),
}

impl Envelope {
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Command(_) => "command",
            Envelope::Response(_) => "response",
            Envelope::PermissionResponse(_) => "permission-response",
            Envelope::ControllerStatus(_) => "controller-status",
            Envelope::TargetStatus(_) => "target-status",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    /// Stamped by the relay with the sending controller's endpoint id.
    #[serde(default)]
    pub controller_id: String,
    /// Optional unicast address; without it the relay fans out to every target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    pub request_id: u64,
}

impl CommandEnvelope {
    pub fn new(command: impl Into<String>, request_id: u64) -> Self {
        Self {
            controller_id: String::new(),
            target_id: None,
            command: command.into(),
            args: Map::new(),
            request_id,
        }
    }

    pub fn from_controller(mut self, controller_id: impl Into<String>) -> Self {
        self.controller_id = controller_id.into();
        self
    }

    pub fn to_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub controller_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    pub response: ResponsePayload,
    pub request_id: u64,
}

impl ResponseEnvelope {
    pub fn success(command: &CommandEnvelope, payload: Value) -> Self {
        Self::answering(command, ResponsePayload::Success(payload))
    }

    pub fn failure(command: &CommandEnvelope, error: &CommandError) -> Self {
        Self::answering(command, ResponsePayload::Error(error.descriptor()))
    }

    fn answering(command: &CommandEnvelope, response: ResponsePayload) -> Self {
        Self {
            controller_id: command.controller_id.clone(),
            command: command.command.clone(),
            args: command.args.clone(),
            response,
            request_id: command.request_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.response, ResponsePayload::Success(_))
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match &self.response {
            ResponsePayload::Error(descriptor) => descriptor.code,
            ResponsePayload::Success(_) => None,
        }
    }
}

/// Either the handler's payload or an error descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Error(ErrorDescriptor),
    Success(Value),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorDescriptor {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDecision {
    pub controller_id: String,
    pub granted: bool,
    #[serde(default)]
    pub permissions: BTreeSet<PermissionKind>,
    /// Request id of the command that raised the prompt.
    pub request_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    pub controller_id: String,
    pub status: EndpointStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    pub target_id: String,
    pub status: EndpointStatus,
}
