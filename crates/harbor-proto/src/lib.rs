//! Shared protocol definitions for controller ↔ relay ↔ target traffic.
//! Keeping the envelope shapes in a dedicated crate lets the relay, the
//! target agent and any controller tooling agree on the wire format without
//! pulling in each other's runtime code.

mod endpoint;
mod envelope;
mod error;
mod permission;
mod raw;

pub use endpoint::{
    endpoint_url, generate_endpoint_id, EndpointId, EndpointUrlError, Role, RoleParseError,
    RELAY_WS_PATH,
};
pub use envelope::{
    CommandEnvelope, ControllerStatus, EndpointStatus, Envelope, ErrorDescriptor,
    PermissionDecision, ResponseEnvelope, ResponsePayload, TargetStatus,
};
pub use error::{CommandError, ErrorCode};
pub use permission::{PermissionKind, PermissionParseError};
pub use raw::{RawEnvelope, RawEnvelopeError};
