//! Target side of the harbor relay: a per-connection session that binds one
//! controller at a time, gates its commands on locally granted permissions
//! and answers every command with exactly one response.

pub mod actor;
pub mod authorization;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod permissions;
pub mod session;
pub mod telemetry;

pub use actor::{spawn_session, SessionHandle, SessionOptions, DEFAULT_DECISION_TIMEOUT};
pub use authorization::{Authorize, AuthorizerKind, PromptAuthorizer};
pub use client::{ClientError, TargetAgent};
pub use config::{Cli, TargetConfig};
pub use dispatcher::{handler_fn, CommandArgs, CommandDispatcher, CommandHandler, HandlerError};
pub use permissions::{CatalogError, Grant, PermissionCatalog, PermissionRegistry};
pub use session::{
    DecisionOutcome, PermissionPrompt, PromptPurpose, SessionEffect, SessionSnapshot,
    SessionState, TargetSession,
};
