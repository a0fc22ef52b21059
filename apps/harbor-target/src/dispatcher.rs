use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use harbor_proto::{CommandEnvelope, CommandError, PermissionKind, ResponseEnvelope};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::permissions::{CatalogError, PermissionCatalog};
use crate::session::TargetSession;

pub type CommandArgs = Map<String, Value>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        HandlerError::InvalidArgument {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, args: &CommandArgs) -> Result<Value, HandlerError>;
}

/// Adapts a plain closure into a [`CommandHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&CommandArgs) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(&CommandArgs) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, args: &CommandArgs) -> Result<Value, HandlerError> {
        (self.0)(args)
    }
}

/// Routes authorized commands to their handlers and shapes the response.
#[derive(Clone, Default)]
pub struct CommandDispatcher {
    catalog: PermissionCatalog,
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandDispatcher {
    pub fn new(catalog: PermissionCatalog) -> Self {
        Self {
            catalog,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler and the permission that gates it.
    pub fn register(
        &mut self,
        command: &str,
        permission: PermissionKind,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), CatalogError> {
        self.catalog.register(command, permission)?;
        self.handlers.insert(command.to_string(), handler);
        Ok(())
    }

    /// Attach a handler to a command the catalog already knows.
    pub fn with_handler(mut self, command: &str, handler: impl CommandHandler + 'static) -> Self {
        self.handlers.insert(command.to_string(), Arc::new(handler));
        self
    }

    pub fn required_permission(&self, command: &str) -> PermissionKind {
        self.catalog.resolve(command)
    }

    /// Execute a command for the session's bound controller.
    ///
    /// Binding and grant are checked again here so a caller that skips the
    /// session transition still cannot reach a handler.
    pub async fn dispatch(
        &self,
        session: &TargetSession,
        command: &CommandEnvelope,
    ) -> ResponseEnvelope {
        if session.bound_controller() != Some(command.controller_id.as_str()) {
            return ResponseEnvelope::failure(command, &CommandError::UnboundController);
        }
        let required = self.required_permission(&command.command);
        if !session.permissions().check(required).is_granted() {
            return ResponseEnvelope::failure(command, &CommandError::PermissionDenied);
        }
        let Some(handler) = self.handlers.get(&command.command) else {
            return ResponseEnvelope::failure(command, &CommandError::UnknownCommand);
        };

        let outcome = AssertUnwindSafe(handler.handle(&command.args))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(payload)) => {
                debug!(
                    target = "harbor::dispatch",
                    command = %command.command,
                    request_id = command.request_id,
                    "command completed"
                );
                ResponseEnvelope::success(command, payload)
            }
            Ok(Err(err)) => {
                debug!(
                    target = "harbor::dispatch",
                    command = %command.command,
                    request_id = command.request_id,
                    error = %err,
                    "command failed"
                );
                ResponseEnvelope::failure(command, &CommandError::HandlerFailure(err.to_string()))
            }
            Err(_) => {
                warn!(
                    target = "harbor::dispatch",
                    command = %command.command,
                    request_id = command.request_id,
                    "handler panicked"
                );
                ResponseEnvelope::failure(
                    command,
                    &CommandError::HandlerFailure("command handler panicked".to_string()),
                )
            }
        }
    }
}
