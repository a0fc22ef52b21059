//! Simulated device capabilities.
//!
//! Nothing here touches real hardware; each handler returns a canned payload
//! shaped the way a controller expects to render it.

use harbor_proto::PermissionKind;
use serde_json::{json, Value};

use crate::dispatcher::{handler_fn, CommandArgs, CommandDispatcher, HandlerError};
use crate::permissions::PermissionCatalog;

pub fn camera(args: &CommandArgs) -> Result<Value, HandlerError> {
    match args.get("action").and_then(Value::as_str) {
        Some("toggle") => Ok(json!({
            "status": "active",
            "message": "Camera feed activated",
        })),
        Some(other) => Err(HandlerError::invalid(
            "action",
            format!("unsupported camera action '{other}'"),
        )),
        None => Err(HandlerError::invalid("action", "missing")),
    }
}

pub fn files(args: &CommandArgs) -> Result<Value, HandlerError> {
    let path = match args.get("path") {
        None | Some(Value::Null) => "/",
        Some(Value::String(path)) if path.is_empty() => "/",
        Some(Value::String(path)) => path.as_str(),
        Some(_) => return Err(HandlerError::invalid("path", "must be a string")),
    };
    Ok(json!({
        "files": [
            { "name": "Documents", "isDir": true },
            { "name": "Pictures", "isDir": true },
            { "name": "notes.txt", "isDir": false },
            { "name": "config.json", "isDir": false },
        ],
        "path": path,
    }))
}

pub fn sms(_args: &CommandArgs) -> Result<Value, HandlerError> {
    Ok(json!({
        "messages": [
            { "sender": "Mom", "text": "Call me when you get home" },
            { "sender": "John", "text": "Meeting at 3pm tomorrow" },
            { "sender": "Bank", "text": "Your payment is due soon" },
        ]
    }))
}

pub fn flashlight(_args: &CommandArgs) -> Result<Value, HandlerError> {
    let status = if rand::random::<bool>() { "on" } else { "off" };
    Ok(json!({
        "status": status,
        "message": format!("Flashlight turned {status}"),
    }))
}

/// Dispatcher with every simulated handler wired to the default catalog.
///
/// `location` is catalogued but has no handler, so once granted it answers
/// with an unknown-command error.
pub fn simulated_dispatcher() -> CommandDispatcher {
    CommandDispatcher::new(PermissionCatalog::default())
        .with_handler(PermissionKind::Camera.as_str(), handler_fn(camera))
        .with_handler(PermissionKind::Files.as_str(), handler_fn(files))
        .with_handler(PermissionKind::Sms.as_str(), handler_fn(sms))
        .with_handler(PermissionKind::Flashlight.as_str(), handler_fn(flashlight))
}
