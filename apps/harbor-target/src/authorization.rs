use std::io::{self, BufRead, Write};
use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::session::PermissionPrompt;

/// Local decision point for permission prompts.
///
/// Implementations may take as long as they like; the session actor bounds
/// the wait with its own decision timeout.
#[async_trait]
pub trait Authorize: Send + Sync {
    async fn decide(&self, prompt: PermissionPrompt) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AuthorizerKind {
    /// Grant every prompt immediately.
    Allow,
    /// Deny every prompt immediately.
    Deny,
    /// Grant after a short pause, like a user clicking through.
    Delayed,
    /// Ask on the terminal.
    Interactive,
}

pub struct PromptAuthorizer {
    inner: PromptAuthorizerInner,
}

enum PromptAuthorizerInner {
    AllowAll,
    DenyAll,
    Delayed(Duration),
    Interactive(InteractiveAuthorizer),
}

struct InteractiveAuthorizer {
    lines: AsyncMutex<mpsc::UnboundedReceiver<String>>,
}

pub const DEFAULT_DELAYED_GRANT: Duration = Duration::from_millis(500);

impl PromptAuthorizer {
    pub fn allow_all() -> Self {
        Self {
            inner: PromptAuthorizerInner::AllowAll,
        }
    }

    pub fn deny_all() -> Self {
        Self {
            inner: PromptAuthorizerInner::DenyAll,
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            inner: PromptAuthorizerInner::Delayed(delay),
        }
    }

    /// Reads answers from stdin on a dedicated thread. Lines typed while no
    /// prompt is open are discarded when the next prompt starts.
    pub fn interactive() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let spawned = std::thread::Builder::new()
            .name("harbor-stdin".into())
            .spawn(move || {
                let stdin = io::stdin();
                for line in stdin.lock().lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        if let Err(err) = spawned {
            warn!(
                target = "harbor::auth",
                error = %err,
                "failed to start stdin reader; prompts will be denied"
            );
        }
        Self {
            inner: PromptAuthorizerInner::Interactive(InteractiveAuthorizer {
                lines: AsyncMutex::new(rx),
            }),
        }
    }

    pub fn from_kind(kind: AuthorizerKind) -> Self {
        match kind {
            AuthorizerKind::Allow => Self::allow_all(),
            AuthorizerKind::Deny => Self::deny_all(),
            AuthorizerKind::Delayed => Self::delayed(DEFAULT_DELAYED_GRANT),
            AuthorizerKind::Interactive => Self::interactive(),
        }
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self.inner, PromptAuthorizerInner::Interactive(_))
    }
}

#[async_trait]
impl Authorize for PromptAuthorizer {
    async fn decide(&self, prompt: PermissionPrompt) -> bool {
        let decision = match &self.inner {
            PromptAuthorizerInner::AllowAll => true,
            PromptAuthorizerInner::DenyAll => false,
            PromptAuthorizerInner::Delayed(delay) => {
                sleep(*delay).await;
                true
            }
            PromptAuthorizerInner::Interactive(inner) => return inner.decide(prompt).await,
        };
        debug!(
            target = "harbor::auth",
            details = %prompt.synopsis(),
            granted = decision,
            "permission decided automatically"
        );
        decision
    }
}

impl InteractiveAuthorizer {
    async fn decide(&self, prompt: PermissionPrompt) -> bool {
        // Holding the receiver serializes prompts across sessions.
        let mut lines = self.lines.lock().await;
        while lines.try_recv().is_ok() {}

        if let Err(err) = render_prompt(&prompt) {
            warn!(
                target = "harbor::auth",
                error = %err,
                details = %prompt.synopsis(),
                "failed to render permission prompt; denying"
            );
            return false;
        }

        loop {
            let Some(line) = lines.recv().await else {
                warn!(
                    target = "harbor::auth",
                    details = %prompt.synopsis(),
                    "stdin closed; denying permission"
                );
                return false;
            };
            match parse_answer(&line) {
                Some(allow) => {
                    info!(
                        target = "harbor::auth",
                        details = %prompt.synopsis(),
                        granted = allow,
                        "permission decided"
                    );
                    return allow;
                }
                None => {
                    let mut stderr = io::stderr();
                    let _ = write!(stderr, "Type 'yes' or 'no': ");
                    let _ = stderr.flush();
                }
            }
        }
    }
}

fn render_prompt(prompt: &PermissionPrompt) -> io::Result<()> {
    let mut stderr = io::stderr();
    writeln!(stderr)?;
    writeln!(stderr, "==============================")?;
    writeln!(stderr, "  Permission request")?;
    writeln!(stderr, "==============================")?;
    writeln!(stderr, "permission : {}", prompt.permission.label())?;
    writeln!(stderr, "controller : {}", prompt.controller_id)?;
    writeln!(stderr, "command    : {}", prompt.command.command)?;
    if !prompt.command.args.is_empty() {
        writeln!(
            stderr,
            "args       : {}",
            serde_json::Value::Object(prompt.command.args.clone())
        )?;
    }
    write!(stderr, "Allow? (yes/no): ")?;
    stderr.flush()
}

fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "allow" => Some(true),
        "no" | "n" | "deny" => Some(false),
        _ => None,
    }
}
