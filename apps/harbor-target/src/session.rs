use std::collections::BTreeSet;

use harbor_proto::{
    CommandEnvelope, CommandError, ControllerStatus, EndpointStatus, Envelope, PermissionDecision,
    PermissionKind, ResponseEnvelope,
};
use tracing::{debug, info};

use crate::permissions::PermissionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No controller bound.
    Idle,
    /// A first command arrived and its permission prompt is outstanding.
    AwaitingDecision,
    /// A controller is attached and holds at least one grant.
    Bound,
}

/// Why a prompt was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPurpose {
    /// First command on an idle session; granting binds the controller and
    /// the command proceeds.
    Binding,
    /// Bound controller reached for a kind it does not hold yet; the command
    /// was already refused and only the grant is at stake.
    Escalation,
}

/// What the local authorization collaborator is asked to decide.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionPrompt {
    pub prompt_id: u64,
    pub target_id: String,
    pub controller_id: String,
    pub permission: PermissionKind,
    pub purpose: PromptPurpose,
    pub command: CommandEnvelope,
}

impl PermissionPrompt {
    pub fn synopsis(&self) -> String {
        let mut parts = vec![
            format!("controller: {}", self.controller_id),
            format!("permission: {}", self.permission.label()),
            format!("command: {}", self.command.command),
            format!("request: {}", self.command.request_id),
        ];
        if !self.command.args.is_empty() {
            parts.push(format!(
                "args: {}",
                serde_json::Value::Object(self.command.args.clone())
            ));
        }
        if self.purpose == PromptPurpose::Escalation {
            parts.push("additional permission".to_string());
        }
        parts.join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOutcome {
    Granted,
    Denied,
    TimedOut,
}

/// Work the session asks its owner to carry out, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    /// Surface a prompt to the authorization collaborator.
    Prompt(PermissionPrompt),
    /// Abandon the outstanding prompt; any late decision is ignored.
    CancelPrompt { prompt_id: u64 },
    /// Run the command through the dispatcher.
    Dispatch(CommandEnvelope),
    /// Send an envelope to the relay.
    Send(Envelope),
}

#[derive(Debug, Clone)]
struct PendingPrompt {
    prompt_id: u64,
    controller_id: String,
    permission: PermissionKind,
    purpose: PromptPurpose,
    command: CommandEnvelope,
}

/// Point-in-time copy of a session, used for inspection and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub target_id: String,
    pub state: SessionState,
    pub bound_controller: Option<String>,
    pub granted: BTreeSet<PermissionKind>,
    pub pending_request_id: Option<u64>,
}

/// Binding and grant state for one connected target.
///
/// All mutation goes through the `on_*` transitions, which return the
/// effects to perform instead of performing them.
#[derive(Debug)]
pub struct TargetSession {
    target_id: String,
    bound_controller: Option<String>,
    permissions: PermissionRegistry,
    state: SessionState,
    pending: Option<PendingPrompt>,
    next_prompt_id: u64,
}

impl TargetSession {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            bound_controller: None,
            permissions: PermissionRegistry::new(),
            state: SessionState::Idle,
            pending: None,
            next_prompt_id: 0,
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn bound_controller(&self) -> Option<&str> {
        self.bound_controller.as_deref()
    }

    pub fn permissions(&self) -> &PermissionRegistry {
        &self.permissions
    }

    pub fn pending_request_id(&self) -> Option<u64> {
        self.pending.as_ref().map(|pending| pending.command.request_id)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            target_id: self.target_id.clone(),
            state: self.state,
            bound_controller: self.bound_controller.clone(),
            granted: self.permissions.granted().clone(),
            pending_request_id: self.pending_request_id(),
        }
    }

    /// Grants only exist while a controller is bound, `Bound` means a bound
    /// controller, and `AwaitingDecision` means an outstanding binding prompt.
    pub fn invariants_hold(&self) -> bool {
        let grants_need_binding = self.permissions.is_empty() || self.bound_controller.is_some();
        let state_matches = match self.state {
            SessionState::Idle => self.bound_controller.is_none() && self.pending.is_none(),
            SessionState::AwaitingDecision => {
                self.bound_controller.is_none()
                    && matches!(
                        self.pending,
                        Some(PendingPrompt {
                            purpose: PromptPurpose::Binding,
                            ..
                        })
                    )
            }
            SessionState::Bound => {
                self.bound_controller.is_some()
                    && self
                        .pending
                        .as_ref()
                        .map_or(true, |p| p.purpose == PromptPurpose::Escalation)
            }
        };
        grants_need_binding && state_matches
    }

    pub fn on_command(
        &mut self,
        command: CommandEnvelope,
        required: PermissionKind,
    ) -> Vec<SessionEffect> {
        let effects = self.command_transition(command, required);
        debug_assert!(self.invariants_hold(), "session invariants violated: {self:?}");
        effects
    }

    fn command_transition(
        &mut self,
        command: CommandEnvelope,
        required: PermissionKind,
    ) -> Vec<SessionEffect> {
        if !required.is_grantable() {
            debug!(
                target = "harbor::session",
                command = %command.command,
                request_id = command.request_id,
                "command maps to no known permission; refusing"
            );
            return vec![refuse(&command, CommandError::PermissionDenied)];
        }

        match self.state {
            SessionState::Idle => {
                let prompt = self.open_prompt(command, required, PromptPurpose::Binding);
                self.state = SessionState::AwaitingDecision;
                vec![SessionEffect::Prompt(prompt)]
            }
            SessionState::AwaitingDecision => vec![refuse(&command, CommandError::Busy)],
            SessionState::Bound => {
                if self.bound_controller.as_deref() != Some(command.controller_id.as_str()) {
                    return vec![refuse(&command, CommandError::UnboundController)];
                }
                if self.permissions.check(required).is_granted() {
                    return vec![SessionEffect::Dispatch(command)];
                }
                if self.pending.is_some() {
                    return vec![refuse(&command, CommandError::Busy)];
                }
                let denial = refuse(&command, CommandError::PermissionDenied);
                let prompt = self.open_prompt(command, required, PromptPurpose::Escalation);
                vec![denial, SessionEffect::Prompt(prompt)]
            }
        }
    }

    pub fn on_decision(&mut self, prompt_id: u64, outcome: DecisionOutcome) -> Vec<SessionEffect> {
        let effects = self.decision_transition(prompt_id, outcome);
        debug_assert!(self.invariants_hold(), "session invariants violated: {self:?}");
        effects
    }

    fn decision_transition(
        &mut self,
        prompt_id: u64,
        outcome: DecisionOutcome,
    ) -> Vec<SessionEffect> {
        let Some(pending) = self.take_pending(prompt_id) else {
            debug!(
                target = "harbor::session",
                prompt_id, "ignoring decision for a prompt that is no longer pending"
            );
            return Vec::new();
        };

        let granted = outcome == DecisionOutcome::Granted;
        let decision = SessionEffect::Send(Envelope::PermissionResponse(PermissionDecision {
            controller_id: pending.controller_id.clone(),
            granted,
            permissions: if granted {
                BTreeSet::from([pending.permission])
            } else {
                BTreeSet::new()
            },
            request_id: pending.command.request_id,
        }));

        info!(
            target = "harbor::session",
            target_id = %self.target_id,
            controller_id = %pending.controller_id,
            permission = %pending.permission,
            outcome = ?outcome,
            "permission decision recorded"
        );

        match (pending.purpose, outcome) {
            (PromptPurpose::Binding, DecisionOutcome::Granted) => {
                self.permissions.grant(pending.permission);
                self.bound_controller = Some(pending.controller_id);
                self.state = SessionState::Bound;
                vec![decision, SessionEffect::Dispatch(pending.command)]
            }
            (PromptPurpose::Binding, DecisionOutcome::Denied) => {
                self.unbind();
                vec![decision, refuse(&pending.command, CommandError::PermissionDenied)]
            }
            (PromptPurpose::Binding, DecisionOutcome::TimedOut) => {
                self.unbind();
                vec![decision, refuse(&pending.command, CommandError::Timeout)]
            }
            (PromptPurpose::Escalation, DecisionOutcome::Granted) => {
                self.permissions.grant(pending.permission);
                vec![decision]
            }
            (PromptPurpose::Escalation, _) => vec![decision],
        }
    }

    pub fn on_controller_status(&mut self, status: &ControllerStatus) -> Vec<SessionEffect> {
        if status.status != EndpointStatus::Disconnected {
            return Vec::new();
        }
        let involved = self.bound_controller.as_deref() == Some(status.controller_id.as_str())
            || self
                .pending
                .as_ref()
                .is_some_and(|pending| pending.controller_id == status.controller_id);
        if !involved {
            return Vec::new();
        }
        info!(
            target = "harbor::session",
            target_id = %self.target_id,
            controller_id = %status.controller_id,
            "bound controller disconnected; tearing down"
        );
        self.teardown()
    }

    /// Drop the binding, every grant and any outstanding prompt.
    pub fn teardown(&mut self) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if let Some(pending) = self.pending.take() {
            effects.push(SessionEffect::CancelPrompt {
                prompt_id: pending.prompt_id,
            });
            // Escalation commands were answered when the prompt opened.
            if pending.purpose == PromptPurpose::Binding {
                effects.push(refuse(&pending.command, CommandError::PermissionDenied));
            }
        }
        self.unbind();
        debug_assert!(self.invariants_hold(), "session invariants violated: {self:?}");
        effects
    }

    fn open_prompt(
        &mut self,
        command: CommandEnvelope,
        permission: PermissionKind,
        purpose: PromptPurpose,
    ) -> PermissionPrompt {
        self.next_prompt_id += 1;
        let prompt = PermissionPrompt {
            prompt_id: self.next_prompt_id,
            target_id: self.target_id.clone(),
            controller_id: command.controller_id.clone(),
            permission,
            purpose,
            command: command.clone(),
        };
        self.pending = Some(PendingPrompt {
            prompt_id: prompt.prompt_id,
            controller_id: command.controller_id.clone(),
            permission,
            purpose,
            command,
        });
        prompt
    }

    fn take_pending(&mut self, prompt_id: u64) -> Option<PendingPrompt> {
        if self.pending.as_ref().map(|pending| pending.prompt_id) == Some(prompt_id) {
            self.pending.take()
        } else {
            None
        }
    }

    fn unbind(&mut self) {
        self.pending = None;
        self.bound_controller = None;
        self.permissions.revoke_all();
        self.state = SessionState::Idle;
    }
}

fn refuse(command: &CommandEnvelope, error: CommandError) -> SessionEffect {
    SessionEffect::Send(Envelope::Response(ResponseEnvelope::failure(command, &error)))
}
