use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use harbor_proto::Envelope;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::authorization::Authorize;
use crate::dispatcher::CommandDispatcher;
use crate::session::{
    DecisionOutcome, PermissionPrompt, SessionEffect, SessionSnapshot, TargetSession,
};

pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum SessionEvent {
    Inbound(Envelope),
    /// Drop the binding and grants; the session keeps serving from `Idle`.
    Teardown,
    Shutdown,
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

type DecisionFuture = Pin<Box<dyn Future<Output = (u64, DecisionOutcome)> + Send>>;

/// Owner side of a running session task.
///
/// Every envelope for one target goes through a single task, so transitions
/// never interleave and responses leave in the order they were produced.
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Returns false once the session task has stopped.
    pub fn deliver(&self, envelope: Envelope) -> bool {
        self.events.send(SessionEvent::Inbound(envelope)).is_ok()
    }

    /// Revoke the binding and every grant without stopping the task.
    pub fn teardown(&self) -> bool {
        self.events.send(SessionEvent::Teardown).is_ok()
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (reply, response) = oneshot::channel();
        self.events.send(SessionEvent::Snapshot(reply)).ok()?;
        response.await.ok()
    }

    /// Stop the session task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.events.send(SessionEvent::Shutdown);
        let _ = self.task.await;
    }
}

pub struct SessionOptions {
    pub decision_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            decision_timeout: DEFAULT_DECISION_TIMEOUT,
        }
    }
}

pub fn spawn_session(
    target_id: impl Into<String>,
    dispatcher: Arc<CommandDispatcher>,
    authorizer: Arc<dyn Authorize>,
    outbound: mpsc::UnboundedSender<Envelope>,
    options: SessionOptions,
) -> SessionHandle {
    let (events, inbox) = mpsc::unbounded_channel();
    let actor = SessionActor {
        session: TargetSession::new(target_id),
        dispatcher,
        authorizer,
        outbound,
        decision_timeout: options.decision_timeout,
        decision: None,
    };
    let task = tokio::spawn(actor.run(inbox));
    SessionHandle { events, task }
}

struct SessionActor {
    session: TargetSession,
    dispatcher: Arc<CommandDispatcher>,
    authorizer: Arc<dyn Authorize>,
    outbound: mpsc::UnboundedSender<Envelope>,
    decision_timeout: Duration,
    decision: Option<DecisionFuture>,
}

enum Next {
    Event(Option<SessionEvent>),
    Decision(u64, DecisionOutcome),
}

impl SessionActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SessionEvent>) {
        info!(
            target = "harbor::session",
            target_id = %self.session.target_id(),
            "session started"
        );
        loop {
            let next = tokio::select! {
                event = inbox.recv() => Next::Event(event),
                (prompt_id, outcome) = next_decision(&mut self.decision) => {
                    Next::Decision(prompt_id, outcome)
                }
            };

            match next {
                Next::Event(Some(SessionEvent::Inbound(envelope))) => {
                    self.handle_inbound(envelope).await;
                }
                Next::Event(Some(SessionEvent::Snapshot(reply))) => {
                    let _ = reply.send(self.session.snapshot());
                }
                Next::Event(Some(SessionEvent::Teardown)) => {
                    info!(
                        target = "harbor::session",
                        target_id = %self.session.target_id(),
                        "teardown requested; returning to idle"
                    );
                    let effects = self.session.teardown();
                    self.apply(effects).await;
                }
                Next::Event(Some(SessionEvent::Shutdown)) | Next::Event(None) => break,
                Next::Decision(prompt_id, outcome) => {
                    let effects = self.session.on_decision(prompt_id, outcome);
                    self.apply(effects).await;
                }
            }
        }

        // Nobody is left to read refusals, so only the prompt is cancelled.
        self.decision = None;
        self.session.teardown();
        info!(
            target = "harbor::session",
            target_id = %self.session.target_id(),
            "session stopped"
        );
    }

    async fn handle_inbound(&mut self, envelope: Envelope) {
        let effects = match envelope {
            Envelope::Command(command) => {
                let required = self.dispatcher.required_permission(&command.command);
                debug!(
                    target = "harbor::session",
                    command = %command.command,
                    controller_id = %command.controller_id,
                    request_id = command.request_id,
                    permission = %required,
                    state = ?self.session.state(),
                    "command received"
                );
                self.session.on_command(command, required)
            }
            Envelope::ControllerStatus(status) => self.session.on_controller_status(&status),
            other => {
                trace!(
                    target = "harbor::session",
                    kind = other.type_name(),
                    "ignoring envelope not meant for targets"
                );
                Vec::new()
            }
        };
        self.apply(effects).await;
    }

    async fn apply(&mut self, effects: Vec<SessionEffect>) {
        for effect in effects {
            match effect {
                SessionEffect::Prompt(prompt) => {
                    info!(
                        target = "harbor::session",
                        details = %prompt.synopsis(),
                        "awaiting permission decision"
                    );
                    self.decision = Some(self.decision_future(prompt));
                }
                SessionEffect::CancelPrompt { prompt_id } => {
                    if self.decision.take().is_some() {
                        debug!(target = "harbor::session", prompt_id, "prompt cancelled");
                    }
                }
                SessionEffect::Dispatch(command) => {
                    let response = self.dispatcher.dispatch(&self.session, &command).await;
                    self.send(Envelope::Response(response));
                }
                SessionEffect::Send(envelope) => self.send(envelope),
            }
        }
    }

    fn decision_future(&self, prompt: PermissionPrompt) -> DecisionFuture {
        let authorizer = Arc::clone(&self.authorizer);
        let limit = self.decision_timeout;
        let prompt_id = prompt.prompt_id;
        Box::pin(async move {
            let outcome = match timeout(limit, authorizer.decide(prompt)).await {
                Ok(true) => DecisionOutcome::Granted,
                Ok(false) => DecisionOutcome::Denied,
                Err(_) => DecisionOutcome::TimedOut,
            };
            (prompt_id, outcome)
        })
    }

    fn send(&self, envelope: Envelope) {
        let kind = envelope.type_name();
        if self.outbound.send(envelope).is_err() {
            debug!(
                target = "harbor::session",
                kind, "outbound channel closed; dropping envelope"
            );
        }
    }
}

async fn next_decision(slot: &mut Option<DecisionFuture>) -> (u64, DecisionOutcome) {
    match slot.as_mut() {
        Some(pending) => {
            let outcome = pending.await;
            *slot = None;
            outcome
        }
        None => std::future::pending().await,
    }
}
