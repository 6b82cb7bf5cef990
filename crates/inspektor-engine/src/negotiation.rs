use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use inspektor_agents::{Action, Planner};
use inspektor_common::{
    Confidence, ConversationId, DatastoreId, Error, Message, MessagePayload, MessageRole,
    MetadataKind, MetadataPayload, MetadataRequest, MetadataSnapshot, Result, WorkspaceContext,
    WorkspaceId,
};
use inspektor_config::{AppConfig, NegotiationConfig, PlannerConfig};
use inspektor_db::{MetadataCache, SessionStore, WorkspaceContextStore};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{debug, info, instrument, warn};

use crate::approval::AutoApprovalState;
use crate::correction::{self, CorrectionTracker};
use crate::executor::Executor;

/// Runtime knobs of the engine, usually derived from [`NegotiationConfig`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub auto_approve: bool,
    pub auto_approve_bound: u32,
    pub max_correction_attempts: u32,
    pub planner_timeout: Duration,
    pub executor_timeout: Duration,
    pub max_rounds: u32,
    /// Most recent messages handed to the planner each round; 0 means all.
    pub history_limit: usize,
}

impl From<&NegotiationConfig> for EngineOptions {
    fn from(config: &NegotiationConfig) -> Self {
        Self {
            auto_approve: config.auto_approve,
            auto_approve_bound: config.effective_auto_approve_bound(),
            max_correction_attempts: config.max_correction_attempts.max(1),
            planner_timeout: Duration::from_secs(config.planner_timeout_secs),
            executor_timeout: Duration::from_secs(config.executor_timeout_secs),
            max_rounds: config.max_rounds.max(1),
            history_limit: PlannerConfig::default().history_limit,
        }
    }
}

impl From<&AppConfig> for EngineOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            history_limit: config.planner.history_limit,
            ..Self::from(&config.negotiation)
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// What started the planning rounds that led to a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOrigin {
    UserMessage,
    Correction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    AwaitingInput,
    Planning,
    AwaitingApproval {
        request: MetadataRequest,
        origin: TurnOrigin,
    },
    FetchingMetadata {
        request: MetadataRequest,
    },
    AwaitingExecution {
        sql: String,
        intent: String,
    },
}

/// Inputs recorded into a conversation before planning.
///
/// `Continue` is produced by the engine itself after a metadata round-trip;
/// it is never a user message.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    UserMessage(String),
    Continue {
        request: MetadataRequest,
        summary: String,
    },
    ExecutionFailure {
        sql: String,
        error: String,
        intent: String,
        attempt: u32,
    },
}

impl TurnEvent {
    fn into_message(self) -> (MessageRole, String, Option<MessagePayload>) {
        match self {
            Self::UserMessage(text) => (MessageRole::User, text, None),
            Self::Continue { request, summary } => (
                MessageRole::System,
                summary.clone(),
                Some(MessagePayload::Continue { request, summary }),
            ),
            Self::ExecutionFailure {
                sql,
                error,
                intent,
                attempt,
            } => (
                MessageRole::System,
                correction::failure_message(&sql, &error),
                Some(MessagePayload::ExecutionFailure {
                    sql,
                    error,
                    intent,
                    attempt,
                }),
            ),
        }
    }
}

/// Result of driving a conversation until it needs outside input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    Ready {
        sql: String,
        explanation: String,
        confidence: Confidence,
    },
    Clarification {
        question: String,
    },
    /// A metadata request waits for `approve` or `reject`.
    /// `budget_exhausted` is set when auto-mode is on but its bound is spent.
    AwaitingApproval {
        request: MetadataRequest,
        budget_exhausted: bool,
    },
    Rejected {
        request: MetadataRequest,
    },
    Failed {
        kind: String,
        message: String,
        sql: Option<String>,
    },
}

impl TurnOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::AwaitingApproval { .. })
    }
}

struct ConversationState {
    phase: EngineState,
    auto: AutoApprovalState,
    corrections: CorrectionTracker,
    /// Text of the user message the current turn answers.
    intent: String,
}

struct ConversationHandle {
    datastore_id: DatastoreId,
    workspace_id: Option<WorkspaceId>,
    turn: Mutex<ConversationState>,
    status: watch::Sender<EngineState>,
    cancel: watch::Sender<bool>,
}

impl ConversationHandle {
    fn settle(&self, state: &mut ConversationState, phase: EngineState) {
        state.phase = phase.clone();
        self.status.send_replace(phase);
    }

    fn mark(&self, phase: EngineState) {
        self.status.send_replace(phase);
    }
}

/// Drives conversations between the planner and the executor.
pub struct NegotiationEngine {
    store: Arc<SessionStore>,
    cache: Arc<MetadataCache>,
    planner: Arc<dyn Planner>,
    executor: Arc<dyn Executor>,
    contexts: Option<Arc<WorkspaceContextStore>>,
    options: EngineOptions,
    handles: DashMap<ConversationId, Arc<ConversationHandle>>,
}

impl NegotiationEngine {
    pub fn new(
        store: Arc<SessionStore>,
        cache: Arc<MetadataCache>,
        planner: Arc<dyn Planner>,
        executor: Arc<dyn Executor>,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            cache,
            planner,
            executor,
            contexts: None,
            options,
            handles: DashMap::new(),
        }
    }

    /// Share workspace knowledge with the planner for conversations that
    /// belong to a workspace.
    pub fn with_workspace_contexts(mut self, contexts: Arc<WorkspaceContextStore>) -> Self {
        self.contexts = Some(contexts);
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn workspace_contexts(&self) -> Option<&Arc<WorkspaceContextStore>> {
        self.contexts.as_ref()
    }

    #[instrument(skip(self), fields(datastore = %datastore_id))]
    pub fn start_conversation(
        &self,
        datastore_id: &DatastoreId,
        workspace_id: Option<&WorkspaceId>,
    ) -> Result<ConversationId> {
        let conversation = self
            .store
            .create_conversation(datastore_id, workspace_id, None)?;
        let handle = self.new_handle(
            conversation.datastore_id.clone(),
            conversation.workspace_id.clone(),
            Restored::default(),
        );
        self.handles
            .insert(conversation.id.clone(), Arc::new(handle));
        Ok(conversation.id)
    }

    /// Send a user message, creating the conversation when none is given.
    pub async fn submit(
        &self,
        conversation_id: Option<&ConversationId>,
        datastore_id: &DatastoreId,
        text: &str,
    ) -> Result<(ConversationId, TurnOutcome)> {
        ensure_text(text)?;
        let id = match conversation_id {
            Some(id) => {
                let handle = self.handle(id)?;
                if handle.datastore_id != *datastore_id {
                    return Err(Error::Validation(format!(
                        "conversation {id} belongs to datastore {}, not {datastore_id}",
                        handle.datastore_id
                    )));
                }
                id.clone()
            }
            None => self.start_conversation(datastore_id, None)?,
        };
        let outcome = self.handle_user_message(&id, text).await?;
        Ok((id, outcome))
    }

    #[instrument(skip(self, text), fields(conversation = %conversation_id))]
    pub async fn handle_user_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<TurnOutcome> {
        ensure_text(text)?;
        let handle = self.handle(conversation_id)?;
        let mut state = lock_turn(&handle, conversation_id)?;
        if let EngineState::AwaitingApproval { request, .. } = &state.phase {
            return Err(Error::Busy(format!(
                "conversation {conversation_id} is waiting for a decision on {}",
                request.label()
            )));
        }

        self.record(conversation_id, TurnEvent::UserMessage(text.to_string()))?;
        state.intent = text.trim().to_string();
        self.drive(
            conversation_id,
            &handle,
            &mut state,
            TurnOrigin::UserMessage,
            None,
        )
        .await
    }

    #[instrument(skip(self), fields(conversation = %conversation_id))]
    pub async fn approve(&self, conversation_id: &ConversationId) -> Result<TurnOutcome> {
        let handle = self.handle(conversation_id)?;
        let mut state = lock_turn(&handle, conversation_id)?;
        let (request, origin) = match &state.phase {
            EngineState::AwaitingApproval { request, origin } => (request.clone(), *origin),
            _ => return Err(no_pending_request(conversation_id)),
        };

        info!("metadata request {} approved", request.label());
        self.drive(
            conversation_id,
            &handle,
            &mut state,
            origin,
            Some(request),
        )
        .await
    }

    #[instrument(skip(self), fields(conversation = %conversation_id))]
    pub fn reject(&self, conversation_id: &ConversationId) -> Result<TurnOutcome> {
        let handle = self.handle(conversation_id)?;
        let mut state = lock_turn(&handle, conversation_id)?;
        let request = match &state.phase {
            EngineState::AwaitingApproval { request, .. } => request.clone(),
            _ => return Err(no_pending_request(conversation_id)),
        };

        let rejection = Error::Rejected(request.label());
        self.store.append_message(
            conversation_id,
            MessageRole::System,
            &rejection.to_string(),
            Some(MessagePayload::Failure {
                error_kind: rejection.kind().to_string(),
                sql: None,
            }),
        )?;
        handle.settle(&mut state, EngineState::AwaitingInput);
        info!("metadata request {} rejected", request.label());
        Ok(TurnOutcome::Rejected { request })
    }

    /// Toggle auto-approval for one conversation. Spent approvals stay spent.
    pub fn set_auto_approve(
        &self,
        conversation_id: &ConversationId,
        enabled: bool,
        bound: Option<u32>,
    ) -> Result<AutoApprovalState> {
        let handle = self.handle(conversation_id)?;
        let mut state = lock_turn(&handle, conversation_id)?;
        state.auto.configure(enabled, bound);
        debug!(
            conversation = %conversation_id,
            enabled,
            bound = state.auto.bound,
            remaining = state.auto.remaining(),
            "auto-approval updated"
        );
        Ok(state.auto)
    }

    pub fn auto_approval(&self, conversation_id: &ConversationId) -> Result<AutoApprovalState> {
        let handle = self.handle(conversation_id)?;
        let state = lock_turn(&handle, conversation_id)?;
        Ok(state.auto)
    }

    /// Current state, including the transient planning and fetching phases.
    pub fn state(&self, conversation_id: &ConversationId) -> Result<EngineState> {
        let handle = self.handle(conversation_id)?;
        let state = handle.status.borrow().clone();
        Ok(state)
    }

    /// Feed an execution failure back into planning, bounded per intent.
    #[instrument(skip(self, sql, error, intent), fields(conversation = %conversation_id))]
    pub async fn on_execution_failure(
        &self,
        conversation_id: &ConversationId,
        sql: &str,
        error: &str,
        intent: &str,
    ) -> Result<TurnOutcome> {
        let handle = self.handle(conversation_id)?;
        let mut state = lock_turn(&handle, conversation_id)?;
        if let EngineState::AwaitingApproval { request, .. } = &state.phase {
            return Err(Error::Busy(format!(
                "conversation {conversation_id} is waiting for a decision on {}",
                request.label()
            )));
        }

        let intent = if intent.trim().is_empty() {
            state.intent.clone()
        } else {
            intent.trim().to_string()
        };
        let attempt = state.corrections.record_failure(&intent);
        self.record(
            conversation_id,
            TurnEvent::ExecutionFailure {
                sql: sql.to_string(),
                error: error.to_string(),
                intent: intent.clone(),
                attempt,
            },
        )?;
        warn!(
            attempt,
            max = self.options.max_correction_attempts,
            "execution failed: {error}"
        );

        if attempt >= self.options.max_correction_attempts {
            let failure = Error::Execution(correction::exhausted_message(attempt, sql, error));
            return self.fail(
                conversation_id,
                &handle,
                &mut state,
                failure,
                Some(sql.to_string()),
            );
        }

        state.intent = intent;
        self.drive(
            conversation_id,
            &handle,
            &mut state,
            TurnOrigin::Correction,
            None,
        )
        .await
    }

    /// The caller ran the SQL successfully; the failure streak for `intent` ends.
    pub fn on_execution_success(
        &self,
        conversation_id: &ConversationId,
        intent: &str,
    ) -> Result<()> {
        let handle = self.handle(conversation_id)?;
        let mut state = lock_turn(&handle, conversation_id)?;
        let intent = if intent.trim().is_empty() {
            state.intent.clone()
        } else {
            intent.trim().to_string()
        };
        self.store.append_message(
            conversation_id,
            MessageRole::System,
            "SQL executed successfully",
            Some(MessagePayload::ExecutionSuccess {
                intent: intent.clone(),
            }),
        )?;
        state.corrections.reset(&intent);
        if matches!(state.phase, EngineState::AwaitingExecution { .. }) {
            handle.settle(&mut state, EngineState::AwaitingInput);
        }
        Ok(())
    }

    /// Merge knowledge learned from this conversation into its workspace's
    /// context. Extracting it (typically with an LLM) is up to the caller.
    #[instrument(skip(self, learned), fields(conversation = %conversation_id))]
    pub fn learn_workspace_context(
        &self,
        conversation_id: &ConversationId,
        learned: &WorkspaceContext,
    ) -> Result<WorkspaceContext> {
        let contexts = self
            .contexts
            .as_ref()
            .ok_or_else(|| Error::Config("no workspace context store configured".into()))?;
        let handle = self.handle(conversation_id)?;
        let workspace_id = handle.workspace_id.as_ref().ok_or_else(|| {
            Error::Validation(format!(
                "conversation {conversation_id} does not belong to a workspace"
            ))
        })?;
        let merged = contexts.merge(workspace_id, learned, Some(conversation_id))?;
        info!(
            workspace = %workspace_id,
            tables = merged.tables_used.len(),
            rules = merged.business_context.len(),
            "workspace context updated"
        );
        Ok(merged)
    }

    /// Abandon in-flight work for the conversation and delete it.
    #[instrument(skip(self), fields(conversation = %conversation_id))]
    pub fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<bool> {
        if let Some((_, handle)) = self.handles.remove(conversation_id) {
            handle.cancel.send_replace(true);
            debug!("conversation handle released");
        }
        self.store.delete_conversation(conversation_id)
    }

    // --- turn driving ---

    /// Plan until the turn needs outside input. `pending` is an approved
    /// request to fetch before the first planning round.
    async fn drive(
        &self,
        id: &ConversationId,
        handle: &ConversationHandle,
        state: &mut ConversationState,
        origin: TurnOrigin,
        pending: Option<MetadataRequest>,
    ) -> Result<TurnOutcome> {
        let result = self.drive_rounds(id, handle, state, origin, pending).await;
        if result.is_err() {
            // the status mirror may still show a transient phase
            handle.mark(state.phase.clone());
        }
        result
    }

    async fn drive_rounds(
        &self,
        id: &ConversationId,
        handle: &ConversationHandle,
        state: &mut ConversationState,
        origin: TurnOrigin,
        mut pending: Option<MetadataRequest>,
    ) -> Result<TurnOutcome> {
        let mut rounds = 0u32;
        loop {
            if let Some(request) = pending.take()
                && let Err(e) = self.fetch_metadata(id, handle, &request).await
            {
                return self.settle_error(id, handle, state, e);
            }

            rounds += 1;
            if rounds > self.options.max_rounds {
                let runaway = Error::LoopDetected(format!(
                    "turn did not settle within {} planning rounds",
                    self.options.max_rounds
                ));
                return self.fail(id, handle, state, runaway, None);
            }

            handle.mark(EngineState::Planning);
            let (snapshot, workspace, history) = match self.planning_inputs(id, handle) {
                Ok(inputs) => inputs,
                Err(e) => return self.settle_error(id, handle, state, e),
            };
            let planned = self
                .plan(handle, &history, snapshot.as_ref(), workspace.as_ref())
                .await;
            let action = match planned {
                Ok(action) => action,
                Err(e) => return self.settle_error(id, handle, state, e),
            };
            if let Err(e) = action.validate() {
                return self.fail(id, handle, state, e, None);
            }
            debug!(round = rounds, status = action.label(), "planner action");

            match action {
                Action::NeedsMetadata { request } => {
                    if snapshot.as_ref().is_some_and(|s| s.satisfies(&request)) {
                        let repeated = Error::LoopDetected(format!(
                            "planner requested {} again although it is already cached",
                            request.label()
                        ));
                        return self.fail(id, handle, state, repeated, None);
                    }

                    self.store.append_message(
                        id,
                        MessageRole::Assistant,
                        &request_text(&request),
                        Some(MessagePayload::MetadataRequest {
                            request: request.clone(),
                        }),
                    )?;

                    if state.auto.try_consume() {
                        info!(
                            used = state.auto.used,
                            bound = state.auto.bound,
                            "metadata request {} auto-approved",
                            request.label()
                        );
                        pending = Some(request);
                        continue;
                    }

                    let budget_exhausted = state.auto.exhausted();
                    if budget_exhausted {
                        info!(
                            "{}",
                            Error::BudgetExceeded(format!(
                                "{} of {} auto-approvals used",
                                state.auto.used, state.auto.bound
                            ))
                        );
                    }
                    handle.settle(
                        state,
                        EngineState::AwaitingApproval {
                            request: request.clone(),
                            origin,
                        },
                    );
                    return Ok(TurnOutcome::AwaitingApproval {
                        request,
                        budget_exhausted,
                    });
                }
                Action::Ready {
                    sql,
                    explanation,
                    confidence,
                } => {
                    let content = if explanation.trim().is_empty() {
                        sql.clone()
                    } else {
                        explanation.clone()
                    };
                    self.store.append_message(
                        id,
                        MessageRole::Assistant,
                        &content,
                        Some(MessagePayload::Sql {
                            sql: sql.clone(),
                            explanation: explanation.clone(),
                            confidence,
                        }),
                    )?;
                    let intent = state.intent.clone();
                    handle.settle(
                        state,
                        EngineState::AwaitingExecution {
                            sql: sql.clone(),
                            intent,
                        },
                    );
                    return Ok(TurnOutcome::Ready {
                        sql,
                        explanation,
                        confidence,
                    });
                }
                Action::Clarification { question } => {
                    self.store.append_message(
                        id,
                        MessageRole::Assistant,
                        &question,
                        Some(MessagePayload::Clarification {
                            question: question.clone(),
                        }),
                    )?;
                    handle.settle(state, EngineState::AwaitingInput);
                    return Ok(TurnOutcome::Clarification { question });
                }
                Action::Error { message } => {
                    return self.fail(id, handle, state, Error::Agent(message), None);
                }
            }
        }
    }

    async fn fetch_metadata(
        &self,
        id: &ConversationId,
        handle: &ConversationHandle,
        request: &MetadataRequest,
    ) -> Result<()> {
        handle.mark(EngineState::FetchingMetadata {
            request: request.clone(),
        });
        let payload = self.call_executor(handle, request).await?;
        let snapshot = self
            .cache
            .merge_fulfilled(&handle.datastore_id, request, &payload)?;
        debug!(
            tables = snapshot.tables.len(),
            schemas = snapshot.schemas.len(),
            relationships = snapshot.relationships.len(),
            "metadata merged"
        );
        self.record(
            id,
            TurnEvent::Continue {
                request: request.clone(),
                summary: payload.summary(),
            },
        )?;
        Ok(())
    }

    fn planning_inputs(
        &self,
        id: &ConversationId,
        handle: &ConversationHandle,
    ) -> Result<(Option<MetadataSnapshot>, Option<WorkspaceContext>, Vec<Message>)> {
        let snapshot = self.cache.get(&handle.datastore_id)?;
        let workspace = match (&self.contexts, &handle.workspace_id) {
            (Some(contexts), Some(workspace_id)) => contexts.get(workspace_id)?,
            _ => None,
        };
        let history = self.store.recent_messages(id, self.options.history_limit)?;
        Ok((snapshot, workspace, history))
    }

    async fn plan(
        &self,
        handle: &ConversationHandle,
        history: &[Message],
        snapshot: Option<&MetadataSnapshot>,
        workspace: Option<&WorkspaceContext>,
    ) -> Result<Action> {
        let planner = &self.planner;
        guarded(handle, "planner", self.options.planner_timeout, move || {
            planner.plan_with_context(history, snapshot, workspace)
        })
        .await
    }

    async fn call_executor(
        &self,
        handle: &ConversationHandle,
        request: &MetadataRequest,
    ) -> Result<MetadataPayload> {
        let executor = &self.executor;
        let datastore = &handle.datastore_id;
        guarded(handle, "executor", self.options.executor_timeout, move || async move {
            match request.kind {
                MetadataKind::Tables => executor
                    .list_tables(datastore)
                    .await
                    .map(MetadataPayload::Tables),
                MetadataKind::Schema => executor
                    .get_schema(datastore, &request.params.tables)
                    .await
                    .map(MetadataPayload::Schema),
                MetadataKind::Relationships => executor
                    .get_relationships(datastore)
                    .await
                    .map(MetadataPayload::Relationships),
            }
        })
        .await
    }

    // --- terminal bookkeeping ---

    fn settle_error(
        &self,
        id: &ConversationId,
        handle: &ConversationHandle,
        state: &mut ConversationState,
        error: Error,
    ) -> Result<TurnOutcome> {
        match error {
            Error::Cancelled(_) => Err(error),
            other => self.fail(id, handle, state, other, None),
        }
    }

    fn fail(
        &self,
        id: &ConversationId,
        handle: &ConversationHandle,
        state: &mut ConversationState,
        error: Error,
        sql: Option<String>,
    ) -> Result<TurnOutcome> {
        let kind = error.kind().to_string();
        let message = error.to_string();
        warn!(kind = %kind, "turn failed: {message}");
        handle.settle(state, EngineState::AwaitingInput);
        self.store.append_message(
            id,
            MessageRole::System,
            &message,
            Some(MessagePayload::Failure {
                error_kind: kind.clone(),
                sql: sql.clone(),
            }),
        )?;
        Ok(TurnOutcome::Failed { kind, message, sql })
    }

    fn record(&self, id: &ConversationId, event: TurnEvent) -> Result<Message> {
        let (role, content, payload) = event.into_message();
        self.store.append_message(id, role, &content, payload)
    }

    // --- handles ---

    fn handle(&self, id: &ConversationId) -> Result<Arc<ConversationHandle>> {
        if let Some(handle) = self.handles.get(id) {
            return Ok(Arc::clone(handle.value()));
        }

        let conversation = self.store.get_conversation(id)?;
        let restored = restore(&self.store.messages(id)?);
        let handle = self.handles.entry(id.clone()).or_insert_with(|| {
            Arc::new(self.new_handle(
                conversation.datastore_id,
                conversation.workspace_id,
                restored,
            ))
        });
        Ok(Arc::clone(handle.value()))
    }

    fn new_handle(
        &self,
        datastore_id: DatastoreId,
        workspace_id: Option<WorkspaceId>,
        restored: Restored,
    ) -> ConversationHandle {
        let (status, _) = watch::channel(restored.phase.clone());
        let (cancel, _) = watch::channel(false);
        ConversationHandle {
            datastore_id,
            workspace_id,
            turn: Mutex::new(ConversationState {
                phase: restored.phase,
                auto: AutoApprovalState::new(
                    self.options.auto_approve,
                    self.options.auto_approve_bound,
                ),
                corrections: restored.corrections,
                intent: restored.intent,
            }),
            status,
            cancel,
        }
    }
}

/// Turn state rebuilt from a conversation's persisted history.
struct Restored {
    phase: EngineState,
    intent: String,
    corrections: CorrectionTracker,
}

impl Default for Restored {
    fn default() -> Self {
        Self {
            phase: EngineState::AwaitingInput,
            intent: String::new(),
            corrections: CorrectionTracker::default(),
        }
    }
}

fn restore(messages: &[Message]) -> Restored {
    let intent = messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map(|m| m.content.trim().to_string())
        .unwrap_or_default();

    // each recorded failure carries the streak length at that point
    let mut corrections = CorrectionTracker::default();
    for payload in messages.iter().filter_map(|m| m.payload.as_ref()) {
        match payload {
            MessagePayload::ExecutionFailure {
                intent, attempt, ..
            } => corrections.restore(intent, *attempt),
            MessagePayload::ExecutionSuccess { intent } => corrections.reset(intent),
            _ => {}
        }
    }

    let phase = match messages.last().and_then(|m| m.payload.as_ref()) {
        Some(MessagePayload::MetadataRequest { request }) => EngineState::AwaitingApproval {
            request: request.clone(),
            origin: TurnOrigin::UserMessage,
        },
        Some(MessagePayload::Sql { sql, .. }) => EngineState::AwaitingExecution {
            sql: sql.clone(),
            intent: intent.clone(),
        },
        _ => EngineState::AwaitingInput,
    };
    Restored {
        phase,
        intent,
        corrections,
    }
}

/// Run an external call under a deadline, retrying once on timeout.
/// Cancelling the conversation abandons the call.
async fn guarded<T, F, Fut>(
    handle: &ConversationHandle,
    label: &str,
    limit: Duration,
    call: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut cancel = handle.cancel.subscribe();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(limit, call()) => outcome,
            _ = cancelled(&mut cancel) => {
                return Err(Error::Cancelled(format!("{label} call abandoned")));
            }
        };
        match outcome {
            Ok(Err(Error::Timeout(reason))) if attempt == 1 => {
                warn!("{label} timed out ({reason}), retrying once");
            }
            Ok(result) => return result,
            Err(_) if attempt == 1 => {
                warn!("{label} gave no answer within {limit:?}, retrying once");
            }
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "{label} gave no answer within {limit:?} after one retry"
                )));
            }
        }
    }
}

fn lock_turn<'a>(
    handle: &'a ConversationHandle,
    id: &ConversationId,
) -> Result<MutexGuard<'a, ConversationState>> {
    handle
        .turn
        .try_lock()
        .map_err(|_| Error::Busy(format!("conversation {id} has a turn in progress")))
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn ensure_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(Error::Validation("message text cannot be empty".into()));
    }
    Ok(())
}

fn no_pending_request(id: &ConversationId) -> Error {
    Error::Busy(format!("conversation {id} has no metadata request awaiting approval"))
}

fn request_text(request: &MetadataRequest) -> String {
    if request.reason.trim().is_empty() {
        format!("Requesting metadata: {}", request.label())
    } else {
        request.reason.clone()
    }
}
