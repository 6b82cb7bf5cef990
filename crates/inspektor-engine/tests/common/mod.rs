#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use inspektor_agents::{Action, Planner};
use inspektor_common::{
    ColumnSchema, Confidence, ConversationId, DatastoreId, Error, Message, MetadataRequest,
    MetadataSnapshot, Relationship, Result, WorkspaceContext,
};
use inspektor_db::{MetadataCache, SessionStore};
use inspektor_engine::{EngineOptions, EngineState, Executor, NegotiationEngine, QueryResult};

/// Planner that replays a fixed list of actions, optionally after a delay.
#[derive(Default)]
pub struct ScriptedPlanner {
    script: Mutex<VecDeque<(Duration, Action)>>,
    calls: AtomicUsize,
    histories: Mutex<Vec<Vec<Message>>>,
    workspaces: Mutex<Vec<Option<WorkspaceContext>>>,
}

impl ScriptedPlanner {
    pub fn new(actions: Vec<Action>) -> Arc<Self> {
        Self::delayed(actions.into_iter().map(|a| (Duration::ZERO, a)).collect())
    }

    pub fn delayed(steps: Vec<(Duration, Action)>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn history(&self, call: usize) -> Vec<Message> {
        self.histories.lock().unwrap()[call].clone()
    }

    pub fn workspace(&self, call: usize) -> Option<WorkspaceContext> {
        self.workspaces.lock().unwrap()[call].clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(
        &self,
        history: &[Message],
        _snapshot: Option<&MetadataSnapshot>,
    ) -> Result<Action> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.histories.lock().unwrap().push(history.to_vec());
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some((delay, action)) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(action)
            }
            None => Ok(Action::Error {
                message: "planner script exhausted".into(),
            }),
        }
    }

    async fn plan_with_context(
        &self,
        history: &[Message],
        snapshot: Option<&MetadataSnapshot>,
        workspace: Option<&WorkspaceContext>,
    ) -> Result<Action> {
        self.workspaces.lock().unwrap().push(workspace.cloned());
        self.plan(history, snapshot).await
    }
}

/// Executor over a fixed two-table schema that counts its calls.
pub struct MockExecutor {
    pub tables: Vec<String>,
    pub fail_metadata: Option<String>,
    /// Only describe tables from `tables`, like a real database would.
    pub known_tables_only: bool,
    pub list_tables_calls: AtomicUsize,
    pub schema_calls: AtomicUsize,
    pub relationship_calls: AtomicUsize,
}

impl MockExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_failure(None))
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self::with_failure(Some(message.to_string())))
    }

    pub fn strict() -> Arc<Self> {
        Arc::new(Self {
            known_tables_only: true,
            ..Self::with_failure(None)
        })
    }

    fn with_failure(fail_metadata: Option<String>) -> Self {
        Self {
            tables: vec!["users".into(), "orders".into()],
            fail_metadata,
            known_tables_only: false,
            list_tables_calls: AtomicUsize::new(0),
            schema_calls: AtomicUsize::new(0),
            relationship_calls: AtomicUsize::new(0),
        }
    }

    pub fn list_tables_calls(&self) -> usize {
        self.list_tables_calls.load(Ordering::SeqCst)
    }

    pub fn schema_calls(&self) -> usize {
        self.schema_calls.load(Ordering::SeqCst)
    }

    pub fn relationship_calls(&self) -> usize {
        self.relationship_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        match &self.fail_metadata {
            Some(message) => Err(Error::Execution(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn list_tables(&self, _datastore: &DatastoreId) -> Result<Vec<String>> {
        self.list_tables_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.tables.clone())
    }

    async fn get_schema(
        &self,
        _datastore: &DatastoreId,
        tables: &[String],
    ) -> Result<BTreeMap<String, Vec<ColumnSchema>>> {
        self.schema_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let wanted: Vec<&String> = if tables.is_empty() {
            self.tables.iter().collect()
        } else {
            tables
                .iter()
                .filter(|t| !self.known_tables_only || self.tables.contains(t))
                .collect()
        };
        Ok(wanted
            .into_iter()
            .map(|t| {
                (
                    t.clone(),
                    vec![ColumnSchema {
                        name: "id".into(),
                        data_type: "integer".into(),
                        nullable: false,
                        is_primary_key: true,
                    }],
                )
            })
            .collect())
    }

    async fn get_relationships(&self, _datastore: &DatastoreId) -> Result<Vec<Relationship>> {
        self.relationship_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(vec![Relationship {
            from_table: "orders".into(),
            from_column: "user_id".into(),
            to_table: "users".into(),
            to_column: "id".into(),
            kind: Some("foreign_key".into()),
        }])
    }

    async fn execute_read_only_sql(
        &self,
        _datastore: &DatastoreId,
        sql: &str,
    ) -> Result<QueryResult> {
        Err(Error::Execution(format!("not executed in tests: {sql}")))
    }
}

pub fn engine(
    planner: Arc<ScriptedPlanner>,
    executor: Arc<MockExecutor>,
    options: EngineOptions,
) -> Arc<NegotiationEngine> {
    engine_with_ttl(planner, executor, options, chrono::Duration::hours(24))
}

pub fn engine_with_ttl(
    planner: Arc<ScriptedPlanner>,
    executor: Arc<MockExecutor>,
    options: EngineOptions,
    ttl: chrono::Duration,
) -> Arc<NegotiationEngine> {
    let store = Arc::new(SessionStore::in_memory().unwrap());
    let cache = Arc::new(MetadataCache::in_memory(ttl).unwrap());
    Arc::new(NegotiationEngine::new(
        store, cache, planner, executor, options,
    ))
}

pub fn auto(bound: u32) -> EngineOptions {
    EngineOptions {
        auto_approve: true,
        auto_approve_bound: bound,
        ..EngineOptions::default()
    }
}

pub fn ready(sql: &str) -> Action {
    Action::Ready {
        sql: sql.to_string(),
        explanation: format!("runs {sql}"),
        confidence: Confidence::High,
    }
}

pub fn needs(request: MetadataRequest) -> Action {
    Action::NeedsMetadata { request }
}

pub fn datastore() -> DatastoreId {
    DatastoreId::from_str("warehouse")
}

/// Non-empty user messages must match terminal outcome messages one to one.
pub fn assert_turns_balanced(engine: &NegotiationEngine, id: &ConversationId) {
    let messages = engine.store().messages(id).unwrap();
    let users = messages
        .iter()
        .filter(|m| m.role == inspektor_common::MessageRole::User)
        .count();
    let terminal = messages.iter().filter(|m| m.is_terminal()).count();
    assert_eq!(users, terminal, "unbalanced conversation: {messages:#?}");
}

pub async fn wait_for_state(
    engine: &NegotiationEngine,
    id: &ConversationId,
    wanted: fn(&EngineState) -> bool,
) {
    for _ in 0..200 {
        if wanted(&engine.state(id).unwrap()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("conversation never reached the expected state");
}
