mod common;

use common::{MockExecutor, ScriptedPlanner, datastore, engine, needs, ready};
use inspektor_common::{Error, MessagePayload, MessageRole, MetadataRequest};
use inspektor_db::{MetadataCache, SessionStore};
use inspektor_engine::{EngineOptions, EngineState, NegotiationEngine, TurnOutcome};
use std::sync::Arc;

const MISSING_RELATION: &str = "relation \"usr\" does not exist";

#[tokio::test]
async fn failure_is_corrected_with_the_right_table() {
    let planner = ScriptedPlanner::new(vec![
        ready("SELECT count(*) FROM usr"),
        ready("SELECT count(*) FROM users"),
    ]);
    let engine = engine(planner.clone(), MockExecutor::new(), EngineOptions::default());

    let (id, first) = engine
        .submit(None, &datastore(), "how many users are there?")
        .await
        .unwrap();
    let TurnOutcome::Ready { sql, .. } = first else {
        panic!("expected ready, got {first:?}");
    };

    let corrected = engine
        .on_execution_failure(&id, &sql, MISSING_RELATION, "how many users are there?")
        .await
        .unwrap();
    match corrected {
        TurnOutcome::Ready { sql, .. } => assert_eq!(sql, "SELECT count(*) FROM users"),
        other => panic!("expected corrected sql, got {other:?}"),
    }

    // the planner saw the raw error and the failing statement
    let history = planner.history(1);
    let failure = history.last().unwrap();
    assert_eq!(failure.role, MessageRole::System);
    match &failure.payload {
        Some(MessagePayload::ExecutionFailure {
            sql,
            error,
            intent,
            attempt,
        }) => {
            assert_eq!(sql, "SELECT count(*) FROM usr");
            assert_eq!(error, MISSING_RELATION);
            assert_eq!(intent, "how many users are there?");
            assert_eq!(*attempt, 1);
        }
        other => panic!("expected execution failure payload, got {other:?}"),
    }
    assert!(failure.content.contains(MISSING_RELATION));
}

#[tokio::test]
async fn third_consecutive_failure_stops_without_planning() {
    let planner = ScriptedPlanner::new(vec![
        ready("SELECT * FROM usr"),
        ready("SELECT * FROM user"),
        ready("SELECT * FROM userz"),
        ready("SELECT * FROM users"),
    ]);
    let engine = engine(planner.clone(), MockExecutor::new(), EngineOptions::default());
    let intent = "show all users";

    let (id, _) = engine.submit(None, &datastore(), intent).await.unwrap();
    let second = engine
        .on_execution_failure(&id, "SELECT * FROM usr", MISSING_RELATION, intent)
        .await
        .unwrap();
    assert!(matches!(second, TurnOutcome::Ready { .. }));
    let third = engine
        .on_execution_failure(&id, "SELECT * FROM user", "syntax error at or near \"user\"", intent)
        .await
        .unwrap();
    assert!(matches!(third, TurnOutcome::Ready { .. }));

    let last_error = "relation \"userz\" does not exist";
    let outcome = engine
        .on_execution_failure(&id, "SELECT * FROM userz", last_error, intent)
        .await
        .unwrap();

    match outcome {
        TurnOutcome::Failed { kind, message, sql } => {
            assert_eq!(kind, "execution");
            assert!(message.contains(last_error));
            assert!(message.contains("SELECT * FROM userz"));
            assert_eq!(sql.as_deref(), Some("SELECT * FROM userz"));
        }
        other => panic!("expected terminal failure, got {other:?}"),
    }
    assert_eq!(planner.calls(), 3);
    assert_eq!(engine.state(&id).unwrap(), EngineState::AwaitingInput);

    let messages = engine.store().messages(&id).unwrap();
    let recorded = messages
        .iter()
        .filter(|m| matches!(m.payload, Some(MessagePayload::ExecutionFailure { .. })))
        .count();
    assert_eq!(recorded, 3);
}

#[tokio::test]
async fn success_resets_the_failure_streak() {
    let planner = ScriptedPlanner::new(vec![
        ready("SELECT * FROM usr"),
        ready("SELECT * FROM users"),
        ready("SELECT * FROM users LIMIT 10"),
    ]);
    let engine = engine(planner, MockExecutor::new(), EngineOptions::default());
    let intent = "show users";

    let (id, _) = engine.submit(None, &datastore(), intent).await.unwrap();
    engine
        .on_execution_failure(&id, "SELECT * FROM usr", MISSING_RELATION, intent)
        .await
        .unwrap();
    engine.on_execution_success(&id, intent).unwrap();
    assert_eq!(engine.state(&id).unwrap(), EngineState::AwaitingInput);

    engine
        .on_execution_failure(&id, "SELECT * FROM users", "statement timeout", intent)
        .await
        .unwrap();

    let messages = engine.store().messages(&id).unwrap();
    let attempts: Vec<u32> = messages
        .iter()
        .filter_map(|m| match &m.payload {
            Some(MessagePayload::ExecutionFailure { attempt, .. }) => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 1]);
}

#[tokio::test]
async fn correction_may_request_metadata() {
    let planner = ScriptedPlanner::new(vec![
        ready("SELECT * FROM usr"),
        needs(MetadataRequest::tables("check the real table names")),
        ready("SELECT * FROM users"),
    ]);
    let executor = MockExecutor::new();
    let engine = engine(planner, executor.clone(), EngineOptions::default());

    let (id, _) = engine
        .submit(None, &datastore(), "show users")
        .await
        .unwrap();
    let outcome = engine
        .on_execution_failure(&id, "SELECT * FROM usr", MISSING_RELATION, "show users")
        .await
        .unwrap();
    assert!(matches!(outcome, TurnOutcome::AwaitingApproval { .. }));
    assert!(matches!(
        engine.state(&id).unwrap(),
        EngineState::AwaitingApproval {
            origin: inspektor_engine::TurnOrigin::Correction,
            ..
        }
    ));

    // failures cannot be reported while a decision is pending
    let busy = engine
        .on_execution_failure(&id, "SELECT 1", "boom", "show users")
        .await;
    assert!(matches!(busy, Err(Error::Busy(_))));

    let outcome = engine.approve(&id).await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Ready { ref sql, .. } if sql == "SELECT * FROM users"));
    assert_eq!(executor.list_tables_calls(), 1);
}

#[tokio::test]
async fn failure_streak_survives_engine_restart() {
    let store = Arc::new(SessionStore::in_memory().unwrap());
    let cache = Arc::new(MetadataCache::in_memory(chrono::Duration::hours(1)).unwrap());
    let intent = "show all users";

    let first_planner = ScriptedPlanner::new(vec![
        ready("SELECT * FROM usr"),
        ready("SELECT * FROM user"),
        ready("SELECT * FROM userz"),
    ]);
    let first = NegotiationEngine::new(
        store.clone(),
        cache.clone(),
        first_planner.clone(),
        MockExecutor::new(),
        EngineOptions::default(),
    );
    let (id, _) = first.submit(None, &datastore(), intent).await.unwrap();
    for sql in ["SELECT * FROM usr", "SELECT * FROM user"] {
        let outcome = first
            .on_execution_failure(&id, sql, MISSING_RELATION, intent)
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Ready { .. }));
    }
    drop(first);

    let second_planner = ScriptedPlanner::new(vec![ready("SELECT * FROM users")]);
    let second = NegotiationEngine::new(
        store,
        cache,
        second_planner.clone(),
        MockExecutor::new(),
        EngineOptions::default(),
    );
    let outcome = second
        .on_execution_failure(&id, "SELECT * FROM userz", MISSING_RELATION, intent)
        .await
        .unwrap();

    match outcome {
        TurnOutcome::Failed { kind, sql, .. } => {
            assert_eq!(kind, "execution");
            assert_eq!(sql.as_deref(), Some("SELECT * FROM userz"));
        }
        other => panic!("expected terminal failure, got {other:?}"),
    }
    assert_eq!(first_planner.calls() + second_planner.calls(), 3);
    assert_eq!(second_planner.calls(), 0);
}

#[tokio::test]
async fn recorded_success_ends_the_streak_after_restart() {
    let store = Arc::new(SessionStore::in_memory().unwrap());
    let cache = Arc::new(MetadataCache::in_memory(chrono::Duration::hours(1)).unwrap());
    let intent = "show users";
    let first = NegotiationEngine::new(
        store.clone(),
        cache.clone(),
        ScriptedPlanner::new(vec![ready("SELECT * FROM usr"), ready("SELECT * FROM users")]),
        MockExecutor::new(),
        EngineOptions::default(),
    );
    let (id, _) = first.submit(None, &datastore(), intent).await.unwrap();
    first
        .on_execution_failure(&id, "SELECT * FROM usr", MISSING_RELATION, intent)
        .await
        .unwrap();
    first.on_execution_success(&id, intent).unwrap();
    drop(first);

    let second = NegotiationEngine::new(
        store,
        cache,
        ScriptedPlanner::new(vec![ready("SELECT * FROM users LIMIT 10")]),
        MockExecutor::new(),
        EngineOptions::default(),
    );
    second
        .on_execution_failure(&id, "SELECT * FROM users", "statement timeout", intent)
        .await
        .unwrap();

    let attempts: Vec<u32> = second
        .store()
        .messages(&id)
        .unwrap()
        .iter()
        .filter_map(|m| match &m.payload {
            Some(MessagePayload::ExecutionFailure { attempt, .. }) => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 1]);
}
