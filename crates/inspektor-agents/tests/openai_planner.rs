use std::sync::Arc;

use chrono::Utc;
use inspektor_agents::{Action, LlmPlanner, LlmProvider, OpenAiProvider, Planner};
use inspektor_common::{
    Confidence, ConversationId, DatastoreId, Message, MessageId, MessageRole, MetadataRequest,
    MetadataSnapshot,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn user_message(text: &str) -> Message {
    Message {
        id: MessageId::new(),
        conversation_id: ConversationId::from_str("conv-1"),
        role: MessageRole::User,
        content: text.to_string(),
        payload: None,
        timestamp: Utc::now(),
    }
}

fn tool_call_body(name: &str, arguments: serde_json::Value) -> serde_json::Value {
    json!({
        "choices": [{
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": name, "arguments": arguments.to_string()}
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "model": "gpt-test",
        "usage": {"prompt_tokens": 120, "completion_tokens": 18}
    })
}

fn planner_for(server: &MockServer) -> LlmPlanner {
    let provider = OpenAiProvider::new("test-key", Some("gpt-test".into()), Some(server.uri()));
    LlmPlanner::new(Arc::new(provider))
}

#[tokio::test]
async fn planner_requests_tables_through_tool_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "gpt-test",
            "tool_choice": "required"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(tool_call_body(
            "get_table_names",
            json!({"reason": "need the table list"}),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let action = planner_for(&server)
        .plan(&[user_message("list tables")], None)
        .await
        .unwrap();

    assert_eq!(
        action,
        Action::NeedsMetadata {
            request: MetadataRequest::tables("need the table list")
        }
    );

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "list tables");
    assert_eq!(body["tools"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn planner_returns_sql_when_metadata_is_cached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tool_call_body(
            "generate_sql",
            json!({
                "sql": "SELECT count(*) FROM users",
                "explanation": "Counts rows in users",
                "confidence": "high"
            }),
        )))
        .mount(&server)
        .await;

    let mut snapshot = MetadataSnapshot::empty(DatastoreId::from_str("db-1"));
    snapshot.tables_fetched = true;
    snapshot.tables.insert("users".into());

    let action = planner_for(&server)
        .plan(&[user_message("how many users?")], Some(&snapshot))
        .await
        .unwrap();

    assert_eq!(
        action,
        Action::Ready {
            sql: "SELECT count(*) FROM users".into(),
            explanation: "Counts rows in users".into(),
            confidence: Confidence::High,
        }
    );

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    let system = body["messages"][0]["content"].as_str().unwrap();
    assert!(system.contains("Tables: users"));
}

#[tokio::test]
async fn provider_failure_becomes_error_action() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;

    let action = planner_for(&server)
        .plan(&[user_message("how many users?")], None)
        .await
        .unwrap();

    match action {
        Action::Error { message } => assert!(message.contains("status=500")),
        other => panic!("expected error action, got {other:?}"),
    }
}

#[tokio::test]
async fn health_check_reports_unreachable_provider() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("bad-key", None, Some(server.uri()));
    assert!(!provider.health_check().await.unwrap());
}
