//! Orchestrator integration tests
//!
//! Drives the full engine against the scripted in-memory service: thread
//! setup, tool-call rounds, busy threads, expiry, the content relay and
//! agent-to-agent handoff.

use agentrelay::core::config::BusyPolicy;
use agentrelay::core::{
    CallErrorKind, DispatchMode, MessageOrder, RunState, ThreadStatus, ToolCallRequest, ToolOutput,
};
use agentrelay::tools::FnRegistrar;
use agentrelay::{
    CompletionService, Config, FunctionRegistry, Orchestrator, RelayError, ScriptStep,
    ScriptedService,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> Config {
    let mut config = Config::default();
    config.run.poll_interval_ms = 5;
    config.run.max_poll_interval_ms = 20;
    config.run.retry_backoff_ms = 5;
    config.run.run_timeout_secs = 30;
    config
}

fn echo_registrar() -> FnRegistrar<impl Fn(&mut FunctionRegistry) -> agentrelay::Result<()>> {
    FnRegistrar::new("demo", |registry: &mut FunctionRegistry| {
        registry.register_fn("echo", |_ctx, args: Value| async move {
            Ok::<_, anyhow::Error>(args.get("text").cloned().unwrap_or(Value::Null))
        })
    })
}

async fn engine(config: Config, service: Arc<ScriptedService>) -> Orchestrator {
    Orchestrator::builder(config)
        .service(service)
        .registrar(echo_registrar())
        .build()
        .await
        .unwrap()
}

async fn wait_for_runs(service: &ScriptedService, count: usize) {
    while service.runs_created() < count {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn test_echo_round_trip() {
    let service = Arc::new(ScriptedService::new().with_script(
        "A1",
        [
            ScriptStep::InProgress,
            ScriptStep::RequiresAction(vec![ToolCallRequest::new(
                "call_1",
                "echo",
                json!({"text": "hi"}),
            )]),
            ScriptStep::ReplyWithOutputs,
        ],
    ));
    let orch = engine(fast_config(), service.clone()).await;

    let thread_id = orch.thread_initialization("A1").await.unwrap();
    let outcome = orch
        .create_and_monitor_run("A1", &thread_id, Some("hello"))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.final_status, RunState::Completed);
    assert_eq!(outcome.output_text, "hi");
    assert_eq!(outcome.tool_rounds, 1);

    let submitted = service.submissions(&outcome.run_id);
    assert_eq!(
        submitted,
        vec![vec![ToolOutput {
            tool_call_id: "call_1".into(),
            output: "hi".into(),
        }]]
    );

    let messages = orch
        .retrieve_messages(&thread_id, MessageOrder::Asc, 10)
        .await
        .unwrap();
    let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["hello", "hi"]);

    let (_, status) = orch.check_for_thread_and_status("A1");
    assert_eq!(status, Some(ThreadStatus::Initialized));
}

#[tokio::test]
async fn test_thread_initialization_idempotent() {
    let service = Arc::new(ScriptedService::new());
    let orch = engine(fast_config(), service.clone()).await;

    let first = orch.thread_initialization("A1").await.unwrap();
    let second = orch.thread_initialization("A1").await.unwrap();
    let other = orch.thread_initialization("A2").await.unwrap();

    assert_eq!(first, second);
    assert_ne!(first, other);
    assert_eq!(service.threads_created(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_busy_thread_rejected_and_hung_run_expires() {
    let service = Arc::new(
        ScriptedService::new()
            .with_script("A1", [ScriptStep::Queued, ScriptStep::Hang])
            .with_script("A1", [ScriptStep::Reply("never".into())]),
    );
    let orch = engine(fast_config(), service.clone()).await;
    let thread_id = orch.thread_initialization("A1").await.unwrap();

    let first = tokio::spawn({
        let orch = orch.clone();
        let thread_id = thread_id.clone();
        async move {
            orch.create_and_monitor_run("A1", &thread_id, Some("first"))
                .await
        }
    });
    wait_for_runs(&service, 1).await;

    let (_, status) = orch.check_for_thread_and_status("A1");
    assert_eq!(status, Some(ThreadStatus::Active));

    let second = orch
        .create_and_monitor_run("A1", &thread_id, Some("second"))
        .await;
    assert!(matches!(second, Err(RelayError::ThreadBusy { .. })));
    assert_eq!(service.runs_created(), 1);
    assert_eq!(service.messages(&thread_id).len(), 1);

    let outcome = first.await.unwrap().unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.final_status, RunState::Expired);
    assert!(service.cancel_requested(&outcome.run_id));
}

#[tokio::test(start_paused = true)]
async fn test_wait_policy_serializes_runs() {
    let service = Arc::new(
        ScriptedService::new()
            .with_script(
                "A1",
                [
                    ScriptStep::InProgress,
                    ScriptStep::InProgress,
                    ScriptStep::Reply("one".into()),
                ],
            )
            .with_script("A1", [ScriptStep::Reply("two".into())]),
    );
    let mut config = fast_config();
    config.run.busy_policy = BusyPolicy::Wait;
    let orch = engine(config, service.clone()).await;
    let thread_id = orch.thread_initialization("A1").await.unwrap();

    let first = tokio::spawn({
        let orch = orch.clone();
        let thread_id = thread_id.clone();
        async move { orch.create_and_monitor_run("A1", &thread_id, Some("q1")).await }
    });
    wait_for_runs(&service, 1).await;

    let second = orch
        .create_and_monitor_run("A1", &thread_id, Some("q2"))
        .await
        .unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(first.output_text, "one");
    assert_eq!(second.output_text, "two");
    assert_eq!(service.runs_created(), 2);

    let contents: Vec<_> = service
        .messages(&thread_id)
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, ["q1", "one", "q2", "two"]);
}

#[tokio::test]
async fn test_polling_gives_up_on_permanent_error() {
    let service = Arc::new(ScriptedService::new().with_script(
        "A1",
        [ScriptStep::InProgress, ScriptStep::ServiceError(404)],
    ));
    let orch = engine(fast_config(), service).await;
    let thread_id = orch.thread_initialization("A1").await.unwrap();

    let err = orch
        .create_and_monitor_run("A1", &thread_id, Some("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::RunPollingFailed { .. }));

    let (_, status) = orch.check_for_thread_and_status("A1");
    assert_eq!(status, Some(ThreadStatus::Initialized));

    let outcome = orch
        .continue_conversation_with_assistant("A1", "again")
        .await;
    assert!(outcome.success, "{}", outcome.message);
}

#[tokio::test]
async fn test_content_relay_properties() {
    let orch = engine(fast_config(), Arc::new(ScriptedService::new())).await;

    assert!(orch.load_processed_content("A", "B", false).is_empty());

    assert!(orch.save_processed_content("A", "B", "X").await);
    assert_eq!(orch.load_processed_content("A", "B", false), vec!["X"]);

    assert!(orch.save_processed_content("A", "B", "Y").await);
    assert_eq!(orch.load_processed_content("A", "B", false), vec!["Y"]);

    assert!(orch.save_processed_content("A", "C", "Z").await);
    assert_eq!(orch.load_processed_content("A", "ignored", true), vec!["Y", "Z"]);

    assert!(!orch.save_processed_content("", "B", "nope").await);
}

#[tokio::test]
async fn test_dispatch_modes_agree() {
    let orch = engine(fast_config(), Arc::new(ScriptedService::new())).await;
    let requests = vec![
        ToolCallRequest::new("c1", "echo", json!({"text": "a"})),
        ToolCallRequest::new("c2", "no_such_function", json!({})),
        ToolCallRequest::new("c3", "echo", json!({"text": "c"})),
    ];

    let parallel = orch.parallel_tool_calls(&requests).await;
    let sequential = orch.dispatch(&requests, DispatchMode::Sequential).await;

    assert_eq!(parallel, sequential);
    assert_eq!(parallel.len(), 3);
    assert_eq!(parallel[0].output, Some(json!("a")));
    assert_eq!(parallel[1].error_kind(), Some(CallErrorKind::UnknownFunction));
    assert_eq!(parallel[2].output, Some(json!("c")));
}

#[tokio::test]
async fn test_unknown_function_inside_run() {
    let service = Arc::new(ScriptedService::new().with_script(
        "A1",
        [
            ScriptStep::RequiresAction(vec![ToolCallRequest::new("c1", "missing", json!({}))]),
            ScriptStep::Reply("recovered".into()),
        ],
    ));
    let orch = engine(fast_config(), service.clone()).await;
    let thread_id = orch.thread_initialization("A1").await.unwrap();

    let outcome = orch
        .create_and_monitor_run("A1", &thread_id, Some("go"))
        .await
        .unwrap();
    assert!(outcome.success);

    let submitted = service.submissions(&outcome.run_id);
    let payload: Value = serde_json::from_str(&submitted[0][0].output).unwrap();
    assert_eq!(payload["error"]["kind"], "unknown_function");
}

#[tokio::test]
async fn test_handoff_between_agents() {
    let service = Arc::new(
        ScriptedService::new()
            .with_script(
                "coordinator",
                [
                    ScriptStep::RequiresAction(vec![ToolCallRequest::new(
                        "call_h",
                        "handoff_to_assistant",
                        json!({
                            "assistant_id": "researcher",
                            "next_assistant_id": "writer",
                            "user_content": "find facts"
                        }),
                    )]),
                    ScriptStep::Reply("handed off".into()),
                ],
            )
            .with_script("researcher", [ScriptStep::Reply("facts: 42".into())])
            .with_script(
                "writer",
                [
                    ScriptStep::RequiresAction(vec![ToolCallRequest::new(
                        "call_l",
                        "load_processed_content",
                        json!({"from_assistant_id": "researcher", "to_assistant_id": "writer"}),
                    )]),
                    ScriptStep::ReplyWithOutputs,
                ],
            ),
    );
    let orch = engine(fast_config(), service.clone()).await;

    let coordinator = orch
        .continue_conversation_with_assistant("coordinator", "plan the article")
        .await;
    assert!(coordinator.success, "{}", coordinator.message);
    assert_eq!(coordinator.content, "handed off");

    assert_eq!(
        orch.load_processed_content("researcher", "writer", false),
        vec!["facts: 42"]
    );

    let handoff_run = &service.runs()[0];
    let handoff_output: Value =
        serde_json::from_str(&service.submissions(&handoff_run.run_id)[0][0].output).unwrap();
    assert_eq!(handoff_output["success"], true);
    assert_eq!(handoff_output["content"], "facts: 42");

    let writer = orch
        .continue_conversation_with_assistant("writer", "write it up")
        .await;
    assert!(writer.success);
    assert_eq!(writer.content, r#"["facts: 42"]"#);

    assert!(orch.check_for_thread_and_status("researcher").0.is_some());
}

#[tokio::test]
async fn test_communicate_with_assistant_builtin() {
    let service = Arc::new(
        ScriptedService::new().with_script("helper", [ScriptStep::Reply("sure".into())]),
    );
    let orch = engine(fast_config(), service).await;

    let result = orch
        .execute_task(
            "communicate_with_assistant",
            json!({"assistant_id": "helper", "user_content": "can you help?"}),
        )
        .await;
    assert!(result.is_success());
    assert_eq!(result.output.unwrap()["content"], "sure");

    let init = orch
        .execute_task("initialize_agent", json!({"assistant_id": "helper"}))
        .await;
    assert!(init.output.unwrap().as_str().unwrap().contains("already initialized"));
}

#[tokio::test]
async fn test_failing_registrar_aborts_startup() {
    let broken = FnRegistrar::new("broken", |_registry: &mut FunctionRegistry| {
        Err(RelayError::Other("cannot reach catalog".into()))
    });

    let result = Orchestrator::builder(fast_config())
        .service(Arc::new(ScriptedService::new()))
        .registrar(broken)
        .build()
        .await;
    assert!(matches!(result, Err(RelayError::Registration { .. })));
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.storage.data_dir = Some(dir.path().to_path_buf());
    let service = Arc::new(ScriptedService::new());

    let thread_id = {
        let orch = engine(config.clone(), service.clone()).await;
        assert!(orch.save_processed_content("A", "B", "kept").await);
        orch.thread_initialization("A1").await.unwrap()
    };

    let orch = engine(config, service.clone()).await;
    assert_eq!(
        orch.check_for_thread_and_status("A1"),
        (Some(thread_id.clone()), Some(ThreadStatus::Initialized))
    );
    assert_eq!(orch.thread_initialization("A1").await.unwrap(), thread_id);
    assert_eq!(orch.load_processed_content("A", "B", false), vec!["kept"]);
    assert_eq!(service.threads_created(), 1);
}

#[tokio::test]
async fn test_unsaved_handoff_is_not_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.storage.data_dir = Some(dir.path().to_path_buf());
    let orch = engine(config.clone(), Arc::new(ScriptedService::new())).await;

    let blocker = dir.path().join("relay.json.tmp");
    std::fs::create_dir(&blocker).unwrap();
    assert!(!orch.save_processed_content("A", "B", "X").await);
    assert!(orch.load_processed_content("A", "B", false).is_empty());

    std::fs::remove_dir(&blocker).unwrap();
    assert!(orch.save_processed_content("A", "B", "Y").await);

    let restarted = engine(config, Arc::new(ScriptedService::new())).await;
    assert_eq!(restarted.load_processed_content("A", "B", false), vec!["Y"]);
}

#[tokio::test]
async fn test_retrieve_messages_dynamically() {
    let mut config = fast_config();
    config.run.message_page_size = 2;
    let service = Arc::new(ScriptedService::new());
    let orch = engine(config, service.clone()).await;
    let thread_id = orch.thread_initialization("A1").await.unwrap();

    let mut ids = Vec::new();
    for text in ["a", "b", "c", "d", "e"] {
        ids.push(service.append_message(&thread_id, "user", text).await.unwrap());
    }

    let all = orch
        .retrieve_messages_dynamically(&thread_id, None)
        .await
        .unwrap();
    assert_eq!(all.len(), 5);

    let rest = orch
        .retrieve_messages_dynamically(&thread_id, Some(&ids[1]))
        .await
        .unwrap();
    let contents: Vec<_> = rest.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["c", "d", "e"]);

    let newest = orch
        .retrieve_messages(&thread_id, MessageOrder::Desc, 1)
        .await
        .unwrap();
    assert_eq!(newest[0].content, "e");
}
