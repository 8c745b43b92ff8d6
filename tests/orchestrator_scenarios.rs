//! 编排器端到端场景（脚本化 Adapter，不依赖外部进程）

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use hive::adapter::{AgentEvent, ExecutionResult, ScriptedAdapter};
use hive::config::AppConfig;
use hive::core::{OrchestratorError, TaskStatus};
use hive::hitl::{ApprovalDecision, ApprovalType, HitlEvent, HitlPolicy};
use hive::providers::{AccessMode, ProviderConfig, SubscriptionLimits};
use hive::stream::{TaskEvent, TaskEventKind};
use hive::{Orchestrator, OrchestratorBuilder, TaskDefinition};
use serde_json::json;

fn demo_provider() -> ProviderConfig {
    ProviderConfig::new("demo").with_access_mode(AccessMode::subscription(1, SubscriptionLimits::per_day(500)))
}

fn build(max_concurrency: usize, adapter: Arc<ScriptedAdapter>) -> Orchestrator {
    let mut config = AppConfig::default();
    config.orchestrator.max_concurrency = max_concurrency;
    config.failover.retry_delay_ms = 5;
    OrchestratorBuilder::new(config)
        .with_provider(demo_provider())
        .with_adapter(adapter)
        .build()
        .unwrap()
}

fn task(prompt: &str) -> TaskDefinition {
    TaskDefinition::new(prompt, "demo", "/tmp/demo").with_hitl_policy(HitlPolicy::Autonomous)
}

async fn collect(events: hive::stream::TaskEventStream) -> Vec<TaskEvent> {
    tokio::time::timeout(Duration::from_secs(5), events.collect::<Vec<_>>())
        .await
        .unwrap()
}

#[tokio::test]
async fn demo_task_runs_to_completion() {
    let adapter = Arc::new(ScriptedAdapter::demo("demo", "all tests pass"));
    let orchestrator = build(2, adapter.clone());

    let handle = orchestrator.submit(task("run the tests")).await.unwrap();
    let events = collect(handle.subscribe()).await;
    let names: Vec<_> = events.iter().map(|e| e.kind.name()).collect();
    assert_eq!(names, vec!["queued", "started", "started", "output", "completed"]);
    match &events[1].kind {
        TaskEventKind::Started {
            provider_id, session_id, ..
        } => {
            assert_eq!(provider_id.as_deref(), Some("demo"));
            assert!(session_id.is_none());
        }
        other => panic!("unexpected event {other:?}"),
    }
    // 会话建立后补发带 session id 的 started
    assert!(matches!(&events[2].kind, TaskEventKind::Started { session_id: Some(_), .. }));

    let state = handle.get_status().await.unwrap();
    assert_eq!(state.status, TaskStatus::Completed);
    assert_eq!(state.result.unwrap().output, "all tests pass");

    let progress = orchestrator.stream().get_status(handle.task_id()).unwrap();
    assert_eq!(progress.progress, 100);
    assert_eq!(progress.output, "all tests pass");
    assert_eq!(adapter.execution_count(), 1);

    // 用量已回写到订阅额度
    let usage = orchestrator
        .router()
        .rate_limits()
        .get_status("demo", hive::providers::AccessModeKind::Subscription);
    assert_eq!(usage.remaining_requests, Some(499));
}

#[tokio::test]
async fn rejected_tool_use_fails_the_task() {
    let adapter = Arc::new(ScriptedAdapter::new(
        "demo",
        vec![
            AgentEvent::Start {
                session_id: "s1".into(),
            },
            AgentEvent::ToolUse {
                tool_name: "bash".into(),
                tool_input: json!({"command": "rm -rf target"}),
            },
            AgentEvent::Output {
                content: "should never be forwarded".into(),
                is_partial: false,
            },
            AgentEvent::Complete {
                result: ExecutionResult {
                    success: true,
                    output: "done".into(),
                    session_id: Some("s1".into()),
                    duration_ms: 10,
                    tokens_used: None,
                },
            },
        ],
    ));
    let orchestrator = build(1, adapter.clone());
    let mut approvals = orchestrator.hitl().subscribe();

    let handle = orchestrator
        .submit(task("clean the build").with_hitl_policy(HitlPolicy::ApproveSteps))
        .await
        .unwrap();
    let events = handle.subscribe();

    let request = loop {
        if let HitlEvent::ApprovalRequested { request } = approvals.recv().await.unwrap() {
            break request;
        }
    };
    assert_eq!(request.approval_type, ApprovalType::CommandExecution);
    assert_eq!(request.task_id, handle.task_id());
    orchestrator
        .hitl()
        .submit_decision(&request.id, ApprovalDecision::reject("too destructive"))
        .unwrap();

    let events = collect(events).await;
    assert!(events
        .iter()
        .all(|e| !matches!(&e.kind, TaskEventKind::Output { .. })));
    assert!(matches!(events.last().map(|e| &e.kind), Some(TaskEventKind::Failed { .. })));

    let state = handle.get_status().await.unwrap();
    assert_eq!(state.status, TaskStatus::Failed);
    assert!(state.error.unwrap().contains("rejected"));
    assert_eq!(adapter.interrupt_count(), 1);
}

#[tokio::test]
async fn late_subscribers_share_the_buffered_replay() {
    let orchestrator = build(1, Arc::new(ScriptedAdapter::demo("demo", "unused")));
    let stream = orchestrator.stream();
    stream.emit(TaskEvent::new("t5", TaskEventKind::Queued { position: 0 }));
    stream.emit(TaskEvent::new(
        "t5",
        TaskEventKind::Started {
            provider_id: Some("demo".into()),
            access_mode: None,
            session_id: None,
        },
    ));
    stream.emit(TaskEvent::new(
        "t5",
        TaskEventKind::Progress {
            progress: 40,
            message: None,
        },
    ));

    let mut subscribers: Vec<_> = (0..3).map(|_| stream.subscribe("t5")).collect();
    for sub in subscribers.iter_mut() {
        let mut names = Vec::new();
        for _ in 0..3 {
            names.push(sub.next().await.unwrap().kind.name());
        }
        assert_eq!(names, vec!["queued", "started", "progress"]);
    }
}

#[tokio::test]
async fn cancelling_a_queued_task_never_invokes_the_adapter() {
    let adapter = Arc::new(ScriptedAdapter::demo("demo", "done"));
    let orchestrator = build(1, adapter.clone());

    let handle = orchestrator.submit(task("never runs")).await.unwrap();
    let cancelled = handle.cancel().await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    let events = collect(handle.subscribe()).await;
    assert!(matches!(events.last().map(|e| &e.kind), Some(TaskEventKind::Cancelled { .. })));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(adapter.execution_count(), 0);
    assert_eq!(handle.get_status().await.unwrap().status, TaskStatus::Cancelled);

    // 再次取消保持终态不变
    assert_eq!(handle.cancel().await.unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn cancelling_a_running_task_interrupts_the_adapter() {
    let adapter = Arc::new(ScriptedAdapter::demo("demo", "slow").with_step_delay(Duration::from_millis(50)));
    let orchestrator = build(1, adapter.clone());

    let handle = orchestrator.submit(task("long job")).await.unwrap();
    for _ in 0..100 {
        if handle.get_status().await.unwrap().status == TaskStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    handle.cancel().await.unwrap();

    let state = handle.wait().await.unwrap();
    assert_eq!(state.status, TaskStatus::Cancelled);
    assert_eq!(adapter.interrupt_count(), 1);

    // 执行器退出后槽位释放
    for _ in 0..100 {
        if orchestrator.queue().running_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(orchestrator.queue().running_count(), 0);
}

#[tokio::test]
async fn unknown_task_operations_are_not_found() {
    let orchestrator = build(1, Arc::new(ScriptedAdapter::demo("demo", "x")));
    assert!(matches!(
        orchestrator.status("task_missing").await,
        Err(OrchestratorError::NotFound { .. })
    ));
    assert!(matches!(
        orchestrator.pause("task_missing").await,
        Err(OrchestratorError::NotFound { .. })
    ));
    assert!(matches!(
        orchestrator.resume("task_missing").await,
        Err(OrchestratorError::NotFound { .. })
    ));
    assert!(matches!(
        orchestrator.checkpoint("task_missing").await,
        Err(OrchestratorError::NotFound { .. })
    ));
}

#[tokio::test]
async fn approval_timeout_fails_the_task() {
    let adapter = Arc::new(ScriptedAdapter::new(
        "demo",
        vec![AgentEvent::ToolUse {
            tool_name: "write_file".into(),
            tool_input: json!({"path": "README.md"}),
        }],
    ));
    let mut config = AppConfig::default();
    config.hitl.default_timeout_ms = 30;
    let orchestrator = OrchestratorBuilder::new(config)
        .with_provider(demo_provider())
        .with_adapter(adapter)
        .build()
        .unwrap();

    let handle = orchestrator
        .submit(task("edit docs").with_hitl_policy(HitlPolicy::ReviewEdits))
        .await
        .unwrap();
    let state = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, TaskStatus::Failed);
    assert!(state.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn session_input_is_passed_as_guidance() {
    let orchestrator = build(1, Arc::new(ScriptedAdapter::demo("demo", "ok")));
    let handle = orchestrator
        .submit_with_id("task_guided", task("follow guidance"))
        .await
        .unwrap();
    orchestrator.hitl().provide_input("task_guided", "prefer small commits");
    assert_eq!(handle.wait().await.unwrap().status, TaskStatus::Completed);
    assert_eq!(orchestrator.hitl().get_session_inputs("task_guided").len(), 1);

    // 同 id 的任务结束后可以再次提交
    let again = orchestrator
        .submit_with_id("task_guided", task("second round"))
        .await
        .unwrap();
    assert_eq!(again.wait().await.unwrap().status, TaskStatus::Completed);
}
