//! Executor scenarios: transitions, async resume, forks and timeouts.

mod common;

use std::time::Duration;

use common::{payload, Harness};
use pipewright_engine::instance::{ExecutionStatus, FailureType};
use pipewright_engine::state::ResponseData;

#[tokio::test]
async fn test_sync_chain_runs_to_success() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: chain
initial_state: A
states:
  - { name: A, type: sync }
  - { name: B, type: sync }
transitions:
  - { from: A, to: B }
"#,
        )
        .await;

    let a = h.only(&exec, "A").await;
    let b = h.only(&exec, "B").await;
    assert_eq!(a.status, ExecutionStatus::Success);
    assert_eq!(b.status, ExecutionStatus::Success);
    assert_eq!(b.prev_instance_id.as_deref(), Some(a.uuid.as_str()));
    assert!(a.start_ts.is_some() && a.end_ts.is_some());
    assert!(!a.has_inspection);
    assert_eq!(h.outcome(&exec).await, Some(ExecutionStatus::Success));
    assert_eq!(h.recorder.events(), vec!["execute:A", "execute:B"]);
}

#[tokio::test]
async fn test_async_success_takes_success_edge() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: async-then
initial_state: A
states:
  - { name: A, type: async, properties: { correlation: x } }
  - { name: B, type: sync }
  - { name: C, type: sync }
transitions:
  - { from: A, to: B, type: SUCCESS }
  - { from: A, to: C, type: FAILURE }
"#,
        )
        .await;

    let waiting = h.only(&exec, "A").await;
    assert_eq!(waiting.status, ExecutionStatus::Waiting);
    assert_eq!(waiting.correlation_ids, vec!["x".to_string()]);
    assert!(waiting.expiry_ts.is_some());
    assert!(h.of(&exec, "B").await.is_empty());

    assert!(h.deliver("x", payload()).await);

    assert_eq!(h.only(&exec, "A").await.status, ExecutionStatus::Success);
    assert_eq!(h.only(&exec, "B").await.status, ExecutionStatus::Success);
    assert!(h.of(&exec, "C").await.is_empty());
    assert_eq!(h.recorder.count("execute", "C"), 0);
}

#[tokio::test]
async fn test_async_error_takes_failure_edge() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: async-fail
initial_state: A
states:
  - { name: A, type: async, properties: { correlation: x } }
  - { name: B, type: sync }
  - { name: C, type: sync }
transitions:
  - { from: A, to: B, type: SUCCESS }
  - { from: A, to: C, type: FAILURE }
"#,
        )
        .await;

    h.deliver("x", ResponseData::error("delegate crashed")).await;

    let a = h.only(&exec, "A").await;
    assert_eq!(a.status, ExecutionStatus::Failed);
    assert_eq!(a.error_message.as_deref(), Some("delegate crashed"));
    assert!(h.of(&exec, "B").await.is_empty());
    assert_eq!(h.only(&exec, "C").await.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_duplicate_delivery_resumes_once() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: dup
initial_state: A
states:
  - { name: A, type: async, properties: { correlation: x } }
"#,
        )
        .await;

    assert!(h.deliver("x", payload()).await);
    assert!(!h.deliver("x", payload()).await);

    let a = h.only(&exec, "A").await;
    assert_eq!(a.status, ExecutionStatus::Success);
    assert_eq!(h.recorder.count("resume", "A"), 1);

    // a direct resume of a finished instance is a no-op
    let resumed = h
        .executor
        .resume(common::APP, &a.uuid, Default::default(), false)
        .await
        .unwrap();
    assert!(!resumed);
    h.executor.wait_idle().await;
    assert_eq!(h.recorder.count("resume", "A"), 1);
    assert_eq!(h.only(&exec, "A").await.version, a.version);
}

#[tokio::test]
async fn test_terminal_statuses_never_change() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: terminal
initial_state: A
states:
  - { name: A, type: sync, properties: { status: FAILED } }
"#,
        )
        .await;

    let failed = h.only(&exec, "A").await;
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert!(failed.end_ts.is_some());

    let resumed = h
        .executor
        .resume(common::APP, &failed.uuid, Default::default(), false)
        .await
        .unwrap();
    assert!(!resumed);
    assert_eq!(h.only(&exec, "A").await, failed);
    assert_eq!(h.outcome(&exec).await, Some(ExecutionStatus::Failed));
}

#[tokio::test]
async fn test_conditional_picks_first_true_guard() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: conditional
initial_state: A
states:
  - { name: A, type: sync, properties: { output: { env: prod } } }
  - { name: B, type: sync }
  - { name: C, type: sync }
  - { name: D, type: sync }
transitions:
  - { from: A, to: B, type: CONDITIONAL, condition: "A.env == 'qa'" }
  - { from: A, to: C, type: CONDITIONAL, condition: "A.env == 'prod'" }
  - { from: A, to: D, type: CONDITIONAL, condition: "true" }
"#,
        )
        .await;

    assert!(h.of(&exec, "B").await.is_empty());
    assert_eq!(h.only(&exec, "C").await.status, ExecutionStatus::Success);
    assert!(h.of(&exec, "D").await.is_empty());
}

#[tokio::test]
async fn test_no_true_guard_ends_branch() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: dead-end
initial_state: A
states:
  - { name: A, type: sync, properties: { output: { env: dev } } }
  - { name: B, type: sync }
transitions:
  - { from: A, to: B, type: CONDITIONAL, condition: "A.env == 'prod'" }
"#,
        )
        .await;

    assert!(h.of(&exec, "B").await.is_empty());
    assert_eq!(h.outcome(&exec).await, Some(ExecutionStatus::Success));
}

#[tokio::test]
async fn test_repeat_takes_precedence_over_success() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: repeat
initial_state: A
states:
  - { name: A, type: sync, properties: { output: { hosts: 3 } } }
  - { name: again, type: sync }
  - { name: next, type: sync }
transitions:
  - { from: A, to: next, type: SUCCESS }
  - { from: A, to: again, type: REPEAT, condition: "A.hosts > 1" }
"#,
        )
        .await;

    let a = h.only(&exec, "A").await;
    let again = h.only(&exec, "again").await;
    assert_eq!(again.status, ExecutionStatus::Success);
    assert_eq!(again.prev_instance_id.as_deref(), Some(a.uuid.as_str()));
    assert!(h.of(&exec, "next").await.is_empty());
}

#[tokio::test]
async fn test_false_repeat_guard_falls_through_to_success() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: repeat-done
initial_state: A
states:
  - { name: A, type: sync, properties: { output: { hosts: 1 } } }
  - { name: again, type: sync }
  - { name: next, type: sync }
transitions:
  - { from: A, to: again, type: REPEAT, condition: "A.hosts > 1" }
  - { from: A, to: next, type: SUCCESS }
"#,
        )
        .await;

    assert!(h.of(&exec, "again").await.is_empty());
    assert_eq!(h.only(&exec, "next").await.status, ExecutionStatus::Success);
    assert_eq!(h.outcome(&exec).await, Some(ExecutionStatus::Success));
}

#[tokio::test]
async fn test_repeat_is_not_taken_after_failure() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: repeat-failed
initial_state: A
states:
  - { name: A, type: sync, properties: { status: FAILED } }
  - { name: again, type: sync }
  - { name: cleanup, type: sync }
transitions:
  - { from: A, to: again, type: REPEAT, condition: "true" }
  - { from: A, to: cleanup, type: FAILURE }
"#,
        )
        .await;

    assert!(h.of(&exec, "again").await.is_empty());
    assert_eq!(h.only(&exec, "cleanup").await.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_nested_fork_aggregates_recursively() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: nested-fork
initial_state: A
states:
  - { name: A, type: sync }
  - { name: B, type: sync }
  - { name: C, type: sync, properties: { status: ERROR } }
  - { name: D, type: sync }
  - { name: E, type: sync, properties: { status: EXPIRED } }
transitions:
  - { from: A, to: B, type: FORK }
  - { from: A, to: C, type: FORK }
  - { from: B, to: D, type: FORK }
  - { from: B, to: E, type: FORK }
"#,
        )
        .await;

    let a = h.only(&exec, "A").await;
    let b = h.only(&exec, "B").await;
    let e = h.only(&exec, "E").await;
    assert_eq!(h.only(&exec, "D").await.status, ExecutionStatus::Success);
    assert_eq!(e.status, ExecutionStatus::Expired);
    assert_eq!(e.parent_instance_id.as_deref(), Some(b.uuid.as_str()));
    // inner join: SUCCESS and EXPIRED
    assert_eq!(b.status, ExecutionStatus::Expired);
    // outer join: EXPIRED and ERROR
    assert_eq!(a.status, ExecutionStatus::Error);
    assert_eq!(h.outcome(&exec).await, Some(ExecutionStatus::Error));
}

#[tokio::test]
async fn test_advisor_skip() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: advised-skip
initial_state: A
states:
  - { name: A, type: advised, properties: { advice: skip } }
  - { name: B, type: sync }
transitions:
  - { from: A, to: B }
"#,
        )
        .await;

    let a = h.only(&exec, "A").await;
    assert_eq!(a.status, ExecutionStatus::Skipped);
    assert_eq!(a.error_message.as_deref(), Some("maintenance window"));
    assert_eq!(h.recorder.count("execute", "A"), 0);
    assert_eq!(h.only(&exec, "B").await.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_advisor_response_replaces_execute() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: advised-respond
initial_state: A
states:
  - { name: A, type: advised, properties: { advice: respond } }
"#,
        )
        .await;

    let a = h.only(&exec, "A").await;
    assert_eq!(a.status, ExecutionStatus::Success);
    assert_eq!(a.state_execution_data.unwrap()["cached"], true);
    assert_eq!(h.recorder.events(), vec!["advice:A"]);
    assert_eq!(h.outcome(&exec).await, Some(ExecutionStatus::Success));
}

#[tokio::test]
async fn test_fork_worst_status_wins() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: fork
initial_state: A
states:
  - { name: A, type: sync }
  - { name: B, type: sync }
  - { name: C, type: sync, properties: { status: FAILED } }
  - { name: D, type: sync }
transitions:
  - { from: A, to: B, type: FORK }
  - { from: A, to: C, type: FORK }
  - { from: A, to: D, type: SUCCESS }
"#,
        )
        .await;

    let a = h.only(&exec, "A").await;
    let b = h.only(&exec, "B").await;
    let c = h.only(&exec, "C").await;
    assert_eq!(b.status, ExecutionStatus::Success);
    assert_eq!(c.status, ExecutionStatus::Failed);
    assert_eq!(a.status, ExecutionStatus::Failed);
    assert!(a.fork_barrier && a.fork_joined);
    assert_eq!(b.parent_instance_id.as_deref(), Some(a.uuid.as_str()));
    assert!(a.end_ts >= b.end_ts && a.end_ts >= c.end_ts);
    assert!(h.of(&exec, "D").await.is_empty());
    assert_eq!(h.outcome(&exec).await, Some(ExecutionStatus::Failed));
}

#[tokio::test]
async fn test_fork_waits_for_every_child() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: fork-wait
initial_state: A
states:
  - { name: A, type: sync }
  - { name: B, type: sync }
  - { name: C, type: async, properties: { correlation: slow } }
  - { name: D, type: sync }
transitions:
  - { from: A, to: B, type: FORK }
  - { from: A, to: C, type: FORK }
  - { from: A, to: D }
"#,
        )
        .await;

    assert_eq!(h.only(&exec, "A").await.status, ExecutionStatus::Waiting);
    assert_eq!(h.only(&exec, "B").await.status, ExecutionStatus::Success);
    assert!(h.of(&exec, "D").await.is_empty());

    h.deliver("slow", payload()).await;

    assert_eq!(h.only(&exec, "A").await.status, ExecutionStatus::Success);
    assert_eq!(h.only(&exec, "D").await.status, ExecutionStatus::Success);
    assert_eq!(h.outcome(&exec).await, Some(ExecutionStatus::Success));
}

#[tokio::test]
async fn test_skip_condition_skips_and_continues() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: skip
initial_state: A
states:
  - { name: A, type: sync, skip_condition: "1 == 1" }
  - { name: B, type: sync }
transitions:
  - { from: A, to: B }
"#,
        )
        .await;

    let a = h.only(&exec, "A").await;
    assert_eq!(a.status, ExecutionStatus::Skipped);
    assert_eq!(a.error_message.as_deref(), Some("Skip condition: 1 == 1"));
    assert_eq!(h.recorder.count("execute", "A"), 0);
    assert_eq!(h.only(&exec, "B").await.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_bad_skip_condition_is_an_error() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: bad-skip
initial_state: A
states:
  - { name: A, type: sync, skip_condition: "nothing.here" }
"#,
        )
        .await;

    let a = h.only(&exec, "A").await;
    assert_eq!(a.status, ExecutionStatus::Error);
    assert!(a.error_message.is_some());
    assert_eq!(h.recorder.count("execute", "A"), 0);
}

#[tokio::test]
async fn test_upstream_output_visible_to_later_state() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: upstream
initial_state: build-app
states:
  - { name: build-app, type: sync, properties: { output: { version: "1.4.2" } } }
  - { name: show, type: render, properties: { expression: "v=${build__app.version}" } }
transitions:
  - { from: build-app, to: show }
"#,
        )
        .await;

    let show = h.only(&exec, "show").await;
    assert!(show.has_inspection);
    assert!(h.only(&exec, "build-app").await.has_inspection);
    assert_eq!(show.state_execution_data.unwrap()["plain"], "v=1.4.2");
}

#[tokio::test(start_paused = true)]
async fn test_wait_timeout_expires_instance() {
    let h = Harness::new();
    let exec = h
        .run(
            r#"
name: timeout
initial_state: A
states:
  - { name: A, type: async, timeout_millis: 1000, properties: { correlation: never } }
"#,
        )
        .await;

    assert_eq!(h.only(&exec, "A").await.status, ExecutionStatus::Waiting);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    h.executor.wait_idle().await;

    let a = h.only(&exec, "A").await;
    assert_eq!(a.status, ExecutionStatus::Expired);
    assert!(a.failure_types.contains(&FailureType::Expired));
    assert_eq!(h.outcome(&exec).await, Some(ExecutionStatus::Expired));
}
