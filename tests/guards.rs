// tests/guards.rs

//! Guard rails before a task body runs: preconditions, required variables,
//! internal tasks and prompts.

mod common;

use common::{executor_in, run_target, run_target_with_vars, write_taskfile};
use taskdag::errors::TaskError;

#[tokio::test]
async fn failing_precondition_aborts_with_its_message() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\ntasks:\n  impossible:\n    preconditions:\n      - sh: '[ 1 = 0 ]'\n        msg: \"1 != 0 obviously!\"\n    cmds:\n      - echo never >> log.txt\n",
    );

    let (executor, capture) = executor_in(tmp.path(), |_| {}).await;
    let err = run_target(&executor, "impossible").await.unwrap_err();

    assert!(matches!(err, TaskError::PreconditionFailed { .. }));
    assert!(capture.contents().contains("1 != 0 obviously!"));
    assert!(!tmp.path().join("log.txt").exists());
}

#[tokio::test]
async fn passing_preconditions_are_quiet() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\ntasks:\n  possible:\n    preconditions:\n      - '[ 1 = 1 ]'\n    cmds:\n      - echo fine\n",
    );

    let (executor, capture) = executor_in(tmp.path(), |_| {}).await;
    run_target(&executor, "possible").await.unwrap();
    assert!(!capture.contents().contains("failed"));
}

#[tokio::test]
async fn dep_precondition_failure_aborts_the_caller() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\ntasks:\n  impossible:\n    preconditions:\n      - sh: '[ 1 = 0 ]'\n        msg: \"1 != 0 obviously!\"\n    cmds:\n      - echo never\n  depends_on_impossible:\n    deps: [impossible]\n    cmds:\n      - echo never >> log.txt\n",
    );

    let (executor, capture) = executor_in(tmp.path(), |_| {}).await;
    let err = run_target(&executor, "depends_on_impossible")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TaskError::PreconditionFailed { .. } | TaskError::Upstream(_)
    ));
    assert!(capture.contents().contains("1 != 0 obviously!"));
    assert!(!tmp.path().join("log.txt").exists());
}

#[tokio::test]
async fn missing_required_var_is_reported_by_name() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\ntasks:\n  t:\n    requires:\n      vars: [FOO]\n    cmds:\n      - echo ${FOO} >> log.txt\n",
    );

    let (executor, _) = executor_in(tmp.path(), |_| {}).await;
    let err = run_target(&executor, "t").await.unwrap_err();
    assert!(matches!(err, TaskError::MissingRequiredVars { .. }));
    assert!(err.to_string().contains("FOO"));

    // Bound: runs fine.
    run_target_with_vars(&executor, "t", &[("FOO", "bar")])
        .await
        .unwrap();
    assert_eq!(common::read_file(tmp.path(), "log.txt"), "bar\n");
}

#[tokio::test]
async fn required_enum_values_are_enforced() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\ntasks:\n  deploy:\n    requires:\n      vars:\n        - name: ENV\n          enum: [dev, prod]\n    cmds:\n      - echo ${ENV}\n",
    );

    let (executor, _) = executor_in(tmp.path(), |_| {}).await;

    let err = run_target_with_vars(&executor, "deploy", &[("ENV", "staging")])
        .await
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("ENV"));
    assert!(msg.contains("dev"));
    assert!(msg.contains("prod"));

    run_target_with_vars(&executor, "deploy", &[("ENV", "prod")])
        .await
        .unwrap();
}

#[tokio::test]
async fn internal_tasks_reject_direct_invocation_but_work_as_deps() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\ntasks:\n  helper:\n    internal: true\n    cmds:\n      - echo helped >> log.txt\n  public:\n    deps: [helper]\n    cmds:\n      - echo done >> log.txt\n",
    );

    let (executor, _) = executor_in(tmp.path(), |_| {}).await;
    let err = run_target(&executor, "helper").await.unwrap_err();
    assert!(matches!(err, TaskError::InternalTask { .. }));

    run_target(&executor, "public").await.unwrap();
    let log = common::read_file(tmp.path(), "log.txt");
    assert!(log.contains("helped"));
    assert!(log.contains("done"));
}

#[tokio::test]
async fn prompts_are_auto_approved_with_assume_yes() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\ntasks:\n  risky:\n    prompt: 'Delete everything?'\n    cmds:\n      - echo approved >> log.txt\n",
    );

    let (executor, _) = executor_in(tmp.path(), |opts| opts.assume_yes = true).await;
    run_target(&executor, "risky").await.unwrap();
    assert_eq!(common::read_file(tmp.path(), "log.txt"), "approved\n");
}

#[tokio::test]
async fn summary_mode_prints_the_block_before_running() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\ntasks:\n  release:\n    desc: Cut a release\n    cmds:\n      - echo releasing >> log.txt\n",
    );

    let (executor, capture) = executor_in(tmp.path(), |opts| opts.summary = true).await;
    run_target(&executor, "release").await.unwrap();

    let output = capture.contents();
    assert!(output.contains("task: release"));
    assert!(output.contains("Cut a release"));
    assert!(output.contains("commands:"));
}
