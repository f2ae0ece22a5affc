// tests/concurrency.rs

//! Scheduling properties: parallel deps, run-once deduplication, the
//! concurrency limit and sibling cancellation on dep failure.

mod common;

use std::time::{Duration, Instant};

use common::{executor_in, read_file, run_target, write_taskfile};

#[tokio::test]
async fn deps_run_concurrently() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\ntasks:\n  all:\n    deps: [slow-a, slow-b, slow-c]\n    cmds:\n      - echo done\n  slow-a: sleep 0.4\n  slow-b: sleep 0.4\n  slow-c: sleep 0.4\n",
    );

    let (executor, _) = executor_in(tmp.path(), |_| {}).await;
    let started = Instant::now();
    run_target(&executor, "all").await.unwrap();
    let elapsed = started.elapsed();

    // Serial execution would need ~1.2s; parallel stays near max(dep_time).
    assert!(
        elapsed < Duration::from_millis(1000),
        "deps were not parallel: {elapsed:?}"
    );
}

#[tokio::test]
async fn run_once_executes_exactly_once_across_concurrent_callers() {
    let tmp = tempfile::tempdir().unwrap();
    // Three deps all call `shared` (run: once); its body appends a line.
    write_taskfile(
        tmp.path(),
        "version: 3\ntasks:\n  all:\n    deps: [wrap-a, wrap-b, wrap-c]\n    cmds:\n      - echo done\n  wrap-a:\n    deps: [shared]\n    cmds: ['true']\n  wrap-b:\n    deps: [shared]\n    cmds: ['true']\n  wrap-c:\n    deps: [shared]\n    cmds: ['true']\n  shared:\n    run: once\n    cmds:\n      - sleep 0.1\n      - echo ran >> shared.txt\n",
    );

    let (executor, _) = executor_in(tmp.path(), |_| {}).await;
    run_target(&executor, "all").await.unwrap();

    assert_eq!(read_file(tmp.path(), "shared.txt"), "ran\n");
}

#[tokio::test]
async fn run_once_result_is_shared_with_later_callers() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\ntasks:\n  once:\n    run: once\n    cmds:\n      - echo ran >> log.txt\n",
    );

    let (executor, _) = executor_in(tmp.path(), |_| {}).await;
    run_target(&executor, "once").await.unwrap();
    run_target(&executor, "once").await.unwrap();

    assert_eq!(read_file(tmp.path(), "log.txt"), "ran\n");
}

#[tokio::test]
async fn when_changed_reruns_only_for_new_var_bindings() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\ntasks:\n  build:\n    run: when_changed\n    cmds:\n      - echo ${TARGET} >> log.txt\n",
    );

    let (executor, _) = executor_in(tmp.path(), |_| {}).await;
    common::run_target_with_vars(&executor, "build", &[("TARGET", "a")])
        .await
        .unwrap();
    common::run_target_with_vars(&executor, "build", &[("TARGET", "a")])
        .await
        .unwrap();
    common::run_target_with_vars(&executor, "build", &[("TARGET", "b")])
        .await
        .unwrap();

    assert_eq!(read_file(tmp.path(), "log.txt"), "a\nb\n");
}

#[tokio::test]
async fn concurrency_limit_serializes_cmd_phases() {
    let tmp = tempfile::tempdir().unwrap();
    // Two parallel deps; with a one-slot semaphore their cmd phases cannot
    // overlap, so the bodies serialize.
    write_taskfile(
        tmp.path(),
        "version: 3\ntasks:\n  all:\n    deps: [a, b]\n    cmds:\n      - echo done\n  a: sleep 0.3\n  b: sleep 0.3\n",
    );

    let (executor, _) = executor_in(tmp.path(), |opts| opts.concurrency = 1).await;
    let started = Instant::now();
    run_target(&executor, "all").await.unwrap();
    assert!(
        started.elapsed() >= Duration::from_millis(550),
        "cmd phases overlapped despite concurrency=1"
    );
}

#[tokio::test]
async fn dep_failure_cancels_remaining_siblings() {
    let tmp = tempfile::tempdir().unwrap();
    // `fails` exits quickly; `slow` would take 2s and write a marker at the
    // end. With sibling cancellation the marker never appears and the whole
    // run finishes early.
    write_taskfile(
        tmp.path(),
        "version: 3\ntasks:\n  all:\n    deps: [fails, slow]\n    cmds:\n      - echo never >> log.txt\n  fails:\n    cmds:\n      - sleep 0.1\n      - exit 3\n  slow:\n    cmds:\n      - sleep 5\n      - echo finished >> slow.txt\n",
    );

    let (executor, _) = executor_in(tmp.path(), |_| {}).await;
    let started = Instant::now();
    let err = run_target(&executor, "all").await.unwrap_err();

    assert_eq!(err.exit_code(), 3);
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "sibling dep was not cancelled"
    );
    assert!(!tmp.path().join("slow.txt").exists());
    assert!(!tmp.path().join("log.txt").exists());
}

#[tokio::test]
async fn deferred_cleanup_survives_cancellation_of_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\ntasks:\n  long:\n    cmds:\n      - defer: echo cleaned >> log.txt\n      - sleep 10\n",
    );

    let (executor, _) = executor_in(tmp.path(), |_| {}).await;
    let token = executor.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        token.cancel();
    });

    let err = run_target(&executor, "long").await.unwrap_err();
    assert!(err.is_cancellation());
    // Cleanup ran on the detached context.
    assert_eq!(read_file(tmp.path(), "log.txt"), "cleaned\n");
}

#[tokio::test]
async fn timeout_cancels_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\ntasks:\n  forever:\n    cmds:\n      - sleep 30\n",
    );

    let (executor, _) = executor_in(tmp.path(), |opts| {
        opts.timeout = Some(Duration::from_millis(200));
    })
    .await;

    let started = Instant::now();
    let err = run_target(&executor, "forever").await.unwrap_err();
    assert!(matches!(err, taskdag::errors::TaskError::Timeout));
    assert!(started.elapsed() < Duration::from_secs(10));
}
