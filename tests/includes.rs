// tests/includes.rs

//! Include semantics end to end: namespacing, flatten, optional includes,
//! conduit vars, and remote includes served from an in-process HTTP listener.

mod common;

use common::{executor_in, read_file, run_target, write_file, write_taskfile};
use taskdag::errors::TaskError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn included_tasks_run_under_their_prefix_and_dir() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\nincludes:\n  sub: ./sub/Taskfile.yml\ntasks:\n  root: echo root\n",
    );
    write_file(
        tmp.path(),
        "sub/Taskfile.yml",
        "version: 3\ntasks:\n  where:\n    cmds:\n      - pwd > where.txt\n",
    );

    let (executor, _) = executor_in(tmp.path(), |_| {}).await;
    run_target(&executor, "sub:where").await.unwrap();

    // The included task ran in the included file's directory.
    let recorded = read_file(tmp.path(), "sub/where.txt");
    assert!(recorded.trim().ends_with("sub"), "ran in {recorded}");
}

#[tokio::test]
async fn include_alias_reaches_the_namespace() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\nincludes:\n  subsystem:\n    taskfile: ./sub.yml\n    aliases: [s]\n",
    );
    write_file(
        tmp.path(),
        "sub.yml",
        "version: 3\ntasks:\n  go:\n    cmds:\n      - echo went >> log.txt\n",
    );

    let (executor, _) = executor_in(tmp.path(), |_| {}).await;
    run_target(&executor, "s:go").await.unwrap();
    assert_eq!(read_file(tmp.path(), "log.txt"), "went\n");
}

#[tokio::test]
async fn conduit_vars_flow_into_included_tasks() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\nincludes:\n  sub:\n    taskfile: ./sub.yml\n    vars:\n      REGION: eu-west\n",
    );
    write_file(
        tmp.path(),
        "sub.yml",
        "version: 3\nvars:\n  REGION: default-region\ntasks:\n  show:\n    cmds:\n      - echo ${REGION} > region.txt\n",
    );

    let (executor, _) = executor_in(tmp.path(), |_| {}).await;
    run_target(&executor, "sub:show").await.unwrap();
    assert_eq!(read_file(tmp.path(), "region.txt"), "eu-west\n");
}

#[tokio::test]
async fn included_deps_resolve_within_their_namespace() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\nincludes:\n  sub: ./sub.yml\n",
    );
    write_file(
        tmp.path(),
        "sub.yml",
        "version: 3\ntasks:\n  build:\n    deps: [prepare]\n    cmds:\n      - echo built >> log.txt\n  prepare:\n    cmds:\n      - echo prepared >> log.txt\n",
    );

    let (executor, _) = executor_in(tmp.path(), |_| {}).await;
    run_target(&executor, "sub:build").await.unwrap();
    assert_eq!(read_file(tmp.path(), "log.txt"), "prepared\nbuilt\n");
}

#[tokio::test]
async fn calling_the_bare_include_name_runs_its_default_task() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(tmp.path(), "version: 3\nincludes:\n  sub: ./sub.yml\n");
    write_file(
        tmp.path(),
        "sub.yml",
        "version: 3\ntasks:\n  default:\n    cmds:\n      - echo defaulted >> log.txt\n",
    );

    let (executor, _) = executor_in(tmp.path(), |_| {}).await;
    run_target(&executor, "sub").await.unwrap();
    assert_eq!(read_file(tmp.path(), "log.txt"), "defaulted\n");
}

/// Minimal one-shot HTTP server: serves `body` for every GET until dropped.
async fn spawn_http_server(body: String) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                // Read the request head; content does not matter.
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/yaml\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{addr}/T.yml")
}

const REMOTE_BODY: &str = "version: 3\ntasks:\n  hello:\n    cmds:\n      - echo remote-hello >> log.txt\n";

#[tokio::test]
async fn remote_include_downloads_caches_and_runs() {
    let url = spawn_http_server(REMOTE_BODY.to_string()).await;

    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        &format!("version: 3\nincludes:\n  r:\n    taskfile: {url}\n"),
    );

    // Plain HTTP requires the insecure opt-in.
    let (executor, _) = executor_in(tmp.path(), |opts| {
        opts.insecure = true;
        opts.download = true;
    })
    .await;
    run_target(&executor, "r:hello").await.unwrap();
    assert_eq!(read_file(tmp.path(), "log.txt"), "remote-hello\n");

    // A cache entry was written.
    let cached: Vec<_> = std::fs::read_dir(tmp.path().join(".taskdag/remote"))
        .unwrap()
        .collect();
    assert_eq!(cached.len(), 1);

    // Offline mode with a warm cache still works.
    let (executor, _) = executor_in(tmp.path(), |opts| {
        opts.insecure = true;
        opts.offline = true;
    })
    .await;
    run_target(&executor, "r:hello").await.unwrap();
    assert_eq!(read_file(tmp.path(), "log.txt"), "remote-hello\nremote-hello\n");
}

#[tokio::test]
async fn remote_include_without_insecure_is_refused() {
    let url = spawn_http_server(REMOTE_BODY.to_string()).await;

    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        &format!("version: 3\nincludes:\n  r:\n    taskfile: {url}\n"),
    );

    let result = taskdag::engine::Executor::setup(taskdag::engine::ExecutorOptions {
        dir: Some(tmp.path().to_path_buf()),
        ..Default::default()
    })
    .await;
    assert!(matches!(result, Err(TaskError::InsecureRemote { .. })));
}

#[tokio::test]
async fn offline_without_cache_fails_setup() {
    let tmp = tempfile::tempdir().unwrap();
    write_taskfile(
        tmp.path(),
        "version: 3\nincludes:\n  r:\n    taskfile: https://example.invalid/T.yml\n",
    );

    let result = taskdag::engine::Executor::setup(taskdag::engine::ExecutorOptions {
        dir: Some(tmp.path().to_path_buf()),
        offline: true,
        ..Default::default()
    })
    .await;
    assert!(matches!(result, Err(TaskError::OfflineCacheMiss { .. })));
}
