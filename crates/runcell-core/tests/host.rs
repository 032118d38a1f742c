//! Integration tests for the host-process backend.
//!
//! These only need a POSIX `sh`. The Python scenario is skipped when no
//! interpreter is on PATH.
//!
//! Run with: `cargo test -p runcell-core --test host`

use runcell_core::{
    EnvConfig, EnvError, ExecutionEnv, FileContent, Files, SimpleExecutionEnv, TempDirRegistry,
    TIMEOUT_EXIT_CODE,
};
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn files(pairs: &[(&str, &str)]) -> Files {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), FileContent::from(*v)))
        .collect()
}

async fn env() -> SimpleExecutionEnv {
    init_tracing();
    SimpleExecutionEnv::temp().await.expect("Failed to create environment")
}

#[tokio::test]
async fn test_upload_traversal_rejected() {
    let env = env().await;
    let escape_target = env.root().parent().unwrap().join("evil.txt");

    let err = env
        .upload(&files(&[("../evil.txt", "x")]))
        .await
        .unwrap_err();
    assert!(matches!(err, EnvError::PathSecurity { .. }));
    assert!(!escape_target.exists());
    assert!(env.download().await.unwrap().is_empty());

    env.cleanup().await;
}

#[tokio::test]
async fn test_text_files_roundtrip() {
    let env = env().await;
    let input = files(&[
        ("main.py", "print('hi')\n"),
        ("pkg/__init__.py", ""),
        ("pkg/util.py", "X = 1\n"),
    ]);

    env.upload(&input).await.unwrap();
    assert_eq!(env.download().await.unwrap(), input);
    env.cleanup().await;
}

#[tokio::test]
async fn test_binary_file_roundtrip() {
    let env = env().await;
    let payload = [0xffu8, 0xd8, 0xff, 0xe0, 0x00, 0x10];
    let mut input = Files::new();
    input.insert("photo.jpg".into(), FileContent::binary(payload));

    env.upload(&input).await.unwrap();
    let result = env.run("wc -c < photo.jpg", true).await.unwrap();
    assert_eq!(result.stdout.trim(), "6");

    let output = env.download().await.unwrap();
    assert!(output["photo.jpg"].is_binary());
    assert_eq!(output["photo.jpg"].decode().unwrap().as_ref(), payload);
    env.cleanup().await;
}

#[tokio::test]
async fn test_timeout_returns_near_deadline() {
    init_tracing();
    let config = EnvConfig::builder()
        .timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    let env = SimpleExecutionEnv::new(None, config).await.unwrap();

    let start = Instant::now();
    let result = env.run("echo started; sleep 60", true).await.unwrap();

    assert!(result.timed_out);
    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert_eq!(result.stdout, "started\n");
    assert!(start.elapsed() < Duration::from_secs(5));

    // The instance stays usable after a timeout.
    let result = env.run("echo again", true).await.unwrap();
    assert!(!result.timed_out);
    assert_eq!(result.stdout, "again\n");
    env.cleanup().await;
}

#[tokio::test]
async fn test_exit_code_propagates() {
    let env = env().await;
    let result = env.run("exit 7", true).await.unwrap();
    assert_eq!(result.exit_code, 7);
    assert!(!result.timed_out);
    assert!(!result.success());
    env.cleanup().await;
}

#[tokio::test]
async fn test_streams_are_separate() {
    let env = env().await;
    let result = env.run("echo out; echo err 1>&2", false).await.unwrap();
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "err\n");
    assert_eq!(result.exit_code, 0);
    env.cleanup().await;
}

#[tokio::test]
async fn test_cleanup_twice() {
    let env = env().await;
    let root = env.root().to_path_buf();
    env.upload(&files(&[("a.txt", "a")])).await.unwrap();

    env.cleanup().await;
    env.cleanup().await;
    assert!(!root.exists());
    assert!(!TempDirRegistry::global().contains(&root));
}

#[tokio::test]
async fn test_caller_directory_is_kept() {
    init_tracing();
    let parent = tempfile::tempdir().unwrap();
    let dir = parent.path().join("caller");
    let env = SimpleExecutionEnv::new(Some(dir.clone()), EnvConfig::default())
        .await
        .unwrap();

    env.run("echo kept > kept.txt", true).await.unwrap();
    env.cleanup().await;
    assert!(dir.join("kept.txt").exists());
}

#[tokio::test]
async fn test_hello_world_python() {
    let env = env().await;
    let lookup = env.run("command -v python3 || command -v python", true).await.unwrap();
    let Some(python) = lookup.stdout.lines().next().map(str::to_string) else {
        eprintln!("Skipping test: no python interpreter on PATH");
        env.cleanup().await;
        return;
    };

    env.upload(&files(&[("hello.py", "print('Hello, world!')")]))
        .await
        .unwrap();
    let result = env.run(&format!("{python} hello.py"), true).await.unwrap();

    assert_eq!(result.stdout, "Hello, world!\n");
    assert_eq!(result.exit_code, 0);
    env.cleanup().await;
}

#[tokio::test]
async fn test_command_output_files_are_downloaded() {
    let env = env().await;
    env.upload(&files(&[("a.txt", "1")])).await.unwrap();

    let result = env.run("echo 2 > b.txt", true).await.unwrap();
    assert!(result.success());

    let output = env.download().await.unwrap();
    assert_eq!(output, files(&[("a.txt", "1"), ("b.txt", "2\n")]));
    env.cleanup().await;
}

#[tokio::test]
async fn test_files_json_shape() {
    let mut input = files(&[("a.txt", "1")]);
    input.insert("b.bin".into(), FileContent::binary([0xffu8, 0x00]));

    let json = serde_json::to_value(&input).unwrap();
    assert_eq!(json["a.txt"]["encoding"], "text");
    assert_eq!(json["a.txt"]["content"], "1");
    assert_eq!(json["b.bin"]["encoding"], "base64");
    assert_eq!(json["b.bin"]["content"], "/wA=");

    let back: Files = serde_json::from_value(json).unwrap();
    assert_eq!(back, input);
}

#[tokio::test]
async fn test_environment_as_trait_object() {
    let env = env().await;
    let dyn_env: &dyn ExecutionEnv = &env;
    dyn_env.upload(&files(&[("x.txt", "x")])).await.unwrap();
    let result = dyn_env.run("cat x.txt", true).await.unwrap();
    assert_eq!(result.stdout, "x");
    env.cleanup().await;
}
