//! End-to-end lifecycle tests against mock language servers.
//!
//! Each mock server is a bash script written to a temp file and spawned
//! through `ChildTransport`, so these tests exercise the real pipes, the
//! environment overrides and process exit reporting.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::time::timeout;

use lsp_probe::config::ServerConfig;
use lsp_probe::lsp::{
    ChildTransport, ClientError, ClientOptions, ClientState, ExitReport, FrameError,
    InitializeParams, LspClient, ReaderError, RequestId,
};

/// Test timeout to prevent hanging tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared frame helpers for the mock scripts.
///
/// `dd bs=1` reads the body byte by byte so nothing past the frame is
/// consumed from stdin.
const FRAME_HELPERS: &str = r#"
read_frame() {
    local line length=""
    while IFS= read -r line; do
        line="${line%$'\r'}"
        [ -z "$line" ] && break
        case "$line" in
            Content-Length:*) length="${line#Content-Length: }" ;;
        esac
    done
    if [ -z "$length" ]; then
        exit 0
    fi
    body=$(dd bs=1 count="$length" 2>/dev/null)
    id=$(printf '%s' "$body" | grep -oE '"id":[0-9]+' | head -n1 | grep -oE '[0-9]+')
    method=$(printf '%s' "$body" | grep -oE '"method":"[^"]*"' | head -n1 | cut -d'"' -f4)
}

send() {
    printf 'Content-Length: %d\r\n\r\n%s' "${#1}" "$1"
}
"#;

/// Different mock server behaviors for testing.
#[derive(Debug, Clone, Copy)]
enum MockServerBehavior {
    /// Full initialize / notification / shutdown / exit conversation,
    /// exiting with `$MOCK_EXIT_CODE` (default 0)
    Lifecycle,
    /// Writes a line that is not a header, then idles
    Garbage,
    /// Exits immediately without responding (simulates crash on startup)
    ExitImmediately,
}

fn create_mock_lsp_server_script(behavior: MockServerBehavior) -> PathBuf {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    let script_path = std::env::temp_dir().join(format!(
        "mock_lsp_server_{:?}_{}_{}.sh",
        behavior,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));

    let body = match behavior {
        MockServerBehavior::Lifecycle => {
            r#"
read_frame
[ "$method" = "initialize" ] || exit 10
send "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"capabilities\":{}}}"
send '{"jsonrpc":"2.0","method":"window/logMessage","params":{"type":3,"message":"hi"}}'

read_frame
[ "$method" = "shutdown" ] || exit 11
send "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":null}"

read_frame
[ "$method" = "exit" ] || exit 12
exit "${MOCK_EXIT_CODE:-0}"
"#
        }
        MockServerBehavior::Garbage => {
            r#"
printf 'this is not a header\r\n\r\n'
exec cat > /dev/null
"#
        }
        MockServerBehavior::ExitImmediately => "\nexit 0\n",
    };

    let script = format!("#!/bin/bash\n{}\n{}", FRAME_HELPERS, body);
    fs::write(&script_path, script).expect("Failed to write mock script");

    let mut perms = fs::metadata(&script_path)
        .expect("Failed to get script metadata")
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).expect("Failed to set script permissions");

    script_path
}

/// Clean up a mock script file.
fn cleanup_mock_script(path: &Path) {
    let _ = std::fs::remove_file(path);
}

fn mock_config(script: &Path, env: &[(&str, &str)]) -> ServerConfig {
    ServerConfig {
        command: "bash".to_string(),
        args: vec![script.to_string_lossy().into_owned()],
        working_dir: Some(std::env::temp_dir()),
        env: env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        root_path: Some(PathBuf::from("/proj")),
    }
}

fn options() -> ClientOptions {
    ClientOptions {
        response_timeout: Some(TEST_TIMEOUT),
        exit_timeout: Some(TEST_TIMEOUT),
        ..ClientOptions::default()
    }
}

fn start(config: &ServerConfig) -> LspClient<ChildTransport> {
    let transport = ChildTransport::spawn(config).expect("Failed to spawn mock server");
    LspClient::connect(transport, options()).expect("Failed to connect")
}

#[tokio::test]
async fn test_full_lifecycle_against_process() {
    let script = create_mock_lsp_server_script(MockServerBehavior::Lifecycle);
    let config = mock_config(&script, &[]);
    let mut client = start(&config);

    let response = client
        .initialize(InitializeParams::for_root(config.root_path.as_deref()))
        .await
        .expect("initialize should succeed");
    assert_eq!(response.id, RequestId(1));
    assert_eq!(response.payload, Ok(json!({"capabilities": {}})));
    assert_eq!(client.state(), ClientState::Ready);

    let notification = client
        .next_notification_timeout(TEST_TIMEOUT)
        .await
        .expect("notification expected");
    assert_eq!(notification.method, "window/logMessage");
    assert_eq!(notification.params["message"], "hi");

    let response = client.shutdown().await.expect("shutdown should succeed");
    assert_eq!(response.id, RequestId(2));
    assert_eq!(response.payload, Ok(Value::Null));
    assert_eq!(client.state(), ClientState::Closed);

    let err = timeout(TEST_TIMEOUT, client.next_response())
        .await
        .expect("next_response must not hang after exit")
        .unwrap_err();
    assert!(matches!(err, ClientError::TransportClosed { cause: None }));

    cleanup_mock_script(&script);
}

#[tokio::test]
async fn test_unclean_exit_is_reported() {
    let script = create_mock_lsp_server_script(MockServerBehavior::Lifecycle);
    let config = mock_config(&script, &[("MOCK_EXIT_CODE", "3")]);
    let mut client = start(&config);

    client
        .initialize(InitializeParams::for_root(None))
        .await
        .expect("initialize should succeed");

    match client.shutdown().await {
        Err(ClientError::UnexpectedExitStatus(report)) => {
            assert_eq!(report, ExitReport::code(3));
        }
        other => panic!("Expected UnexpectedExitStatus, got: {:?}", other),
    }

    cleanup_mock_script(&script);
}

#[tokio::test]
async fn test_garbage_output_fails_client() {
    let script = create_mock_lsp_server_script(MockServerBehavior::Garbage);
    let config = mock_config(&script, &[]);
    let mut client = start(&config);

    let err = client
        .initialize(InitializeParams::for_root(None))
        .await
        .unwrap_err();

    match &err {
        ClientError::TransportClosed { cause: Some(cause) } => {
            assert!(
                matches!(**cause, ReaderError::Frame(FrameError::MalformedHeader(_))),
                "unexpected cause: {}",
                cause
            );
        }
        other => panic!("Expected TransportClosed with cause, got: {:?}", other),
    }
    assert_eq!(client.state(), ClientState::Failed);

    // Dropping the client kills the idle server
    drop(client);
    cleanup_mock_script(&script);
}

#[tokio::test]
async fn test_immediate_exit_fails_initialize() {
    let script = create_mock_lsp_server_script(MockServerBehavior::ExitImmediately);
    let config = mock_config(&script, &[]);
    let mut client = start(&config);

    // Depending on timing the write fails (broken pipe) or the reader sees
    // EOF first; either way initialize must not hang or succeed.
    let result = timeout(
        TEST_TIMEOUT,
        client.initialize(InitializeParams::for_root(None)),
    )
    .await
    .expect("Test timed out");
    assert!(result.is_err(), "initialize should fail: {:?}", result);

    cleanup_mock_script(&script);
}

#[tokio::test]
async fn test_spawn_nonexistent_server() {
    let config = ServerConfig {
        command: "/nonexistent/path/to/lsp-server".to_string(),
        ..ServerConfig::default()
    };
    assert!(ChildTransport::spawn(&config).is_err());
}
