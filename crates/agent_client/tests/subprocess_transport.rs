//! SubprocessTransport against real child processes. Unix-only: the tests
//! drive `/bin/sh` and `/bin/cat` as stand-ins for the agent CLI.
#![cfg(unix)]

use agent_client::{AgentError, CliCommand, SubprocessTransport, Transport};
use serde_json::json;
use tokio::sync::mpsc;

fn sh(script: &str) -> CliCommand {
    CliCommand::new("/bin/sh").arg("-c").arg(script)
}

#[tokio::test]
async fn echo_round_trip_preserves_frame_order() {
    let transport = SubprocessTransport::new(CliCommand::new("/bin/cat"));
    transport.connect().await.unwrap();
    assert!(transport.is_ready());

    for n in 0..5 {
        transport
            .write(&json!({"type": "user", "n": n}).to_string())
            .await
            .unwrap();
    }
    transport.end_input().await.unwrap();

    for n in 0..5 {
        let frame = transport.read_message().await.unwrap().unwrap();
        assert_eq!(frame["n"], n);
    }
    assert!(transport.read_message().await.unwrap().is_none());
    transport.close().await.unwrap();
}

#[tokio::test]
async fn concurrent_writers_never_interleave_frames() {
    let transport = std::sync::Arc::new(SubprocessTransport::new(CliCommand::new("/bin/cat")));
    transport.connect().await.unwrap();

    let mut writers = Vec::new();
    for task in 0..8 {
        let transport = transport.clone();
        writers.push(tokio::spawn(async move {
            for seq in 0..25 {
                let frame = json!({"task": task, "seq": seq, "pad": "x".repeat(512)});
                transport.write(&frame.to_string()).await.unwrap();
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }
    transport.end_input().await.unwrap();

    // Interleaved bytes would produce unparseable lines, which the reader
    // drops; a full count proves every frame came through intact.
    let mut decoded = 0;
    while let Some(frame) = transport.read_message().await.unwrap() {
        assert!(frame["task"].is_u64() && frame["seq"].is_u64());
        decoded += 1;
    }
    assert_eq!(decoded, 8 * 25);
    transport.close().await.unwrap();
}

#[tokio::test]
async fn undecodable_and_blank_lines_are_skipped() {
    let transport = SubprocessTransport::new(sh(
        r#"printf 'not json\n\n{"type":"result","subtype":"success"}\n'"#,
    ));
    transport.connect().await.unwrap();

    let frame = transport.read_message().await.unwrap().unwrap();
    assert_eq!(frame["type"], "result");
    assert!(transport.read_message().await.unwrap().is_none());
    transport.close().await.unwrap();
}

#[tokio::test]
async fn missing_trailing_newline_still_parses() {
    let transport = SubprocessTransport::new(sh(r#"printf '{"type":"result"}'"#));
    transport.connect().await.unwrap();

    let frame = transport.read_message().await.unwrap().unwrap();
    assert_eq!(frame["type"], "result");
    transport.close().await.unwrap();
}

#[tokio::test]
async fn nonzero_exit_reports_process_error_with_stderr() {
    let transport = SubprocessTransport::new(sh("echo boom >&2; exit 3"));
    transport.connect().await.unwrap();

    match transport.read_message().await {
        Err(AgentError::ProcessExit { status, stderr }) => {
            assert_eq!(status.code(), Some(3));
            assert!(stderr.contains("boom"), "stderr was: {stderr}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    transport.close().await.unwrap();
}

#[tokio::test]
async fn stderr_lines_reach_the_sink() {
    let (sink, mut lines) = mpsc::unbounded_channel();
    let transport = SubprocessTransport::new(sh(r#"echo diagnostics >&2; echo '{"ok":true}'"#))
        .stderr_sink(sink);
    transport.connect().await.unwrap();

    assert!(transport.read_message().await.unwrap().is_some());
    assert_eq!(lines.recv().await.as_deref(), Some("diagnostics"));
    transport.close().await.unwrap();
}

#[tokio::test]
async fn write_after_end_input_fails() {
    let transport = SubprocessTransport::new(CliCommand::new("/bin/cat"));
    transport.connect().await.unwrap();
    transport.end_input().await.unwrap();
    transport.end_input().await.unwrap();

    assert!(matches!(
        transport.write("{}").await,
        Err(AgentError::Connection(_))
    ));
    transport.close().await.unwrap();
}

#[tokio::test]
async fn missing_binary_is_a_spawn_error() {
    let transport =
        SubprocessTransport::new(CliCommand::new("/definitely/not/an/agent/binary"));
    match transport.connect().await {
        Err(AgentError::Spawn { binary, .. }) => {
            assert!(binary.to_string_lossy().contains("definitely"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn missing_working_directory_is_rejected_before_spawn() {
    let gone = {
        let dir = tempfile::tempdir().unwrap();
        dir.path().to_path_buf()
    };
    let transport = SubprocessTransport::new(CliCommand::new("/bin/cat").cwd(&gone));
    assert!(matches!(
        transport.connect().await,
        Err(AgentError::WorkingDirectory { .. })
    ));
}

#[tokio::test]
async fn close_is_idempotent_and_reaps_long_running_children() {
    let transport = SubprocessTransport::new(sh("sleep 30"));
    transport.connect().await.unwrap();

    transport.close().await.unwrap();
    transport.close().await.unwrap();
    assert!(!transport.is_ready());
}

#[tokio::test]
async fn child_env_and_cwd_are_applied() {
    let dir = tempfile::tempdir().unwrap();
    let transport = SubprocessTransport::new(
        sh(r#"printf '{"cwd":"%s","flag":"%s"}\n' "$(pwd)" "$AGENT_TEST_FLAG""#)
            .env("AGENT_TEST_FLAG", "on")
            .cwd(dir.path()),
    );
    transport.connect().await.unwrap();

    let frame = transport.read_message().await.unwrap().unwrap();
    assert_eq!(frame["flag"], "on");
    let reported = frame["cwd"].as_str().unwrap();
    let expected = dir.path().canonicalize().unwrap();
    assert_eq!(
        std::path::Path::new(reported).canonicalize().unwrap(),
        expected
    );
    transport.close().await.unwrap();
}
