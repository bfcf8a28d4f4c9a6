use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use atchat_runner::{run_session, ChatScript, CommandStatus, SessionOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn read_command(modem: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut chunk = [0u8; 64];
    while !received.contains(&b'\r') {
        let n = modem.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&chunk[..n]);
    }
    received
}

async fn connect() -> (TcpStream, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stream = TcpStream::connect(listener.local_addr().unwrap())
        .await
        .unwrap();
    (stream, listener)
}

#[tokio::test]
async fn command_and_notification_over_tcp() {
    let (stream, listener) = connect().await;

    let modem = tokio::spawn(async move {
        let (mut modem, _) = listener.accept().await.unwrap();
        let command = read_command(&mut modem).await;
        modem
            .write_all(b"\r\n+CREG: 0,1\r\n\r\nOK\r\n\r\n+CREG: 5\r\n")
            .await
            .unwrap();
        command
    });

    let script = ChatScript::from_yaml_str(
        r#"
notifications:
  - prefix: "+CREG:"
commands:
  - command: "AT+CREG?"
    prefixes: ["+CREG:"]
"#,
    )
    .unwrap();

    let summary = run_session(
        stream,
        &script,
        &SessionOptions {
            listen: Duration::from_millis(200),
            debug: false,
        },
        Arc::new(AtomicBool::new(false)),
    )
    .await
    .unwrap();

    assert_eq!(modem.await.unwrap(), b"AT+CREG?\r");

    assert_eq!(summary.commands.len(), 1);
    let outcome = &summary.commands[0];
    assert_eq!(outcome.status, CommandStatus::Ok);
    assert_eq!(outcome.lines, vec!["+CREG: 0,1".to_string()]);
    assert_eq!(outcome.final_line.as_deref(), Some("OK"));

    assert_eq!(summary.notifications.len(), 1);
    assert_eq!(summary.notifications[0].lines, vec!["+CREG: 5".to_string()]);
    assert!(summary.all_ok());
    assert!(!summary.disconnected);
}

#[tokio::test]
async fn hangup_cancels_outstanding_commands() {
    let (stream, listener) = connect().await;

    let modem = tokio::spawn(async move {
        let (mut modem, _) = listener.accept().await.unwrap();
        read_command(&mut modem).await;
        drop(modem);
    });

    let script = ChatScript::from_yaml_str(
        r#"
commands:
  - command: "ATD123;"
  - command: "ATH"
"#,
    )
    .unwrap();

    let summary = run_session(
        stream,
        &script,
        &SessionOptions::default(),
        Arc::new(AtomicBool::new(false)),
    )
    .await
    .unwrap();
    modem.await.unwrap();

    assert!(summary.disconnected);
    assert!(summary
        .commands
        .iter()
        .all(|c| c.status == CommandStatus::Canceled));
    assert!(!summary.all_ok());
}

#[tokio::test]
async fn stop_flag_ends_session() {
    let (stream, listener) = connect().await;

    let modem = tokio::spawn(async move {
        let (mut modem, _) = listener.accept().await.unwrap();
        read_command(&mut modem).await;
        modem
    });

    let script = ChatScript::from_yaml_str("commands: [{command: \"AT+COPS=0\"}]").unwrap();

    let summary = run_session(
        stream,
        &script,
        &SessionOptions::default(),
        Arc::new(AtomicBool::new(true)),
    )
    .await
    .unwrap();
    drop(modem);

    assert!(summary.interrupted);
    assert_eq!(summary.commands[0].status, CommandStatus::Canceled);
}
