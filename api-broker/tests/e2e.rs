use std::{net::SocketAddr, path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use api_broker::{
    client::ApiClient,
    protocol::{RequestHeader, code, service},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn serve_and_ping_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("api-broker");

    let (mut broker, mut broker_stdout) = spawn_broker(binary)?;
    let addr = read_broker_addr(&mut broker_stdout).await?;

    // Keep the broker's log pipe drained so it never blocks on a full buffer.
    let drain = tokio::spawn(drain_stdout(broker_stdout));

    let mut client = ApiClient::connect(addr).await?;
    let ack = timeout(READ_TIMEOUT, client.heartbeat()).await??;
    assert_eq!(ack.code, code::HEARTBEAT);
    let echo = timeout(
        READ_TIMEOUT,
        client.request(RequestHeader::new(service::ECHO, 0).encode(b"hello broker")),
    )
    .await??;
    assert_eq!(echo.body.as_ref(), b"hello broker");
    drop(client);

    let output = timeout(
        READ_TIMEOUT,
        Command::new(binary)
            .arg("ping")
            .arg("--server")
            .arg(addr.to_string())
            .env("RUST_LOG", "warn")
            .env("NO_COLOR", "1")
            .output(),
    )
    .await?
    .context("failed to run ping")?;
    assert!(output.status.success(), "ping exited with {}", output.status);

    let stdout = String::from_utf8(output.stdout)?;
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3, "unexpected ping output: {stdout}");
    assert!(lines[0].starts_with("connected as 0x"));
    assert_eq!(lines[1], format!("heartbeat: code {}", code::HEARTBEAT));
    assert_eq!(lines[2], "echo: ping");

    stop(&mut broker).await;
    let _ = drain.await;
    Ok(())
}

#[tokio::test]
async fn serve_rejects_invalid_config() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("api-broker");
    let status = timeout(
        READ_TIMEOUT,
        Command::new(binary)
            .args(["serve", "--port", "0", "--workers", "0"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    )
    .await??;
    assert!(!status.success());
    Ok(())
}

fn spawn_broker(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut child = Command::new(binary)
        .args(["serve", "--port", "0"])
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn broker")?;
    let stdout = child
        .stdout
        .take()
        .context("broker stdout missing after spawn")?;
    Ok((child, BufReader::new(stdout)))
}

async fn read_broker_addr(reader: &mut BufReader<ChildStdout>) -> Result<SocketAddr> {
    loop {
        let mut line = String::new();
        let read = timeout(READ_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("timed out waiting for listening banner"))??;
        if read == 0 {
            return Err(anyhow!("broker exited before announcing its address"));
        }
        if let Some((_, addr)) = line.trim_end().split_once("api broker listening on ") {
            return addr.trim().parse().context("unexpected broker banner format");
        }
    }
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while matches!(reader.read_line(&mut buffer).await, Ok(read) if read > 0) {
        buffer.clear();
    }
}

async fn stop(child: &mut Child) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}
