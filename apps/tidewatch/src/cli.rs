use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use tidewatch_proto::downstream::{ViewerFrame, ViewerOpcode};

#[derive(Parser, Debug)]
#[command(name = "tidewatch")]
#[command(about = "Tidewatch presence relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the listen port (otherwise TIDEWATCH_PORT / default)
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a running relay and exercise the viewer handshake
    Probe {
        /// Relay URL (e.g., ws://localhost:8081)
        #[arg(short, long, default_value = "ws://localhost:8081")]
        url: String,

        /// Session token to identify with (random if omitted)
        #[arg(short, long)]
        token: Option<String>,

        /// Subject id to track
        #[arg(short, long)]
        subject: String,
    },
}

/// Drive hello → identify → heartbeat against a running relay and print
/// what came back. Useful for checking a deployment without a real viewer.
pub async fn run_probe(url: String, token: Option<String>, subject: String) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            return Err(anyhow::anyhow!("connection to {} failed: {}", ws_url, err));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout - is the relay running at {}?",
                ws_url
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let hello = next_frame(&mut read).await?;
    if hello.op != ViewerOpcode::Hello as u8 {
        return Err(anyhow::anyhow!("expected hello, got op {}", hello.op));
    }
    println!(
        "hello: heartbeat interval {}ms",
        hello.d["heartbeat_interval"]
    );

    let token = token.unwrap_or_else(|| Uuid::new_v4().to_string());
    let identify = serde_json::json!({
        "op": ViewerOpcode::Identify as u8,
        "d": { "token": token, "subject_ids": [subject] },
    });
    write
        .send(Message::Text(serde_json::to_string(&identify)?))
        .await?;

    let ready = next_frame(&mut read).await?;
    if ready.t.as_deref() != Some("READY") {
        return Err(anyhow::anyhow!("identify rejected: {:?}", ready));
    }
    println!(
        "ready: session {} (seq {})",
        ready.d["session_id"],
        ready.s.unwrap_or(0)
    );

    let started = Instant::now();
    let heartbeat = serde_json::json!({ "op": ViewerOpcode::Heartbeat as u8, "d": null });
    write
        .send(Message::Text(serde_json::to_string(&heartbeat)?))
        .await?;
    let ack = next_frame(&mut read).await?;
    if ack.op != ViewerOpcode::HeartbeatAck as u8 {
        return Err(anyhow::anyhow!("expected heartbeat ack, got op {}", ack.op));
    }
    println!(
        "heartbeat acked in {}ms (seq {})",
        started.elapsed().as_millis(),
        ack.d["seq"]
    );

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}

async fn next_frame(
    read: &mut SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
) -> Result<ViewerFrame> {
    let deadline = Duration::from_secs(5);
    loop {
        let msg = timeout(deadline, read.next())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for a relay frame"))?
            .ok_or_else(|| anyhow::anyhow!("relay closed the connection"))??;
        match msg {
            Message::Text(text) => return Ok(serde_json::from_str(&text)?),
            Message::Close(frame) => {
                return Err(anyhow::anyhow!("relay closed the connection: {:?}", frame));
            }
            _ => continue,
        }
    }
}
