use anyhow::{bail, Result};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::cli::TailArgs;

/// Map an http(s) base URL to the server's WebSocket endpoint.
pub fn websocket_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("ws://{}", base)
    };
    format!("{}/ws", ws)
}

pub async fn execute_tail(args: TailArgs) -> Result<()> {
    let url = websocket_url(&args.url);
    eprintln!("Connecting to {}...", url);

    let (ws_stream, _) = connect_async(&url).await?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(
            json!({"type": "authenticate", "token": args.token}).to_string(),
        ))
        .await?;
    for topic in &args.topics {
        write
            .send(Message::Text(
                json!({"type": "subscribe", "topic": topic}).to_string(),
            ))
            .await?;
    }

    eprintln!("Connected. Streaming {}...", args.topics.join(", "));
    eprintln!("Press Ctrl+C to stop.\n");

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Ok(envelope) = serde_json::from_str::<serde_json::Value>(&text) {
                    if envelope["event"] == "error" {
                        let message = envelope["data"]["message"].as_str().unwrap_or("unknown error");
                        bail!("Server error: {}", message);
                    }
                }
                println!("{}", text);
            }
            Ok(Message::Close(_)) => {
                eprintln!("Connection closed by server");
                break;
            }
            Err(e) => {
                eprintln!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
