//! Realtime change feed over a phoenix-channel websocket.

use color_eyre::{eyre::eyre, Result};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};
use url::Url;

use super::{ChangeEvent, ChangeOp, ChangeStream};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Envelope of every phoenix message.
#[derive(Debug, Deserialize)]
struct PhoenixMessage {
  #[serde(default)]
  topic: String,
  event: String,
  #[serde(default)]
  payload: Value,
}

/// Row change body, both in the `postgres_changes` form and the legacy
/// per-operation events.
#[derive(Debug, Deserialize)]
struct ChangePayload {
  table: String,
  #[serde(alias = "eventType")]
  r#type: String,
  #[serde(default)]
  record: Value,
  #[serde(default)]
  old_record: Value,
}

/// Open a socket, join the channel for `table` and stream its changes.
///
/// The socket lives on its own task; it is closed when the returned stream
/// is dropped or the server goes away.
pub(super) async fn subscribe(
  endpoint: &Url,
  api_key: &str,
  schema: &str,
  table: &str,
) -> Result<ChangeStream> {
  let mut url = endpoint
    .join("realtime/v1/websocket")
    .map_err(|e| eyre!("Invalid realtime URL: {}", e))?;
  url
    .query_pairs_mut()
    .append_pair("apikey", api_key)
    .append_pair("vsn", "1.0.0");

  let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
    .await
    .map_err(|e| eyre!("Failed to connect realtime socket for {}: {}", table, e))?;
  let (mut sink, mut source) = socket.split();

  let topic = format!("realtime:{}:{}", schema, table);
  sink
    .send(Message::Text(join_message(&topic, schema, table, api_key).to_string()))
    .await
    .map_err(|e| eyre!("Failed to join realtime channel {}: {}", topic, e))?;
  debug!(topic = %topic, "joined realtime channel");

  let (tx, rx) = mpsc::channel::<Result<ChangeEvent>>(64);
  let table = table.to_string();

  tokio::spawn(async move {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut next_ref: u64 = 2;

    loop {
      tokio::select! {
        _ = tx.closed() => break,
        _ = heartbeat.tick() => {
          let beat = json!({"topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": next_ref.to_string()});
          next_ref += 1;
          if let Err(e) = sink.send(Message::Text(beat.to_string())).await {
            let _ = tx.send(Err(eyre!("Realtime heartbeat failed: {}", e))).await;
            break;
          }
        }
        message = source.next() => match message {
          Some(Ok(Message::Text(text))) => match parse_message(&text, &table) {
            Ok(Some(event)) => {
              if tx.send(Ok(event)).await.is_err() {
                break;
              }
            }
            Ok(None) => trace!(table = %table, "ignoring realtime message"),
            Err(e) => {
              let _ = tx.send(Err(e)).await;
              break;
            }
          },
          Some(Ok(Message::Close(_))) | None => break,
          Some(Ok(_)) => {}
          Some(Err(e)) => {
            let _ = tx.send(Err(eyre!("Realtime socket error: {}", e))).await;
            break;
          }
        }
      }
    }

    if let Err(e) = sink.send(Message::Close(None)).await {
      trace!(error = %e, "realtime socket already closed");
    }
    debug!(table = %table, "realtime channel closed");
  });

  Ok(
    futures::stream::unfold(rx, |mut rx| async move {
      rx.recv().await.map(|item| (item, rx))
    })
    .boxed(),
  )
}

fn join_message(topic: &str, schema: &str, table: &str, api_key: &str) -> Value {
  json!({
    "topic": topic,
    "event": "phx_join",
    "payload": {
      "config": {
        "broadcast": {"self": false},
        "presence": {"key": ""},
        "postgres_changes": [{"event": "*", "schema": schema, "table": table}]
      },
      "access_token": api_key
    },
    "ref": "1"
  })
}

/// Decode one socket frame.
///
/// Returns `Ok(None)` for frames that carry no row change (replies,
/// heartbeats, presence) and an error when the server rejects the channel.
fn parse_message(text: &str, table: &str) -> Result<Option<ChangeEvent>> {
  let message: PhoenixMessage =
    serde_json::from_str(text).map_err(|e| eyre!("Undecodable realtime frame: {}", e))?;

  let change = match message.event.as_str() {
    "postgres_changes" => message.payload.get("data").cloned(),
    "INSERT" | "UPDATE" | "DELETE" => Some(message.payload),
    "phx_reply" => {
      if message.payload.get("status").and_then(Value::as_str) == Some("error") {
        return Err(eyre!(
          "Realtime channel {} rejected: {}",
          message.topic,
          message.payload.get("response").unwrap_or(&Value::Null)
        ));
      }
      None
    }
    "phx_error" | "phx_close" => {
      return Err(eyre!("Realtime channel {} closed by server", message.topic));
    }
    _ => None,
  };

  let Some(change) = change else {
    return Ok(None);
  };
  let payload: ChangePayload = match serde_json::from_value(change) {
    Ok(payload) => payload,
    Err(e) => {
      warn!(table = %table, error = %e, "malformed change payload");
      return Ok(None);
    }
  };
  let Some(op) = ChangeOp::from_wire(&payload.r#type) else {
    return Ok(None);
  };

  let row = if op == ChangeOp::Delete {
    &payload.old_record
  } else {
    &payload.record
  };
  let row_id = row.get("id").and_then(|id| match id {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  });

  Ok(Some(ChangeEvent {
    table: payload.table,
    op,
    row_id,
  }))
}
