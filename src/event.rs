//! Upstream fault notifications.
//!
//! A `FaultEvent` is delivered once per observed cluster anomaly by the
//! external subscription client and is never mutated here. The NDJSON
//! adapter at the bottom is the development stand-in for that client: the
//! orchestrator only ever sees the channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// The cluster resource a fault involves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRef {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// One upstream fault notification.
///
/// `fault_id` is a deterministic hash owned by the upstream source; two
/// notifications for the same underlying fault legitimately share it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultEvent {
    pub fault_id: String,
    pub cluster: String,
    pub subscription: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,
    pub fault_type: String,
    /// Upstream-owned severity classification; filtered on equality only.
    pub severity: String,
    pub context: String,
    pub occurred_at: DateTime<Utc>,
}

/// Read newline-delimited JSON fault events and forward them to `tx`.
///
/// Blank lines are skipped; malformed lines are logged and skipped rather
/// than aborting the stream. Returns when the reader hits EOF or the
/// receiving side of the channel is gone.
pub async fn stream_ndjson_events<R>(reader: R, tx: mpsc::Sender<FaultEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<FaultEvent>(line) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Skipping malformed fault event line: {}", e);
                    }
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Fault event stream read error: {}", e);
                return;
            }
        }
    }
}
