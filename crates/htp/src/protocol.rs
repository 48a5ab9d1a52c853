//! Wire protocol between the host and the helper process.
//!
//! JSON Lines (one object per line) over loopback TCP. Every connection
//! starts with a `Hello`/`HelloAck` token handshake; dispatch replies are
//! correlated by a per-call id so stale replies from a previous helper
//! incarnation can never be mistaken for a live one.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use uuid::Uuid;

use crate::task::ExecutionOutcome;

/// Frames sent from the host to the helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Connection handshake; must be the first frame on every connection.
    Hello { token: String, node: String },
    /// Reachability check.
    Ping,
    /// Fire-and-forget work submission.
    Dispatch {
        id: Uuid,
        kind: String,
        input: Value,
        timeout_ms: Option<u64>,
    },
    /// Remote termination command; the helper exits without replying.
    Halt,
}

/// Frames sent from the helper back to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerFrame {
    /// Handshake accepted.
    HelloAck { node: String },
    Pong,
    /// Reply to a dispatch, correlated by id.
    Result { id: Uuid, outcome: ExecutionOutcome },
}

/// Write one frame as a JSON line, flushing immediately.
pub async fn write_frame<W, F>(writer: &mut W, frame: &F) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    F: Serialize,
{
    let mut line = serde_json::to_vec(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Read the next frame, skipping blank lines. `None` on a clean EOF.
pub async fn read_frame<R, F>(lines: &mut Lines<BufReader<R>>) -> std::io::Result<Option<F>>
where
    R: AsyncRead + Unpin,
    F: DeserializeOwned,
{
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(&line)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatch_frame_shape_is_stable() {
        let id = Uuid::new_v4();
        let frame = ClientFrame::Dispatch {
            id,
            kind: "echo".into(),
            input: json!({ "n": 1 }),
            timeout_ms: Some(250),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "Dispatch");
        assert_eq!(json["kind"], "echo");
        assert_eq!(json["timeout_ms"], 250);
        assert_eq!(json["id"], json!(id.to_string()));
    }

    #[tokio::test]
    async fn frames_roundtrip_over_a_buffer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &ClientFrame::Ping).await.unwrap();
        write_frame(
            &mut buf,
            &WorkerFrame::Result {
                id: Uuid::nil(),
                outcome: ExecutionOutcome::TimedOut,
            },
        )
        .await
        .unwrap();

        let mut lines = BufReader::new(buf.as_slice()).lines();
        let first: ClientFrame = read_frame(&mut lines).await.unwrap().unwrap();
        assert!(matches!(first, ClientFrame::Ping));
        let second: WorkerFrame = read_frame(&mut lines).await.unwrap().unwrap();
        assert!(matches!(
            second,
            WorkerFrame::Result {
                outcome: ExecutionOutcome::TimedOut,
                ..
            }
        ));
        let eof: std::io::Result<Option<ClientFrame>> = read_frame(&mut lines).await;
        assert!(eof.unwrap().is_none());
    }
}
