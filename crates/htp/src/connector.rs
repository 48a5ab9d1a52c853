//! Reachability polling against the helper process.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

use crate::protocol::{self, ClientFrame, WorkerFrame};

/// A handshaken connection to the helper. Dropping it closes the channel.
pub struct WorkerConnection {
    pub lines: Lines<BufReader<OwnedReadHalf>>,
    pub writer: OwnedWriteHalf,
}

/// Polls connect + handshake against the worker's loopback endpoint.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    addr: SocketAddr,
    token: String,
    node: String,
    poll_interval: Duration,
}

impl ProcessConnector {
    pub fn new(
        port: u16,
        token: impl Into<String>,
        node: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            token: token.into(),
            node: node.into(),
            poll_interval,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Canonical name of the worker this connector targets.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Connect and run the `Hello`/`HelloAck` handshake.
    pub async fn open(&self) -> std::io::Result<WorkerConnection> {
        let stream = TcpStream::connect(self.addr).await?;
        let (read, mut writer) = stream.into_split();
        protocol::write_frame(
            &mut writer,
            &ClientFrame::Hello {
                token: self.token.clone(),
                node: self.node.clone(),
            },
        )
        .await?;
        let mut lines = BufReader::new(read).lines();
        match protocol::read_frame::<_, WorkerFrame>(&mut lines).await? {
            Some(WorkerFrame::HelloAck { .. }) => Ok(WorkerConnection { lines, writer }),
            other => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("handshake rejected: {other:?}"),
            )),
        }
    }

    /// One connect + handshake + ping attempt, bounded by a single poll
    /// interval.
    pub async fn probe(&self) -> bool {
        let attempt = async {
            let mut conn = self.open().await?;
            protocol::write_frame(&mut conn.writer, &ClientFrame::Ping).await?;
            match protocol::read_frame::<_, WorkerFrame>(&mut conn.lines).await? {
                Some(WorkerFrame::Pong) => Ok(()),
                other => Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unexpected ping reply: {other:?}"),
                )),
            }
        };
        match tokio::time::timeout(self.poll_interval, attempt).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                trace!(addr = %self.addr, error = %e, "worker probe failed");
                false
            }
            Err(_) => {
                trace!(addr = %self.addr, "worker probe timed out");
                false
            }
        }
    }

    /// Poll until the worker is reachable or the budget runs out. Sleeps a
    /// fixed poll interval between attempts; never blocks longer than
    /// `budget` plus one interval of slack.
    pub async fn wait_connected(&self, budget: Duration) -> bool {
        let interval_ms = self.poll_interval.as_millis() as i64;
        let mut remaining_ms = budget.as_millis() as i64;
        loop {
            if self.probe().await {
                return true;
            }
            if remaining_ms <= 0 {
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
            remaining_ms -= interval_ms;
        }
    }
}
