//! TCP adapter for networked interrogators.
//!
//! The BraggMeter closes idle sessions on its side, so the adapter does not
//! hold a connection: each [`Adapter::exchange`] connects, writes the request,
//! reads up to the `\n` delimiter and drops the socket. Connect, write and read
//! each carry the configured timeout.

use super::Adapter;
use crate::error::{AppResult, DaqError};
use crate::instrument::protocol::RESPONSE_DELIMITER;
use async_trait::async_trait;
use log::debug;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Per-exchange TCP link.
#[derive(Debug, Clone)]
pub struct TcpAdapter {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpAdapter {
    /// Creates an adapter for `host:port`. Nothing is opened until the first exchange.
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    /// Timeout applied to each of connect, write and read.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn open(&self) -> AppResult<TcpStream> {
        let addr = self.endpoint();
        match timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(DaqError::Disconnected(format!(
                "connect to {} failed: {}",
                addr, e
            ))),
            Err(_) => Err(DaqError::Disconnected(format!(
                "connect to {} timed out after {:?}",
                addr, self.timeout
            ))),
        }
    }
}

#[async_trait]
impl Adapter for TcpAdapter {
    async fn exchange(&self, request: &[u8]) -> AppResult<Vec<u8>> {
        let addr = self.endpoint();
        let mut stream = self.open().await?;
        let (reader, mut writer) = stream.split();

        match timeout(self.timeout, writer.write_all(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(DaqError::Disconnected(format!(
                    "write to {} failed: {}",
                    addr, e
                )))
            }
            Err(_) => {
                return Err(DaqError::Disconnected(format!(
                    "write to {} timed out after {:?}",
                    addr, self.timeout
                )))
            }
        }
        debug!(
            "[{}] Sent command: {}",
            addr,
            String::from_utf8_lossy(request).trim()
        );

        let mut reply = Vec::new();
        let mut reader = BufReader::new(reader);
        match timeout(self.timeout, reader.read_until(RESPONSE_DELIMITER, &mut reply)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(DaqError::Disconnected(format!(
                    "read from {} failed: {}",
                    addr, e
                )))
            }
            Err(_) => {
                return Err(DaqError::Disconnected(format!(
                    "read from {} timed out after {:?}",
                    addr, self.timeout
                )))
            }
        }

        if reply.last() != Some(&RESPONSE_DELIMITER) {
            return Err(DaqError::Disconnected(format!(
                "{} closed the connection before the end of the reply ({} bytes read)",
                addr,
                reply.len()
            )));
        }
        debug!(
            "[{}] Received response: {}",
            addr,
            String::from_utf8_lossy(&reply).trim()
        );
        Ok(reply)
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
