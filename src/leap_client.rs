use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{ProvisionError, Result};

pub const READ_REQUEST: &str = "ReadRequest";
pub const READ_RESPONSE: &str = "ReadResponse";
pub const PING_URL: &str = "/server/1/status/ping";

/// A LEAP request to send to the bridge.
#[derive(Debug, Clone, Serialize)]
pub struct LeapRequest {
    #[serde(rename = "CommuniqueType")]
    pub communique_type: String,
    #[serde(rename = "Header")]
    pub header: LeapHeader,
    #[serde(rename = "Body", skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeapHeader {
    #[serde(rename = "Url")]
    pub url: String,
}

impl LeapRequest {
    pub fn ping() -> Self {
        Self {
            communique_type: READ_REQUEST.to_string(),
            header: LeapHeader {
                url: PING_URL.to_string(),
            },
            body: None,
        }
    }
}

/// A LEAP message received from the bridge. Unsolicited messages may omit
/// the body.
#[derive(Debug, Clone, Deserialize)]
pub struct LeapMessage {
    #[serde(rename = "CommuniqueType")]
    pub communique_type: String,
    #[serde(rename = "Body", default)]
    pub body: serde_json::Value,
}

impl LeapMessage {
    /// `Body.PingResponse.LEAPVersion`, which firmware reports either as a
    /// string or as a bare number.
    pub fn leap_version(&self) -> Result<String> {
        match self.body.pointer("/PingResponse/LEAPVersion") {
            Some(serde_json::Value::String(v)) => Ok(v.clone()),
            Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
            _ => Err(ProvisionError::Protocol(
                "ReadResponse is missing Body.PingResponse.LEAPVersion".to_string(),
            )),
        }
    }
}

/// Write one request followed by the `\r\n` terminator.
pub async fn write_request<W>(writer: &mut W, req: &LeapRequest) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut msg = serde_json::to_string(req)
        .map_err(|e| ProvisionError::Protocol(format!("Failed to encode request: {}", e)))?;
    msg.push_str("\r\n");
    writer
        .write_all(msg.as_bytes())
        .await
        .map_err(|e| ProvisionError::Connection(format!("Failed to send request: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| ProvisionError::Connection(format!("Failed to send request: {}", e)))?;
    Ok(())
}

/// Read lines until the first `ReadResponse`, skipping any other message type.
/// The whole exchange shares one `timeout`, so a stream of unsolicited
/// messages cannot hold it open.
pub async fn read_response<R>(reader: &mut R, timeout: Duration) -> Result<LeapMessage>
where
    R: AsyncBufRead + Unpin,
{
    tokio::time::timeout(timeout, read_until_response(reader))
        .await
        .map_err(|_| {
            ProvisionError::Connection(format!(
                "Timed out after {}s waiting for bridge response",
                timeout.as_secs()
            ))
        })?
}

async fn read_until_response<R>(reader: &mut R) -> Result<LeapMessage>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidData => {
                ProvisionError::Protocol("Bridge sent non UTF-8 data".to_string())
            }
            _ => ProvisionError::Connection(format!("Read from bridge failed: {}", e)),
        })?;
        if n == 0 {
            return Err(ProvisionError::Protocol(
                "Connection closed before a ReadResponse was received".to_string(),
            ));
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let msg: LeapMessage = serde_json::from_str(trimmed).map_err(|e| {
            ProvisionError::Protocol(format!("Invalid LEAP message: {} (line: {})", e, trimmed))
        })?;
        if msg.communique_type == READ_RESPONSE {
            return Ok(msg);
        }
        debug!("Ignoring {} message from bridge", msg.communique_type);
    }
}
