use super::proto::{NodeResponse, RequestEnvelope};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("i/o error talking to {addr}: {reason}")]
    Io { addr: String, reason: String },

    #[error("malformed message from {addr}: {reason}")]
    Codec { addr: String, reason: String },

    #[error("connection to {0} closed by peer")]
    Closed(String),
}

/// A reusable handle for unary calls to one node.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    fn addr(&self) -> &str;

    async fn call(&self, request: &RequestEnvelope) -> Result<NodeResponse, TransportError>;
}

/// Creates transport handles. Creating a handle does no I/O; connecting
/// happens on the first call.
pub trait NodeConnector: Send + Sync {
    fn connect(&self, addr: &str) -> Result<Arc<dyn NodeTransport>, TransportError>;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl NodeConnector for TcpConnector {
    fn connect(&self, addr: &str) -> Result<Arc<dyn NodeTransport>, TransportError> {
        Ok(Arc::new(TcpNodeTransport::new(addr, self.connect_timeout)))
    }
}

/// Line-delimited JSON over one TCP connection, redialed on demand.
///
/// Calls on the same handle are serialized. The stream is taken out of the
/// slot for the duration of a call and only put back after a complete
/// exchange, so a call abandoned mid-flight (e.g. by a timeout) never leaves
/// a half-read connection behind.
pub struct TcpNodeTransport {
    addr: String,
    connect_timeout: Duration,
    stream: Mutex<Option<BufReader<TcpStream>>>,
}

impl TcpNodeTransport {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            stream: Mutex::new(None),
        }
    }

    async fn dial(&self) -> Result<BufReader<TcpStream>, TransportError> {
        let connect_err = |reason: String| TransportError::Connect {
            addr: self.addr.clone(),
            reason,
        };
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| connect_err(format!("timed out after {:?}", self.connect_timeout)))?
            .map_err(|err| connect_err(err.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|err| connect_err(err.to_string()))?;
        Ok(BufReader::new(stream))
    }

    async fn exchange(
        &self,
        stream: &mut BufReader<TcpStream>,
        request: &RequestEnvelope,
    ) -> Result<NodeResponse, TransportError> {
        let io_err = |err: std::io::Error| TransportError::Io {
            addr: self.addr.clone(),
            reason: err.to_string(),
        };
        let codec_err = |err: serde_json::Error| TransportError::Codec {
            addr: self.addr.clone(),
            reason: err.to_string(),
        };

        let mut line = serde_json::to_vec(request).map_err(codec_err)?;
        line.push(b'\n');
        stream.get_mut().write_all(&line).await.map_err(io_err)?;
        stream.get_mut().flush().await.map_err(io_err)?;

        let mut reply = String::new();
        let read = stream.read_line(&mut reply).await.map_err(io_err)?;
        if read == 0 {
            return Err(TransportError::Closed(self.addr.clone()));
        }
        serde_json::from_str(reply.trim_end()).map_err(codec_err)
    }
}

#[async_trait]
impl NodeTransport for TcpNodeTransport {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn call(&self, request: &RequestEnvelope) -> Result<NodeResponse, TransportError> {
        let mut slot = self.stream.lock().await;
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => self.dial().await?,
        };
        let response = self.exchange(&mut stream, request).await?;
        *slot = Some(stream);
        Ok(response)
    }
}
