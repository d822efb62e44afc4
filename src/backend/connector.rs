use std::io;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::warn;

/// Byte stream to a server.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxTransport = Box<dyn Transport>;

/// Opens transports to endpoints. Name resolution happens here.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> io::Result<BoxTransport>;
}

/// Plain TCP with `TCP_NODELAY` and OS keepalive.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    keepalive: Option<Duration>,
}

impl TcpConnector {
    pub fn new(keepalive: Option<Duration>) -> Self {
        Self { keepalive }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Some(Duration::from_secs(60)))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &str) -> io::Result<BoxTransport> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        #[cfg(any(unix, windows))]
        {
            if let Some(period) = self.keepalive.filter(|period| !period.is_zero()) {
                let keepalive = TcpKeepalive::new()
                    .with_time(period)
                    .with_interval(period);
                if let Err(err) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
                    warn!(
                        endpoint = %endpoint,
                        error = %err,
                        "failed to enable TCP keepalive"
                    );
                }
            }
        }
        Ok(Box::new(stream))
    }
}
