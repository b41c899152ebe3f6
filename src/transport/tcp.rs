//! TCP transport implementation

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::common::{Address, IntoStream, Result, Stream};
use crate::error::Error;

use super::Transport;

/// Bound on a single connect attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP transport - raw TCP connections
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &Address) -> Result<Stream> {
        let connect = async {
            let stream = match addr {
                Address::Socket(socket_addr) => TcpStream::connect(socket_addr).await?,
                Address::Domain(domain, port) => {
                    TcpStream::connect(format!("{}:{}", domain, port)).await?
                }
            };
            Ok::<_, Error>(stream)
        };

        let stream = timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| Error::Timeout)??;

        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true)?;

        Ok(stream.into_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_local() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let transport = TcpTransport::new();
        let mut stream = transport.connect(&Address::Socket(addr)).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let transport = TcpTransport::new();
        // Port 1 is essentially never listening locally
        let result = transport
            .connect(&"127.0.0.1:1".parse::<Address>().unwrap())
            .await;
        assert!(result.is_err());
    }
}
