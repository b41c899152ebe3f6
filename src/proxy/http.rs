//! HTTP CONNECT client handshake

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::common::{Address, IntoStream, Result, Stream};
use crate::error::Error;

use super::ProxyConnector;

/// HTTP CONNECT proxy connector
pub struct HttpConnectConnector {
    username: Option<String>,
    password: Option<String>,
}

impl HttpConnectConnector {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        Self { username, password }
    }

    fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

#[async_trait]
impl ProxyConnector for HttpConnectConnector {
    async fn connect_through(&self, mut stream: Stream, target: &Address) -> Result<Stream> {
        let target = target.to_string();

        // Build CONNECT request
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);

        if self.has_auth() {
            let auth = format!(
                "{}:{}",
                self.username.as_deref().unwrap_or(""),
                self.password.as_deref().unwrap_or("")
            );
            let encoded = BASE64.encode(auth);
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
        }

        request.push_str("\r\n");

        stream.write_all(request.as_bytes()).await?;

        // Read response
        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        reader.read_line(&mut response_line).await?;

        let parts: Vec<&str> = response_line.trim().split_whitespace().collect();
        if parts.len() < 2 {
            return Err(Error::Protocol("invalid HTTP response".into()));
        }

        let status_code: u16 = parts[1]
            .parse()
            .map_err(|_| Error::Protocol("invalid status code".into()))?;

        if status_code != 200 {
            return Err(Error::Proxy(format!(
                "HTTP CONNECT failed: {}",
                response_line.trim()
            )));
        }

        // Skip remaining headers
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            if line.trim().is_empty() {
                break;
            }
        }

        // Keep the BufReader so already-buffered bytes are not lost
        Ok(reader.into_stream())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
