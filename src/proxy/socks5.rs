//! SOCKS5 client handshake (RFC 1928 / RFC 1929)

use std::net::IpAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{Address, Result, Stream};
use crate::error::Error;

use super::ProxyConnector;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;

/// SOCKS5 proxy connector
pub struct Socks5Connector {
    username: Option<String>,
    password: Option<String>,
}

impl Socks5Connector {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        Self { username, password }
    }

    fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

#[async_trait]
impl ProxyConnector for Socks5Connector {
    async fn connect_through(&self, mut stream: Stream, target: &Address) -> Result<Stream> {
        // 1. Greeting: offer password auth only when we have credentials
        let offered = if self.has_auth() { AUTH_PASSWORD } else { AUTH_NONE };
        stream.write_all(&[SOCKS5_VERSION, 0x01, offered]).await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;

        if choice[0] != SOCKS5_VERSION {
            return Err(Error::Protocol(format!(
                "unexpected SOCKS version: {}",
                choice[0]
            )));
        }
        if choice[1] == AUTH_NO_ACCEPTABLE || choice[1] != offered {
            return Err(Error::Protocol(format!(
                "proxy rejected auth method: {:#04x}",
                choice[1]
            )));
        }

        // 2. Username/password subnegotiation
        if choice[1] == AUTH_PASSWORD {
            let user = self.username.as_deref().unwrap_or("");
            let pass = self.password.as_deref().unwrap_or("");
            if user.len() > 255 || pass.len() > 255 {
                return Err(Error::Protocol("SOCKS5 credentials too long".into()));
            }

            let mut req = Vec::with_capacity(3 + user.len() + pass.len());
            req.push(0x01);
            req.push(user.len() as u8);
            req.extend_from_slice(user.as_bytes());
            req.push(pass.len() as u8);
            req.extend_from_slice(pass.as_bytes());
            stream.write_all(&req).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(Error::Protocol("SOCKS5 authentication failed".into()));
            }
        }

        // 3. CONNECT request
        let mut req = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
        match target {
            Address::Socket(addr) => match addr.ip() {
                IpAddr::V4(ip) => {
                    req.push(ATYP_IPV4);
                    req.extend_from_slice(&ip.octets());
                }
                IpAddr::V6(ip) => {
                    req.push(ATYP_IPV6);
                    req.extend_from_slice(&ip.octets());
                }
            },
            Address::Domain(domain, _) => {
                if domain.len() > 255 {
                    return Err(Error::Protocol("domain too long for SOCKS5".into()));
                }
                req.push(ATYP_DOMAIN);
                req.push(domain.len() as u8);
                req.extend_from_slice(domain.as_bytes());
            }
        }
        req.extend_from_slice(&target.port().to_be_bytes());
        stream.write_all(&req).await?;

        // 4. Reply
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::Protocol("invalid SOCKS version in reply".into()));
        }
        if header[1] != REP_SUCCESS {
            return Err(Error::Proxy(format!(
                "SOCKS5 CONNECT failed: {}",
                reply_message(header[1])
            )));
        }

        // Consume the bound address, which we do not use
        match header[3] {
            ATYP_IPV4 => {
                let mut skip = [0u8; 4 + 2];
                stream.read_exact(&mut skip).await?;
            }
            ATYP_IPV6 => {
                let mut skip = [0u8; 16 + 2];
                stream.read_exact(&mut skip).await?;
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut skip = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut skip).await?;
            }
            atyp => {
                return Err(Error::Protocol(format!(
                    "unsupported address type in reply: {}",
                    atyp
                )));
            }
        }

        Ok(stream)
    }

    fn name(&self) -> &'static str {
        "socks5"
    }
}

fn reply_message(rep: u8) -> &'static str {
    match rep {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown failure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Minimal scripted SOCKS5 server for the happy path.
    async fn fake_server(
        mut stream: tokio::io::DuplexStream,
        expect_auth: bool,
    ) -> Vec<u8> {
        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).await.unwrap();
        let offered = greeting[2];
        stream.write_all(&[SOCKS5_VERSION, offered]).await.unwrap();

        if expect_auth {
            let mut hdr = [0u8; 2];
            stream.read_exact(&mut hdr).await.unwrap();
            let mut user = vec![0u8; hdr[1] as usize];
            stream.read_exact(&mut user).await.unwrap();
            let mut plen = [0u8; 1];
            stream.read_exact(&mut plen).await.unwrap();
            let mut pass = vec![0u8; plen[0] as usize];
            stream.read_exact(&mut pass).await.unwrap();
            stream.write_all(&[0x01, 0x00]).await.unwrap();
        }

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let mut request = header.to_vec();
        match header[3] {
            ATYP_IPV4 => {
                let mut rest = [0u8; 6];
                stream.read_exact(&mut rest).await.unwrap();
                request.extend_from_slice(&rest);
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await.unwrap();
                let mut rest = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut rest).await.unwrap();
                request.push(len[0]);
                request.extend_from_slice(&rest);
            }
            _ => panic!("unexpected atyp"),
        }

        // Success reply with a zero IPv4 bound address
        stream
            .write_all(&[SOCKS5_VERSION, REP_SUCCESS, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        request
    }

    #[tokio::test]
    async fn test_connect_no_auth() {
        let (client, server) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(fake_server(server, false));

        let connector = Socks5Connector::new(None, None);
        let target = Address::domain("relay.example.com", 443);
        connector
            .connect_through(Box::new(client), &target)
            .await
            .unwrap();

        let request = server_task.await.unwrap();
        assert_eq!(request[1], CMD_CONNECT);
        assert_eq!(request[3], ATYP_DOMAIN);
    }

    #[tokio::test]
    async fn test_connect_with_auth() {
        let (client, server) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(fake_server(server, true));

        let connector = Socks5Connector::new(Some("u".into()), Some("p".into()));
        let target: Address = "10.0.0.1:80".parse().unwrap();
        connector
            .connect_through(Box::new(client), &target)
            .await
            .unwrap();

        let request = server_task.await.unwrap();
        assert_eq!(request[3], ATYP_IPV4);
    }

    #[tokio::test]
    async fn test_connect_refused_by_proxy() {
        let (client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await.unwrap();

            let mut header = [0u8; 4];
            server.read_exact(&mut header).await.unwrap();
            let mut rest = [0u8; 6];
            server.read_exact(&mut rest).await.unwrap();
            // connection refused
            server
                .write_all(&[SOCKS5_VERSION, 0x05, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let connector = Socks5Connector::new(None, None);
        let target: Address = "10.0.0.1:80".parse().unwrap();
        let err = connector
            .connect_through(Box::new(client), &target)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }
}
