use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use hickory_proto::op::Message;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::ResolverProtocol;

// RFC 8484 says application/dns-message, but the DoH servers this targets
// still speak the media type of the older draft
// (draft-ietf-doh-dns-over-https-05).
const DOH_MIME_TYPE: &str = "application/dns-udpwireformat";

const MAX_RESPONSE_SIZE: usize = 4096;

/// A DNS exchange: send a query, get the reply.
#[async_trait]
pub trait Exchanger: Send + Sync {
    async fn exchange(&self, msg: &Message) -> Result<Message>;
}

/// A single upstream resolver speaking one transport.
pub struct Resolver {
    addr: String,
    transport: ResolverProtocol,
    timeout: Duration,
    /// SNI override for tcp-tls, parsed from `addr=servername`.
    server_name: String,
    tls: Option<tokio_rustls::TlsConnector>,
    http: Option<reqwest::Client>,
}

impl Resolver {
    pub fn new(addr: &str, transport: ResolverProtocol, timeout_dur: Duration) -> Result<Resolver> {
        let mut addr = addr.to_string();
        let mut server_name = String::new();
        let mut tls = None;
        let mut http = None;
        match transport {
            ResolverProtocol::TcpTls => {
                if let Some((host_port, name)) = addr.split_once('=') {
                    let host_port = host_port.to_string();
                    server_name = name.to_string();
                    addr = host_port;
                } else {
                    let host = addr.rsplit_once(':').map_or(addr.as_str(), |(h, _)| h);
                    server_name = host.trim_matches(['[', ']']).to_string();
                }
                tls = Some(tls_connector()?);
            }
            ResolverProtocol::Https => {
                let client = reqwest::Client::builder()
                    .timeout(timeout_dur)
                    .build()
                    .context("build doh client")?;
                http = Some(client);
            }
            ResolverProtocol::Udp | ResolverProtocol::Tcp => {}
        }
        Ok(Resolver {
            addr,
            transport,
            timeout: timeout_dur,
            server_name,
            tls,
            http,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn exchange_udp(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let bind = if self.addr.starts_with('[') || self.addr.matches(':').count() > 1 {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = UdpSocket::bind(bind).await.context("bind")?;
        socket.connect(&self.addr).await.context("connect")?;
        socket.send(packet).await.context("send")?;
        let mut buf = [0u8; MAX_RESPONSE_SIZE];
        loop {
            let len = socket.recv(&mut buf).await.context("recv")?;
            // The socket is connected and fresh, but still require the reply
            // to echo our transaction id.
            if len >= 2 && packet.len() >= 2 && buf[..2] == packet[..2] {
                return Ok(buf[..len].to_vec());
            }
        }
    }

    async fn exchange_tcp(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect(&self.addr).await.context("connect")?;
        framed_exchange(&mut stream, packet).await
    }

    async fn exchange_tls(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let connector = self.tls.as_ref().context("tls connector missing")?;
        let server_name = rustls::pki_types::ServerName::try_from(self.server_name.clone())
            .with_context(|| format!("invalid tls server name: {}", self.server_name))?;
        let stream = TcpStream::connect(&self.addr).await.context("connect")?;
        let mut stream = connector
            .connect(server_name, stream)
            .await
            .context("tls handshake")?;
        framed_exchange(&mut stream, packet).await
    }

    async fn exchange_https(&self, packet: Vec<u8>) -> Result<(Vec<u8>, Duration)> {
        let client = self.http.as_ref().context("http client missing")?;
        let start = Instant::now();
        let response = client
            .post(&self.addr)
            .header(CONTENT_TYPE, DOH_MIME_TYPE)
            .header(ACCEPT, DOH_MIME_TYPE)
            .body(packet)
            .send()
            .await
            .context("doh request")?;
        if response.status() != StatusCode::OK {
            bail!("server returned HTTP {}", response.status());
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with(DOH_MIME_TYPE) {
            bail!(
                "server returned unexpected content type {:?}, want {:?}",
                content_type,
                DOH_MIME_TYPE
            );
        }
        let body = response.bytes().await.context("read doh response")?;
        Ok((body.to_vec(), start.elapsed()))
    }
}

#[async_trait]
impl Exchanger for Resolver {
    async fn exchange(&self, msg: &Message) -> Result<Message> {
        let packet = msg.to_vec().context("encode query")?;
        let reply = match self.transport {
            ResolverProtocol::Udp => match timeout(self.timeout, self.exchange_udp(&packet)).await
            {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("udp timeout")),
            },
            ResolverProtocol::Tcp => match timeout(self.timeout, self.exchange_tcp(&packet)).await
            {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("tcp timeout")),
            },
            ResolverProtocol::TcpTls => {
                match timeout(self.timeout, self.exchange_tls(&packet)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("tls timeout")),
                }
            }
            // reqwest enforces its own timeout
            ResolverProtocol::Https => match self.exchange_https(packet).await {
                Ok((reply, rtt)) => {
                    debug!(upstream = %self.addr, rtt_ms = rtt.as_millis() as u64, "doh exchange");
                    Ok(reply)
                }
                Err(err) => Err(err),
            },
        }
        .with_context(|| format!("resolver {} failed", self.addr))?;
        Message::from_vec(&reply)
            .with_context(|| format!("resolver {} returned an invalid message", self.addr))
    }
}

/// Length-prefixed exchange used by both TCP and DoT, per RFC 1035 §4.2.2.
async fn framed_exchange<S>(stream: &mut S, packet: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if packet.len() > u16::MAX as usize {
        bail!("query too large for tcp");
    }
    let mut out = Vec::with_capacity(2 + packet.len());
    out.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    out.extend_from_slice(packet);
    stream.write_all(&out).await.context("write")?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.context("read len")?;
    let resp_len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; resp_len];
    stream.read_exact(&mut buf).await.context("read body")?;
    Ok(buf)
}

fn tls_connector() -> Result<tokio_rustls::TlsConnector> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
}

/// Fans a query out to every resolver at once and settles on the first
/// success; the remaining exchanges are cancelled when the winner returns.
pub struct Mux {
    resolvers: Vec<Arc<Resolver>>,
}

impl Mux {
    pub fn new(resolvers: Vec<Arc<Resolver>>) -> Mux {
        Mux { resolvers }
    }
}

#[async_trait]
impl Exchanger for Mux {
    async fn exchange(&self, msg: &Message) -> Result<Message> {
        if self.resolvers.is_empty() {
            bail!("no resolvers to query");
        }
        let mut pending: FuturesUnordered<_> = self
            .resolvers
            .iter()
            .map(|resolver| {
                let resolver = Arc::clone(resolver);
                async move { (resolver.addr().to_string(), resolver.exchange(msg).await) }
            })
            .collect();
        let mut last_err = None;
        while let Some((addr, result)) = pending.next().await {
            match result {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    warn!(upstream = %addr, error = %err, "upstream query failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no upstream replies")))
    }
}
