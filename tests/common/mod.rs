//! Shared test doubles: in-memory dialers and selectors, a minimal SOCKS5 server.

#![allow(dead_code)]

use async_trait::async_trait;
use socks_bridge::dialer::{BoxedStream, Dialer, Route, SelectDialer};
use socks_bridge::error::ProxyError;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

/// TLS acceptor presenting the `localhost` certificate signed by `fixtures/ca.pem`.
pub fn localhost_acceptor() -> TlsAcceptor {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(fixture("localhost.pem")).unwrap()))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(fixture("localhost-key.pem")).unwrap()))
        .unwrap()
        .unwrap();
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Hands out one prepared in-memory stream and records every dialed address.
pub struct PipeDialer {
    stream: Mutex<Option<DuplexStream>>,
    pub dialed: Mutex<Vec<String>>,
}

impl PipeDialer {
    pub fn new(stream: DuplexStream) -> Arc<Self> {
        Arc::new(Self {
            stream: Mutex::new(Some(stream)),
            dialed: Mutex::new(Vec::new()),
        })
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for PipeDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedStream, ProxyError> {
        self.dialed.lock().unwrap().push(addr.to_string());
        let stream = self.stream.lock().unwrap().take();
        match stream {
            Some(s) => Ok(Box::new(s)),
            None => Err(ProxyError::Connection("pipe already used".to_string())),
        }
    }

    fn route(&self) -> Route {
        Route::Socks5("mock:1080".to_string())
    }
}

/// Fails every dial.
pub struct FailingDialer;

#[async_trait]
impl Dialer for FailingDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedStream, ProxyError> {
        Err(ProxyError::Dial {
            addr: addr.to_string(),
            reason: "connection refused".to_string(),
        })
    }

    fn route(&self) -> Route {
        Route::Socks5("mock:1080".to_string())
    }
}

/// Always returns the same dialer.
pub struct FixedSelector(pub Arc<dyn Dialer>);

impl SelectDialer for FixedSelector {
    fn select(&self) -> Arc<dyn Dialer> {
        self.0.clone()
    }
}

/// Minimal no-auth SOCKS5 server supporting CONNECT to IPv4, IPv6 and domain targets.
pub struct Socks5Server {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
}

impl Socks5Server {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _ = serve_socks5(stream).await;
                });
            }
        });

        Self { addr, connections }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve_socks5(mut client: TcpStream) -> std::io::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[5, 0]).await?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let host = match request[3] {
        1 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        3 => {
            let len = client.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).to_string()
        }
        4 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            format!("[{}]", std::net::Ipv6Addr::from(ip))
        }
        _ => return Ok(()),
    };
    let port = client.read_u16().await?;

    let mut target = match TcpStream::connect(format!("{}:{}", host, port)).await {
        Ok(target) => target,
        Err(_) => {
            client.write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
            return Ok(());
        }
    };
    client.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
    tokio::io::copy_bidirectional(&mut client, &mut target).await?;
    Ok(())
}

/// TCP echo server on an ephemeral loopback port.
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}
