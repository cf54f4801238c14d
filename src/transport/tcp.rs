use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{insecure_client_config, ClientHandler, ControlClient, ControlTransport};

/// Upper bound on one control line.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Newline-framed client over any byte stream.
pub struct LineClient<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    peer: String,
    stop: CancellationToken,
}

impl<S: AsyncRead + AsyncWrite + Send> LineClient<S> {
    pub fn new(stream: S, peer: String, stop: CancellationToken) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer: write,
            peer,
            stop,
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send> ControlClient for LineClient<S> {
    async fn send_line(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let mut limited = (&mut self.reader).take(MAX_LINE_LEN as u64);
        let n = tokio::select! {
            _ = self.stop.cancelled() => anyhow::bail!("transport stopped"),
            n = limited.read_until(b'\n', &mut line) => n?,
        };
        if n == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') && n >= MAX_LINE_LEN {
            anyhow::bail!("control line exceeds {MAX_LINE_LEN} bytes");
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        Ok(Some(line))
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Raw TCP control transport, optionally wrapped in TLS.
pub struct LineTransport {
    tls: Option<TlsAcceptor>,
    stop: Mutex<CancellationToken>,
}

impl LineTransport {
    pub fn new(tls: Option<TlsAcceptor>) -> Self {
        Self {
            tls,
            stop: Mutex::new(CancellationToken::new()),
        }
    }
}

#[async_trait]
impl ControlTransport for LineTransport {
    async fn listen(&self, host: &str, handler: ClientHandler) -> Result<SocketAddr> {
        let listener = TcpListener::bind(host)
            .await
            .with_context(|| format!("binding control socket on {host}"))?;
        let addr = listener.local_addr()?;
        let stop = {
            let mut guard = self.stop.lock();
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
            guard.clone()
        };
        let tls = self.tls.clone();
        info!(listen = %addr, tls = tls.is_some(), "Control socket listening");

        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            warn!(error = %e, "Control accept failed");
                            continue;
                        }
                    },
                };
                let handler = handler.clone();
                let stop = stop.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    let peer = peer.to_string();
                    match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => handler(Box::new(LineClient::new(tls_stream, peer, stop))).await,
                            Err(e) => debug!(peer = %peer, error = %e, "Control TLS handshake failed"),
                        },
                        None => handler(Box::new(LineClient::new(stream, peer, stop))).await,
                    }
                });
            }
            debug!("Control accept loop exited");
        });
        Ok(addr)
    }

    fn stop(&self) {
        self.stop.lock().cancel();
    }
}

/// Dial a line transport as a client.
pub async fn connect(host: &str, tls: bool) -> Result<Box<dyn ControlClient>> {
    let stream = TcpStream::connect(host)
        .await
        .with_context(|| format!("connecting to {host}"))?;
    let never = CancellationToken::new();
    if !tls {
        return Ok(Box::new(LineClient::new(stream, host.to_string(), never)));
    }
    let name = host.rsplit_once(':').map_or(host, |(h, _)| h).to_string();
    let server_name = ServerName::try_from(name).context("invalid TLS server name")?;
    let connector = TlsConnector::from(insecure_client_config());
    let stream = connector
        .connect(server_name, stream)
        .await
        .with_context(|| format!("TLS handshake with {host}"))?;
    Ok(Box::new(LineClient::new(stream, host.to_string(), never)))
}
