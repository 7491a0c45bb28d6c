//! WebSocket-over-TLS transport. Unlike QUIC, a WSS connection is a single
//! TCP+TLS byte stream, so mesh streams are multiplexed over it with a small
//! internal framing: `substream_id(u32) | kind(u8) | len(u32) | data`. One
//! read task demultiplexes inbound WebSocket messages into per-substream
//! channels; one write task serializes outbound messages, mirroring the
//! single-reader/single-writer-task-per-connection model used everywhere
//! else in this crate.

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, MaybeTlsStream, WebSocketStream};

use super::{MeshStream, PeerConnection, TransportDialer, TransportListener, TransportType};
use crate::error::TransportError;

const KIND_OPEN: u8 = 1;
const KIND_DATA: u8 = 2;
const KIND_CLOSE: u8 = 3;

struct Substream {
    to_conn: mpsc::UnboundedSender<(u32, u8, Vec<u8>)>,
    from_conn: mpsc::UnboundedReceiver<Vec<u8>>,
    id: u32,
    read_buf: BytesMut,
    closed: bool,
}

impl AsyncRead for Substream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        if !self.read_buf.is_empty() {
            let n = self.read_buf.len().min(buf.remaining());
            buf.put_slice(&self.read_buf[..n]);
            self.read_buf.advance(n);
            return std::task::Poll::Ready(Ok(()));
        }
        if self.closed {
            return std::task::Poll::Ready(Ok(()));
        }
        match self.from_conn.poll_recv(cx) {
            std::task::Poll::Ready(Some(data)) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.read_buf.extend_from_slice(&data[n..]);
                }
                std::task::Poll::Ready(Ok(()))
            }
            std::task::Poll::Ready(None) => {
                self.closed = true;
                std::task::Poll::Ready(Ok(()))
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl AsyncWrite for Substream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let id = self.id;
        self.to_conn
            .send((id, KIND_DATA, buf.to_vec()))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection closed"))?;
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let id = self.id;
        let _ = self.to_conn.send((id, KIND_CLOSE, Vec::new()));
        std::task::Poll::Ready(Ok(()))
    }
}

pub struct WssPeerConnection {
    remote_addr: SocketAddr,
    to_conn: mpsc::UnboundedSender<(u32, u8, Vec<u8>)>,
    next_id: AtomicU32,
    pending_accept: tokio::sync::Mutex<mpsc::UnboundedReceiver<(u32, mpsc::UnboundedReceiver<Vec<u8>>)>>,
    substream_registry: Arc<DashMap<u32, mpsc::UnboundedSender<Vec<u8>>>>,
}

fn spawn_io_tasks<S>(
    ws: WebSocketStream<S>,
    registry: Arc<DashMap<u32, mpsc::UnboundedSender<Vec<u8>>>>,
    accept_tx: mpsc::UnboundedSender<(u32, mpsc::UnboundedReceiver<Vec<u8>>)>,
) -> mpsc::UnboundedSender<(u32, u8, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (to_conn_tx, mut to_conn_rx) = mpsc::unbounded_channel::<(u32, u8, Vec<u8>)>();
    let (mut sink, mut source) = ws.split();

    tokio::spawn(async move {
        while let Some((id, kind, data)) = to_conn_rx.recv().await {
            let mut frame = BytesMut::with_capacity(9 + data.len());
            frame.put_u32(id);
            frame.put_u8(kind);
            frame.put_u32(data.len() as u32);
            frame.put_slice(&data);
            if sink.send(Message::Binary(frame.freeze().to_vec().into())).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(Ok(msg)) = source.next().await {
            let Message::Binary(bytes) = msg else { continue };
            if bytes.len() < 9 {
                continue;
            }
            let id = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
            let kind = bytes[4];
            let len = u32::from_be_bytes(bytes[5..9].try_into().unwrap()) as usize;
            if bytes.len() < 9 + len {
                continue;
            }
            let payload = bytes[9..9 + len].to_vec();
            match kind {
                KIND_OPEN => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    registry.insert(id, tx);
                    let _ = accept_tx.send((id, rx));
                }
                KIND_DATA => {
                    if let Some(tx) = registry.get(&id) {
                        let _ = tx.send(payload);
                    }
                }
                KIND_CLOSE => {
                    registry.remove(&id);
                }
                _ => {}
            }
        }
    });

    to_conn_tx
}

#[async_trait]
impl PeerConnection for WssPeerConnection {
    async fn open_stream(&self) -> Result<Box<dyn MeshStream>, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.substream_registry.insert(id, tx);
        self.to_conn
            .send((id, KIND_OPEN, Vec::new()))
            .map_err(|_| TransportError::ConnectionLost)?;
        Ok(Box::new(Substream {
            to_conn: self.to_conn.clone(),
            from_conn: rx,
            id,
            read_buf: BytesMut::new(),
            closed: false,
        }))
    }

    async fn accept_stream(&self) -> Result<Box<dyn MeshStream>, TransportError> {
        let (id, rx) = self
            .pending_accept
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ConnectionLost)?;
        Ok(Box::new(Substream {
            to_conn: self.to_conn.clone(),
            from_conn: rx,
            id,
            read_buf: BytesMut::new(),
            closed: false,
        }))
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Wss
    }

    async fn close(&self) {}
}

pub struct WssListener {
    tcp: TcpListener,
    tls_acceptor: tokio_rustls::TlsAcceptor,
}

#[async_trait]
impl TransportListener for WssListener {
    async fn accept(&self) -> Result<Box<dyn PeerConnection>, TransportError> {
        let (tcp_stream, remote_addr) = self.tcp.accept().await?;
        let tls_stream = self
            .tls_acceptor
            .accept(tcp_stream)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let ws = tokio_tungstenite::accept_async(tls_stream)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let registry = Arc::new(DashMap::new());
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let to_conn = spawn_io_tasks(ws, registry.clone(), accept_tx);
        Ok(Box::new(WssPeerConnection {
            remote_addr,
            to_conn,
            next_id: AtomicU32::new(1),
            pending_accept: tokio::sync::Mutex::new(accept_rx),
            substream_registry: registry,
        }))
    }

    fn local_addr(&self) -> SocketAddr {
        self.tcp.local_addr().expect("bound listener has a local address")
    }
}

pub async fn bind(addr: SocketAddr, tls_config: Arc<rustls::ServerConfig>) -> Result<WssListener, TransportError> {
    let tcp = TcpListener::bind(addr).await?;
    Ok(WssListener {
        tcp,
        tls_acceptor: tokio_rustls::TlsAcceptor::from(tls_config),
    })
}

pub struct WssDialer {
    tls_config: Arc<rustls::ClientConfig>,
    path: String,
}

impl WssDialer {
    pub fn new(tls_config: Arc<rustls::ClientConfig>, path: impl Into<String>) -> Self {
        Self {
            tls_config,
            path: path.into(),
        }
    }
}

#[async_trait]
impl TransportDialer for WssDialer {
    async fn dial(&self, addr: SocketAddr, server_name: &str) -> Result<Box<dyn PeerConnection>, TransportError> {
        let tcp_stream = TcpStream::connect(addr).await?;
        let connector = tokio_tungstenite::Connector::Rustls(self.tls_config.clone());
        let url = format!("wss://{}{}", server_name, self.path);
        let request = url.into_client_request().map_err(|e| TransportError::Handshake(e.to_string()))?;
        let (ws, _) = client_async_tls_with_config(request, tcp_stream, None, Some(connector))
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let registry = Arc::new(DashMap::new());
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let to_conn = spawn_io_tasks(ws, registry.clone(), accept_tx);
        Ok(Box::new(WssPeerConnection {
            remote_addr: addr,
            to_conn,
            next_id: AtomicU32::new(1),
            pending_accept: tokio::sync::Mutex::new(accept_rx),
            substream_registry: registry,
        }))
    }
}

use tokio_tungstenite::tungstenite::client::IntoClientRequest;
