//! HTTP/2-over-TLS transport, backed by the `h2` crate. Each mesh stream
//! maps onto one HTTP/2 stream (a `POST` request whose body and response
//! body together form a bidirectional byte pipe), so multiplexing comes
//! directly from HTTP/2 rather than a hand-rolled framing layer.

use async_trait::async_trait;
use bytes::Bytes;
use h2::client::SendRequest;
use h2::server::SendResponse;
use http::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::{MeshStream, PeerConnection, TransportDialer, TransportListener, TransportType};
use crate::error::TransportError;

/// A single HTTP/2 request/response pair wrapped as an `AsyncRead +
/// AsyncWrite` byte stream.
struct H2Stream {
    send: h2::SendStream<Bytes>,
    recv: h2::RecvStream,
    read_buf: Bytes,
}

impl AsyncRead for H2Stream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let n = self.read_buf.len().min(buf.remaining());
                buf.put_slice(&self.read_buf[..n]);
                self.read_buf = self.read_buf.split_off(n);
                return std::task::Poll::Ready(Ok(()));
            }
            match self.recv.poll_data(cx) {
                std::task::Poll::Ready(Some(Ok(chunk))) => {
                    let _ = self.recv.flow_control().release_capacity(chunk.len());
                    self.read_buf = chunk;
                    continue;
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    return std::task::Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, e)))
                }
                std::task::Poll::Ready(None) => return std::task::Poll::Ready(Ok(())),
                std::task::Poll::Pending => return std::task::Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.send
            .send_data(Bytes::copy_from_slice(buf), false)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let _ = self.send.send_data(Bytes::new(), true);
        std::task::Poll::Ready(Ok(()))
    }
}

pub struct H2PeerConnection {
    remote_addr: SocketAddr,
    send_request: Option<Mutex<SendRequest<Bytes>>>,
    incoming: Mutex<mpsc::UnboundedReceiver<(Request<h2::RecvStream>, SendResponse<Bytes>)>>,
}

#[async_trait]
impl PeerConnection for H2PeerConnection {
    async fn open_stream(&self) -> Result<Box<dyn MeshStream>, TransportError> {
        let send_request = self
            .send_request
            .as_ref()
            .ok_or_else(|| TransportError::Handshake("h2 peer connection is server-side only".into()))?;
        let mut sr = send_request.lock().await;
        let request = Request::post("/mesh").body(()).expect("static request is well-formed");
        let (response_fut, send_stream) = sr
            .send_request(request, false)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let response = response_fut.await.map_err(|e| TransportError::Handshake(e.to_string()))?;
        let recv_stream = response.into_body();
        Ok(Box::new(H2Stream {
            send: send_stream,
            recv: recv_stream,
            read_buf: Bytes::new(),
        }))
    }

    async fn accept_stream(&self) -> Result<Box<dyn MeshStream>, TransportError> {
        let (request, mut responder) = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ConnectionLost)?;
        let recv_stream = request.into_body();
        let response = Response::builder()
            .status(StatusCode::OK)
            .body(())
            .expect("static response is well-formed");
        let send_stream = responder
            .send_response(response, false)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(Box::new(H2Stream {
            send: send_stream,
            recv: recv_stream,
            read_buf: Bytes::new(),
        }))
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn transport_type(&self) -> TransportType {
        TransportType::H2
    }

    async fn close(&self) {}
}

pub struct H2Listener {
    tcp: TcpListener,
    tls_acceptor: TlsAcceptor,
}

#[async_trait]
impl TransportListener for H2Listener {
    async fn accept(&self) -> Result<Box<dyn PeerConnection>, TransportError> {
        let (tcp_stream, remote_addr) = self.tcp.accept().await?;
        let tls_stream = self
            .tls_acceptor
            .accept(tcp_stream)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let mut h2_conn = h2::server::handshake(tls_stream)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(Ok((request, responder))) = h2_conn.accept().await {
                if incoming_tx.send((request, responder)).is_err() {
                    break;
                }
            }
        });

        Ok(Box::new(H2PeerConnection {
            remote_addr,
            send_request: None,
            incoming: Mutex::new(incoming_rx),
        }))
    }

    fn local_addr(&self) -> SocketAddr {
        self.tcp.local_addr().expect("bound listener has a local address")
    }
}

pub async fn bind(addr: SocketAddr, tls_config: Arc<rustls::ServerConfig>) -> Result<H2Listener, TransportError> {
    let tcp = TcpListener::bind(addr).await?;
    Ok(H2Listener {
        tcp,
        tls_acceptor: TlsAcceptor::from(tls_config),
    })
}

pub struct H2Dialer {
    tls_config: Arc<rustls::ClientConfig>,
}

impl H2Dialer {
    pub fn new(tls_config: Arc<rustls::ClientConfig>) -> Self {
        Self { tls_config }
    }
}

#[async_trait]
impl TransportDialer for H2Dialer {
    async fn dial(&self, addr: SocketAddr, server_name: &str) -> Result<Box<dyn PeerConnection>, TransportError> {
        let tcp_stream = TcpStream::connect(addr).await?;
        let connector = TlsConnector::from(self.tls_config.clone());
        let domain = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let tls_stream = connector
            .connect(domain, tcp_stream)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let (send_request, connection) = h2::client::handshake(tls_stream)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        tokio::spawn(async move {
            let _ = connection.await;
        });
        let (_incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Ok(Box::new(H2PeerConnection {
            remote_addr: addr,
            send_request: Some(Mutex::new(send_request)),
            incoming: Mutex::new(incoming_rx),
        }))
    }
}
