//! Connection session - TCP transport to the receiver plus the identity
//! handshake.

use crate::error::{Result, SyncError};
use crate::protocol::{self, MessageType, Request, Response, PROTOCOL_VERSION};
use crate::transport::{Connected, Connector, Status, SyncService};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

/// Open request/response channel to one receiver.
pub struct ConnectionSession<S = TcpStream> {
    stream: BufStream<S>,
    local_ip: IpAddr,
    call_timeout: Duration,
}

impl ConnectionSession<TcpStream> {
    /// Open a TCP connection to `addr` (host:port).
    pub async fn connect(addr: &str, call_timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(call_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SyncError::Connect {
                addr: addr.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| SyncError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true).map_err(SyncError::connection)?;

        let local_ip = stream
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        tracing::info!("Connected to receiver {}", addr);
        Ok(Self::new(stream, local_ip, call_timeout))
    }
}

/// Connects to the configured receiver over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    call_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            call_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Connected> {
        let session = ConnectionSession::connect(&self.addr, self.call_timeout).await?;
        let caller_address = session.caller_address();
        Ok(Connected {
            service: Box::new(session),
            caller_address,
        })
    }
}

impl<S> ConnectionSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, local_ip: IpAddr, call_timeout: Duration) -> Self {
        Self {
            stream: BufStream::new(stream),
            local_ip,
            call_timeout,
        }
    }

    /// Address the receiver uses to authorize this sender
    pub fn caller_address(&self) -> String {
        self.local_ip.to_string()
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        let frame = request
            .encode()
            .map_err(|e| SyncError::Protocol(e.to_string()))?;

        let call_timeout = self.call_timeout;
        let stream = &mut self.stream;
        let exchange = async move {
            protocol::write_frame(stream, &frame).await?;
            protocol::read_frame(stream).await
        };

        let (msg_type, payload) = tokio::time::timeout(call_timeout, exchange)
            .await
            .map_err(|_| {
                SyncError::Connection(format!(
                    "{:?} timed out after {:?}",
                    request.message_type(),
                    call_timeout
                ))
            })?
            .map_err(SyncError::connection)?;

        match Response::decode(msg_type, payload) {
            Ok(Response::Fatal { code, message }) => Err(SyncError::Protocol(format!(
                "receiver fatal error {}: {}",
                code, message
            ))),
            Ok(response) => Ok(response),
            Err(e) => Err(SyncError::Protocol(e.to_string())),
        }
    }

    async fn call_status(&mut self, request: Request) -> Result<Status> {
        let expected = request.message_type();
        match self.call(request).await? {
            Response::Status { ok } => Ok(Status::from(ok)),
            other => Err(unexpected(expected, &other)),
        }
    }
}

fn unexpected(request: MessageType, response: &Response) -> SyncError {
    SyncError::Protocol(format!(
        "unexpected response {:?} to {:?}",
        response, request
    ))
}

#[async_trait]
impl<S> SyncService for ConnectionSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn check_identity(&mut self, caller_address: &str) -> Result<Status> {
        self.call_status(Request::CheckIdentity {
            version: PROTOCOL_VERSION,
            address: caller_address.to_string(),
        })
        .await
    }

    async fn start_storage_group(&mut self, name: &str) -> Result<Status> {
        self.call_status(Request::StartStorageGroup {
            name: name.to_string(),
        })
        .await
    }

    async fn init_transfer(&mut self, name: &str) -> Result<Status> {
        self.call_status(Request::InitTransfer {
            name: name.to_string(),
        })
        .await
    }

    async fn send_chunk(&mut self, data: Bytes) -> Result<Status> {
        self.call_status(Request::SendChunk { data }).await
    }

    async fn check_digest(&mut self, local_digest: &str) -> Result<String> {
        match self
            .call(Request::CheckDigest {
                digest: local_digest.to_string(),
            })
            .await?
        {
            Response::Digest { digest } => Ok(digest),
            other => Err(unexpected(MessageType::CheckDigest, &other)),
        }
    }

    async fn notify_deleted_name(&mut self, name: &str) -> Result<Status> {
        self.call_status(Request::NotifyDeletedName {
            name: name.to_string(),
        })
        .await
    }

    async fn end_session(&mut self) -> Result<()> {
        self.call_status(Request::EndSession).await.map(|_| ())
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("Transport shutdown: {}", e);
        }
    }
}

/// Confirm the sender's identity. A refusal is [`SyncError::IdentityRejected`].
pub async fn handshake<T: SyncService + ?Sized>(service: &mut T, caller_address: &str) -> Result<()> {
    match service.check_identity(caller_address).await? {
        Status::Success => {
            tracing::info!("Receiver accepted sender {}", caller_address);
            Ok(())
        }
        Status::Failure => Err(SyncError::IdentityRejected(caller_address.to_string())),
    }
}
