//! TCP server for a single remote call.
//!
//! Binds the listening socket, accepts exactly one client, decodes its
//! request, and traces the handling of it. The accepted connection is
//! closed before the listener; both are closed on every path.

use crate::protocol::{DecodeError, ValueReader};
use crate::remote_call::{handle_message, trace_call, MessageHandler};
use crate::request::IncomingRequest;
use crate::sdk::TracingSdk;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Pending connection queue length
const LISTEN_BACKLOG: i32 = 50;

/// Server instance
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    sdk: Arc<dyn TracingSdk>,
    handler: MessageHandler,
    accept_timeout: Option<Duration>,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr, sdk: Arc<dyn TracingSdk>) -> Result<Self, ServerError> {
        let listener = bind_listener(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Server {
            listener,
            local_addr,
            sdk,
            handler: handle_message,
            accept_timeout: None,
        })
    }

    /// Replace the business logic run for the received message.
    pub fn with_handler(mut self, handler: MessageHandler) -> Self {
        self.handler = handler;
        self
    }

    /// Stop waiting for a client after `timeout`. Waits forever by default.
    pub fn with_accept_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one client, handle its call, and shut down.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(address = %self.local_addr, "Waiting for clients");

        let (stream, peer) = self.accept().await?;
        info!(peer = %peer, "Client connected");

        let result = self.handle_connection(stream).await;
        debug!(peer = %peer, "Connection closed");

        drop(self.listener);
        debug!(address = %self.local_addr, "Listener closed");
        result
    }

    async fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        let accepted = match self.accept_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.listener.accept())
                .await
                .map_err(|_| ServerError::AcceptTimeout(timeout))?,
            None => self.listener.accept().await,
        };
        accepted.map_err(ServerError::Accept)
    }

    /// Decode the request and trace it. The stream is closed on return.
    async fn handle_connection(&self, stream: TcpStream) -> Result<(), ServerError> {
        let mut reader = ValueReader::new(stream);
        let request = IncomingRequest::read_from(&mut reader).await?;
        info!(tag = %request.tag, "received tag");

        trace_call(self.sdk.as_ref(), &request, self.handler);
        Ok(())
    }
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Errors that end the server run.
#[derive(Debug)]
pub enum ServerError {
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    Accept(std::io::Error),
    AcceptTimeout(Duration),
    Decode(DecodeError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind { addr, source } => write!(f, "failed to bind {addr}: {source}"),
            ServerError::Accept(e) => write!(f, "failed to accept connection: {e}"),
            ServerError::AcceptTimeout(timeout) => {
                write!(f, "no client connected within {}s", timeout.as_secs_f64())
            }
            ServerError::Decode(e) => write!(f, "failed to decode request: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
            ServerError::Accept(e) => Some(e),
            ServerError::AcceptTimeout(_) => None,
            ServerError::Decode(e) => Some(e),
        }
    }
}

impl From<DecodeError> for ServerError {
    fn from(e: DecodeError) -> Self {
        ServerError::Decode(e)
    }
}
