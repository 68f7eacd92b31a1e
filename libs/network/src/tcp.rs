//! TCP socket tasks
//!
//! Each connection gets a reader task that forwards raw bytes to the
//! middleman and a writer task that drains the connection's outgoing queue.
//! Framing is not done here: BASP handshakes and frames are cut out of the
//! byte stream by `BaspConnection`.

use crate::error::{NetworkError, Result};
use crate::router::ConnectionId;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 64 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Socket activity reported to the middleman
#[derive(Debug)]
pub(crate) enum SocketEvent {
    Accepted {
        port: u16,
        stream: TcpStream,
        remote: SocketAddr,
    },
    Connected {
        request: u64,
        target: String,
        result: Result<TcpStream>,
    },
    Bound {
        request: u64,
        target: String,
        result: Result<TcpListener>,
    },
    Received {
        connection: ConnectionId,
        data: Bytes,
    },
    /// Reader hit EOF or an error, or the writer failed
    Closed {
        connection: ConnectionId,
        error: Option<String>,
    },
}

/// Binds a listener in the background and reports it as `Bound`;
/// `port` 0 picks an ephemeral port
pub(crate) fn spawn_bind<T>(host: String, port: u16, request: u64, events: UnboundedSender<T>)
where
    T: From<SocketEvent> + Send + 'static,
{
    tokio::spawn(async move {
        let target = format!("{host}:{port}");
        let result = TcpListener::bind(&target)
            .await
            .map_err(|e| NetworkError::bind_failure(&target, e));
        let _ = events.send(
            SocketEvent::Bound {
                request,
                target,
                result,
            }
            .into(),
        );
    });
}

fn configure(stream: &TcpStream, nodelay: bool) {
    if nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
    }
}

pub(crate) fn spawn_acceptor<T>(
    listener: TcpListener,
    port: u16,
    nodelay: bool,
    events: UnboundedSender<T>,
) -> JoinHandle<()>
where
    T: From<SocketEvent> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    debug!(port, %remote, "Accepted TCP connection");
                    configure(&stream, nodelay);
                    let event = SocketEvent::Accepted {
                        port,
                        stream,
                        remote,
                    };
                    if events.send(event.into()).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(port, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    })
}

/// Connects in the background and reports the outcome as `Connected`
pub(crate) fn spawn_connect<T>(
    host: String,
    port: u16,
    timeout: Duration,
    nodelay: bool,
    request: u64,
    events: UnboundedSender<T>,
) where
    T: From<SocketEvent> + Send + 'static,
{
    tokio::spawn(async move {
        let target = format!("{host}:{port}");
        let result = match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
            Ok(Ok(stream)) => {
                configure(&stream, nodelay);
                info!(%target, "TCP connection established");
                Ok(stream)
            }
            Ok(Err(e)) => Err(NetworkError::network_with_source(
                format!("failed to connect to {target}"),
                e,
            )),
            Err(_) => Err(NetworkError::timeout(
                format!("connect to {target}"),
                timeout.as_millis() as u64,
            )),
        };
        let _ = events.send(
            SocketEvent::Connected {
                request,
                target,
                result,
            }
            .into(),
        );
    });
}

pub(crate) fn spawn_reader<T>(
    connection: ConnectionId,
    mut read: OwnedReadHalf,
    events: UnboundedSender<T>,
) -> JoinHandle<()>
where
    T: From<SocketEvent> + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let error = loop {
            buf.reserve(READ_BUFFER_SIZE);
            match read.read_buf(&mut buf).await {
                Ok(0) => break None,
                Ok(_) => {
                    let data = buf.split().freeze();
                    if events
                        .send(SocketEvent::Received { connection, data }.into())
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => break Some(e.to_string()),
            }
        };
        let _ = events.send(SocketEvent::Closed { connection, error }.into());
    })
}

pub(crate) fn spawn_writer<T>(
    connection: ConnectionId,
    mut write: OwnedWriteHalf,
    mut outgoing: UnboundedReceiver<Bytes>,
    events: UnboundedSender<T>,
) -> JoinHandle<()>
where
    T: From<SocketEvent> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(bytes) = outgoing.recv().await {
            if let Err(e) = write.write_all(&bytes).await {
                let event = SocketEvent::Closed {
                    connection,
                    error: Some(e.to_string()),
                };
                let _ = events.send(event.into());
                return;
            }
        }
        // Queue dropped by the middleman: flush and send FIN
        let _ = write.shutdown().await;
    })
}
