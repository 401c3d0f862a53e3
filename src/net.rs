//! Newline-delimited JSON transport over TCP.

use crate::{
    error::TransportError,
    log,
    message::{Envelope, Message},
    responder::Responder,
    transport::Transport,
};
use color_print::cformat;
use futures::{SinkExt, StreamExt};
use std::{
    collections::HashMap, error::Error, future::Future, io, net::SocketAddr, sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::Mutex,
    time::timeout,
};
use tokio_util::{
    codec::{Framed, LinesCodec},
    sync::CancellationToken,
};

type Connection = Arc<Mutex<Framed<TcpStream, LinesCodec>>>;

/// Pause after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Source of inbound connections for [`serve`].
trait Listener: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;
}

impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Client side of the TCP transport.
///
/// Keeps one connection per peer address; exchanges on a connection are
/// serialized, so messages to the same peer arrive in send order.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    timeout: Duration,
    connections: Arc<Mutex<HashMap<String, Connection>>>,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn connection(&self, address: &str) -> Result<Connection, TransportError> {
        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.get(address) {
            return Ok(Arc::clone(connection));
        }

        let stream = timeout(self.timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout(address.to_string()))?
            .map_err(|_| TransportError::Unreachable(address.to_string()))?;

        let connection = Arc::new(Mutex::new(Framed::new(stream, LinesCodec::new())));
        connections.insert(address.to_string(), Arc::clone(&connection));
        Ok(connection)
    }

    async fn exchange(
        &self,
        address: &str,
        message: Message,
    ) -> Result<Option<Message>, TransportError> {
        let connection = self.connection(address).await?;
        let frame = Envelope::Deliver(message)
            .to_json_string()
            .map_err(|e| TransportError::Codec(e.to_string()))?;

        let result = {
            let mut lines = connection.lock().await;
            timeout(self.timeout, async {
                if lines.send(frame).await.is_err() {
                    return Err(TransportError::Closed(address.to_string()));
                }

                match lines.next().await {
                    Some(Ok(line)) => match Envelope::from_json_string(&line) {
                        Ok(Envelope::Ack(answer)) => Ok(answer),
                        Ok(Envelope::Deliver(_)) => Err(TransportError::Codec(
                            "expected an ack, got a delivery".to_string(),
                        )),
                        Err(e) => Err(TransportError::Codec(e.to_string())),
                    },
                    Some(Err(e)) => Err(TransportError::Codec(e.to_string())),
                    None => Err(TransportError::Closed(address.to_string())),
                }
            })
            .await
            .unwrap_or_else(|_| Err(TransportError::Timeout(address.to_string())))
        };

        if result.is_err() {
            // a half-finished exchange leaves the stream out of step
            self.connections.lock().await.remove(address);
        }
        result
    }
}

impl Transport for TcpTransport {
    async fn request(
        &self,
        address: &str,
        message: Message,
    ) -> Result<Option<Message>, TransportError> {
        self.exchange(address, message).await
    }

    async fn notify(&self, address: &str, message: Message) -> Result<(), TransportError> {
        self.exchange(address, message).await.map(|_| ())
    }
}

/// Accepts peer connections and feeds their messages to `responder` until
/// `shutdown` fires.
///
/// A failed `accept` is logged and retried after a short pause.
pub async fn serve(
    listener: TcpListener,
    responder: Responder,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    serve_on(listener, responder, shutdown).await
}

async fn serve_on<L: Listener>(
    listener: L,
    responder: Responder,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        let (stream, address) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error(&cformat!("Couldn't <bold>accept</bold> a connection: {e}"));
                tokio::select! {
                    () = shutdown.cancelled() => return Ok(()),
                    () = tokio::time::sleep(ACCEPT_RETRY) => {}
                }
                continue;
            }
        };

        log::debug(&cformat!("Accepted a <bold>connection</bold> from {address}."));

        let responder = responder.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, responder, shutdown).await {
                log::error(&format!("{e}"));
            }
        });
    }
}

async fn handle_connection<S>(
    stream: S,
    responder: Responder,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = Framed::new(stream, LinesCodec::new());

    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            line = lines.next() => match line {
                Some(line) => line?,
                None => return Ok(()),
            },
        };

        match Envelope::from_json_string(&line) {
            Ok(Envelope::Deliver(message)) => {
                let answer = responder.handle(message).await;
                lines.send(Envelope::Ack(answer).to_json_string()?).await?;
            }
            Ok(Envelope::Ack(_)) => {
                log::warn("Dropping an unexpected ack.");
            }
            Err(_) => {
                log::error(&cformat!("The frame had <bold>incorrect formatting</bold>."));
                lines.send(Envelope::Ack(None).to_json_string()?).await?;
            }
        }
    }
}
