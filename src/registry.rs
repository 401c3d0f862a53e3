//! Rendezvous point that lets nodes discover each other.

use crate::{
    log,
    membership::PeerEvent,
    message::{Peer, RegistryMessage},
};
use color_print::cformat;
use futures::{SinkExt, StreamExt};
use std::{collections::HashMap, error::Error, net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{
        mpsc::{self, UnboundedSender},
        RwLock,
    },
};
use tokio_util::codec::{Framed, LinesCodec};

#[derive(Debug, Default)]
pub struct Registry {
    pub peers: Vec<Peer>,
    pub connections: HashMap<SocketAddr, UnboundedSender<Peer>>,
}

/// Registry server.
///
/// A node announces itself once; it is then sent every peer already known,
/// and every later newcomer. Peers are never forgotten.
#[derive(Debug, Clone, Default)]
pub struct RegistryServer {
    registry: Arc<RwLock<Registry>>,
}

impl RegistryServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.registry.read().await.peers.clone()
    }

    async fn handle(
        stream: TcpStream,
        address: SocketAddr,
        registry: Arc<RwLock<Registry>>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let lines = Framed::new(stream, LinesCodec::new());
        let (mut writer, mut reader) = lines.split::<String>();

        let peer = match reader.next().await {
            Some(Ok(line)) => match RegistryMessage::from_json_string(&line)? {
                RegistryMessage::Announce(peer) => peer,
                RegistryMessage::Joined(_) => return Err("expected an announcement".into()),
            },
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(()),
        };

        log::info(&cformat!("Peer <bold>{peer}</bold> joined the registry."));

        let (tx, mut rx) = mpsc::unbounded_channel::<Peer>();
        {
            let mut registry = registry.write().await;

            for known in registry.peers.iter().filter(|known| known.id != peer.id) {
                tx.send(known.clone())?;
            }
            for other in registry.connections.values() {
                // a closed receiver belongs to a connection being torn down
                let _ = other.send(peer.clone());
            }
            if !registry.peers.iter().any(|known| known.id == peer.id) {
                registry.peers.push(peer.clone());
            }
            registry.connections.insert(address, tx);
        }

        let result: Result<(), Box<dyn Error + Send + Sync>> = loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(joined) => {
                        if let Err(e) = writer.send(RegistryMessage::Joined(joined).to_json_string()?).await {
                            break Err(e.into());
                        }
                    }
                    None => break Ok(()),
                },
                line = reader.next() => match line {
                    Some(Ok(_)) => log::warn(&cformat!("Ignoring extra frame from <bold>{peer}</bold>.")),
                    Some(Err(e)) => break Err(e.into()),
                    None => break Ok(()),
                },
            }
        };

        registry.write().await.connections.remove(&address);
        log::debug(&cformat!("Registry connection of <bold>{peer}</bold> closed."));
        result
    }

    pub async fn run(&self, listener: TcpListener) -> Result<(), Box<dyn Error + Send + Sync>> {
        loop {
            let (stream, address) = listener.accept().await?;

            log::debug(&cformat!("Accepted a <bold>registry connection</bold>."));

            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                if let Err(e) = Self::handle(stream, address, registry).await {
                    log::error(&format!("{e}"));
                }
            });
        }
    }
}

/// Announces `own` to the registry and forwards every peer it reports.
///
/// Returns when the registry closes the connection or `events` is dropped.
pub async fn join_registry(
    registry_address: &str,
    own: Peer,
    events: mpsc::Sender<PeerEvent>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let stream = TcpStream::connect(registry_address).await?;
    let mut lines = Framed::new(stream, LinesCodec::new());

    lines
        .send(RegistryMessage::Announce(own).to_json_string()?)
        .await?;

    while let Some(line) = lines.next().await {
        match RegistryMessage::from_json_string(&line?) {
            Ok(RegistryMessage::Joined(peer)) => {
                if events.send(PeerEvent::Joined(peer)).await.is_err() {
                    return Ok(());
                }
            }
            Ok(RegistryMessage::Announce(_)) => {
                log::warn("Registry sent an announcement, ignoring it.");
            }
            Err(_) => {
                log::error(&cformat!("The registry frame had <bold>incorrect formatting</bold>."));
            }
        }
    }

    Ok(())
}
