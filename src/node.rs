//! Node bootstrap and the re-entry loop.

use crate::{
    config::Config,
    coordinator::Coordinator,
    error::MutexError,
    log,
    membership::MembershipView,
    net::{serve, TcpTransport},
    poisson::Poisson,
    registry::join_registry,
    transport::Transport,
};
use color_print::cformat;
use rand::{rngs::SmallRng, SeedableRng};
use std::{error::Error, future::Future};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// Repeatedly waits a Poisson-distributed delay, then runs `body` inside the
/// critical section.
///
/// Timed-out attempts back off before the next try. Stops after `rounds`
/// completed sections, or on shutdown. Returns the number completed.
pub async fn run_loop<T, F, Fut>(
    coordinator: &Coordinator<T>,
    config: &Config,
    rounds: Option<usize>,
    mut body: F,
) -> Result<usize, MutexError>
where
    T: Transport,
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    config
        .validate()
        .map_err(|e| MutexError::InvalidConfig(e.to_string()))?;

    let mut scheduler = Poisson::new(config.rate, config.seed);
    let mut rng = SmallRng::seed_from_u64(config.seed.wrapping_add(1));
    let shutdown = coordinator.shutdown_token();

    let mut completed = 0;
    let mut retries = 0u32;

    while rounds.map_or(true, |rounds| completed < rounds) {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(scheduler.next_delay()) => {}
        }

        match coordinator.run_exclusive(&mut body).await {
            Ok(()) => {
                completed += 1;
                retries = 0;
            }
            Err(MutexError::Timeout { missing }) => {
                let backoff = config.backoff.duration(retries, &mut rng);
                retries = retries.saturating_add(1);
                log::warn(&cformat!(
                    "<bold>{}</bold> backs off for {backoff:?}, silent peers {missing:?}.",
                    coordinator.id()
                ));

                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(backoff) => {}
                }
            }
            Err(MutexError::Cancelled) => break,
            Err(e) => return Err(e),
        }
    }

    Ok(completed)
}

/// A node reachable over TCP.
pub struct Node {
    config: Config,
    coordinator: Coordinator<TcpTransport>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Binds the listener, seeds the membership and starts the background
    /// tasks: the inbound server and, when configured, registry discovery.
    pub async fn start(mut config: Config) -> Result<Self, Box<dyn Error + Send + Sync>> {
        config.validate()?;

        let listener = TcpListener::bind(&config.address).await?;
        // resolves port 0 to the port actually bound
        config.address = listener.local_addr()?.to_string();

        let membership = MembershipView::from_peers(config.peers.clone()).await;
        let shutdown = CancellationToken::new();
        let coordinator = Coordinator::new(
            &config,
            membership.clone(),
            TcpTransport::new(config.send_timeout()),
        )
        .with_shutdown(shutdown.clone());

        let mut tasks = Vec::new();

        tasks.push({
            let responder = coordinator.responder();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = serve(listener, responder, shutdown).await {
                    log::error(&format!("{e}"));
                }
            })
        });

        if let Some(registry_address) = config.registry_address.clone() {
            let (tx, rx) = mpsc::channel(64);

            tasks.push({
                let membership = membership.clone();
                tokio::spawn(async move { membership.run_discovery(rx).await })
            });

            tasks.push({
                let own = config.peer();
                tokio::spawn(async move {
                    if let Err(e) = join_registry(&registry_address, own, tx).await {
                        log::error(&cformat!("Couldn't join the registry: {e}"));
                    }
                })
            });
        }

        log::info(&cformat!(
            "Node <bold>{}</bold> listening on <bold>{}</bold>.",
            config.id,
            config.address
        ));

        Ok(Self {
            config,
            coordinator,
            shutdown,
            tasks,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn coordinator(&self) -> &Coordinator<TcpTransport> {
        &self.coordinator
    }

    pub fn membership(&self) -> &MembershipView {
        self.coordinator.membership()
    }

    pub async fn run<F, Fut>(&self, rounds: Option<usize>, body: F) -> Result<usize, MutexError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        run_loop(&self.coordinator, &self.config, rounds, body).await
    }

    /// Cancels pending waits and stops the background tasks.
    pub fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            task.abort();
        }
    }
}
