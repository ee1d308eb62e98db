//! Lifecycle supervisor
//!
//! Wires the upstream link, the listener, the keepalive timer, and the
//! signal handlers to the engine, in the order the relay's purpose
//! dictates: no MSC, no relay. The upstream connect happens first and
//! its failure aborts startup before the listener ever binds. Once
//! running, only upstream-scoped failures end the process; the engine
//! absorbs everything downstream-scoped.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::downstream;
use crate::engine::{Engine, Event};
use crate::errors::RelayError;
use crate::upstream::UpstreamLink;

/// A running relay. Dropping it does not stop the process; call
/// [`wait`](Self::wait) to follow it to completion.
pub struct Relay {
    /// Address the listener actually bound (useful with port 0)
    pub local_addr: SocketAddr,
    events: mpsc::Sender<Event>,
    task: JoinHandle<Result<(), RelayError>>,
}

impl Relay {
    /// Request an orderly shutdown, as the interrupt signal does.
    pub async fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown).await;
    }

    /// Wait for the relay to finish. `Ok` is a clean shutdown; `Err`
    /// carries the fatal condition that ended it.
    pub async fn wait(self) -> Result<(), RelayError> {
        self.task
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
    }
}

/// Process-wide orchestration entry point
pub struct Supervisor;

impl Supervisor {
    /// Bring the relay up: connect the MSC link, bind the listener, arm
    /// the keepalive timer and signal handlers, start the engine.
    pub async fn start(cfg: RelayConfig) -> Result<Relay, RelayError> {
        let (events_tx, events_rx) = mpsc::channel(cfg.event_queue_depth);

        // Upstream first: a refused MSC is a startup failure, reported
        // before any BSC can connect
        let upstream = UpstreamLink::connect(&cfg, events_tx.clone()).await?;

        let listener =
            TcpListener::bind(&cfg.listen_addr)
                .await
                .map_err(|source| RelayError::ListenFailed {
                    addr: cfg.listen_addr.clone(),
                    source,
                })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening for BSC connections");

        let mut aux = Vec::new();
        aux.push(tokio::spawn(downstream::accept_loop(
            listener,
            events_tx.clone(),
        )));
        aux.push(tokio::spawn(tick_loop(
            cfg.keepalive_interval(),
            events_tx.clone(),
        )));
        aux.push(tokio::spawn(watch_signals(events_tx.clone())));

        let engine = Engine::new(cfg, upstream, events_rx, events_tx.clone());
        let task = tokio::spawn(async move {
            let outcome = engine.run().await;
            for task in aux {
                task.abort();
            }
            outcome
        });

        Ok(Relay {
            local_addr,
            events: events_tx,
            task,
        })
    }

    /// Run the relay to completion. What `main` calls.
    pub async fn run(cfg: RelayConfig) -> Result<(), RelayError> {
        Self::start(cfg).await?.wait().await
    }
}

/// Reactor-driven liveness clock: one event per keepalive interval.
async fn tick_loop(period: std::time::Duration, events: mpsc::Sender<Event>) {
    let mut interval = tokio::time::interval(period);
    // The immediate first tick would probe before anyone had a chance
    // to answer anything
    interval.tick().await;
    loop {
        interval.tick().await;
        if events.send(Event::Tick).await.is_err() {
            return;
        }
    }
}

/// Interrupt requests an orderly shutdown; SIGUSR1 a resource report.
async fn watch_signals(events: mpsc::Sender<Event>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let Ok(mut usr1) = signal(SignalKind::user_defined1()) else {
            debug!("SIGUSR1 handler unavailable");
            return wait_interrupt(events).await;
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    let _ = events.send(Event::Shutdown).await;
                    return;
                }
                _ = usr1.recv() => {
                    let _ = events.send(Event::Report).await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    wait_interrupt(events).await
}

async fn wait_interrupt(events: mpsc::Sender<Event>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupt received");
        let _ = events.send(Event::Shutdown).await;
    }
}
