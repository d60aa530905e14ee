use std::{pin::pin, sync::LazyLock};

use emailrelay_common::{Signal, internal};
use emailrelay_smtp::ServerContext;
use futures_util::future::join_all;
use tokio::sync::broadcast;

use crate::{config::Config, forwarder::Forwarder, listener::Listener};

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Everything the daemon runs: one listener per configured address and the
/// forwarding poller.
#[derive(Debug)]
pub struct Emailrelay {
    config: Config,
}

impl Emailrelay {
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Recover the spool, then serve until a shutdown signal arrives
    ///
    /// # Errors
    ///
    /// The spool directory is unusable, or a listen address cannot be bound.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        let Config {
            server,
            spool,
            client,
        } = self.config;

        let store = spool.open()?;
        let recovery = store.recover()?;
        internal!(
            level = INFO,
            "Spool {} ready: {} queued, {} removed and {} unlocked by recovery",
            store.dir().display(),
            store.ids()?.len(),
            recovery.removed,
            recovery.unlocked
        );

        let hop = client.next_hop(&server.hostname);
        if hop.is_none() {
            internal!(level = WARN, "No forward_to configured, mail will only be queued");
        }

        let listen = server.listen.clone();
        let context = ServerContext::new(server, store.clone(), hop.clone());

        let mut listeners = Vec::with_capacity(listen.len());
        for address in listen {
            listeners.push(Listener::bind(address, context.clone()).await?);
        }

        let forwarder = hop.map(|hop| Forwarder::new(store, hop, &client));

        let mut work = pin!(async {
            let serving = async {
                let results = join_all(
                    listeners
                        .into_iter()
                        .map(|listener| listener.serve(&SHUTDOWN_BROADCAST)),
                )
                .await;
                // Listeners only stop on their own when they fail
                let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);
                results.into_iter().collect::<anyhow::Result<Vec<()>>>()
            };

            let forwarding = async {
                if let Some(forwarder) = forwarder {
                    forwarder.run(SHUTDOWN_BROADCAST.subscribe()).await;
                }
            };

            let (served, ()) = tokio::join!(serving, forwarding);
            served.map(|_| ())
        });

        internal!("Controller running");

        let result = tokio::select! {
            result = &mut work => result,
            signal = shutdown() => {
                signal?;
                let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);
                work.await
            }
        };

        internal!(level = INFO, "Shut down");
        result
    }
}

/// Wait for CTRL+C or SIGTERM.
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate signal received, shutting down");
        }
    }

    Ok(())
}
