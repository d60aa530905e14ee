use std::time::Duration;

use emailrelay_common::{Signal, internal};
use emailrelay_smtp::{NextHop, Summary, client::session::forward};
use emailrelay_spool::MessageStore;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::{MissedTickBehavior, interval},
};

use crate::config::ClientConfig;

/// Periodically forwards the spool to the next hop.
///
/// Passes run one after another on a single task, so they never overlap.
#[derive(Debug)]
pub struct Forwarder {
    store: MessageStore,
    hop: NextHop,
    poll: Option<Duration>,
    on_startup: bool,
}

impl Forwarder {
    pub fn new(store: MessageStore, hop: NextHop, config: &ClientConfig) -> Self {
        Self {
            store,
            hop,
            poll: (config.poll_secs > 0).then(|| Duration::from_secs(config.poll_secs)),
            on_startup: config.forward_on_startup,
        }
    }

    /// Run passes until told to stop.
    pub async fn run(self, mut shutdown: broadcast::Receiver<Signal>) {
        if self.on_startup {
            self.pass().await;
        }

        let Some(poll) = self.poll else {
            wait_for_shutdown(&mut shutdown).await;
            return;
        };

        let mut ticks = interval(poll);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick is immediate
        ticks.tick().await;

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    self.pass().await;
                }
                () = wait_for_shutdown(&mut shutdown) => {
                    internal!(level = INFO, "Forwarder received shutdown signal");
                    return;
                }
            }
        }
    }

    /// Forward whatever is queued; `None` when there was nothing to do.
    pub async fn pass(&self) -> Option<Summary> {
        if self.store.is_empty() {
            internal!(level = TRACE, "Spool is empty, nothing to forward");
            return None;
        }

        match forward(&self.store, &self.hop).await {
            Ok(summary) => {
                if let Some(reason) = &summary.aborted {
                    internal!(level = WARN, "Forwarding to {} stopped early: {reason}", self.hop.address);
                }
                Some(summary)
            }
            Err(err) => {
                internal!(level = ERROR, "Unable to scan the spool: {err}");
                None
            }
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut broadcast::Receiver<Signal>) {
    loop {
        match shutdown.recv().await {
            Ok(Signal::Shutdown) | Err(RecvError::Closed) => return,
            Err(RecvError::Lagged(_)) => {}
        }
    }
}
