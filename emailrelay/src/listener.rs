use std::{io, net::SocketAddr};

use emailrelay_common::{Signal, internal};
use emailrelay_smtp::{ServerContext, server::session::serve};
use futures_util::future::join_all;
use tokio::{
    net::TcpListener,
    sync::broadcast::{self, error::RecvError},
};

/// Accepts SMTP connections on one address.
pub struct Listener {
    listener: TcpListener,
    address: SocketAddr,
    context: ServerContext,
}

impl Listener {
    /// # Errors
    /// The address cannot be bound.
    pub async fn bind(address: SocketAddr, context: ServerContext) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let address = listener.local_addr()?;

        internal!(level = INFO, "Listening on {address}");
        Ok(Self {
            listener,
            address,
            context,
        })
    }

    /// The bound address, with the real port when bound to port zero.
    pub const fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Serve connections until `shutdown` fires, then wait for open sessions
    /// to say goodbye.
    ///
    /// # Errors
    /// Accepting a connection failed.
    #[tracing::instrument(level = "trace", skip_all, fields(address = %self.address))]
    pub async fn serve(self, shutdown: &broadcast::Sender<Signal>) -> anyhow::Result<()> {
        let mut receiver = shutdown.subscribe();
        let mut sessions = Vec::new();

        let result = loop {
            tokio::select! {
                signal = receiver.recv() => {
                    if matches!(signal, Ok(Signal::Shutdown) | Err(RecvError::Closed)) {
                        internal!(
                            level = INFO,
                            "Listener {} received shutdown signal, finishing sessions ...",
                            self.address
                        );
                        break Ok(());
                    }
                }

                connection = self.listener.accept() => {
                    let (stream, peer) = match connection {
                        Ok(connection) => connection,
                        Err(err) => break Err(err.into()),
                    };

                    let context = self.context.clone();
                    let session_shutdown = shutdown.subscribe();
                    sessions.retain(|session: &tokio::task::JoinHandle<()>| !session.is_finished());
                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = serve(stream, peer, context, session_shutdown).await {
                            internal!(level = WARN, "Session with {peer} ended: {err}");
                        }
                    }));
                }
            }
        };

        join_all(sessions).await;
        result
    }
}
