//! Drives a [`ServerProtocol`] over an accepted tokio socket.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use emailrelay_common::{Signal, internal};
use emailrelay_spool::{MessageId, StoredMessage};
use tokio::{
    net::TcpStream,
    sync::broadcast,
    time::{Instant, timeout, timeout_at},
};

use crate::{
    client,
    connection::{LineBuffer, SocketSender, read_some},
    error::{Failure, SessionError},
    server::{ServerContext, ServerEvent, ServerProtocol},
    state::State,
};

/// Stands in for a deadline too far away to represent.
const FOREVER: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Serve one inbound connection until QUIT, disconnect, timeout or shutdown.
///
/// A message still being received when the session ends is discarded.
///
/// # Errors
/// Socket errors and timeouts. A client disconnecting is not an error.
#[tracing::instrument(skip_all, fields(%peer))]
pub async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    context: ServerContext,
    mut shutdown: broadcast::Receiver<Signal>,
) -> Result<(), SessionError> {
    let timeouts = context.config.timeouts.clone();
    let deadline = Instant::now().checked_add(timeouts.connection());

    let stream = Arc::new(stream);
    let mut protocol = context.protocol(
        SocketSender::new(Arc::clone(&stream)),
        &peer.ip().to_string(),
    );
    let mut lines = LineBuffer::default();

    protocol.start()?;
    drain(&stream, &mut protocol, &context).await?;

    loop {
        while let Some(line) = lines.next_line(protocol.line_limit()) {
            let event = if line.truncated {
                protocol.too_long(&line.bytes)?
            } else {
                protocol.apply(&line.bytes)?
            };

            match event {
                ServerEvent::Continue => {}
                ServerEvent::Close => {
                    drain(&stream, &mut protocol, &context).await?;
                    internal!(level = INFO, "Closed connection from {peer}");
                    return Ok(());
                }
                ServerEvent::Forward(message) => {
                    let result = forward_now(&context, message).await;
                    protocol.processed(result)?;
                }
            }
            drain(&stream, &mut protocol, &context).await?;
        }

        let idle = if protocol.state() == State::Data {
            timeouts.data()
        } else {
            timeouts.command()
        };
        let wait_until = wake_at(Instant::now(), idle, deadline);

        tokio::select! {
            read = timeout_at(wait_until, read_some(&stream, &mut lines)) => match read {
                Ok(Ok(0)) => {
                    internal!(level = INFO, "Connection from {peer} closed by client");
                    return Ok(());
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => {
                    protocol.abort("timeout")?;
                    drain(&stream, &mut protocol, &context).await?;

                    return Err(if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        SessionError::ConnectionTimeout(timeouts.connection())
                    } else {
                        SessionError::Timeout(idle)
                    });
                }
            },
            _ = shutdown.recv() => {
                protocol.abort("service shutting down")?;
                drain(&stream, &mut protocol, &context).await?;
                return Ok(());
            }
        }
    }
}

/// The sooner of the idle timeout and the connection deadline.
fn wake_at(now: Instant, idle: Duration, deadline: Option<Instant>) -> Instant {
    [now.checked_add(idle), deadline]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or_else(|| now + FOREVER)
}

/// Wait until everything the protocol wrote has gone out.
async fn drain(
    stream: &TcpStream,
    protocol: &mut ServerProtocol<SocketSender>,
    context: &ServerContext,
) -> Result<(), SessionError> {
    let limit = context.config.timeouts.command();

    timeout(limit, async {
        while protocol.is_blocked() {
            stream.writable().await?;
            protocol.resume()?;
        }
        Ok::<_, std::io::Error>(())
    })
    .await
    .map_err(|_| SessionError::Timeout(limit))?
    .map_err(SessionError::from)
}

/// Relay a just-stored message before the client gets its reply.
async fn forward_now(context: &ServerContext, message: StoredMessage) -> Result<MessageId, Failure> {
    let id = message.id();

    let Some(hop) = context.next_hop.as_deref() else {
        // Released on drop; the next forwarding pass picks it up
        return Ok(id);
    };

    client::session::forward_messages(message, Box::new(std::iter::empty()), hop)
        .await
        .outcome(id)
}
