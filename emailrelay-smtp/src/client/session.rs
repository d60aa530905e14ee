//! Drives a [`Client`] over an outbound tokio socket.

use std::{sync::Arc, time::Duration};

use emailrelay_common::internal;
use emailrelay_spool::{MessageStore, StoreError, StoredMessage};
use tokio::{net::TcpStream, time::timeout};

use super::{BatchEvent, Client, ClientProtocol, NextHop, Summary};
use crate::{
    connection::{COMMAND_LINE_LIMIT, LineBuffer, SocketSender, read_some},
    error::{Failure, ForwardError},
};

/// Forward everything currently in `store` to `hop`.
///
/// Nothing is connected to when there is nothing to claim.
///
/// # Errors
/// The spool directory cannot be listed.
#[tracing::instrument(skip_all, fields(hop = %hop.address))]
pub async fn forward(store: &MessageStore, hop: &NextHop) -> Result<Summary, StoreError> {
    let mut queue = store.iter()?;

    let Some(first) = queue.next() else {
        internal!("Nothing to forward");
        return Ok(Summary::default());
    };

    Ok(forward_messages(first, Box::new(queue), hop).await)
}

/// Forward `first` and then whatever `queue` yields, over one connection.
///
/// Messages are claimed from `queue` only as the connection becomes free for
/// them, so a batch cut short leaves the rest untouched.
#[tracing::instrument(skip_all, fields(hop = %hop.address))]
pub async fn forward_messages(
    first: StoredMessage,
    queue: Box<dyn Iterator<Item = StoredMessage> + Send>,
    hop: &NextHop,
) -> Summary {
    let stream = match connect(hop).await {
        Ok(stream) => stream,
        Err(err) => {
            internal!(level = WARN, "{err}");
            return unreachable_hop(first, err);
        }
    };

    internal!(level = INFO, "Connected to {}", hop.address);

    let stream = Arc::new(stream);
    let protocol = ClientProtocol::new(SocketSender::new(Arc::clone(&stream)), &hop.hostname);
    let mut client = Client::new(protocol, first, queue);
    let mut lines = LineBuffer::default();

    if let Err(err) = drive(&stream, &mut client, &mut lines, hop.timeouts.response()).await {
        client.abort(err);
    }

    client.finish()
}

async fn connect(hop: &NextHop) -> Result<TcpStream, ForwardError> {
    match timeout(hop.timeouts.connect(), TcpStream::connect(hop.address.as_str())).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ForwardError::Connect {
            address: hop.address.clone(),
            source,
        }),
        Err(_) => Err(ForwardError::ConnectTimeout(hop.address.clone())),
    }
}

fn unreachable_hop(first: StoredMessage, error: ForwardError) -> Summary {
    let id = first.id();
    let failure = Failure::connection(error.to_string());

    if let Err(err) = first.fail(&failure.reason) {
        internal!(level = ERROR, "Unable to fail {id}: {err}");
    }

    Summary {
        forwarded: Vec::new(),
        failed: vec![(id, failure)],
        aborted: Some(error),
    }
}

async fn drive(
    stream: &TcpStream,
    client: &mut Client<SocketSender>,
    lines: &mut LineBuffer,
    limit: Duration,
) -> Result<(), ForwardError> {
    loop {
        while let Some(line) = lines.next_line(COMMAND_LINE_LIMIT) {
            let line = String::from_utf8_lossy(&line.bytes);
            if client.apply(&line)? == BatchEvent::Finished {
                say_goodbye(stream, client, limit).await;
                return Ok(());
            }
        }

        while client.is_blocked() {
            timeout(limit, stream.writable())
                .await
                .map_err(|_| ForwardError::ResponseTimeout)??;

            if client.resume()? == BatchEvent::Finished {
                say_goodbye(stream, client, limit).await;
                return Ok(());
            }
        }

        match timeout(limit, read_some(stream, lines)).await {
            Ok(Ok(0)) => return Err(ForwardError::Closed),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(ForwardError::ResponseTimeout),
        }
    }
}

/// Flush the QUIT; every message is already settled so failures only get logged.
async fn say_goodbye(stream: &TcpStream, client: &mut Client<SocketSender>, limit: Duration) {
    while client.is_blocked() {
        let flushed = match timeout(limit, stream.writable()).await {
            Ok(Ok(())) => client.resume().map(|_| ()),
            Ok(Err(err)) => Err(err),
            Err(_) => break,
        };

        if let Err(err) = flushed {
            internal!("QUIT not delivered: {err}");
            break;
        }
    }
}
