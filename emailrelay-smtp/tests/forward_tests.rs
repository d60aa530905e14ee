#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use emailrelay_common::{Signal, config::ClientTimeouts};
use emailrelay_smtp::{
    ForwardError, NextHop, ServerConfig, ServerContext, client::session::forward,
    server::session::serve,
};
use emailrelay_spool::{MessageId, MessageStore};
use pretty_assertions::assert_eq;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::broadcast,
};

fn hop(address: String) -> NextHop {
    NextHop {
        address,
        hostname: "relay.test".to_string(),
        timeouts: ClientTimeouts {
            connect_secs: 5,
            response_secs: 5,
        },
    }
}

fn queue(store: &MessageStore, to: &str, lines: &[&[u8]]) -> MessageId {
    let mut message = store.new_message("b@y").unwrap();
    message.add_to(to, false);
    for line in lines {
        message.add_text(line);
    }
    message.commit().unwrap()
}

/// Accepts one session and records every line the client sends.
async fn fake_server(listener: TcpListener, eight_bit_mime: bool) -> Vec<String> {
    let (stream, _) = listener.accept().await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    write.write_all(b"220 fake ready\r\n").await.unwrap();

    let mut received = Vec::new();
    let mut in_data = false;
    while let Ok(Some(line)) = lines.next_line().await {
        received.push(line.clone());

        let reply: &[u8] = if in_data {
            if line != "." {
                continue;
            }
            in_data = false;
            b"250 accepted\r\n"
        } else if line.starts_with("EHLO") {
            if eight_bit_mime {
                b"250-fake\r\n250 8BITMIME\r\n"
            } else {
                b"250 fake\r\n"
            }
        } else if line == "DATA" {
            in_data = true;
            b"354 go ahead\r\n"
        } else if line == "QUIT" {
            let _ = write.write_all(b"221 bye\r\n").await;
            break;
        } else {
            b"250 ok\r\n"
        };

        write.write_all(reply).await.unwrap();
    }

    received
}

#[tokio::test]
async fn test_unreachable_hop_fails_the_message() {
    let (dir, store) = common::store();
    let first = queue(&store, "a@x", &[b"hello"]);
    let second = queue(&store, "a@x", &[b"again"]);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let summary = forward(&store, &hop(address)).await.unwrap();

    assert!(summary.forwarded.is_empty());
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, first);
    assert!(matches!(summary.aborted, Some(ForwardError::Connect { .. })));

    assert!(dir.path().join(format!("{first}.envelope.bad")).exists());
    assert!(dir.path().join(format!("{first}.content")).exists());
    assert_eq!(store.ids().unwrap(), vec![second]);
}

#[tokio::test]
async fn test_empty_store_does_not_connect() {
    let (_dir, store) = common::store();

    let summary = forward(&store, &hop("127.0.0.1:9".to_string())).await.unwrap();
    assert!(summary.forwarded.is_empty());
    assert!(summary.failed.is_empty());
    assert!(summary.aborted.is_none());
}

#[tokio::test]
async fn test_messages_are_forwarded() {
    let (dir, store) = common::store();
    let first = queue(&store, "a@x", &[b"Subject: one", b"", b".dotted"]);
    let second = queue(&store, "c@z", &["caf\u{e9}".as_bytes()]);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(fake_server(listener, true));

    let summary = forward(&store, &hop(address)).await.unwrap();
    assert_eq!(summary.forwarded, vec![first, second]);
    assert!(summary.failed.is_empty());
    assert!(summary.aborted.is_none());

    let received = server.await.unwrap();
    assert_eq!(
        received,
        vec![
            "EHLO relay.test",
            "MAIL FROM:<b@y>",
            "RCPT TO:<a@x>",
            "DATA",
            "Subject: one",
            "",
            "..dotted",
            ".",
            "MAIL FROM:<b@y> BODY=8BITMIME",
            "RCPT TO:<c@z>",
            "DATA",
            "caf\u{e9}",
            ".",
            "QUIT",
        ]
    );

    assert!(store.is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_seven_bit_hop_gets_no_eight_bit_mail() {
    let (dir, store) = common::store();
    let id = queue(&store, "a@x", &["caf\u{e9}".as_bytes()]);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(fake_server(listener, false));

    let summary = forward(&store, &hop(address)).await.unwrap();
    assert_eq!(summary.failed[0].0, id);
    assert!(matches!(summary.aborted, Some(ForwardError::Protocol(_))));

    assert_eq!(server.await.unwrap(), vec!["EHLO relay.test", "QUIT"]);
    assert!(dir.path().join(format!("{id}.envelope.bad")).exists());
}

#[tokio::test]
async fn test_relay_to_relay() {
    let (_upstream_dir, upstream) = common::store();
    let (downstream_dir, downstream) = common::store();
    let id = queue(&upstream, "someone@remote.example", &[b"Subject: chained", b"", b"body"]);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let config = ServerConfig {
        hostname: "downstream.test".to_string(),
        ..ServerConfig::default()
    };
    let context = ServerContext::new(config, downstream.clone(), None);
    let (shutdown, receiver) = broadcast::channel::<Signal>(1);

    tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let _ = serve(stream, peer, context, receiver).await;
    });

    let summary = forward(&upstream, &hop(address.to_string())).await.unwrap();
    assert_eq!(summary.forwarded, vec![id]);
    assert!(upstream.is_empty());

    let relayed = downstream.ids().unwrap();
    assert_eq!(relayed.len(), 1);
    let envelope = common::envelope(downstream_dir.path(), relayed[0]);
    assert_eq!(envelope.from, "b@y");
    assert_eq!(
        envelope.remote_recipients().collect::<Vec<_>>(),
        vec!["someone@remote.example"]
    );
    assert_eq!(
        common::content(downstream_dir.path(), relayed[0]),
        b"Subject: chained\r\n\r\nbody\r\n"
    );

    drop(shutdown);
}
