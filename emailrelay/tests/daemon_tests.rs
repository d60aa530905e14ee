#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{net::SocketAddr, time::Duration};

use emailrelay::{ClientConfig, Forwarder, Listener};
use emailrelay_common::{Signal, config::ClientTimeouts};
use emailrelay_smtp::{ForwardMode, NextHop, ServerConfig, ServerContext};
use emailrelay_spool::MessageStore;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::broadcast,
    task::JoinHandle,
    time::timeout,
};

fn store() -> (TempDir, MessageStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = MessageStore::open(dir.path()).unwrap();
    (dir, store)
}

fn server_config(hostname: &str) -> ServerConfig {
    ServerConfig {
        listen: Vec::new(),
        hostname: hostname.to_string(),
        ..ServerConfig::default()
    }
}

fn hop(address: SocketAddr) -> NextHop {
    NextHop {
        address: address.to_string(),
        hostname: "upstream.test".to_string(),
        timeouts: ClientTimeouts {
            connect_secs: 5,
            response_secs: 5,
        },
    }
}

/// A listener running on a loopback port.
async fn listen(
    context: ServerContext,
    shutdown: &broadcast::Sender<Signal>,
) -> (SocketAddr, JoinHandle<anyhow::Result<()>>) {
    let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), context)
        .await
        .unwrap();
    let address = listener.local_addr();
    let shutdown = shutdown.clone();

    (address, tokio::spawn(async move { listener.serve(&shutdown).await }))
}

struct SmtpClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl SmtpClient {
    async fn connect(address: SocketAddr) -> (Self, String) {
        let (read, write) = TcpStream::connect(address).await.unwrap().into_split();
        let mut client = Self {
            lines: BufReader::new(read).lines(),
            write,
        };
        let greeting = client.reply().await;
        (client, greeting)
    }

    /// The last line of the next reply.
    async fn reply(&mut self) -> String {
        loop {
            let line = timeout(Duration::from_secs(10), self.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if line.as_bytes().get(3) != Some(&b'-') {
                return line;
            }
        }
    }

    async fn send(&mut self, line: &str) -> String {
        self.write
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.reply().await
    }

    async fn send_message(&mut self, from: &str, to: &str, body: &[&str]) -> String {
        assert!(self.send(&format!("MAIL FROM:<{from}>")).await.starts_with("250"));
        assert!(self.send(&format!("RCPT TO:<{to}>")).await.starts_with("250"));
        assert!(self.send("DATA").await.starts_with("354"));
        for line in body {
            self.write
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
        }
        self.send(".").await
    }
}

#[tokio::test]
async fn test_listener_queues_mail() {
    let (_dir, store) = store();
    let (shutdown, _) = broadcast::channel(4);
    let context = ServerContext::new(server_config("relay.test"), store.clone(), None);
    let (address, listener) = listen(context, &shutdown).await;

    let (mut client, greeting) = SmtpClient::connect(address).await;
    assert_eq!(greeting, "220 relay.test ESMTP ready");
    assert!(client.send("EHLO client.test").await.starts_with("250"));

    let reply = client
        .send_message("a@client.test", "b@remote.example", &["Subject: hi", "", "hello"])
        .await;
    assert!(reply.starts_with("250 OK queued as emailrelay."), "{reply}");
    assert!(client.send("QUIT").await.starts_with("221"));

    assert_eq!(store.ids().unwrap().len(), 1);

    shutdown.send(Signal::Shutdown).unwrap();
    listener.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_open_sessions() {
    let (_dir, store) = store();
    let (shutdown, _) = broadcast::channel(4);
    let context = ServerContext::new(server_config("relay.test"), store, None);
    let (address, listener) = listen(context, &shutdown).await;

    let (mut client, _) = SmtpClient::connect(address).await;
    assert!(client.send("HELO client.test").await.starts_with("250"));

    shutdown.send(Signal::Shutdown).unwrap();
    let goodbye = client.reply().await;
    assert!(goodbye.starts_with("421 relay.test service shutting down"), "{goodbye}");

    timeout(Duration::from_secs(10), listener)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_forwarder_relays_the_spool() {
    let (shutdown, _) = broadcast::channel(4);

    let (_downstream_dir, downstream) = store();
    let context = ServerContext::new(server_config("downstream.test"), downstream.clone(), None);
    let (address, _listener) = listen(context, &shutdown).await;

    let (_upstream_dir, upstream) = store();
    for n in 0..3 {
        let mut message = upstream.new_message("a@upstream.test").unwrap();
        message.add_to("b@remote.example", false);
        message.add_text(format!("message {n}").as_bytes());
        message.commit().unwrap();
    }

    let config = ClientConfig {
        poll_secs: 0,
        ..ClientConfig::default()
    };
    let forwarder = Forwarder::new(upstream.clone(), hop(address), &config);

    let summary = forwarder.pass().await.unwrap();
    assert_eq!(summary.forwarded.len(), 3);
    assert!(summary.failed.is_empty());
    assert!(upstream.is_empty());
    assert_eq!(downstream.ids().unwrap().len(), 3);

    assert!(forwarder.pass().await.is_none());
}

#[tokio::test]
async fn test_forwarder_runs_on_startup_and_stops() {
    let (shutdown, _) = broadcast::channel(4);

    let (_downstream_dir, downstream) = store();
    let context = ServerContext::new(server_config("downstream.test"), downstream.clone(), None);
    let (address, _listener) = listen(context, &shutdown).await;

    let (_upstream_dir, upstream) = store();
    let mut message = upstream.new_message("a@upstream.test").unwrap();
    message.add_to("b@remote.example", false);
    message.add_text(b"hello");
    message.commit().unwrap();

    let config = ClientConfig {
        poll_secs: 3600,
        forward_on_startup: true,
        ..ClientConfig::default()
    };
    let forwarder = Forwarder::new(upstream.clone(), hop(address), &config);
    let running = tokio::spawn(forwarder.run(shutdown.subscribe()));

    timeout(Duration::from_secs(10), async {
        while !upstream.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(downstream.ids().unwrap().len(), 1);

    shutdown.send(Signal::Shutdown).unwrap();
    timeout(Duration::from_secs(10), running).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_immediate_forwarding() {
    let (shutdown, _) = broadcast::channel(4);

    let (_downstream_dir, downstream) = store();
    let context = ServerContext::new(server_config("downstream.test"), downstream.clone(), None);
    let (downstream_address, _downstream) = listen(context, &shutdown).await;

    let (_upstream_dir, upstream) = store();
    let config = ServerConfig {
        forward: ForwardMode::Immediate,
        ..server_config("upstream.test")
    };
    let context = ServerContext::new(config, upstream.clone(), Some(hop(downstream_address)));
    let (upstream_address, _upstream) = listen(context, &shutdown).await;

    let (mut client, _) = SmtpClient::connect(upstream_address).await;
    assert!(client.send("EHLO client.test").await.starts_with("250"));
    let reply = client
        .send_message("a@client.test", "b@remote.example", &["Subject: now", "", "body"])
        .await;
    assert!(reply.starts_with("250 OK queued as"), "{reply}");

    // Relayed before the reply, so nothing is left upstream
    assert!(upstream.is_empty());
    assert_eq!(downstream.ids().unwrap().len(), 1);
}

#[tokio::test]
async fn test_immediate_forwarding_to_unreachable_hop() {
    let (shutdown, _) = broadcast::channel(4);

    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let unreachable = unused.local_addr().unwrap();
    drop(unused);

    let (dir, upstream) = store();
    let config = ServerConfig {
        forward: ForwardMode::Immediate,
        ..server_config("upstream.test")
    };
    let context = ServerContext::new(config, upstream.clone(), Some(hop(unreachable)));
    let (address, _listener) = listen(context, &shutdown).await;

    let (mut client, _) = SmtpClient::connect(address).await;
    assert!(client.send("EHLO client.test").await.starts_with("250"));
    let reply = client
        .send_message("a@client.test", "b@remote.example", &["hello"])
        .await;
    assert!(reply.starts_with("451 Unable to forward message"), "{reply}");

    // Failed, not lost
    assert!(upstream.is_empty());
    let bad = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".envelope.bad"))
        .count();
    assert_eq!(bad, 1);
}
