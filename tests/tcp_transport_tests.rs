use std::sync::Arc;

use dots_and_boxes::transport::tcp::encode_frame;
use dots_and_boxes::{
    Broker, BrokerConfig, BrokerEvent, BoardSize, ChatMessage, ConnectionStatus, GameProgress, LinkError, Message,
    PeerId, RendezvousServer, Role, Session, SessionConfig, TcpBroker, TcpTransport, Transport, IO_TIMEOUT,
    MAX_FRAME_SIZE,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration, Instant};

async fn socket_pair() -> anyhow::Result<(TcpTransport, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let client = TcpStream::connect(addr).await?;
    let (server, _) = listener.accept().await?;
    Ok((TcpTransport::new(server), client))
}

fn chat(text: &str) -> Message {
    Message::Chat(ChatMessage {
        sender: Role::Joined,
        text: text.to_string(),
        timestamp: 1_700_000_000_000,
    })
}

#[tokio::test]
async fn frames_round_trip_over_loopback() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await?;
        let mut transport = TcpTransport::new(socket);
        let msg = transport.recv().await?;
        transport.send(msg).await?;
        anyhow::Ok(())
    });

    let mut client = TcpTransport::connect(addr).await?;
    client.send(chat("echo")).await?;
    assert_eq!(client.recv().await?, chat("echo"));
    server.await??;
    Ok(())
}

#[tokio::test]
async fn cancelled_recv_keeps_partial_frame() -> anyhow::Result<()> {
    let (mut transport, mut raw) = socket_pair().await?;
    let frame = encode_frame(&chat("split"), 1_000_000)?;
    let (head, tail) = frame.split_at(frame.len() / 2);

    raw.write_all(head).await?;
    assert!(timeout(Duration::from_millis(100), transport.recv()).await.is_err());
    raw.write_all(tail).await?;
    assert_eq!(transport.recv().await?, chat("split"));
    Ok(())
}

#[tokio::test]
async fn oversized_and_empty_frames_are_rejected() -> anyhow::Result<()> {
    let (mut transport, mut raw) = socket_pair().await?;
    raw.write_all(&u32::MAX.to_be_bytes()).await?;
    assert!(transport.recv().await.is_err());

    let (mut transport, mut raw) = socket_pair().await?;
    raw.write_all(&0u32.to_be_bytes()).await?;
    assert!(transport.recv().await.is_err());
    Ok(())
}

#[tokio::test]
async fn garbage_payload_is_an_error() -> anyhow::Result<()> {
    let (mut transport, mut raw) = socket_pair().await?;
    let payload = br#"{"kind":"teleport"}"#;
    raw.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    raw.write_all(payload).await?;
    assert!(transport.recv().await.is_err());
    Ok(())
}

#[tokio::test]
async fn oversized_send_leaves_the_stream_usable() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let client = TcpStream::connect(addr).await?;
    let (server, _) = listener.accept().await?;
    let mut sender = TcpTransport::with_config(client, IO_TIMEOUT, 256);
    let mut receiver = TcpTransport::new(server);

    let err = sender.send(chat(&"x".repeat(300))).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<LinkError>(), Some(LinkError::TooLarge { .. })));
    sender.send(chat("fits")).await?;
    assert_eq!(receiver.recv().await?, chat("fits"));
    Ok(())
}

#[tokio::test]
async fn peer_close_ends_recv() -> anyhow::Result<()> {
    let (mut transport, raw) = socket_pair().await?;
    drop(raw);
    assert!(transport.recv().await.is_err());
    Ok(())
}

async fn rendezvous() -> anyhow::Result<BrokerConfig> {
    let server = RendezvousServer::bind("127.0.0.1:0").await?;
    let addr = server.local_addr()?;
    tokio::spawn(server.run());
    Ok(BrokerConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        path: "/test".to_string(),
    })
}

#[tokio::test]
async fn brokers_find_each_other() -> anyhow::Result<()> {
    let config = rendezvous().await?;
    let host = TcpBroker::register(config.clone(), PeerId::parse("HOST01")?, "127.0.0.1").await?;
    let guest = TcpBroker::register(config.clone(), PeerId::parse("GUEST1")?, "127.0.0.1").await?;

    let mut outbound = guest.connect(host.local_id()).await?;
    let mut inbound = match timeout(Duration::from_secs(2), host.next_event()).await? {
        Some(BrokerEvent::Incoming(channel)) => channel,
        other => panic!("expected incoming channel, got {:?}", other),
    };
    outbound.send(chat("over tcp")).await?;
    assert_eq!(inbound.recv().await?, chat("over tcp"));

    assert!(guest.connect(&PeerId::parse("NOBODY")?).await.is_err());
    assert!(
        TcpBroker::register(config.clone(), PeerId::parse("HOST01")?, "127.0.0.1")
            .await
            .is_err()
    );

    // Paths are separate namespaces.
    let other_path = BrokerConfig {
        path: "/elsewhere".to_string(),
        ..config
    };
    let stranger = TcpBroker::register(other_path, PeerId::parse("STRNGR")?, "127.0.0.1").await?;
    assert!(stranger.connect(host.local_id()).await.is_err());
    Ok(())
}

#[tokio::test]
async fn sessions_start_a_match_over_tcp() -> anyhow::Result<()> {
    let broker = rendezvous().await?;
    let config = SessionConfig {
        broker: broker.clone(),
        ..SessionConfig::default()
    };
    let host_broker = TcpBroker::register(broker.clone(), PeerId::random(), "127.0.0.1").await?;
    let guest_broker = TcpBroker::register(broker, PeerId::random(), "127.0.0.1").await?;
    let mut host = Session::start(Arc::new(host_broker), &config);
    let mut guest = Session::start(Arc::new(guest_broker), &config);
    guest.connect(host.peer_id().as_str());

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut submitted = (false, false);
    while host.progress() != GameProgress::InProgress || guest.progress() != GameProgress::InProgress {
        assert!(Instant::now() < deadline, "match did not start");
        if !submitted.0 && host.progress() == GameProgress::AwaitingPlayers {
            host.submit_player("Ann", Some(BoardSize::Medium))?;
            submitted.0 = true;
        }
        if !submitted.1 && guest.progress() == GameProgress::AwaitingPlayers {
            guest.submit_player("Bo", None)?;
            submitted.1 = true;
        }
        tokio::select! {
            Some(_) = host.next_event() => {}
            Some(_) = guest.next_event() => {}
            _ = sleep(Duration::from_millis(20)) => {}
        }
    }
    assert_eq!(host.state(), guest.state());
    assert_eq!(host.state().board.dimension(), 8);
    Ok(())
}

async fn tcp_sessions() -> anyhow::Result<(Session, Session)> {
    let broker = rendezvous().await?;
    let config = SessionConfig {
        broker: broker.clone(),
        ..SessionConfig::default()
    };
    let host_broker = TcpBroker::register(broker.clone(), PeerId::random(), "127.0.0.1").await?;
    let guest_broker = TcpBroker::register(broker, PeerId::random(), "127.0.0.1").await?;
    let host = Session::start(Arc::new(host_broker), &config);
    let guest = Session::start(Arc::new(guest_broker), &config);
    guest.connect(host.peer_id().as_str());
    Ok((host, guest))
}

async fn pump_until(host: &mut Session, guest: &mut Session, done: impl Fn(&Session, &Session) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(host, guest) {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::select! {
            Some(_) = host.next_event() => {}
            Some(_) = guest.next_event() => {}
            _ = sleep(Duration::from_millis(20)) => {}
        }
    }
}

#[tokio::test]
async fn oversized_chat_is_refused_and_the_channel_survives() -> anyhow::Result<()> {
    let (mut host, mut guest) = tcp_sessions().await?;
    pump_until(&mut host, &mut guest, |h, g| {
        h.progress() == GameProgress::AwaitingPlayers && g.progress() == GameProgress::AwaitingPlayers
    })
    .await;

    let result = guest.send_chat(&"x".repeat(MAX_FRAME_SIZE as usize + 1));
    assert!(matches!(result, Err(LinkError::TooLarge { .. })));
    assert!(guest.chat().messages().is_empty());

    guest.send_chat("gl hf").map_err(|e| anyhow::anyhow!(e))?;
    pump_until(&mut host, &mut guest, |h, _| h.chat().messages().len() == 1).await;
    assert_eq!(guest.status(), ConnectionStatus::Joined);
    assert_eq!(guest.progress(), GameProgress::AwaitingPlayers);
    assert_eq!(guest.role(), Some(Role::Joined));
    Ok(())
}
