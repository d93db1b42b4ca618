use std::time::Duration;

use anyhow::Result;
use plexus_core::wire;
use plexus_core::Packet;
use plexus_services::{HandshakeState, SessionState, UpstreamState};

use crate::*;

/// Client logs in, both legs handshake, start-of-session with dimension 0
/// reaches the client and game traffic flows both ways.
#[tokio::test]
async fn handshake_then_relay() -> Result<()> {
    let mut lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let proxy = Proxy::start(vec![lobby.descriptor("lobby")]).await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    let dimension = client.join("Steve").await?;
    assert_eq!(dimension, 0);

    // The backend saw a login re-signed by the proxy, not the client's.
    assert_eq!(lobby.expect_login().await?, "Steve");

    assert_eq!(client.echo("hello").await?, "lobby:hello");
    assert_eq!(lobby.next_packet().await?.payload(), b"hello");

    let session = proxy.wait_for_session("steve").await?;
    let snap = session.snapshot();
    assert_eq!(snap.state, SessionState::Relaying);
    assert_eq!(snap.downstream_state, Some(HandshakeState::Established));
    assert_eq!(snap.server.as_deref(), Some("lobby"));
    assert_eq!(snap.dimension_id, 0);
    assert_eq!(snap.display_name, "Steve");
    Ok(())
}

/// Backend traffic waits for the client's ack, and the session is not
/// relaying until both legs are up.
#[tokio::test]
async fn backend_traffic_waits_for_client_ack() -> Result<()> {
    let mut lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let proxy = Proxy::start(vec![lobby.descriptor("lobby")]).await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    client.start_login("Steve").await?;
    assert_eq!(lobby.expect_login().await?, "Steve");
    let session = proxy.wait_for_session("steve").await?;

    within("backend established", async {
        while session.downstream_state() != Some(HandshakeState::Established) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    let snap = session.snapshot();
    assert_eq!(snap.state, SessionState::Handshaking);
    assert_eq!(snap.upstream_state, UpstreamState::EncryptionEnabled);
    assert_eq!(snap.queued, 1, "start-of-session is held for the client");

    client.send(&wire::client_handshake_ack()).await?;
    client.recv_id(wire::START_GAME).await?;
    assert_eq!(session.state(), SessionState::Relaying);
    assert_eq!(client.echo("late").await?, "lobby:late");
    Ok(())
}

/// Packets the client sends before the backend is established are held and
/// delivered in order, exactly once.
#[tokio::test]
async fn early_packets_are_held_until_established() -> Result<()> {
    let mut opts = BackendOptions::new("lobby");
    opts.start_delay = Duration::from_millis(300);
    let mut lobby = MockBackend::start(opts).await?;
    let proxy = Proxy::start(vec![lobby.descriptor("lobby")]).await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    client.login("Alex").await?;
    for n in 1..=3u8 {
        client.send(&Packet::new(ECHO, &[b'0' + n])).await?;
    }

    let session = proxy.wait_for_session("alex").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.snapshot().queued, 3);

    client.recv_id(wire::START_GAME).await?;
    for expected in ["lobby:1", "lobby:2", "lobby:3"] {
        let reply = client.recv_id(ECHO_REPLY).await?;
        assert_eq!(reply.payload(), expected.as_bytes());
    }
    for expected in [b"1", b"2", b"3"] {
        assert_eq!(lobby.next_packet().await?.payload(), expected);
    }
    assert_eq!(session.snapshot().queued, 0);
    Ok(())
}

#[tokio::test]
async fn dimension_changes_are_tracked() -> Result<()> {
    let lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let proxy = Proxy::start(vec![lobby.descriptor("lobby")]).await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    client.join("Steve").await?;
    let session = proxy.wait_for_session("Steve").await?;

    lobby.push(change_dimension(1));
    client.recv_id(wire::CHANGE_DIMENSION).await?;
    assert_eq!(session.dimension_id(), 1);
    Ok(())
}

/// The client leaving closes the backend connection and frees the name.
#[tokio::test]
async fn client_leaving_closes_session() -> Result<()> {
    let mut lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let proxy = Proxy::start(vec![lobby.descriptor("lobby")]).await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    client.join("Steve").await?;
    let session = proxy.wait_for_session("steve").await?;
    drop(client);

    lobby.expect_closed().await?;
    within("session close", session.closed()).await?;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(proxy.ctx.registry.is_empty());

    let mut again = MockClient::connect(proxy.addr).await?;
    again.join("Steve").await?;
    Ok(())
}

/// A backend hanging up ends the session with a disconnect to the client.
#[tokio::test]
async fn backend_disconnect_reaches_client() -> Result<()> {
    let lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let proxy = Proxy::start(vec![lobby.descriptor("lobby")]).await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    client.join("Steve").await?;

    lobby.push(wire::Disconnect::new("Server closed").encode());
    assert_eq!(client.expect_disconnect().await?, "Server closed");
    Ok(())
}
