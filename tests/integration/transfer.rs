use anyhow::Result;
use plexus_core::wire;
use plexus_services::{transfer_session, RelayError, SessionState};

use crate::*;

/// A transfer swaps the backend under a live client: same connection, same
/// session id, new downstream handshake.
#[tokio::test]
async fn transfer_keeps_client_and_session_id() -> Result<()> {
    let mut lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let mut pvp_opts = BackendOptions::new("pvp");
    pvp_opts.dimension_id = 1;
    let mut pvp = MockBackend::start(pvp_opts).await?;
    let proxy = Proxy::start(vec![lobby.descriptor("lobby"), pvp.descriptor("pvp")]).await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    assert_eq!(client.join("Steve").await?, 0);
    assert_eq!(client.echo("before").await?, "lobby:before");
    let session = proxy.wait_for_session("steve").await?;
    let id = session.id();

    let target = transfer_session(&proxy.ctx, &session, "pvp")?;
    assert_eq!(target.address, pvp.addr);

    assert_eq!(pvp.expect_login().await?, "Steve");
    lobby.expect_closed().await?;

    let start = client.recv_id(wire::START_GAME).await?;
    assert_eq!(wire::StartGame::decode(&start)?.dimension_id, 1);
    assert_eq!(client.echo("after").await?, "pvp:after");

    let snap = session.snapshot();
    assert_eq!(snap.session_id, id);
    assert_eq!(snap.server.as_deref(), Some("pvp"));
    assert_eq!(snap.state, SessionState::Relaying);
    assert_eq!(snap.dimension_id, 1);
    assert_eq!(snap.transfers, 1);
    assert_eq!(proxy.ctx.registry.len(), 1);
    Ok(())
}

/// An unknown target fails up front and leaves the current backend alone.
#[tokio::test]
async fn transfer_to_unknown_server_changes_nothing() -> Result<()> {
    let lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let proxy = Proxy::start(vec![lobby.descriptor("lobby")]).await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    client.join("Steve").await?;
    let session = proxy.wait_for_session("steve").await?;
    let generation = session.snapshot().generation;

    let err = transfer_session(&proxy.ctx, &session, "nowhere").unwrap_err();
    assert!(matches!(err, RelayError::UnknownServer(ref name) if name == "nowhere"));

    assert_eq!(client.echo("still here").await?, "lobby:still here");
    let snap = session.snapshot();
    assert_eq!(snap.generation, generation);
    assert_eq!(snap.transfers, 0);
    assert_eq!(snap.state, SessionState::Relaying);
    Ok(())
}

/// Traffic sent while the new backend handshakes is held for it.
#[tokio::test]
async fn traffic_during_transfer_goes_to_new_backend() -> Result<()> {
    let lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let mut pvp_opts = BackendOptions::new("pvp");
    pvp_opts.start_delay = std::time::Duration::from_millis(200);
    let mut pvp = MockBackend::start(pvp_opts).await?;
    let proxy = Proxy::start(vec![lobby.descriptor("lobby"), pvp.descriptor("pvp")]).await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    client.join("Steve").await?;
    let session = proxy.wait_for_session("steve").await?;

    transfer_session(&proxy.ctx, &session, "pvp")?;
    client.send(&plexus_core::Packet::new(ECHO, b"in flight")).await?;

    client.recv_id(wire::START_GAME).await?;
    let reply = client.recv_id(ECHO_REPLY).await?;
    assert_eq!(reply.payload(), b"pvp:in flight");
    assert_eq!(pvp.next_packet().await?.payload(), b"in flight");
    Ok(())
}
