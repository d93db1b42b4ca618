use std::time::Duration;

use anyhow::Result;
use plexus_core::wire::LoginPacket;

use crate::*;

/// A client chain whose x5u is not a key is refused before any session or
/// backend connection exists.
#[tokio::test]
async fn client_with_bad_x5u_is_refused() -> Result<()> {
    let mut lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let proxy = Proxy::start(vec![lobby.descriptor("lobby")]).await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    let link = forged_token(
        r#"{"alg":"ES384","x5u":"not-a-key"}"#,
        r#"{"identityPublicKey":"not-a-key","extraData":{"displayName":"Mallory"}}"#,
    );
    let login = LoginPacket {
        protocol_version: 800,
        chain: vec![link],
        client_data: forged_token(r#"{"alg":"ES384"}"#, "{}"),
    }
    .encode()?;
    client.send(&login).await?;

    assert_eq!(client.expect_disconnect().await?, "Authentication failed");
    client.expect_eof().await?;
    assert!(proxy.ctx.registry.is_empty());
    assert!(
        tokio::time::timeout(Duration::from_millis(200), lobby.events.recv())
            .await
            .is_err(),
        "backend must not be contacted"
    );
    Ok(())
}

/// A backend handshake with a bad x5u fails the session and the client is
/// told why.
#[tokio::test]
async fn backend_with_bad_x5u_fails_session() -> Result<()> {
    let mut opts = BackendOptions::new("broken");
    opts.bad_x5u = true;
    let mut broken = MockBackend::start(opts).await?;
    let proxy = Proxy::start(vec![broken.descriptor("broken")]).await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    client.start_login("Steve").await?;

    assert_eq!(client.expect_disconnect().await?, "Authentication failed");
    broken.expect_login().await?;
    broken.expect_closed().await?;
    assert!(proxy.ctx.registry.is_empty());
    Ok(())
}

/// A second login for a live identity is refused; names compare without case.
#[tokio::test]
async fn duplicate_identity_is_refused() -> Result<()> {
    let lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let proxy = Proxy::start(vec![lobby.descriptor("lobby")]).await?;

    let mut first = MockClient::connect(proxy.addr).await?;
    first.join("Steve").await?;

    let mut second = MockClient::connect(proxy.addr).await?;
    let err = second.login("STEVE").await.unwrap_err();
    assert!(err.to_string().contains("You are already connected"), "{err}");

    assert_eq!(proxy.ctx.registry.len(), 1);
    assert_eq!(first.echo("unaffected").await?, "lobby:unaffected");
    Ok(())
}

/// A backend that never sends start-of-session trips the handshake
/// watchdog.
#[tokio::test]
async fn slow_backend_times_out() -> Result<()> {
    let mut opts = BackendOptions::new("slow");
    opts.start_delay = Duration::from_secs(3);
    let slow = MockBackend::start(opts).await?;
    let proxy = Proxy::start_with(vec![slow.descriptor("slow")], |s| {
        s.handshake_timeout = Duration::from_millis(300);
    })
    .await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    client.login("Steve").await?;
    assert_eq!(
        client.expect_disconnect().await?,
        "Timed out connecting to the server"
    );
    assert!(proxy.ctx.registry.is_empty());
    Ok(())
}

/// A client that never acknowledges the server handshake is timed out even
/// though its backend came up, and its identity is freed.
#[tokio::test]
async fn client_without_ack_times_out() -> Result<()> {
    let mut lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let proxy = Proxy::start_with(vec![lobby.descriptor("lobby")], |s| {
        s.handshake_timeout = Duration::from_millis(300);
    })
    .await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    client.start_login("Steve").await?;
    lobby.expect_login().await?;

    assert_eq!(
        client.expect_disconnect().await?,
        "Timed out connecting to the server"
    );
    lobby.expect_closed().await?;
    assert!(proxy.ctx.registry.is_empty());

    let mut retry = MockClient::connect(proxy.addr).await?;
    retry.join("Steve").await?;
    Ok(())
}

/// A backend that refuses connections fails the session.
#[tokio::test]
async fn unreachable_backend_fails_session() -> Result<()> {
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?
    };
    let proxy = Proxy::start(vec![plexus_services::ServerDescriptor {
        name: "dead".into(),
        address: dead,
    }])
    .await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    client.start_login("Steve").await?;
    assert_eq!(
        client.expect_disconnect().await?,
        "Disconnected from the server"
    );
    assert!(proxy.ctx.registry.is_empty());
    Ok(())
}

#[tokio::test]
async fn session_limit_refuses_new_clients() -> Result<()> {
    let lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let proxy = Proxy::start_with(vec![lobby.descriptor("lobby")], |s| s.max_sessions = 1).await?;

    let mut first = MockClient::connect(proxy.addr).await?;
    first.join("Steve").await?;

    let mut second = MockClient::connect(proxy.addr).await?;
    assert_eq!(second.expect_disconnect().await?, "The proxy is full");
    Ok(())
}

/// Connections admitted while the proxy had room still hit the limit when
/// they log in.
#[tokio::test]
async fn session_limit_applies_to_logins_in_flight() -> Result<()> {
    let lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let proxy = Proxy::start_with(vec![lobby.descriptor("lobby")], |s| s.max_sessions = 1).await?;

    let mut first = MockClient::connect(proxy.addr).await?;
    let mut second = MockClient::connect(proxy.addr).await?;
    // Both sockets pass admission before either logs in.
    tokio::time::sleep(Duration::from_millis(100)).await;

    first.join("Steve").await?;
    let err = second.login("Alex").await.unwrap_err();
    assert!(err.to_string().contains("The proxy is full"), "{err}");
    assert_eq!(proxy.ctx.registry.len(), 1);
    Ok(())
}

/// Shutdown kicks every session, empties the pool and stops admission.
#[tokio::test]
async fn shutdown_closes_everything() -> Result<()> {
    let mut lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let proxy = Proxy::start(vec![lobby.descriptor("lobby")]).await?;

    let mut a = MockClient::connect(proxy.addr).await?;
    a.join("Steve").await?;
    let mut b = MockClient::connect(proxy.addr).await?;
    b.join("Alex").await?;
    assert_eq!(proxy.ctx.pool.active(), 2);

    assert_eq!(proxy.ctx.shutdown(), 2);
    assert_eq!(a.expect_disconnect().await?, "Proxy is shutting down");
    assert_eq!(b.expect_disconnect().await?, "Proxy is shutting down");
    lobby.expect_closed().await?;
    lobby.expect_closed().await?;

    within("pool drain", async {
        while proxy.ctx.pool.active() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    assert!(!proxy.ctx.is_accepting());

    let mut late = MockClient::connect(proxy.addr).await?;
    assert_eq!(late.expect_disconnect().await?, "Proxy is shutting down");
    Ok(())
}
