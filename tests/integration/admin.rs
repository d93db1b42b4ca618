use std::time::Instant;

use anyhow::Result;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use plexus_api::ApiState;

use crate::*;

/// Serve the admin API for `proxy` on an ephemeral port. Returns its base
/// URL and the shutdown sender the API signals.
async fn start_api(proxy: &Proxy) -> Result<(String, tokio::sync::broadcast::Sender<()>)> {
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let state = ApiState {
        ctx: proxy.ctx.clone(),
        shutdown_tx: shutdown_tx.clone(),
        started_at: Instant::now(),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}/api", listener.local_addr()?);
    tokio::spawn(plexus_api::serve_on(state, listener));
    Ok((base, shutdown_tx))
}

#[tokio::test]
async fn status_and_listings() -> Result<()> {
    let lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let pvp = MockBackend::start(BackendOptions::new("pvp")).await?;
    let proxy = Proxy::start(vec![lobby.descriptor("lobby"), pvp.descriptor("pvp")]).await?;
    let (api, _shutdown) = start_api(&proxy).await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    client.join("Steve").await?;

    let status: Value = reqwest::get(format!("{api}/status")).await?.json().await?;
    assert_eq!(status["accepting"], true);
    assert_eq!(status["sessions"]["total"], 1);
    assert_eq!(status["sessions"]["relaying"], 1);
    assert_eq!(status["pool"]["active"], 1);
    assert_eq!(status["servers"], 2);
    assert_eq!(status["default_server"], "lobby");

    let servers: Value = reqwest::get(format!("{api}/servers")).await?.json().await?;
    let list = servers["servers"].as_array().expect("servers array");
    assert_eq!(list.len(), 2);
    let lobby_entry = list.iter().find(|s| s["name"] == "lobby").expect("lobby listed");
    assert_eq!(lobby_entry["sessions"], 1);
    assert_eq!(lobby_entry["address"], lobby.addr.to_string());

    let sessions: Value = reqwest::get(format!("{api}/sessions")).await?.json().await?;
    let session = &sessions["sessions"][0];
    assert_eq!(session["identity"], "steve");
    assert_eq!(session["display_name"], "Steve");
    assert_eq!(session["state"], "relaying");
    assert_eq!(session["downstream_state"], "established");
    assert_eq!(session["server"], "lobby");
    assert_eq!(session["dimension_id"], 0);

    let id = session["session_id"].as_str().expect("session_id string");
    assert_eq!(id.len(), 64);
    let inspected: Value = reqwest::get(format!("{api}/sessions/{id}")).await?.json().await?;
    assert_eq!(inspected["session_id"], id);
    Ok(())
}

#[tokio::test]
async fn transfer_over_api() -> Result<()> {
    let lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let mut pvp = MockBackend::start(BackendOptions::new("pvp")).await?;
    let proxy = Proxy::start(vec![lobby.descriptor("lobby"), pvp.descriptor("pvp")]).await?;
    let (api, _shutdown) = start_api(&proxy).await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    client.join("Steve").await?;
    let id = proxy.wait_for_session("steve").await?.id().to_string();
    let http = reqwest::Client::new();

    let resp = http
        .post(format!("{api}/sessions/{id}/transfer"))
        .json(&json!({ "server": "nowhere" }))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(client.echo("stay").await?, "lobby:stay");

    let resp = http
        .post(format!("{api}/sessions/{id}/transfer"))
        .json(&json!({ "server": "pvp" }))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await?;
    assert_eq!(body["server"], "pvp");
    assert_eq!(body["session_id"], id.as_str());

    assert_eq!(pvp.expect_login().await?, "Steve");
    client.recv_id(plexus_core::wire::START_GAME).await?;
    assert_eq!(client.echo("moved").await?, "pvp:moved");
    Ok(())
}

#[tokio::test]
async fn drop_session_over_api() -> Result<()> {
    let lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let proxy = Proxy::start(vec![lobby.descriptor("lobby")]).await?;
    let (api, _shutdown) = start_api(&proxy).await?;

    let mut client = MockClient::connect(proxy.addr).await?;
    client.join("Steve").await?;
    let id = proxy.wait_for_session("steve").await?.id().to_string();
    let http = reqwest::Client::new();

    let body: Value = http
        .delete(format!("{api}/sessions/{id}"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["dropped"], true);
    assert_eq!(client.expect_disconnect().await?, "Kicked by an operator");
    assert!(proxy.ctx.registry.is_empty());

    let body: Value = http
        .delete(format!("{api}/sessions/{id}"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["dropped"], false);

    let resp = reqwest::get(format!("{api}/sessions/{id}")).await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = reqwest::get(format!("{api}/sessions/not-hex")).await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn shutdown_endpoint_signals_daemon() -> Result<()> {
    let lobby = MockBackend::start(BackendOptions::new("lobby")).await?;
    let proxy = Proxy::start(vec![lobby.descriptor("lobby")]).await?;
    let (api, shutdown_tx) = start_api(&proxy).await?;
    let mut shutdown_rx = shutdown_tx.subscribe();

    let resp = reqwest::Client::new()
        .post(format!("{api}/daemon/shutdown"))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    within("shutdown signal", shutdown_rx.recv()).await??;
    Ok(())
}
