//! Client leg driver.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info};

use plexus_core::token::forge_login;
use plexus_core::wire::{Disconnect, LoginPacket};

use super::{create_session, ProxyContext, SHUTDOWN_MESSAGE};
use crate::connection::{split, FrameWriter};
use crate::error::{Leg, RelayError};
use crate::handshake::{LoginAccepted, UpstreamHandshake, UpstreamOutcome};
use crate::session::{LegCommand, SessionInit};

/// Drive one client connection from its login to the end of its session.
///
/// Returns an error only when the connection fails before a session
/// exists; afterwards failures are reported through the session.
pub async fn serve_upstream<S>(
    ctx: Arc<ProxyContext>,
    stream: S,
    peer: SocketAddr,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = split(stream);
    let mut handshake = UpstreamHandshake::new(ctx.keypair.clone(), ctx.settings.trust.clone());

    let first = match tokio::time::timeout(ctx.settings.handshake_timeout, reader.read_packet()).await {
        Ok(Ok(Some(packet))) => packet,
        Ok(Ok(None)) => return Err(RelayError::Closed),
        Ok(Err(e)) => return reject(&mut writer, e).await,
        Err(_) => return reject(&mut writer, RelayError::HandshakeTimeout).await,
    };

    let accepted: LoginAccepted = match handshake.login(&first) {
        Ok(accepted) => accepted,
        Err(e) => return reject(&mut writer, e).await,
    };

    let tokens = match forge_login(&ctx.keypair, &accepted.login.profile, &accepted.login.client_data) {
        Ok(tokens) => tokens,
        Err(e) => return reject(&mut writer, e.into()).await,
    };
    let downstream_login = match (LoginPacket {
        protocol_version: accepted.protocol_version,
        chain: tokens.chain,
        client_data: tokens.client_data,
    })
    .encode()
    {
        Ok(packet) => packet,
        Err(e) => return reject(&mut writer, e.into()).await,
    };

    let (upstream_tx, mut commands) = mpsc::unbounded_channel();
    let init = SessionInit {
        profile: accepted.login.profile.clone(),
        upstream_addr: peer,
        upstream_tx,
        downstream_login,
        pending_limit: ctx.settings.pending_limit,
        registry: ctx.registry.clone(),
    };
    let session = match create_session(&ctx, init, None) {
        Ok(session) => session,
        Err(e) => return reject(&mut writer, e).await,
    };

    writer.write_packet(&accepted.reply).await.map_err(|e| {
        session.close(Leg::Upstream, Some(&e));
        e
    })?;
    reader.enable_encryption(&accepted.key);
    writer.enable_encryption(&accepted.key);
    info!(
        session_id = %session.id().short(),
        identity = %session.identity(),
        %peer,
        protocol = accepted.protocol_version,
        "client logged in"
    );

    let mut closing = false;
    loop {
        tokio::select! {
            read = reader.read_packet(), if !closing => match read {
                Ok(Some(packet)) => {
                    let result = match handshake.handle(&packet) {
                        Ok(UpstreamOutcome::Established) => {
                            let released = session.upstream_established();
                            debug!(session_id = %session.id().short(), released, "upstream established");
                            Ok(())
                        }
                        Ok(UpstreamOutcome::Relay) => session.relay_upstream(packet),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        session.close(Leg::Upstream, Some(&e));
                        closing = true;
                    }
                }
                Ok(None) => {
                    session.close(Leg::Upstream, None);
                    closing = true;
                }
                Err(e) => {
                    session.close(Leg::Upstream, Some(&e));
                    closing = true;
                }
            },

            command = commands.recv() => match command {
                Some(LegCommand::Send(packet)) => {
                    if let Err(e) = writer.write_packet(&packet).await {
                        session.close(Leg::Upstream, Some(&e));
                        closing = true;
                    }
                }
                Some(LegCommand::Close(message)) => {
                    if let Some(message) = message {
                        let _ = writer.write_packet(&Disconnect::new(message).encode()).await;
                    }
                    break;
                }
                None => break,
            },
        }
    }

    writer.shutdown().await;
    debug!(session_id = %session.id().short(), %peer, "upstream leg ended");
    Ok(())
}

/// Refuse a connection that failed admission: a disconnect with the reason,
/// then close.
pub async fn refuse_upstream<S>(ctx: &ProxyContext, stream: S)
where
    S: AsyncRead + AsyncWrite,
{
    let (_, mut writer) = split(stream);
    let message = if ctx.is_accepting() {
        RelayError::Rejected.disconnect_message()
    } else {
        SHUTDOWN_MESSAGE.to_string()
    };
    let _ = writer.write_packet(&Disconnect::new(message).encode()).await;
    writer.shutdown().await;
}

/// Tell a client that never got a session why, then fail.
async fn reject<W>(writer: &mut FrameWriter<W>, error: RelayError) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    let _ = writer
        .write_packet(&Disconnect::new(error.disconnect_message()).encode())
        .await;
    writer.shutdown().await;
    Err(error)
}
