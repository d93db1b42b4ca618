//! Backend leg driver.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use plexus_core::token::TrustPolicy;
use plexus_core::Keypair;

use crate::connection::{split, FrameReader, FrameWriter};
use crate::error::{Leg, RelayError};
use crate::handshake::{DownstreamHandshake, DownstreamOutcome};
use crate::pool::{Lease, PooledStream};
use crate::session::{LegCommand, Session};

type Reader = FrameReader<tokio::io::ReadHalf<TcpStream>>;
type Writer = FrameWriter<tokio::io::WriteHalf<TcpStream>>;

/// Why a downstream leg stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// The session closed it or a transfer replaced it.
    Commanded,
    /// The backend hung up.
    PeerClosed,
    /// The pool is shutting down.
    PoolShutdown,
    /// A transfer superseded this leg while a packet was in flight.
    Superseded,
}

/// Run one backend connection for `generation` until it ends.
///
/// Sends the re-signed login, then runs the downstream handshake and relays
/// backend packets to the client. If this leg is still the session's
/// current one when it ends, the session is closed with it.
pub async fn run_downstream(
    session: Arc<Session>,
    pooled: PooledStream,
    generation: u64,
    mut commands: mpsc::UnboundedReceiver<LegCommand>,
    keypair: Arc<Keypair>,
    trust: TrustPolicy,
) {
    let PooledStream { stream, mut lease } = pooled;
    let (mut reader, mut writer) = split(stream);
    let mut handshake = DownstreamHandshake::new(keypair, trust);

    let result = drive(
        &session,
        generation,
        &mut handshake,
        &mut reader,
        &mut writer,
        &mut commands,
        &mut lease,
    )
    .await;
    writer.shutdown().await;

    debug!(
        session_id = %session.id().short(),
        generation,
        lease = lease.id(),
        outcome = ?result,
        "downstream leg ended"
    );

    if !session.is_current(generation) {
        return;
    }
    match result {
        Ok(Exit::Commanded | Exit::Superseded) => {}
        Ok(Exit::PeerClosed | Exit::PoolShutdown) => session.close(Leg::Downstream, None),
        Err(e) => session.close(Leg::Downstream, Some(&e)),
    }
}

async fn drive(
    session: &Session,
    generation: u64,
    handshake: &mut DownstreamHandshake,
    reader: &mut Reader,
    writer: &mut Writer,
    commands: &mut mpsc::UnboundedReceiver<LegCommand>,
    lease: &mut Lease,
) -> Result<Exit, RelayError> {
    writer.write_packet(session.downstream_login()).await?;

    loop {
        tokio::select! {
            read = reader.read_packet() => {
                let Some(packet) = read? else {
                    return Ok(Exit::PeerClosed);
                };
                if !session.is_current(generation) {
                    return Ok(Exit::Superseded);
                }
                match handshake.handle(&packet)? {
                    DownstreamOutcome::EnableEncryption { key, reply } => {
                        reader.enable_encryption(&key);
                        writer.enable_encryption(&key);
                        writer.write_packet(&reply).await?;
                        session.set_downstream_state(generation, handshake.state());
                        debug!(session_id = %session.id().short(), generation, "downstream encryption enabled");
                    }
                    DownstreamOutcome::Established { dimension_id } => {
                        session.send_upstream(packet)?;
                        session.open_relay(generation, dimension_id);
                    }
                    DownstreamOutcome::DimensionChanged { dimension_id } => {
                        session.set_dimension(dimension_id);
                        session.send_upstream(packet)?;
                    }
                    DownstreamOutcome::Relay => session.send_upstream(packet)?,
                }
            }

            command = commands.recv() => match command {
                Some(LegCommand::Send(packet)) => writer.write_packet(&packet).await?,
                Some(LegCommand::Close(_)) | None => return Ok(Exit::Commanded),
            },

            _ = lease.closed() => return Ok(Exit::PoolShutdown),
        }
    }
}
