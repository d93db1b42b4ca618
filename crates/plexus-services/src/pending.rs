//! Holding area for upstream packets while the backend is not ready.

use std::collections::VecDeque;

use plexus_core::Packet;

use crate::error::RelayError;

/// Bounded FIFO of packets waiting for the downstream leg.
#[derive(Debug)]
pub struct PendingQueue {
    packets: VecDeque<Packet>,
    limit: usize,
}

impl PendingQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            packets: VecDeque::new(),
            limit,
        }
    }

    /// Queue a packet. Overflowing the limit means the backend is not coming
    /// up in any useful time, and is treated as a handshake timeout.
    pub fn push(&mut self, packet: Packet) -> Result<(), RelayError> {
        if self.packets.len() >= self.limit {
            return Err(RelayError::HandshakeTimeout);
        }
        self.packets.push_back(packet);
        Ok(())
    }

    /// Take every queued packet in arrival order.
    pub fn drain(&mut self) -> Vec<Packet> {
        self.packets.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

/// Whether upstream packets go straight to the backend or wait.
#[derive(Debug)]
pub enum RelayGate {
    Buffering(PendingQueue),
    Open,
}

impl RelayGate {
    pub fn buffering(limit: usize) -> Self {
        RelayGate::Buffering(PendingQueue::new(limit))
    }

    pub fn is_open(&self) -> bool {
        matches!(self, RelayGate::Open)
    }

    /// Open the gate and hand back whatever was waiting. Opening an open
    /// gate yields nothing, so queued packets are released exactly once.
    pub fn open(&mut self) -> Vec<Packet> {
        match std::mem::replace(self, RelayGate::Open) {
            RelayGate::Buffering(mut queue) => queue.drain(),
            RelayGate::Open => Vec::new(),
        }
    }

    pub fn queued(&self) -> usize {
        match self {
            RelayGate::Buffering(queue) => queue.len(),
            RelayGate::Open => 0,
        }
    }
}
