//! In-process transport: every rank is a thread with one receive queue.

use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use super::{Envelope, Transport};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};

/// Endpoints of an in-process world, one per rank.
#[derive(Debug)]
pub struct LocalWorld {
    endpoints: Vec<LocalEndpoint>,
}

impl LocalWorld {
    /// A world of `size` ranks with no message size limit.
    pub fn new(size: usize) -> Result<Self> {
        Self::with_limit(size, usize::MAX)
    }

    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        Self::with_limit(config.ranks, config.max_message_bytes)
    }

    fn with_limit(size: usize, max_message_bytes: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidRank { rank: 0, size });
        }
        let (senders, receivers): (Vec<Sender<Envelope>>, Vec<Receiver<Envelope>>) =
            (0..size).map(|_| mpsc::channel()).unzip();
        let endpoints = receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| LocalEndpoint {
                rank,
                peers: senders.clone(),
                receiver,
                max_message_bytes,
            })
            .collect();
        Ok(Self { endpoints })
    }

    pub fn size(&self) -> usize {
        self.endpoints.len()
    }

    pub fn into_endpoints(self) -> Vec<LocalEndpoint> {
        self.endpoints
    }
}

/// One rank's view of a [`LocalWorld`].
#[derive(Debug)]
pub struct LocalEndpoint {
    rank: usize,
    peers: Vec<Sender<Envelope>>,
    receiver: Receiver<Envelope>,
    max_message_bytes: usize,
}

impl Transport for LocalEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, dest: usize, mut envelope: Envelope) -> Result<()> {
        let size = self.peers.len();
        let peer = self
            .peers
            .get(dest)
            .ok_or(Error::InvalidRank { rank: dest, size })?;
        let bytes = envelope.payload.len();
        if bytes > self.max_message_bytes {
            return Err(Error::transport(format!(
                "message of {bytes} bytes exceeds the limit of {}",
                self.max_message_bytes
            )));
        }
        envelope.source = self.rank;
        peer.send(envelope)
            .map_err(|_| Error::transport(format!("rank {dest} has disconnected")))
    }

    fn recv(&self) -> Result<Envelope> {
        self.receiver
            .recv()
            .map_err(|_| Error::transport("all peers have disconnected"))
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(Error::transport("all peers have disconnected"))
            }
        }
    }
}
