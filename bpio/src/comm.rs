//! Communicators
//!
//! Cross-rank coordination goes exclusively through [`Comm`]. The trait is
//! kept to point-to-point messaging; collectives are provided on top of it
//! and always communicate sizes before payloads, so peers never need to
//! agree on buffer lengths up front.
//!
//! [`ThreadComm`] connects in-process ranks with `flume` channels and is what
//! the multi-rank engines and tests run on. Any failure inside a collective
//! is broadcast as an abort so every participant fails the same way.

use std::time::Duration;

use log::{trace, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Message tags used by the collectives
pub mod tags {
    pub const GATHER_SIZE: u32 = 1;
    pub const GATHER_DATA: u32 = 2;
    pub const BROADCAST: u32 = 3;
    pub const DATA_SIZE: u32 = 10;
    pub const DATA: u32 = 11;
    pub const DATA_OFFSET: u32 = 12;
    pub const TOKEN: u32 = 13;
    pub const ABORT: u32 = u32::MAX;
}

/// Rank-to-rank communication used by aggregating engines
pub trait Comm: Send {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Send a tagged message; never blocks
    fn send(&self, dest: usize, tag: u32, data: Vec<u8>) -> Result<()>;

    /// Receive the next message from `source` with `tag`
    fn recv(&self, source: usize, tag: u32) -> Result<Vec<u8>>;

    /// Tell every peer that the current collective failed
    fn abort(&self, reason: &str);

    /// Bound how long a receive waits for a peer; `None` waits forever
    fn set_timeout(&mut self, _timeout: Option<Duration>) {}

    /// Gather variable-length buffers on `root`, in rank order
    fn gather_bytes(&self, data: Vec<u8>, root: usize) -> Result<Option<Vec<Vec<u8>>>> {
        if self.rank() != root {
            self.send(root, tags::GATHER_SIZE, (data.len() as u64).to_le_bytes().to_vec())?;
            self.send(root, tags::GATHER_DATA, data)?;
            return Ok(None);
        }

        let mut sizes = vec![0u64; self.size()];
        for (peer, size) in sizes.iter_mut().enumerate() {
            if peer != root {
                *size = decode_u64(&self.recv(peer, tags::GATHER_SIZE)?)?;
            }
        }
        let mut out = Vec::with_capacity(self.size());
        let mut own = Some(data);
        for (peer, &size) in sizes.iter().enumerate() {
            if peer == root {
                out.push(own.take().unwrap_or_default());
                continue;
            }
            let buf = self.recv(peer, tags::GATHER_DATA)?;
            if buf.len() as u64 != size {
                return Err(Error::CollectiveFailure(format!(
                    "rank {peer} announced {size} bytes but sent {}",
                    buf.len()
                )));
            }
            out.push(buf);
        }
        Ok(Some(out))
    }

    /// Broadcast `data` from `root`; other ranks pass `None`
    fn broadcast_bytes(&self, data: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>> {
        if self.rank() == root {
            let data = data.unwrap_or_default();
            for peer in (0..self.size()).filter(|&p| p != root) {
                self.send(peer, tags::BROADCAST, data.clone())?;
            }
            Ok(data)
        } else {
            self.recv(root, tags::BROADCAST)
        }
    }

    /// Every rank learns every rank's value
    fn all_gather_u64(&self, value: u64) -> Result<Vec<u64>> {
        let gathered = self.gather_bytes(value.to_le_bytes().to_vec(), 0)?;
        let packed = gathered.map(|parts| parts.concat());
        let all = self.broadcast_bytes(packed, 0)?;
        all.chunks_exact(8).map(decode_u64).collect()
    }

    fn barrier(&self) -> Result<()> {
        self.all_gather_u64(0).map(|_| ())
    }
}

pub(crate) fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::CollectiveFailure(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_le_bytes(raw))
}

/// Settle the outcome of a collective step, broadcasting an abort if it failed
pub(crate) fn collective<T>(comm: &dyn Comm, what: &str, result: Result<T>) -> Result<T> {
    result.map_err(|err| {
        if comm.size() > 1 {
            warn!("rank {}: {what} failed, aborting collective: {err}", comm.rank());
            comm.abort(&err.to_string());
        }
        match err {
            Error::CollectiveFailure(_) => err,
            other => Error::CollectiveFailure(format!("{what}: {other}")),
        }
    })
}

/// Single-process communicator
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfComm;

impl Comm for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, dest: usize, _tag: u32, _data: Vec<u8>) -> Result<()> {
        Err(Error::invalid(format!("rank {dest} does not exist in a single-rank communicator")))
    }

    fn recv(&self, source: usize, _tag: u32) -> Result<Vec<u8>> {
        Err(Error::invalid(format!("rank {source} does not exist in a single-rank communicator")))
    }

    fn abort(&self, _reason: &str) {}

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Message {
    source: usize,
    tag: u32,
    payload: Vec<u8>,
}

/// In-process rank connected to its peers by channels
pub struct ThreadComm {
    rank: usize,
    peers: Vec<flume::Sender<Message>>,
    inbox: flume::Receiver<Message>,
    /// Messages received while waiting for another source or tag
    pending: Mutex<Vec<Message>>,
    timeout: Option<Duration>,
}

impl ThreadComm {
    /// Create a fully connected group of `size` ranks
    pub fn create(size: usize) -> Vec<ThreadComm> {
        Self::create_with_timeout(size, Some(Duration::from_secs(60)))
    }

    /// Create a group whose receives fail after `timeout` (`None` waits forever)
    pub fn create_with_timeout(size: usize, timeout: Option<Duration>) -> Vec<ThreadComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| flume::unbounded::<Message>()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ThreadComm {
                rank,
                peers: senders.clone(),
                inbox,
                pending: Mutex::new(Vec::new()),
                timeout,
            })
            .collect()
    }

    fn take_pending(&self, source: usize, tag: u32) -> Option<Vec<u8>> {
        let mut pending = self.pending.lock();
        let pos = pending
            .iter()
            .position(|m| m.source == source && m.tag == tag)?;
        Some(pending.remove(pos).payload)
    }

    fn aborted(&self, message: &Message) -> Error {
        Error::CollectiveFailure(format!(
            "rank {} aborted: {}",
            message.source,
            String::from_utf8_lossy(&message.payload)
        ))
    }
}

impl Comm for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, dest: usize, tag: u32, data: Vec<u8>) -> Result<()> {
        let peer = self
            .peers
            .get(dest)
            .ok_or_else(|| Error::invalid(format!("rank {dest} out of range")))?;
        trace!("rank {} -> {dest}: tag {tag}, {} bytes", self.rank, data.len());
        peer.send(Message {
            source: self.rank,
            tag,
            payload: data,
        })
        .map_err(|_| Error::CollectiveFailure(format!("rank {dest} disconnected")))
    }

    fn recv(&self, source: usize, tag: u32) -> Result<Vec<u8>> {
        if let Some(abort) = self
            .pending
            .lock()
            .iter()
            .find(|m| m.tag == tags::ABORT)
        {
            return Err(self.aborted(abort));
        }
        if let Some(payload) = self.take_pending(source, tag) {
            return Ok(payload);
        }

        loop {
            let message = match self.timeout {
                Some(timeout) => self.inbox.recv_timeout(timeout).map_err(|e| match e {
                    flume::RecvTimeoutError::Timeout => Error::CollectiveFailure(format!(
                        "rank {} timed out waiting for rank {source} (tag {tag})",
                        self.rank
                    )),
                    flume::RecvTimeoutError::Disconnected => {
                        Error::CollectiveFailure("communicator disconnected".into())
                    }
                })?,
                None => self
                    .inbox
                    .recv()
                    .map_err(|_| Error::CollectiveFailure("communicator disconnected".into()))?,
            };

            if message.tag == tags::ABORT {
                let err = self.aborted(&message);
                self.pending.lock().push(message);
                return Err(err);
            }
            if message.source == source && message.tag == tag {
                return Ok(message.payload);
            }
            self.pending.lock().push(message);
        }
    }

    fn abort(&self, reason: &str) {
        for (peer, sender) in self.peers.iter().enumerate() {
            if peer != self.rank {
                // peers that already left cannot be told
                let _ = sender.send(Message {
                    source: self.rank,
                    tag: tags::ABORT,
                    payload: reason.as_bytes().to_vec(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run<F, R>(size: usize, f: F) -> Vec<R>
    where
        F: Fn(ThreadComm) -> R + Send + Sync + Copy + 'static,
        R: Send + 'static,
    {
        let handles: Vec<_> = ThreadComm::create(size)
            .into_iter()
            .map(|comm| thread::spawn(move || f(comm)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_gather_variable_lengths_in_rank_order() {
        let results = run(4, |comm| {
            let data = vec![comm.rank() as u8; comm.rank() * 3];
            comm.gather_bytes(data, 0).unwrap()
        });
        let gathered = results[0].as_ref().unwrap();
        assert_eq!(gathered.len(), 4);
        for (rank, buf) in gathered.iter().enumerate() {
            assert_eq!(buf, &vec![rank as u8; rank * 3]);
        }
        assert!(results[1..].iter().all(Option::is_none));
    }

    #[test]
    fn test_all_gather_and_broadcast() {
        let results = run(3, |comm| {
            let all = comm.all_gather_u64(comm.rank() as u64 * 10).unwrap();
            let msg = comm
                .broadcast_bytes((comm.rank() == 1).then(|| b"hello".to_vec()), 1)
                .unwrap();
            comm.barrier().unwrap();
            (all, msg)
        });
        for (all, msg) in results {
            assert_eq!(all, vec![0, 10, 20]);
            assert_eq!(msg, b"hello");
        }
    }

    #[test]
    fn test_abort_reaches_waiting_peer() {
        let results = run(2, |comm| {
            if comm.rank() == 0 {
                comm.abort("disk full");
                Ok(Vec::new())
            } else {
                comm.recv(0, tags::GATHER_DATA)
            }
        });
        match &results[1] {
            Err(Error::CollectiveFailure(msg)) => assert!(msg.contains("disk full")),
            other => panic!("expected collective failure, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_is_a_collective_failure() {
        let mut comms = ThreadComm::create_with_timeout(2, Some(Duration::from_millis(20)));
        let comm = comms.remove(1);
        assert!(matches!(comm.recv(0, 7), Err(Error::CollectiveFailure(_))));
    }

    #[test]
    fn test_self_comm_collectives() {
        let comm = SelfComm;
        assert_eq!(comm.gather_bytes(vec![1, 2], 0).unwrap(), Some(vec![vec![1, 2]]));
        assert_eq!(comm.all_gather_u64(5).unwrap(), vec![5]);
        assert!(comm.barrier().is_ok());
    }
}
