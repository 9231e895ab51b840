//! Thread-backed process groups.
//!
//! A [`LocalUniverse`] runs one closure per rank on a dedicated rayon pool. Ranks
//! exchange byte messages through unbounded crossbeam channels, one inbox per rank.
//! Sub-groups created by [`Comm::split`] share the inboxes of their members but carry
//! their own message context, so traffic of sibling or nested groups never mixes.
//!
//! Aborting any communicator wakes every rank blocked in a receive with
//! [`CommError::Aborted`].

use super::{Comm, Tag, TAG_BARRIER, TAG_BROADCAST, TAG_SPLIT};
use crate::error::CommError;
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rayon::ThreadPoolBuilder;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

struct Envelope {
    context: u64,
    source: usize,
    tag: Tag,
    payload: Vec<u8>,
}

struct Shared {
    outboxes: Vec<Sender<Envelope>>,
    aborted: AtomicBool,
    // Never written to; dropping the trigger disconnects it and wakes every receiver.
    abort_signal: Receiver<()>,
    abort_trigger: Mutex<Option<Sender<()>>>,
}

impl Shared {
    fn trigger_abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.abort_trigger.lock().take();
    }
}

struct Mailbox {
    inbox: Receiver<Envelope>,
    pending: VecDeque<Envelope>,
}

/// Communicator of one rank inside a [`LocalUniverse`].
#[derive(Clone)]
pub struct LocalComm {
    shared: Arc<Shared>,
    mailbox: Arc<Mutex<Mailbox>>,
    members: Arc<[usize]>,
    rank: usize,
    context: u64,
    splits: Arc<AtomicU64>,
}

impl LocalComm {
    fn matches(&self, envelope: &Envelope, source: Option<usize>, tag: Tag) -> bool {
        envelope.context == self.context
            && envelope.tag == tag
            && source.map_or(true, |s| envelope.source == s)
    }

    fn receive(&self, source: Option<usize>, tag: Tag) -> Result<Envelope, CommError> {
        let mut guard = self.mailbox.lock();
        let Mailbox { inbox, pending } = &mut *guard;
        if let Some(pos) = pending.iter().position(|e| self.matches(e, source, tag)) {
            if let Some(envelope) = pending.remove(pos) {
                return Ok(envelope);
            }
        }
        let abort = &self.shared.abort_signal;
        loop {
            if self.shared.aborted.load(Ordering::SeqCst) {
                return Err(CommError::Aborted);
            }
            select! {
                recv(inbox) -> msg => {
                    let envelope = msg.map_err(|_| CommError::Aborted)?;
                    if self.matches(&envelope, source, tag) {
                        return Ok(envelope);
                    }
                    pending.push_back(envelope);
                }
                recv(abort) -> _ => return Err(CommError::Aborted),
            }
        }
    }

    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank < self.members.len() {
            Ok(())
        } else {
            Err(CommError::InvalidRank { rank, size: self.members.len() })
        }
    }
}

impl Comm for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn barrier(&self) -> Result<(), CommError> {
        if self.rank == 0 {
            for r in 1..self.size() {
                self.recv_from(r, TAG_BARRIER)?;
            }
            for r in 1..self.size() {
                self.send(r, TAG_BARRIER, &[])?;
            }
        } else {
            self.send(0, TAG_BARRIER, &[])?;
            self.recv_from(0, TAG_BARRIER)?;
        }
        Ok(())
    }

    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> Result<(), CommError> {
        self.check_rank(dest)?;
        if self.shared.aborted.load(Ordering::SeqCst) {
            return Err(CommError::Aborted);
        }
        let envelope = Envelope {
            context: self.context,
            source: self.rank,
            tag,
            payload: payload.to_vec(),
        };
        self.shared.outboxes[self.members[dest]]
            .send(envelope)
            .map_err(|_| CommError::Disconnected(dest))
    }

    fn recv_any(&self, tag: Tag) -> Result<(usize, Vec<u8>), CommError> {
        let envelope = self.receive(None, tag)?;
        Ok((envelope.source, envelope.payload))
    }

    fn recv_from(&self, source: usize, tag: Tag) -> Result<Vec<u8>, CommError> {
        self.check_rank(source)?;
        Ok(self.receive(Some(source), tag)?.payload)
    }

    fn broadcast(&self, root: usize, buf: &mut Vec<u8>) -> Result<(), CommError> {
        self.check_rank(root)?;
        if self.rank == root {
            for r in (0..self.size()).filter(|&r| r != root) {
                self.send(r, TAG_BROADCAST, buf)?;
            }
        } else {
            *buf = self.recv_from(root, TAG_BROADCAST)?;
        }
        Ok(())
    }

    fn split(&self, color: Option<usize>, key: usize) -> Result<Option<Self>, CommError> {
        let encoded = encode_split_entry(color, key);
        for r in (0..self.size()).filter(|&r| r != self.rank) {
            self.send(r, TAG_SPLIT, &encoded)?;
        }
        let mut entries = Vec::with_capacity(self.size());
        entries.push((color, key, self.rank));
        for r in (0..self.size()).filter(|&r| r != self.rank) {
            let bytes = self.recv_from(r, TAG_SPLIT)?;
            let (c, k) = decode_split_entry(&bytes)?;
            entries.push((c, k, r));
        }
        // every rank advances the sequence, including those leaving the split
        let seq = self.splits.fetch_add(1, Ordering::SeqCst);
        let Some(color) = color else {
            return Ok(None);
        };

        let mut group: Vec<(usize, usize)> = entries
            .into_iter()
            .filter(|(c, _, _)| *c == Some(color))
            .map(|(_, k, r)| (k, r))
            .collect();
        group.sort_unstable();
        let rank = group
            .iter()
            .position(|&(_, r)| r == self.rank)
            .ok_or(CommError::InvalidRank { rank: self.rank, size: group.len() })?;
        let members: Arc<[usize]> = group.iter().map(|&(_, r)| self.members[r]).collect();

        Ok(Some(LocalComm {
            shared: Arc::clone(&self.shared),
            mailbox: Arc::clone(&self.mailbox),
            members,
            rank,
            context: child_context(self.context, seq, color),
            splits: Arc::new(AtomicU64::new(0)),
        }))
    }

    fn abort(&self, code: i32) {
        log::debug!("local rank {} aborting process tree (code {code})", self.members[self.rank]);
        self.shared.trigger_abort();
    }
}

fn encode_split_entry(color: Option<usize>, key: usize) -> [u8; 17] {
    let mut out = [0u8; 17];
    if let Some(c) = color {
        out[0] = 1;
        out[1..9].copy_from_slice(&(c as u64).to_le_bytes());
    }
    out[9..17].copy_from_slice(&(key as u64).to_le_bytes());
    out
}

fn decode_split_entry(bytes: &[u8]) -> Result<(Option<usize>, usize), CommError> {
    if bytes.len() != 17 {
        return Err(CommError::Unsupported("malformed split message"));
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[1..9]);
    let color = (bytes[0] == 1).then(|| u64::from_le_bytes(word) as usize);
    word.copy_from_slice(&bytes[9..17]);
    Ok((color, u64::from_le_bytes(word) as usize))
}

/// splitmix64 over (parent context, split sequence, color).
fn child_context(parent: u64, seq: u64, color: usize) -> u64 {
    let mut z = parent
        ^ seq.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (color as u64).wrapping_add(1).wrapping_mul(0xD6E8_FEB8_6659_FD93);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Aborts the tree if a rank unwinds, so its peers do not wait on it forever.
struct AbortOnPanic(Arc<Shared>);

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.trigger_abort();
        }
    }
}

/// A fixed-size pool of thread ranks.
#[derive(Debug, Clone, Copy)]
pub struct LocalUniverse {
    size: usize,
}

impl LocalUniverse {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    /// One rank per logical CPU.
    pub fn with_available_parallelism() -> Self {
        Self::new(num_cpus::get())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `body` once per rank and return the per-rank results in rank order.
    pub fn run<F, R>(&self, body: F) -> Result<Vec<R>, CommError>
    where
        F: Fn(LocalComm) -> R + Sync,
        R: Send,
    {
        let (outboxes, inboxes): (Vec<_>, Vec<_>) = (0..self.size).map(|_| unbounded()).unzip();
        let (abort_trigger, abort_signal) = unbounded::<()>();
        let shared = Arc::new(Shared {
            outboxes,
            aborted: AtomicBool::new(false),
            abort_signal,
            abort_trigger: Mutex::new(Some(abort_trigger)),
        });
        let members: Arc<[usize]> = (0..self.size).collect();

        // one extra worker for the scope owner
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.size + 1)
            .thread_name(|i| format!("metasched-rank-{i}"))
            .build()
            .map_err(|e| CommError::Spawn(e.to_string()))?;

        let (done_tx, done_rx) = unbounded();
        let body = &body;
        pool.scope(|scope| {
            for (rank, inbox) in inboxes.into_iter().enumerate() {
                let shared = Arc::clone(&shared);
                let members = Arc::clone(&members);
                let done_tx = done_tx.clone();
                scope.spawn(move |_| {
                    let _guard = AbortOnPanic(Arc::clone(&shared));
                    let comm = LocalComm {
                        shared,
                        mailbox: Arc::new(Mutex::new(Mailbox { inbox, pending: VecDeque::new() })),
                        members,
                        rank,
                        context: 0,
                        splits: Arc::new(AtomicU64::new(0)),
                    };
                    let _ = done_tx.send((rank, body(comm)));
                });
            }
        });
        drop(done_tx);

        let mut results: Vec<(usize, R)> = done_rx.iter().collect();
        results.sort_by_key(|(rank, _)| *rank);
        Ok(results.into_iter().map(|(_, r)| r).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_every_rank() {
        let out = LocalUniverse::new(4)
            .run(|comm| {
                let mut buf = if comm.rank() == 2 { vec![9, 8, 7] } else { Vec::new() };
                comm.broadcast(2, &mut buf).unwrap();
                buf
            })
            .unwrap();
        assert!(out.iter().all(|b| b == &vec![9, 8, 7]));
    }

    #[test]
    fn split_orders_members_by_key() {
        let out = LocalUniverse::new(5)
            .run(|comm| {
                let color = if comm.rank() == 4 { None } else { Some(comm.rank() % 2) };
                let key = 10 - comm.rank();
                comm.split(color, key)
                    .unwrap()
                    .map(|sub| (sub.rank(), sub.size()))
            })
            .unwrap();
        // color 0: ranks {0, 2} keyed 10, 8 -> rank 2 first
        assert_eq!(out[0], Some((1, 2)));
        assert_eq!(out[2], Some((0, 2)));
        assert_eq!(out[1], Some((1, 2)));
        assert_eq!(out[3], Some((0, 2)));
        assert_eq!(out[4], None);
    }

    #[test]
    fn sibling_groups_do_not_see_each_others_traffic() {
        let out = LocalUniverse::new(4)
            .run(|comm| {
                let sub = comm.split(Some(comm.rank() / 2), comm.rank()).unwrap().unwrap();
                if sub.rank() == 0 {
                    sub.send(1, 5, &[comm.rank() as u8]).unwrap();
                    None
                } else {
                    Some(sub.recv_any(5).unwrap())
                }
            })
            .unwrap();
        assert_eq!(out[1], Some((0, vec![0])));
        assert_eq!(out[3], Some((0, vec![2])));
    }

    #[test]
    fn abort_unblocks_waiting_ranks() {
        let out = LocalUniverse::new(3)
            .run(|comm| {
                if comm.rank() == 0 {
                    comm.abort(1);
                    Ok(Vec::new())
                } else {
                    comm.recv_from(0, 1)
                }
            })
            .unwrap();
        assert_eq!(out[1], Err(CommError::Aborted));
        assert_eq!(out[2], Err(CommError::Aborted));
    }

    #[test]
    fn barrier_completes() {
        let out = LocalUniverse::new(3).run(|comm| comm.barrier()).unwrap();
        assert!(out.iter().all(|r| r.is_ok()));
    }
}
