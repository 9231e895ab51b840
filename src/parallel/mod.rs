//! Process-group communication for the iterator scheduler.
//!
//! Every backend exposes the same small message-passing contract: point-to-point
//! byte messages with tags, a rooted broadcast, a barrier, communicator splitting
//! (used to carve a group into iterator servers) and a tree-wide abort.
//!
//! Backends:
//! - [`SerialComm`]: a single process, always available.
//! - [`LocalComm`] (feature `rayon`): each rank is a thread of a dedicated rayon pool,
//!   messages travel over crossbeam channels.
//! - [`MpiComm`] (feature `mpi`): each rank is an MPI process.
//!
//! [`Communicator`] wraps whichever backend is active so the rest of the crate is
//! written against a single concrete type.

use crate::error::CommError;

pub mod hierarchy;
pub use hierarchy::{LevelId, ProcessGroup, ProcessTree};

/// Message tag. Non-negative so it maps directly onto MPI tags.
pub type Tag = i32;

/// Tags at or above this value are reserved for collectives implemented on top of
/// point-to-point messages.
pub const RESERVED_TAG_BASE: Tag = 30_000;
pub(crate) const TAG_BROADCAST: Tag = RESERVED_TAG_BASE;
pub(crate) const TAG_BARRIER: Tag = RESERVED_TAG_BASE + 1;
pub(crate) const TAG_SPLIT: Tag = RESERVED_TAG_BASE + 2;

pub trait Comm {
    /// Rank of this process within the group.
    fn rank(&self) -> usize;
    /// Number of processes in the group.
    fn size(&self) -> usize;
    fn barrier(&self) -> Result<(), CommError>;
    /// Send `payload` to group rank `dest`. Never blocks on the receiver.
    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> Result<(), CommError>;
    /// Block until a message with `tag` arrives from any rank.
    fn recv_any(&self, tag: Tag) -> Result<(usize, Vec<u8>), CommError>;
    /// Block until a message with `tag` arrives from `source`.
    fn recv_from(&self, source: usize, tag: Tag) -> Result<Vec<u8>, CommError>;
    /// Replace `buf` on every rank with the contents held by `root`.
    fn broadcast(&self, root: usize, buf: &mut Vec<u8>) -> Result<(), CommError>;
    /// Collective split. Ranks passing the same `Some(color)` form one child group,
    /// ordered by `key`; ranks passing `None` receive no child group.
    fn split(&self, color: Option<usize>, key: usize) -> Result<Option<Self>, CommError>
    where
        Self: Sized;
    /// Terminate the whole process tree this group belongs to.
    fn abort(&self, code: i32);

    fn is_lead(&self) -> bool {
        self.rank() == 0
    }
}

/// Single-process communicator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialComm;

impl Comm for SerialComm {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn barrier(&self) -> Result<(), CommError> {
        Ok(())
    }
    fn send(&self, _dest: usize, _tag: Tag, _payload: &[u8]) -> Result<(), CommError> {
        Err(CommError::Unsupported("send on a single-process communicator"))
    }
    fn recv_any(&self, _tag: Tag) -> Result<(usize, Vec<u8>), CommError> {
        Err(CommError::Unsupported("receive on a single-process communicator"))
    }
    fn recv_from(&self, _source: usize, _tag: Tag) -> Result<Vec<u8>, CommError> {
        Err(CommError::Unsupported("receive on a single-process communicator"))
    }
    fn broadcast(&self, root: usize, _buf: &mut Vec<u8>) -> Result<(), CommError> {
        if root != 0 {
            return Err(CommError::InvalidRank { rank: root, size: 1 });
        }
        Ok(())
    }
    fn split(&self, color: Option<usize>, _key: usize) -> Result<Option<Self>, CommError> {
        Ok(color.map(|_| SerialComm))
    }
    fn abort(&self, code: i32) {
        log::error!("serial process tree aborted with code {code}");
    }
}

#[cfg(feature = "rayon")]
pub mod local_comm;
#[cfg(feature = "rayon")]
pub use local_comm::{LocalComm, LocalUniverse};

#[cfg(feature = "mpi")]
pub mod mpi_comm;
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;

#[derive(Clone)]
pub enum Communicator {
    Serial(SerialComm),
    #[cfg(feature = "rayon")]
    Local(LocalComm),
    #[cfg(feature = "mpi")]
    Mpi(MpiComm),
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self {
            Communicator::Serial(_) => "serial",
            #[cfg(feature = "rayon")]
            Communicator::Local(_) => "local",
            #[cfg(feature = "mpi")]
            Communicator::Mpi(_) => "mpi",
        };
        write!(f, "Communicator({backend}, {}/{})", self.rank(), self.size())
    }
}

impl Comm for Communicator {
    fn rank(&self) -> usize {
        match self {
            Communicator::Serial(comm) => comm.rank(),
            #[cfg(feature = "rayon")]
            Communicator::Local(comm) => comm.rank(),
            #[cfg(feature = "mpi")]
            Communicator::Mpi(comm) => comm.rank(),
        }
    }
    fn size(&self) -> usize {
        match self {
            Communicator::Serial(comm) => comm.size(),
            #[cfg(feature = "rayon")]
            Communicator::Local(comm) => comm.size(),
            #[cfg(feature = "mpi")]
            Communicator::Mpi(comm) => comm.size(),
        }
    }
    fn barrier(&self) -> Result<(), CommError> {
        match self {
            Communicator::Serial(comm) => comm.barrier(),
            #[cfg(feature = "rayon")]
            Communicator::Local(comm) => comm.barrier(),
            #[cfg(feature = "mpi")]
            Communicator::Mpi(comm) => comm.barrier(),
        }
    }
    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> Result<(), CommError> {
        match self {
            Communicator::Serial(comm) => comm.send(dest, tag, payload),
            #[cfg(feature = "rayon")]
            Communicator::Local(comm) => comm.send(dest, tag, payload),
            #[cfg(feature = "mpi")]
            Communicator::Mpi(comm) => comm.send(dest, tag, payload),
        }
    }
    fn recv_any(&self, tag: Tag) -> Result<(usize, Vec<u8>), CommError> {
        match self {
            Communicator::Serial(comm) => comm.recv_any(tag),
            #[cfg(feature = "rayon")]
            Communicator::Local(comm) => comm.recv_any(tag),
            #[cfg(feature = "mpi")]
            Communicator::Mpi(comm) => comm.recv_any(tag),
        }
    }
    fn recv_from(&self, source: usize, tag: Tag) -> Result<Vec<u8>, CommError> {
        match self {
            Communicator::Serial(comm) => comm.recv_from(source, tag),
            #[cfg(feature = "rayon")]
            Communicator::Local(comm) => comm.recv_from(source, tag),
            #[cfg(feature = "mpi")]
            Communicator::Mpi(comm) => comm.recv_from(source, tag),
        }
    }
    fn broadcast(&self, root: usize, buf: &mut Vec<u8>) -> Result<(), CommError> {
        match self {
            Communicator::Serial(comm) => comm.broadcast(root, buf),
            #[cfg(feature = "rayon")]
            Communicator::Local(comm) => comm.broadcast(root, buf),
            #[cfg(feature = "mpi")]
            Communicator::Mpi(comm) => comm.broadcast(root, buf),
        }
    }
    fn split(&self, color: Option<usize>, key: usize) -> Result<Option<Self>, CommError> {
        match self {
            Communicator::Serial(comm) => Ok(comm.split(color, key)?.map(Communicator::Serial)),
            #[cfg(feature = "rayon")]
            Communicator::Local(comm) => Ok(comm.split(color, key)?.map(Communicator::Local)),
            #[cfg(feature = "mpi")]
            Communicator::Mpi(comm) => Ok(comm.split(color, key)?.map(Communicator::Mpi)),
        }
    }
    fn abort(&self, code: i32) {
        match self {
            Communicator::Serial(comm) => comm.abort(code),
            #[cfg(feature = "rayon")]
            Communicator::Local(comm) => comm.abort(code),
            #[cfg(feature = "mpi")]
            Communicator::Mpi(comm) => comm.abort(code),
        }
    }
}

impl From<SerialComm> for Communicator {
    fn from(comm: SerialComm) -> Self {
        Communicator::Serial(comm)
    }
}

#[cfg(feature = "rayon")]
impl From<LocalComm> for Communicator {
    fn from(comm: LocalComm) -> Self {
        Communicator::Local(comm)
    }
}

#[cfg(feature = "mpi")]
impl From<MpiComm> for Communicator {
    fn from(comm: MpiComm) -> Self {
        Communicator::Mpi(comm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_split_keeps_or_drops_rank() {
        let comm = SerialComm;
        assert!(comm.split(Some(3), 0).unwrap().is_some());
        assert!(comm.split(None, 0).unwrap().is_none());
    }

    #[test]
    fn serial_point_to_point_is_rejected() {
        let comm = Communicator::from(SerialComm);
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.size(), 1);
        assert!(comm.send(0, 1, &[1, 2]).is_err());
        let mut buf = vec![7u8];
        comm.broadcast(0, &mut buf).unwrap();
        assert_eq!(buf, vec![7u8]);
    }
}
