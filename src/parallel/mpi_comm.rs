//! MPI-based process groups.
//!
//! This module provides an implementation of the `Comm` trait on top of an MPI
//! communicator, so iterator servers map onto real MPI sub-communicators created with
//! `MPI_Comm_split` and the tree-wide abort maps onto `MPI_Abort`. The implementation
//! is only available when the `mpi` feature is enabled.
//!
//! # Example
//! ```no_run
//! # #[cfg(feature = "mpi")] {
//! use metasched::parallel::{Comm, MpiComm};
//! let world = MpiComm::init().expect("MPI already initialized");
//! println!("Rank: {} / {}", world.rank(), world.size());
//! # }
//! ```

use super::{Comm, Tag};
use crate::error::CommError;
use mpi::environment::Universe;
use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::*;
use std::rc::Rc;

/// MPI communicator wrapper.
///
/// Holds the communicator and keeps the MPI environment alive for as long as any
/// group derived from the world communicator exists.
#[derive(Clone)]
pub struct MpiComm {
    comm: Rc<SimpleCommunicator>,
    rank: usize,
    size: usize,
    _universe: Rc<Universe>,
}

impl MpiComm {
    /// Initializes MPI and returns the world communicator.
    ///
    /// Returns `None` if MPI was already initialized in this process.
    pub fn init() -> Option<Self> {
        let universe = Rc::new(mpi::initialize()?);
        let world = universe.world();
        Some(Self::wrap(world, universe))
    }

    fn wrap(comm: SimpleCommunicator, universe: Rc<Universe>) -> Self {
        let rank = comm.rank() as usize;
        let size = comm.size() as usize;
        MpiComm { comm: Rc::new(comm), rank, size, _universe: universe }
    }

    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank < self.size {
            Ok(())
        } else {
            Err(CommError::InvalidRank { rank, size: self.size })
        }
    }
}

impl Comm for MpiComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.comm.barrier();
        Ok(())
    }

    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> Result<(), CommError> {
        self.check_rank(dest)?;
        self.comm.process_at_rank(dest as i32).send_with_tag(payload, tag);
        Ok(())
    }

    fn recv_any(&self, tag: Tag) -> Result<(usize, Vec<u8>), CommError> {
        let (payload, status) = self.comm.any_process().receive_vec_with_tag::<u8>(tag);
        Ok((status.source_rank() as usize, payload))
    }

    fn recv_from(&self, source: usize, tag: Tag) -> Result<Vec<u8>, CommError> {
        self.check_rank(source)?;
        let (payload, _status) = self
            .comm
            .process_at_rank(source as i32)
            .receive_vec_with_tag::<u8>(tag);
        Ok(payload)
    }

    /// Two-phase broadcast: the length first, then the bytes.
    fn broadcast(&self, root: usize, buf: &mut Vec<u8>) -> Result<(), CommError> {
        self.check_rank(root)?;
        let root_process = self.comm.process_at_rank(root as i32);
        let mut len = buf.len() as u64;
        root_process.broadcast_into(&mut len);
        if self.rank != root {
            buf.resize(len as usize, 0);
        }
        if len > 0 {
            root_process.broadcast_into(&mut buf[..]);
        }
        Ok(())
    }

    fn split(&self, color: Option<usize>, key: usize) -> Result<Option<Self>, CommError> {
        let color = match color {
            Some(c) => Color::with_value(c as i32),
            None => Color::undefined(),
        };
        Ok(self
            .comm
            .split_by_color_with_key(color, key as i32)
            .map(|sub| Self::wrap(sub, Rc::clone(&self._universe))))
    }

    fn abort(&self, code: i32) {
        self.comm.abort(code)
    }
}
