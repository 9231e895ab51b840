//! Arena of nested process groups.
//!
//! Each meta-iterator partitions the group it runs on into iterator servers; the
//! server group becomes a new level whose parent is the partitioned level. Levels are
//! addressed by [`LevelId`] and refer to their parent by index, so the recursive
//! estimate / partition / free pattern walks the tree without owning back-pointers.

use super::{Comm, Communicator};
use crate::error::SchedError;

pub type LevelId = usize;

/// One level of the process hierarchy as seen from the calling process.
#[derive(Debug, Clone)]
pub struct ProcessGroup {
    parent: Option<LevelId>,
    /// `None` when this process is a dedicated master or idle at this level.
    comm: Option<Communicator>,
    server_id: usize,
    freed: bool,
}

impl ProcessGroup {
    pub fn parent(&self) -> Option<LevelId> {
        self.parent
    }

    pub fn comm(&self) -> Option<&Communicator> {
        self.comm.as_ref()
    }

    /// Server of the parent partition this process belongs to (1 at the root).
    pub fn server_id(&self) -> usize {
        self.server_id
    }

    pub fn is_member(&self) -> bool {
        self.comm.is_some()
    }

    pub fn rank(&self) -> Option<usize> {
        self.comm.as_ref().map(|c| c.rank())
    }

    pub fn size(&self) -> usize {
        self.comm.as_ref().map_or(0, |c| c.size())
    }
}

#[derive(Debug)]
pub struct ProcessTree {
    groups: Vec<ProcessGroup>,
}

impl ProcessTree {
    pub const ROOT: LevelId = 0;

    pub fn new(world: Communicator) -> Self {
        Self {
            groups: vec![ProcessGroup {
                parent: None,
                comm: Some(world),
                server_id: 1,
                freed: false,
            }],
        }
    }

    pub fn group(&self, id: LevelId) -> Result<&ProcessGroup, SchedError> {
        match self.groups.get(id) {
            Some(group) if !group.freed => Ok(group),
            _ => Err(SchedError::Spec(format!("process level {id} does not exist"))),
        }
    }

    /// Communicator of level `id`, if this process is a member of it.
    pub fn comm(&self, id: LevelId) -> Option<&Communicator> {
        self.group(id).ok().and_then(|g| g.comm())
    }

    pub fn world(&self) -> Option<&Communicator> {
        self.comm(Self::ROOT)
    }

    pub fn push_child(
        &mut self,
        parent: LevelId,
        comm: Option<Communicator>,
        server_id: usize,
    ) -> Result<LevelId, SchedError> {
        self.group(parent)?;
        self.groups.push(ProcessGroup { parent: Some(parent), comm, server_id, freed: false });
        Ok(self.groups.len() - 1)
    }

    /// Release level `id`. Children must be released first.
    pub fn free(&mut self, id: LevelId) -> Result<(), SchedError> {
        if id == Self::ROOT {
            return Err(SchedError::Lifecycle { from: "root level", to: "freed" });
        }
        self.group(id)?;
        if self.groups.iter().any(|g| !g.freed && g.parent == Some(id)) {
            return Err(SchedError::Lifecycle { from: "level with live children", to: "freed" });
        }
        let group = &mut self.groups[id];
        group.freed = true;
        group.comm = None;
        while self.groups.len() > 1 && self.groups.last().is_some_and(|g| g.freed) {
            self.groups.pop();
        }
        Ok(())
    }

    /// Number of ancestors between `id` and the root.
    pub fn depth(&self, id: LevelId) -> usize {
        let mut depth = 0;
        let mut current = self.groups.get(id).and_then(|g| g.parent);
        while let Some(parent) = current {
            depth += 1;
            current = self.groups.get(parent).and_then(|g| g.parent);
        }
        depth
    }

    pub fn live_levels(&self) -> usize {
        self.groups.iter().filter(|g| !g.freed).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::SerialComm;

    #[test]
    fn levels_track_parents_and_free_in_order() {
        let mut tree = ProcessTree::new(SerialComm.into());
        let a = tree.push_child(ProcessTree::ROOT, Some(SerialComm.into()), 1).unwrap();
        let b = tree.push_child(a, None, 3).unwrap();
        assert_eq!(tree.depth(b), 2);
        assert!(tree.comm(b).is_none());
        assert_eq!(tree.group(b).unwrap().server_id(), 3);

        assert!(tree.free(a).is_err());
        tree.free(b).unwrap();
        tree.free(a).unwrap();
        assert_eq!(tree.live_levels(), 1);
        assert!(tree.group(a).is_err());
    }
}
