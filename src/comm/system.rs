//! Communicator topology for one system: world → (manager ∪ groups).
//!
//! Replaces the original's process-wide singleton with an explicit context
//! object built once at startup and threaded into every operation that needs
//! a communicator. Layout of one system with `ngroup` groups of `nprocs`
//! ranks:
//!
//! - world ranks `g*nprocs .. (g+1)*nprocs` form group `g`,
//! - the last world rank (`ngroup*nprocs`) is the manager,
//! - `global` connects the manager with every group master,
//! - `local(g)` connects the workers of group `g`,
//! - `global_reduce(j)` connects local rank `j` across all groups (sparse
//!   grid all-reduce and cross-group subspace broadcast),
//! - `third_level` connects the designated group with the manager.
//!
//! Every communicator owns a disjoint tag window relative to the world
//! communicator, so concurrently pending traffic cannot collide.

use std::sync::Arc;

use crate::combi_error::CombiError;
use crate::comm::communicator::{CommTag, Communicator, SubComm};

/// Tag windows, relative to the world communicator. Window strides leave
/// room for the channels listed in [`chan`].
pub mod tags {
    use crate::comm::communicator::CommTag;

    pub const GLOBAL: CommTag = CommTag(0x0100);
    pub const LOCAL_BASE: u16 = 0x0200;
    pub const LOCAL_STRIDE: u16 = 0x0020;
    pub const POLE_BASE: u16 = 0x0300;
    pub const REDUCE_BASE: u16 = 0x0400;
    pub const REDUCE_STRIDE: u16 = 0x0020;
    pub const THIRD_LEVEL: CommTag = CommTag(0x0600);

    pub const fn local(group: u16) -> CommTag {
        CommTag(LOCAL_BASE + group * LOCAL_STRIDE)
    }

    pub const fn pole(group: u16, dim: u16) -> CommTag {
        CommTag(POLE_BASE + group * LOCAL_STRIDE + dim * 4)
    }

    pub const fn reduce(local_rank: u16) -> CommTag {
        CommTag(REDUCE_BASE + local_rank * REDUCE_STRIDE)
    }
}

/// Channel offsets inside a communicator's tag window.
pub mod chan {
    /// Manager → master signal frames.
    pub const SIGNAL: u16 = 0;
    /// Master → manager ready/status bytes.
    pub const READY: u16 = 1;
    /// Signal payloads (two tags: length + data).
    pub const PAYLOAD: u16 = 2;
    /// General collective traffic (up to four tags).
    pub const COLLECTIVE: u16 = 8;
    /// Second collective channel for phases that overlap the first.
    pub const COLLECTIVE_B: u16 = 12;
    /// Barrier ping/release.
    pub const BARRIER: u16 = 16;
}

/// Where this rank sits in the system.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Manager,
    Worker { group: usize, local_rank: usize },
}

/// Communicator context for one system.
pub struct CombiSystem<C: Communicator> {
    world: Arc<C>,
    ngroup: usize,
    nprocs: usize,
    tl_group: usize,
    role: Role,
    global: Option<SubComm<C>>,
    local: Option<SubComm<C>>,
    global_reduce: Option<SubComm<C>>,
    third_level: Option<SubComm<C>>,
}

impl<C: Communicator> CombiSystem<C> {
    /// Build the topology. `world` must contain exactly
    /// `ngroup * nprocs + 1` ranks; `tl_group` designates the group that
    /// participates in third-level exchange.
    pub fn init(world: C, ngroup: usize, nprocs: usize, tl_group: usize) -> Result<Self, CombiError> {
        let expected = ngroup * nprocs + 1;
        if world.size() != expected {
            return Err(CombiError::InvalidConfig(format!(
                "world has {} ranks, topology needs {} ({}x{} workers + manager)",
                world.size(),
                expected,
                ngroup,
                nprocs
            )));
        }
        if ngroup == 0 || ngroup > 8 || nprocs == 0 || nprocs > 8 {
            return Err(CombiError::InvalidConfig(
                "group count and group size must be in 1..=8".into(),
            ));
        }
        if tl_group >= ngroup {
            return Err(CombiError::InvalidConfig(format!(
                "third-level group {} out of range (ngroup = {})",
                tl_group, ngroup
            )));
        }

        let manager_rank = ngroup * nprocs;
        let my_rank = world.rank();
        let world = Arc::new(world);

        let role = if my_rank == manager_rank {
            Role::Manager
        } else {
            Role::Worker {
                group: my_rank / nprocs,
                local_rank: my_rank % nprocs,
            }
        };

        let mut global_members: Vec<usize> = (0..ngroup).map(|g| g * nprocs).collect();
        global_members.push(manager_rank);
        let global = SubComm::split(&world, global_members, tags::GLOBAL);

        let (local, global_reduce) = match role {
            Role::Manager => (None, None),
            Role::Worker { group, local_rank } => {
                let local_members: Vec<usize> =
                    (group * nprocs..(group + 1) * nprocs).collect();
                let local = SubComm::split(&world, local_members, tags::local(group as u16));
                let reduce_members: Vec<usize> =
                    (0..ngroup).map(|g| g * nprocs + local_rank).collect();
                let reduce =
                    SubComm::split(&world, reduce_members, tags::reduce(local_rank as u16));
                (local, reduce)
            }
        };

        let mut tl_members: Vec<usize> =
            (tl_group * nprocs..(tl_group + 1) * nprocs).collect();
        tl_members.push(manager_rank);
        let third_level = SubComm::split(&world, tl_members, tags::THIRD_LEVEL);

        Ok(Self {
            world,
            ngroup,
            nprocs,
            tl_group,
            role,
            global,
            local,
            global_reduce,
            third_level,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_manager(&self) -> bool {
        matches!(self.role, Role::Manager)
    }

    pub fn group_index(&self) -> Option<usize> {
        match self.role {
            Role::Worker { group, .. } => Some(group),
            Role::Manager => None,
        }
    }

    pub fn local_rank(&self) -> Option<usize> {
        match self.role {
            Role::Worker { local_rank, .. } => Some(local_rank),
            Role::Manager => None,
        }
    }

    pub fn is_group_master(&self) -> bool {
        matches!(self.role, Role::Worker { local_rank: 0, .. })
    }

    pub fn ngroup(&self) -> usize {
        self.ngroup
    }

    pub fn nprocs(&self) -> usize {
        self.nprocs
    }

    pub fn tl_group(&self) -> usize {
        self.tl_group
    }

    pub fn in_tl_group(&self) -> bool {
        self.group_index() == Some(self.tl_group)
    }

    pub fn world(&self) -> &Arc<C> {
        &self.world
    }

    /// Manager + group masters. Present on the manager and on masters.
    pub fn global(&self) -> Option<&SubComm<C>> {
        self.global.as_ref()
    }

    /// The manager's sub-rank in the global communicator.
    pub fn global_manager_rank(&self) -> usize {
        self.ngroup
    }

    /// All workers of this rank's group.
    pub fn local(&self) -> Option<&SubComm<C>> {
        self.local.as_ref()
    }

    /// Local rank `j` across all groups.
    pub fn global_reduce(&self) -> Option<&SubComm<C>> {
        self.global_reduce.as_ref()
    }

    /// Designated group + manager. Present on the manager and that group.
    pub fn third_level(&self) -> Option<&SubComm<C>> {
        self.third_level.as_ref()
    }

    /// The manager's sub-rank in the third-level communicator.
    pub fn tl_manager_rank(&self) -> usize {
        self.nprocs
    }

    /// Pole communicator for hierarchisation: the local ranks whose
    /// Cartesian coordinates differ only in one dimension. `None` when this
    /// rank is the manager or not on the pole.
    pub fn pole_comm(&self, pole_members_local: &[usize], tag: CommTag) -> Option<SubComm<C>> {
        self.local.as_ref()?.subset(pole_members_local, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::RayonComm;

    fn system_for(rank: usize, ngroup: usize, nprocs: usize) -> CombiSystem<RayonComm> {
        let size = ngroup * nprocs + 1;
        CombiSystem::init(RayonComm::new(rank, size), ngroup, nprocs, 0).unwrap()
    }

    #[test]
    fn manager_is_last_rank() {
        let sys = system_for(4, 2, 2);
        assert!(sys.is_manager());
        assert!(sys.local().is_none());
        assert!(sys.global_reduce().is_none());
        assert!(sys.global().is_some());
        assert!(sys.third_level().is_some());
    }

    #[test]
    fn worker_topology_membership() {
        let sys = system_for(3, 2, 2);
        assert_eq!(sys.role(), Role::Worker { group: 1, local_rank: 1 });
        assert!(!sys.is_group_master());
        let local = sys.local().unwrap();
        assert_eq!(local.members(), &[2, 3]);
        let reduce = sys.global_reduce().unwrap();
        assert_eq!(reduce.members(), &[1, 3]);
        // rank 3 is not in the third-level group (group 0)
        assert!(sys.third_level().is_none());
    }

    #[test]
    fn third_level_comm_holds_group_and_manager() {
        let sys = system_for(1, 2, 2);
        let tl = sys.third_level().unwrap();
        assert_eq!(tl.members(), &[0, 1, 4]);
        assert_eq!(sys.tl_manager_rank(), 2);
    }

    #[test]
    fn wrong_world_size_is_rejected() {
        assert!(CombiSystem::init(RayonComm::new(0, 4), 2, 2, 0).is_err());
    }
}
