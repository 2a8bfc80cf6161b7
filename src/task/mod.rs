//! Simulation tasks: one opaque solver unit per component grid.
//!
//! Tasks are modelled as a capability set over a kind-tag registry instead
//! of an inheritance hierarchy: the manager serialises a fixed header plus a
//! kind-specific payload, and workers instantiate through the registered
//! constructor for that tag.

use hashbrown::HashMap;

use crate::combi_error::CombiError;
use crate::comm::communicator::{Communicator, SubComm};
use crate::comm::wire::{WireReader, WireWriter, WIRE_VERSION};
use crate::element::CombiElement;
use crate::grid::full::DistributedFullGrid;
use crate::grid::DomainDecomposition;
use crate::scheme::LevelVector;

pub type TaskId = u64;

/// Wire tag identifying a concrete task kind.
pub type TaskKind = u16;

/// Task lifecycle. Advances monotonically except on recovery, where a failed
/// task is reinitialised from the combined solution and set running again.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Finished,
    Failed,
}

/// Header shared by every task on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskHeader {
    pub id: TaskId,
    pub kind: TaskKind,
    pub level: LevelVector,
    pub coeff: f64,
    pub boundary: Vec<bool>,
}

impl TaskHeader {
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u16(WIRE_VERSION);
        w.put_u16(self.kind);
        w.put_u64(self.id);
        w.put_u32_seq(&self.level);
        w.put_f64(self.coeff);
        w.put_u64(self.boundary.len() as u64);
        for &b in &self.boundary {
            w.put_bool(b);
        }
        w.put_bytes(payload);
        w.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, Vec<u8>), CombiError> {
        let mut r = WireReader::new(bytes);
        let version = r.get_u16("task wire version")?;
        if version != WIRE_VERSION {
            return Err(CombiError::Wire(format!(
                "task record version {} (expected {})",
                version, WIRE_VERSION
            )));
        }
        let kind = r.get_u16("task kind")?;
        let id = r.get_u64("task id")?;
        let level = r.get_u32_seq("task level")?;
        let coeff = r.get_f64("task coefficient")?;
        let nb = r.get_u64("boundary length")? as usize;
        let boundary = (0..nb)
            .map(|_| r.get_bool("boundary flag"))
            .collect::<Result<Vec<bool>, _>>()?;
        let payload = r.get_bytes("task payload")?.to_vec();
        Ok((
            Self {
                id,
                kind,
                level,
                coeff,
                boundary,
            },
            payload,
        ))
    }
}

/// Bookkeeping every concrete task embeds.
#[derive(Clone, Debug)]
pub struct TaskInfo {
    pub id: TaskId,
    pub level: LevelVector,
    pub coeff: f64,
    pub boundary: Vec<bool>,
    pub state: TaskState,
}

impl TaskInfo {
    pub fn new(id: TaskId, level: LevelVector, coeff: f64, boundary: Vec<bool>) -> Self {
        Self {
            id,
            level,
            coeff,
            boundary,
            state: TaskState::Created,
        }
    }
}

/// The capability set the coordination core relies on. Concrete task kinds
/// own one or more distributed full grids and an opaque `run` step.
pub trait Task<E: CombiElement, C: Communicator>: Send {
    fn info(&self) -> &TaskInfo;
    fn info_mut(&mut self) -> &mut TaskInfo;

    /// Wire tag of this kind; must be registered on every rank.
    fn kind(&self) -> TaskKind;

    /// Kind-specific payload appended to the wire header.
    fn encode_payload(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Number of component grids this task owns (one per application field).
    fn num_grids(&self) -> usize {
        1
    }

    /// Create the grids; called once on the owning group's ranks.
    fn init(
        &mut self,
        lcomm: &SubComm<C>,
        decomposition: &DomainDecomposition,
    ) -> Result<(), CombiError>;

    /// Advance the simulation by one step.
    fn run(&mut self, lcomm: &SubComm<C>) -> Result<(), CombiError>;

    fn dfg(&self, g: usize) -> &DistributedFullGrid<E>;
    fn dfg_mut(&mut self, g: usize) -> &mut DistributedFullGrid<E>;

    /// Zero all owned grids.
    fn set_zero(&mut self) {
        for g in 0..self.num_grids() {
            self.dfg_mut(g).data_mut().fill(E::default());
        }
    }

    fn id(&self) -> TaskId {
        self.info().id
    }

    fn is_finished(&self) -> bool {
        self.info().state == TaskState::Finished
    }

    fn set_finished(&mut self, finished: bool) {
        self.info_mut().state = if finished {
            TaskState::Finished
        } else {
            TaskState::Running
        };
    }

    fn has_failed(&self) -> bool {
        self.info().state == TaskState::Failed
    }

    fn set_failed(&mut self) {
        self.info_mut().state = TaskState::Failed;
    }

    /// Full wire record: header + payload.
    fn encode(&self) -> Vec<u8> {
        let info = self.info();
        TaskHeader {
            id: info.id,
            kind: self.kind(),
            level: info.level.clone(),
            coeff: info.coeff,
            boundary: info.boundary.clone(),
        }
        .encode(&self.encode_payload())
    }
}

/// Constructor invoked by workers for a received task record.
pub type TaskConstructor<E, C> =
    fn(header: &TaskHeader, payload: &[u8]) -> Result<Box<dyn Task<E, C>>, CombiError>;

/// Registry of task kinds, keyed by wire tag. Both sides of a run must
/// register the same kinds.
pub struct TaskRegistry<E: CombiElement, C: Communicator> {
    constructors: HashMap<TaskKind, TaskConstructor<E, C>>,
}

impl<E: CombiElement, C: Communicator> Default for TaskRegistry<E, C> {
    fn default() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }
}

impl<E: CombiElement, C: Communicator> TaskRegistry<E, C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: TaskKind, constructor: TaskConstructor<E, C>) {
        self.constructors.insert(kind, constructor);
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Task<E, C>>, CombiError> {
        let (header, payload) = TaskHeader::decode(bytes)?;
        let ctor = self
            .constructors
            .get(&header.kind)
            .ok_or(CombiError::UnknownTaskKind { tag: header.kind })?;
        ctor(&header, &payload)
    }
}
