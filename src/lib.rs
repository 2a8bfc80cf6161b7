//! # combigrid
//!
//! combigrid is the coordination core of a distributed sparse grid
//! combination technique engine. An ensemble of anisotropic full-grid
//! solvers advances in parallel process groups and is periodically reduced
//! into a common sparse-grid representation; across two HPC systems, only a
//! small common subspace of the combined grid is exchanged through an
//! external relay ("third level" reduction).
//!
//! ## Features
//! - Combination scheme construction, decomposition across systems, and the
//!   common-subspace computation
//! - Distributed full and sparse grids with rank-local transfers and
//!   pole-exchange hierarchisation
//! - A signal-driven manager/worker protocol with static or dynamic task
//!   assignment and partial-failure tolerance
//! - Pluggable communication backends (serial, thread-per-rank, MPI) behind
//!   one non-blocking communicator trait
//! - A blocking TCP client of the third-level relay daemon
//!
//! ## Usage
//! Add `combigrid` as a dependency and enable features as needed:
//!
//! ```toml
//! [dependencies]
//! combigrid = "0.1"
//! # features = ["mpi-support"]
//! ```
//!
//! The thread-per-rank communicator used by the test suite ships with the
//! default `rayon` feature.

pub mod combi_error;
pub mod comm;
pub mod config;
pub mod element;
pub mod grid;
pub mod io;
pub mod manager;
pub mod scheme;
pub mod task;
pub mod third_level;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::combi_error::CombiError;
    pub use crate::comm::communicator::{CommTag, Communicator, NoComm, SubComm, Wait};
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::communicator::MpiComm;
    #[cfg(feature = "rayon")]
    pub use crate::comm::communicator::RayonComm;
    pub use crate::comm::system::CombiSystem;
    pub use crate::config::CombiConfig;
    pub use crate::element::{CombiElement, ElementKind};
    pub use crate::grid::full::DistributedFullGrid;
    pub use crate::grid::sparse::DistributedSparseGridUniform;
    pub use crate::grid::DomainDecomposition;
    pub use crate::manager::params::{CombiParameters, ThirdLevelConfig};
    pub use crate::manager::process_manager::{ProcessManager, TlOutcome};
    pub use crate::manager::signals::{GroupStatus, Signal};
    pub use crate::manager::worker::ProcessGroupWorker;
    pub use crate::scheme::third_level::create_third_level_scheme;
    pub use crate::scheme::{CombiScheme, LevelType, LevelVector};
    pub use crate::task::{Task, TaskInfo, TaskRegistry};
    pub use crate::third_level::ThirdLevelClient;
}
