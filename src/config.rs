//! Run-wide configuration of the combination engine.
//!
//! The original engine configured these switches at compile time; here they
//! form a plain struct validated once at construction and threaded into the
//! manager and workers.

use crate::combi_error::CombiError;
use crate::element::ElementKind;

/// Configuration options recognised by the engine.
#[derive(Clone, Debug)]
pub struct CombiConfig {
    /// Element type stored in all grids.
    pub element_kind: ElementKind,
    /// Use the same processor-grid decomposition for every component grid.
    /// Only the uniform operations are implemented; must currently be true.
    pub uniform_decomposition: bool,
    /// Enable the task fault-tolerance path (failed tasks are reinitialised
    /// from the combined sparse-grid solution at the next combine).
    pub enable_fault_tolerance: bool,
    /// Reduce the sparse grids with the posted-receive all-reduce, which
    /// lets overlapping backends progress all transfers concurrently.
    pub use_nonblocking_collectives: bool,
    /// Suppress the automatic READY signal after each dispatch; the
    /// application sends it explicitly from inside the solver.
    pub omit_ready_signal: bool,
    /// Reverse the linearisation order of the DFG processor grid.
    pub reverse_dfg_partition_order: bool,
}

impl Default for CombiConfig {
    fn default() -> Self {
        Self {
            element_kind: ElementKind::Real,
            uniform_decomposition: true,
            enable_fault_tolerance: false,
            use_nonblocking_collectives: false,
            omit_ready_signal: false,
            reverse_dfg_partition_order: false,
        }
    }
}

impl CombiConfig {
    /// Check for incompatible option combinations.
    pub fn validate(&self) -> Result<(), CombiError> {
        if !self.uniform_decomposition {
            return Err(CombiError::InvalidConfig(
                "only the uniform domain decomposition is implemented".into(),
            ));
        }
        if self.enable_fault_tolerance && self.omit_ready_signal {
            return Err(CombiError::InvalidConfig(
                "fault tolerance needs the automatic ready signal for status tracking".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CombiConfig::default().validate().is_ok());
    }

    #[test]
    fn ft_without_ready_signal_is_rejected() {
        let cfg = CombiConfig {
            enable_fault_tolerance: true,
            omit_ready_signal: true,
            ..CombiConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn non_uniform_decomposition_is_rejected() {
        let cfg = CombiConfig {
            uniform_decomposition: false,
            ..CombiConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
