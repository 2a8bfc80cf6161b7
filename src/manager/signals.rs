//! Signal and status codes of the manager/worker protocol.
//!
//! Values are wire-stable: both participating systems must agree on them.

use crate::combi_error::CombiError;

/// Signals broadcast from the manager to a group master, then re-broadcast
/// on the group's local communicator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Signal {
    /// Receive a serialised task, initialise it, run it once.
    RunFirst = 1,
    /// Run every local task again.
    RunNext = 2,
    /// Local + global combine, no third level.
    Combine = 3,
    /// Allocate the group's sparse grids and unify subspace sizes.
    InitDsgus = 4,
    /// Local + global combine, then third-level exchange.
    CombineThirdLevel = 5,
    /// Align subspace sizes with the remote system.
    ReduceSubspaceSizesTl = 6,
    /// Receive unified sizes from the remote exchange and resize.
    WaitForTlSizeUpdate = 7,
    /// Receive and install combination parameters.
    UpdateCombiParameters = 8,
    /// Combine onto a dense full grid gathered on the manager.
    GridEval = 9,
    /// Evaluate the combined solution and write per-rank checkpoints.
    ParallelEval = 10,
    /// Report the L2 norm of the combined solution.
    EvalNorm = 11,
    /// Interpolate the combined solution at manager-supplied coordinates.
    InterpolateValues = 12,
    /// Drain, barrier, leave the wait loop.
    Exit = 13,
}

impl Signal {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Result<Self, CombiError> {
        use Signal::*;
        Ok(match code {
            1 => RunFirst,
            2 => RunNext,
            3 => Combine,
            4 => InitDsgus,
            5 => CombineThirdLevel,
            6 => ReduceSubspaceSizesTl,
            7 => WaitForTlSizeUpdate,
            8 => UpdateCombiParameters,
            9 => GridEval,
            10 => ParallelEval,
            11 => EvalNorm,
            12 => InterpolateValues,
            13 => Exit,
            other => return Err(CombiError::Wire(format!("unknown signal code {}", other))),
        })
    }
}

/// Status of a process group as seen by the manager.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GroupStatus {
    Wait = 0,
    Busy = 1,
    Fail = 2,
}

impl GroupStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, CombiError> {
        Ok(match code {
            0 => GroupStatus::Wait,
            1 => GroupStatus::Busy,
            2 => GroupStatus::Fail,
            other => return Err(CombiError::Wire(format!("unknown status code {}", other))),
        })
    }
}

/// Opcodes of the third-level sub-protocol, driven by the manager over the
/// third-level communicator while a combine step is in flight.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TlOp {
    /// Workers send their common-subspace slices (Gatherv to the manager).
    Gather = 1,
    /// Workers receive already-reduced slices and overwrite.
    ScatterAssign = 2,
    /// Workers receive remote slices and accumulate.
    ScatterAccumulate = 3,
    /// Exchange aborted (relay failure); finish with local data.
    Abort = 4,
    /// Exchange complete.
    Done = 5,
}

impl TlOp {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Result<Self, CombiError> {
        use TlOp::*;
        Ok(match code {
            1 => Gather,
            2 => ScatterAssign,
            3 => ScatterAccumulate,
            4 => Abort,
            5 => Done,
            other => {
                return Err(CombiError::Wire(format!(
                    "unknown third-level opcode {}",
                    other
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_codes_are_stable() {
        assert_eq!(Signal::RunFirst.code(), 1);
        assert_eq!(Signal::Exit.code(), 13);
        for code in 1..=13 {
            assert_eq!(Signal::from_code(code).unwrap().code(), code);
        }
        assert!(Signal::from_code(0).is_err());
    }

    #[test]
    fn status_codes_match_the_contract() {
        assert_eq!(GroupStatus::Wait.code(), 0);
        assert_eq!(GroupStatus::Busy.code(), 1);
        assert_eq!(GroupStatus::Fail.code(), 2);
    }
}
