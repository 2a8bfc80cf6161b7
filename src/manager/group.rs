//! Manager-side proxy for one process group.
//!
//! Groups hold no reference back to the manager: each operation sends one
//! signal frame (optionally followed by a payload block) to the group
//! master, marks the group busy, and posts a receive for the READY status
//! byte. Status is observed by polling that receive.

use crate::combi_error::CombiError;
use crate::comm::collectives;
use crate::comm::communicator::{CommTag, Communicator, PollWait, SubComm, Wait};
use crate::comm::system::chan;
use crate::comm::wire::SignalFrame;
use crate::manager::signals::{GroupStatus, Signal};
use crate::task::TaskId;

pub struct ProcessGroupManager<C: Communicator> {
    group_index: usize,
    global: SubComm<C>,
    status: GroupStatus,
    pending_ready: Option<C::RecvHandle>,
    /// Task references for bookkeeping (static assignment and redistribution).
    task_refs: Vec<TaskId>,
    alive: bool,
}

impl<C: Communicator> ProcessGroupManager<C> {
    pub fn new(group_index: usize, global: SubComm<C>) -> Self {
        Self {
            group_index,
            global,
            status: GroupStatus::Wait,
            pending_ready: None,
            task_refs: Vec::new(),
            alive: true,
        }
    }

    pub fn group_index(&self) -> usize {
        self.group_index
    }

    /// The group master's sub-rank in the global communicator.
    fn master(&self) -> usize {
        self.group_index
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Remove the group from the run (unresponsive past the deadline).
    pub fn mark_removed(&mut self) {
        self.alive = false;
        self.status = GroupStatus::Fail;
        self.pending_ready = None;
    }

    pub fn store_task_reference(&mut self, id: TaskId) {
        self.task_refs.push(id);
    }

    pub fn task_references(&self) -> &[TaskId] {
        &self.task_refs
    }

    /// Poll the pending READY receive and return the current status.
    pub fn status(&mut self) -> GroupStatus {
        if self.status == GroupStatus::Busy {
            if let Some(handle) = self.pending_ready.as_mut() {
                if let Some(bytes) = handle.try_wait() {
                    self.pending_ready = None;
                    self.status = bytes
                        .first()
                        .and_then(|&b| GroupStatus::from_code(b).ok())
                        .unwrap_or(GroupStatus::Fail);
                }
            }
        }
        self.status
    }

    fn send_signal(&mut self, signal: Signal) -> Result<(), CombiError> {
        debug_assert!(self.alive);
        debug_assert_ne!(self.status, GroupStatus::Busy, "group already has a signal in flight");
        let frame = SignalFrame::new(signal.code());
        let h = self.global.isend(
            self.master(),
            chan::SIGNAL,
            bytemuck::cast_slice(std::slice::from_ref(&frame)),
        );
        let _ = h.wait();
        if signal == Signal::Exit {
            // no READY follows the exit signal
            self.status = GroupStatus::Wait;
            return Ok(());
        }
        self.status = GroupStatus::Busy;
        let mut template = [0u8; 1];
        self.pending_ready = Some(self.global.irecv(self.master(), chan::READY, &mut template));
        Ok(())
    }

    fn send_signal_with_payload(&mut self, signal: Signal, payload: &[u8]) -> Result<(), CombiError> {
        self.send_signal(signal)?;
        collectives::send_block(&self.global, self.master(), CommTag(chan::PAYLOAD), payload);
        Ok(())
    }

    pub fn runfirst(&mut self, task_record: &[u8]) -> Result<(), CombiError> {
        self.send_signal_with_payload(Signal::RunFirst, task_record)
    }

    pub fn runnext(&mut self) -> Result<(), CombiError> {
        self.send_signal(Signal::RunNext)
    }

    pub fn combine(&mut self) -> Result<(), CombiError> {
        self.send_signal(Signal::Combine)
    }

    pub fn combine_third_level(&mut self) -> Result<(), CombiError> {
        self.send_signal(Signal::CombineThirdLevel)
    }

    pub fn init_dsgus(&mut self) -> Result<(), CombiError> {
        self.send_signal(Signal::InitDsgus)
    }

    pub fn update_combi_parameters(&mut self, params_record: &[u8]) -> Result<(), CombiError> {
        self.send_signal_with_payload(Signal::UpdateCombiParameters, params_record)
    }

    pub fn reduce_subspace_sizes_tl(&mut self, common_record: &[u8]) -> Result<(), CombiError> {
        self.send_signal_with_payload(Signal::ReduceSubspaceSizesTl, common_record)
    }

    pub fn wait_for_tl_size_update(&mut self, sizes_record: &[u8]) -> Result<(), CombiError> {
        self.send_signal_with_payload(Signal::WaitForTlSizeUpdate, sizes_record)
    }

    pub fn grid_eval(&mut self, leval_record: &[u8]) -> Result<(), CombiError> {
        self.send_signal_with_payload(Signal::GridEval, leval_record)
    }

    pub fn eval_norm(&mut self, leval_record: &[u8]) -> Result<(), CombiError> {
        self.send_signal_with_payload(Signal::EvalNorm, leval_record)
    }

    pub fn parallel_eval(&mut self, eval_record: &[u8]) -> Result<(), CombiError> {
        self.send_signal_with_payload(Signal::ParallelEval, eval_record)
    }

    pub fn interpolate_values(&mut self, coords_record: &[u8]) -> Result<(), CombiError> {
        self.send_signal_with_payload(Signal::InterpolateValues, coords_record)
    }

    pub fn exit(&mut self) -> Result<(), CombiError> {
        self.send_signal(Signal::Exit)
    }
}
