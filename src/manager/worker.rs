//! Worker-side state machine, running on every rank of every process group.
//!
//! Workers block in [`ProcessGroupWorker::wait`] until the group master
//! receives a signal from the manager and re-broadcasts it on the local
//! communicator; every rank dispatches, a READY status byte flows back, and
//! the worker returns to waiting. Failures never cross the signal boundary:
//! they are encoded into the group status.

use crate::combi_error::CombiError;
use crate::comm::collectives;
use crate::comm::communicator::{CommTag, Communicator, Wait};
use crate::comm::system::{chan, tags, CombiSystem};
use crate::comm::wire::SignalFrame;
use crate::config::CombiConfig;
use crate::element::CombiElement;
use crate::grid::full::{self, DistributedFullGrid};
use crate::grid::hierarchization::{dehierarchize, hierarchize};
use crate::grid::sparse::{
    add_full_grid_to_sparse_grid, extract_full_grid_from_sparse_grid,
    DistributedSparseGridUniform, WriteMode,
};
use crate::grid::DomainDecomposition;
use crate::io::checkpoint;
use crate::manager::params::CombiParameters;
use crate::manager::payloads;
use crate::manager::signals::{GroupStatus, Signal, TlOp};
use crate::scheme::LevelVector;
use crate::task::{Task, TaskRegistry, TaskState};

pub struct ProcessGroupWorker<E: CombiElement, C: Communicator> {
    sys: CombiSystem<C>,
    config: CombiConfig,
    registry: TaskRegistry<E, C>,
    tasks: Vec<Box<dyn Task<E, C>>>,
    dsgs: Vec<DistributedSparseGridUniform<E>>,
    params: Option<CombiParameters>,
    decomp: Option<DomainDecomposition>,
    /// Sparse-grid table indices of the third-level common subspaces.
    common_selection: Vec<usize>,
    status: GroupStatus,
    current_combi: usize,
}

impl<E: CombiElement, C: Communicator> ProcessGroupWorker<E, C> {
    pub fn new(
        sys: CombiSystem<C>,
        config: CombiConfig,
        registry: TaskRegistry<E, C>,
    ) -> Result<Self, CombiError> {
        config.validate()?;
        if config.element_kind != E::KIND {
            return Err(CombiError::InvalidConfig(format!(
                "configured element kind {:?} does not match the grid element type",
                config.element_kind
            )));
        }
        if sys.is_manager() {
            return Err(CombiError::InvalidConfig(
                "the manager rank cannot run a group worker".into(),
            ));
        }
        Ok(Self {
            sys,
            config,
            registry,
            tasks: Vec::new(),
            dsgs: Vec::new(),
            params: None,
            decomp: None,
            common_selection: Vec::new(),
            status: GroupStatus::Wait,
            current_combi: 0,
        })
    }

    pub fn tasks(&self) -> &[Box<dyn Task<E, C>>] {
        &self.tasks
    }

    pub fn combi_parameters(&self) -> Option<&CombiParameters> {
        self.params.as_ref()
    }

    pub fn status(&self) -> GroupStatus {
        self.status
    }

    pub fn current_combi(&self) -> usize {
        self.current_combi
    }

    pub fn system(&self) -> &CombiSystem<C> {
        &self.sys
    }

    /// Install a locally constructed task (static assignment mode). The task
    /// is initialised but not run; the next `RUN_NEXT` advances it.
    pub fn initialize_task(&mut self, mut task: Box<dyn Task<E, C>>) -> Result<(), CombiError> {
        let decomp = self
            .decomp
            .clone()
            .ok_or_else(|| CombiError::SignalOrder {
                signal: Signal::UpdateCombiParameters,
                reason: "combi parameters must be installed before tasks".into(),
            })?;
        let local = self.sys.local().expect("worker rank");
        task.init(local, &decomp)?;
        self.tasks.push(task);
        Ok(())
    }

    /// Block until the manager's next signal, dispatch it, report status.
    /// Returns the signal so application loops can react to it.
    pub fn wait(&mut self) -> Result<Signal, CombiError> {
        let local = self.sys.local().expect("worker rank").clone();

        // frame: manager -> master -> local broadcast
        let mut frame_bytes: Vec<u8> = vec![0u8; 4];
        if self.sys.is_group_master() {
            let global = self.sys.global().expect("master rank");
            let mut template = [0u8; 4];
            let raw = global
                .irecv(self.sys.global_manager_rank(), chan::SIGNAL, &mut template)
                .wait()
                .ok_or_else(|| CombiError::comm(0, "signal receive returned nothing"))?;
            frame_bytes = raw;
        }
        collectives::broadcast(&local, 0, CommTag(chan::SIGNAL), &mut frame_bytes)?;
        if frame_bytes.len() != 4 {
            return Err(CombiError::Wire("short signal frame".into()));
        }
        let frame: SignalFrame = bytemuck::pod_read_unaligned(&frame_bytes);
        let signal = Signal::from_code(frame.code())?;
        self.status = GroupStatus::Busy;

        // optional payload travels the same path
        let mut payload: Vec<u8> = Vec::new();
        if signal_has_payload(signal) {
            if self.sys.is_group_master() {
                let global = self.sys.global().expect("master rank");
                payload = collectives::recv_block(
                    global,
                    self.sys.global_manager_rank(),
                    CommTag(chan::PAYLOAD),
                )?;
            }
            collectives::broadcast(&local, 0, CommTag(chan::PAYLOAD), &mut payload)?;
        }

        if let Err(err) = self.dispatch(signal, &payload) {
            log::warn!(
                "group {:?} failed to service {:?}: {}",
                self.sys.group_index(),
                signal,
                err
            );
            self.status = GroupStatus::Fail;
        } else if self.status == GroupStatus::Busy {
            self.status = GroupStatus::Wait;
        }

        // the whole group agrees on the worst status
        let mut code = [self.status.code()];
        collectives::allreduce(&local, CommTag(chan::COLLECTIVE_B), &mut code, |a, b| {
            *a = (*a).max(b)
        })?;
        self.status = GroupStatus::from_code(code[0])?;

        if signal != Signal::Exit && self.sys.is_group_master() && !self.config.omit_ready_signal {
            self.ready();
        }
        Ok(signal)
    }

    /// Send the READY status byte to the manager. Called automatically after
    /// each dispatch unless `omit_ready_signal` is configured.
    pub fn ready(&self) {
        if let Some(global) = self.sys.global() {
            let h = global.isend(
                self.sys.global_manager_rank(),
                chan::READY,
                &[self.status.code()],
            );
            let _ = h.wait();
        }
    }

    fn dispatch(&mut self, signal: Signal, payload: &[u8]) -> Result<(), CombiError> {
        match signal {
            Signal::RunFirst => self.run_first(payload),
            Signal::RunNext => self.run_next(),
            Signal::Combine => self.combine_uniform(false),
            Signal::CombineThirdLevel => self.combine_uniform(true),
            Signal::InitDsgus => self.init_dsgus(),
            Signal::ReduceSubspaceSizesTl => self.reduce_subspace_sizes_tl(payload),
            Signal::WaitForTlSizeUpdate => self.apply_tl_size_update(payload),
            Signal::UpdateCombiParameters => self.update_combi_parameters(payload),
            Signal::GridEval | Signal::EvalNorm => self.grid_eval(payload),
            Signal::ParallelEval => self.parallel_eval(payload),
            Signal::InterpolateValues => self.interpolate_values(payload),
            Signal::Exit => self.exit(),
        }
    }

    fn params(&self) -> Result<&CombiParameters, CombiError> {
        self.params.as_ref().ok_or_else(|| CombiError::SignalOrder {
            signal: Signal::UpdateCombiParameters,
            reason: "combi parameters not installed".into(),
        })
    }

    fn update_combi_parameters(&mut self, payload: &[u8]) -> Result<(), CombiError> {
        let params = CombiParameters::decode(payload)?;
        if params.element_kind != E::KIND {
            return Err(CombiError::InvalidConfig(
                "parameter element kind does not match the grid element type".into(),
            ));
        }
        let procs: usize = params.parallelization.iter().product();
        if procs != self.sys.nprocs() {
            return Err(CombiError::InvalidConfig(format!(
                "parallelization {:?} needs {} ranks per group, have {}",
                params.parallelization,
                procs,
                self.sys.nprocs()
            )));
        }
        let decomp = DomainDecomposition::uniform(
            &params.parallelization,
            &params.lmin,
            self.config.reverse_dfg_partition_order,
        )?;
        decomp.validate_nonempty(&params.lmin, &params.boundary)?;
        // fault exclusion resends parameters with adjusted coefficients
        for task in &mut self.tasks {
            let id = task.id();
            if let Some(pos) = params.task_ids.iter().position(|&t| t == id) {
                task.info_mut().coeff = params.coeffs[pos];
            }
        }
        self.decomp = Some(decomp);
        self.params = Some(params);
        Ok(())
    }

    fn run_first(&mut self, payload: &[u8]) -> Result<(), CombiError> {
        let params = self.params()?;
        if params.uses_static_assignment() {
            return Err(CombiError::SignalOrder {
                signal: Signal::RunFirst,
                reason: "RUN_FIRST must never be issued under static task assignment".into(),
            });
        }
        let decomp = self.decomp.clone().expect("set with parameters");
        let mut task = self.registry.decode(payload)?;
        let local = self.sys.local().expect("worker rank");
        task.init(local, &decomp)?;
        task.info_mut().state = TaskState::Running;
        match task.run(local) {
            Ok(()) => task.set_finished(true),
            Err(err) => {
                log::warn!("task {} failed on first run: {}", task.id(), err);
                task.set_failed();
                self.status = GroupStatus::Fail;
            }
        }
        self.tasks.push(task);
        Ok(())
    }

    fn run_next(&mut self) -> Result<(), CombiError> {
        let local = self.sys.local().expect("worker rank").clone();
        for task in &mut self.tasks {
            if task.has_failed() {
                continue;
            }
            task.info_mut().state = TaskState::Running;
            match task.run(&local) {
                Ok(()) => task.set_finished(true),
                Err(err) => {
                    log::warn!("task {} failed: {}", task.id(), err);
                    task.set_failed();
                    self.status = GroupStatus::Fail;
                }
            }
        }
        Ok(())
    }

    /// Allocate the group's sparse grids: subspace table from the scheme's
    /// reference box, sizes from the local grids, unified across groups.
    fn init_dsgus(&mut self) -> Result<(), CombiError> {
        let params = self.params()?.clone();
        let decomp = self.decomp.clone().expect("set with parameters");
        let local_rank = self.sys.local_rank().expect("worker rank");
        let sg_max = params.sparse_grid_max();

        self.dsgs.clear();
        for _ in 0..params.num_grids {
            let mut dsg = DistributedSparseGridUniform::new(
                &sg_max,
                params.boundary.clone(),
                decomp.clone(),
                local_rank,
            )?;
            for task in &self.tasks {
                dsg.register_level(&task.info().level);
            }
            self.dsgs.push(dsg);
        }

        // unify subspace sizes across groups so the flat buffers align
        let mut sizes: Vec<u64> = self
            .dsgs
            .iter()
            .flat_map(|dsg| dsg.subspace_data_sizes())
            .collect();
        let reduce = self.sys.global_reduce().expect("worker rank");
        collectives::allreduce(reduce, CommTag(chan::COLLECTIVE), &mut sizes, |a, b| {
            *a = (*a).max(b)
        })?;
        let per_dsg = self.dsgs[0].num_subspaces();
        for (g, dsg) in self.dsgs.iter_mut().enumerate() {
            dsg.set_subspace_data_sizes(&sizes[g * per_dsg..(g + 1) * per_dsg])?;
            dsg.allocate();
        }
        Ok(())
    }

    fn resolve_common(&self, common: &[LevelVector]) -> Result<Vec<usize>, CombiError> {
        let dsg = self.dsgs.first().ok_or_else(|| CombiError::SignalOrder {
            signal: Signal::InitDsgus,
            reason: "sparse grids not initialised".into(),
        })?;
        common
            .iter()
            .map(|level| {
                dsg.index_of(level).ok_or_else(|| {
                    CombiError::ThirdLevelLayout(format!(
                        "common subspace {:?} missing from the sparse grid table",
                        level
                    ))
                })
            })
            .collect()
    }

    /// Send this rank's common-subspace sizes to the manager for the
    /// cross-system size exchange. Only the third-level group takes part.
    fn reduce_subspace_sizes_tl(&mut self, payload: &[u8]) -> Result<(), CombiError> {
        let tl = self.sys.third_level().ok_or_else(|| CombiError::SignalOrder {
            signal: Signal::ReduceSubspaceSizesTl,
            reason: "rank is not part of the third-level group".into(),
        })?;
        let common = payloads::decode_common_levels(payload)?;
        self.common_selection = self.resolve_common(&common)?;
        let sizes: Vec<u64> = self
            .dsgs
            .iter()
            .flat_map(|dsg| dsg.sizes_of(&self.common_selection))
            .collect();
        collectives::gatherv(
            tl,
            self.sys.tl_manager_rank(),
            CommTag(chan::COLLECTIVE),
            &sizes,
        )?;
        Ok(())
    }

    /// Install the unified common-subspace sizes and reallocate.
    fn apply_tl_size_update(&mut self, payload: &[u8]) -> Result<(), CombiError> {
        let (common, rows) = payloads::decode_size_update(payload)?;
        self.common_selection = self.resolve_common(&common)?;
        let local_rank = self.sys.local_rank().expect("worker rank");
        let row = rows.get(local_rank).ok_or_else(|| {
            CombiError::ThirdLevelLayout(format!(
                "no size row for local rank {} ({} rows)",
                local_rank,
                rows.len()
            ))
        })?;
        let ncommon = self.common_selection.len();
        if row.len() != ncommon * self.dsgs.len() {
            return Err(CombiError::ThirdLevelLayout(format!(
                "size row holds {} entries, expected {}",
                row.len(),
                ncommon * self.dsgs.len()
            )));
        }
        for (g, dsg) in self.dsgs.iter_mut().enumerate() {
            for (k, &si) in self.common_selection.iter().enumerate() {
                dsg.set_subspace_size(si, row[g * ncommon + k]);
            }
            dsg.allocate();
        }
        Ok(())
    }

    /// The combine pipeline of §combine: zero, hierarchise, scatter into the
    /// sparse grids, all-reduce across groups, optional third-level phase,
    /// extract and dehierarchise.
    fn combine_uniform(&mut self, third_level: bool) -> Result<(), CombiError> {
        let params = self.params()?.clone();
        if self.dsgs.is_empty() {
            return Err(CombiError::SignalOrder {
                signal: Signal::Combine,
                reason: "INIT_DSGUS must run before the first combine".into(),
            });
        }
        let group = self.sys.group_index().expect("worker rank") as u16;
        let pole_tag = move |d: usize| tags::pole(group, d as u16);

        {
            let local = self.sys.local().expect("worker rank");
            for dsg in &mut self.dsgs {
                dsg.zero();
            }
            for task in &mut self.tasks {
                if task.has_failed() {
                    continue;
                }
                let coeff = task.info().coeff;
                for g in 0..params.num_grids {
                    hierarchize(task.dfg_mut(g), local, pole_tag)?;
                    add_full_grid_to_sparse_grid(task.dfg(g), coeff, &mut self.dsgs[g])?;
                }
            }
            let reduce = self.sys.global_reduce().expect("worker rank");
            for dsg in &mut self.dsgs {
                if self.config.use_nonblocking_collectives {
                    collectives::allreduce_posted(
                        reduce,
                        CommTag(chan::COLLECTIVE),
                        dsg.flat_data_mut(),
                        |a: &mut E, b| *a += b,
                    )?;
                } else {
                    collectives::allreduce(
                        reduce,
                        CommTag(chan::COLLECTIVE),
                        dsg.flat_data_mut(),
                        |a: &mut E, b| *a += b,
                    )?;
                }
            }
        }

        if third_level {
            if self.common_selection.is_empty() {
                return Err(CombiError::SignalOrder {
                    signal: Signal::CombineThirdLevel,
                    reason: "subspace sizes were never unified with the remote system".into(),
                });
            }
            if self.sys.in_tl_group() {
                self.tl_participate()?;
            }
            // hand the (possibly updated) common payload to every group
            let root = self.sys.tl_group();
            let mut payload = self.tl_local_slice();
            let reduce = self.sys.global_reduce().expect("worker rank");
            collectives::broadcast(reduce, root, CommTag(chan::COLLECTIVE_B), &mut payload)?;
            self.tl_write_slice(&payload, WriteMode::Assign)?;
        }

        {
            let local = self.sys.local().expect("worker rank");
            for task in &mut self.tasks {
                let recover = task.has_failed();
                if recover && !self.config.enable_fault_tolerance {
                    continue;
                }
                for g in 0..params.num_grids {
                    extract_full_grid_from_sparse_grid(&self.dsgs[g], task.dfg_mut(g))?;
                    dehierarchize(task.dfg_mut(g), local, pole_tag)?;
                }
                if recover {
                    // reinitialised from the combined solution
                    task.info_mut().state = TaskState::Running;
                }
            }
        }
        self.current_combi += 1;
        Ok(())
    }

    /// Concatenated local payload of the common subspaces, over all grids.
    fn tl_local_slice(&self) -> Vec<E> {
        self.dsgs
            .iter()
            .flat_map(|dsg| dsg.concat_subspaces(&self.common_selection))
            .collect()
    }

    fn tl_write_slice(&mut self, data: &[E], mode: WriteMode) -> Result<(), CombiError> {
        let mut cursor = 0usize;
        for dsg in &mut self.dsgs {
            let part: usize = self
                .common_selection
                .iter()
                .map(|&i| dsg.subspace(i).size)
                .sum();
            if cursor + part > data.len() {
                return Err(CombiError::ThirdLevelLayout(format!(
                    "common payload of {} elements is too short",
                    data.len()
                )));
            }
            dsg.write_subspaces(&self.common_selection, &data[cursor..cursor + part], mode)?;
            cursor += part;
        }
        if cursor != data.len() {
            return Err(CombiError::ThirdLevelLayout(format!(
                "common payload holds {} elements, expected {}",
                data.len(),
                cursor
            )));
        }
        Ok(())
    }

    /// Third-level sub-protocol: follow the manager's opcodes until the
    /// exchange completes or aborts.
    fn tl_participate(&mut self) -> Result<(), CombiError> {
        let tl = self.sys.third_level().expect("third-level group").clone();
        let root = self.sys.tl_manager_rank();
        loop {
            let mut frame: Vec<u8> = vec![0u8; 4];
            collectives::broadcast(&tl, root, CommTag(chan::SIGNAL), &mut frame)?;
            if frame.len() != 4 {
                return Err(CombiError::Wire("short third-level opcode".into()));
            }
            let op = TlOp::from_code(u32::from_le_bytes(frame[..4].try_into().unwrap()))?;
            match op {
                TlOp::Gather => {
                    let slice = self.tl_local_slice();
                    collectives::gatherv(&tl, root, CommTag(chan::COLLECTIVE), &slice)?;
                }
                TlOp::ScatterAssign | TlOp::ScatterAccumulate => {
                    let part: Vec<E> =
                        collectives::scatterv(&tl, root, CommTag(chan::COLLECTIVE_B), None)?;
                    let mode = if op == TlOp::ScatterAssign {
                        WriteMode::Assign
                    } else {
                        WriteMode::Accumulate
                    };
                    self.tl_write_slice(&part, mode)?;
                }
                TlOp::Abort => {
                    log::warn!("third-level exchange aborted, continuing with local data");
                    break;
                }
                TlOp::Done => break,
            }
        }
        Ok(())
    }

    /// Evaluate the combination of the local tasks on a dense grid of level
    /// `leval` and reduce the partial sums onto the manager.
    fn grid_eval(&mut self, payload: &[u8]) -> Result<(), CombiError> {
        let leval = payloads::decode_leval(payload)?;
        let params = self.params()?.clone();
        let mut partial = self.eval_combined_dense(&leval, &params)?;
        if self.sys.is_group_master() {
            let global = self.sys.global().expect("master rank");
            let data = partial.as_mut().expect("master holds the partial sum");
            collectives::reduce_to_root(
                global,
                self.sys.global_manager_rank(),
                CommTag(chan::COLLECTIVE_B),
                data,
                |a: &mut E, b| *a += b,
            )?;
        }
        Ok(())
    }

    /// Gather each task's grid on the group master and accumulate the
    /// coefficient-weighted interpolation onto the evaluation grid.
    fn eval_combined_dense(
        &mut self,
        leval: &LevelVector,
        params: &CombiParameters,
    ) -> Result<Option<Vec<E>>, CombiError> {
        let local = self.sys.local().expect("worker rank").clone();
        let npoints = full::dense_len(leval, &params.boundary);
        let mut acc = self
            .sys
            .is_group_master()
            .then(|| vec![E::default(); npoints]);
        for task in &self.tasks {
            if task.has_failed() {
                continue;
            }
            let dense = task
                .dfg(0)
                .gather_full_grid(&local, 0, CommTag(chan::COLLECTIVE))?;
            if let (Some(acc), Some(dense)) = (acc.as_mut(), dense) {
                let info = task.info();
                for (gi, slot) in acc.iter_mut().enumerate() {
                    let x = full::dense_coords(leval, &params.boundary, gi);
                    *slot +=
                        full::interpolate_dense(&dense, &info.level, &info.boundary, &x)
                            .scale(info.coeff);
                }
            }
        }
        Ok(acc)
    }

    /// Evaluate the combined sparse-grid solution on a fresh grid of level
    /// `leval` and write the per-rank checkpoint files.
    fn parallel_eval(&mut self, payload: &[u8]) -> Result<(), CombiError> {
        let (leval, path) = payloads::decode_parallel_eval(payload)?;
        let params = self.params()?.clone();
        let decomp = self.decomp.clone().expect("set with parameters");
        let local_rank = self.sys.local_rank().expect("worker rank");
        let group = self.sys.group_index().expect("worker rank") as u16;
        if self.dsgs.is_empty() {
            return Err(CombiError::SignalOrder {
                signal: Signal::ParallelEval,
                reason: "no combined solution available yet".into(),
            });
        }
        let mut dfg: DistributedFullGrid<E> =
            DistributedFullGrid::new(leval, params.boundary.clone(), decomp, local_rank)?;
        extract_full_grid_from_sparse_grid(&self.dsgs[0], &mut dfg)?;
        let local = self.sys.local().expect("worker rank");
        dehierarchize(&mut dfg, local, move |d| tags::pole(group, d as u16))?;
        checkpoint::write_dfg_checkpoint(&dfg, &path, local_rank)?;
        Ok(())
    }

    /// Interpolate the combination of the local tasks at the manager's
    /// coordinates; partial sums reduce onto the manager.
    fn interpolate_values(&mut self, payload: &[u8]) -> Result<(), CombiError> {
        let coords = payloads::decode_coords(payload)?;
        let local = self.sys.local().expect("worker rank").clone();
        let mut partial = self
            .sys
            .is_group_master()
            .then(|| vec![E::default(); coords.len()]);
        for task in &self.tasks {
            if task.has_failed() {
                continue;
            }
            let dense = task
                .dfg(0)
                .gather_full_grid(&local, 0, CommTag(chan::COLLECTIVE))?;
            if let (Some(acc), Some(dense)) = (partial.as_mut(), dense) {
                let info = task.info();
                for (slot, x) in acc.iter_mut().zip(&coords) {
                    *slot += full::interpolate_dense(&dense, &info.level, &info.boundary, x)
                        .scale(info.coeff);
                }
            }
        }
        if self.sys.is_group_master() {
            let global = self.sys.global().expect("master rank");
            let data = partial.as_mut().expect("master holds the partial sum");
            collectives::reduce_to_root(
                global,
                self.sys.global_manager_rank(),
                CommTag(chan::COLLECTIVE_B),
                data,
                |a: &mut E, b| *a += b,
            )?;
        }
        Ok(())
    }

    fn exit(&mut self) -> Result<(), CombiError> {
        let local = self.sys.local().expect("worker rank");
        collectives::barrier(local, CommTag(chan::BARRIER))?;
        self.tasks.clear();
        for dsg in &mut self.dsgs {
            dsg.deallocate();
        }
        Ok(())
    }
}

fn signal_has_payload(signal: Signal) -> bool {
    matches!(
        signal,
        Signal::RunFirst
            | Signal::UpdateCombiParameters
            | Signal::ReduceSubspaceSizesTl
            | Signal::WaitForTlSizeUpdate
            | Signal::GridEval
            | Signal::EvalNorm
            | Signal::ParallelEval
            | Signal::InterpolateValues
    )
}
