//! Top-level orchestrator: owns the group proxies and the task list, drives
//! the combination loop, and runs the third-level exchange against the
//! external relay.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::combi_error::CombiError;
use crate::comm::collectives;
use crate::comm::communicator::{CommTag, Communicator};
use crate::comm::system::{chan, CombiSystem};
use crate::comm::wire::TlOpFrame;
use crate::config::CombiConfig;
use crate::element::CombiElement;
use crate::grid::full::dense_len;
use crate::manager::group::ProcessGroupManager;
use crate::manager::params::CombiParameters;
use crate::manager::payloads;
use crate::manager::signals::{GroupStatus, Signal, TlOp};
use crate::scheme::LevelVector;
use crate::task::Task;
use crate::third_level::{RelayInstruction, ThirdLevelClient};

/// How a third-level combine step ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TlOutcome {
    /// Data was exchanged with the remote system.
    Exchanged,
    /// The relay failed; the step completed with local+global reduction only.
    LocalOnly,
}

pub struct ProcessManager<E: CombiElement, C: Communicator> {
    sys: CombiSystem<C>,
    config: CombiConfig,
    groups: Vec<ProcessGroupManager<C>>,
    tasks: Vec<Box<dyn Task<E, C>>>,
    params: CombiParameters,
    /// Common subspaces of the decomposed scheme, in decomposer order.
    common_subspaces: Vec<LevelVector>,
    relay: Option<ThirdLevelClient>,
    /// Unified per-TL-rank common sizes (element counts per (grid, subspace)).
    tl_part_sizes: Option<Vec<Vec<u64>>>,
    status_timeout: Duration,
}

impl<E: CombiElement, C: Communicator> ProcessManager<E, C> {
    pub fn new(
        sys: CombiSystem<C>,
        config: CombiConfig,
        tasks: Vec<Box<dyn Task<E, C>>>,
        params: CombiParameters,
        common_subspaces: Vec<LevelVector>,
    ) -> Result<Self, CombiError> {
        config.validate()?;
        params.validate()?;
        if config.element_kind != E::KIND {
            return Err(CombiError::InvalidConfig(format!(
                "configured element kind {:?} does not match the grid element type",
                config.element_kind
            )));
        }
        if !sys.is_manager() {
            return Err(CombiError::InvalidConfig(
                "only the manager rank can run the process manager".into(),
            ));
        }
        let global = sys
            .global()
            .expect("manager is in the global communicator")
            .clone();
        let mut groups: Vec<ProcessGroupManager<C>> = (0..sys.ngroup())
            .map(|g| ProcessGroupManager::new(g, global.clone()))
            .collect();
        if params.uses_static_assignment() {
            for (i, &g) in params.group_assignment.iter().enumerate() {
                if g >= groups.len() {
                    return Err(CombiError::InvalidScheme(format!(
                        "task {} assigned to group {} of {}",
                        params.task_ids[i],
                        g,
                        groups.len()
                    )));
                }
                groups[g].store_task_reference(params.task_ids[i]);
            }
        }
        Ok(Self {
            sys,
            config,
            groups,
            tasks,
            params,
            common_subspaces,
            relay: None,
            tl_part_sizes: None,
            status_timeout: Duration::from_secs(60),
        })
    }

    pub fn set_status_timeout(&mut self, timeout: Duration) {
        self.status_timeout = timeout;
    }

    pub fn combi_parameters(&self) -> &CombiParameters {
        &self.params
    }

    pub fn config(&self) -> &CombiConfig {
        &self.config
    }

    pub fn group_statuses(&mut self) -> Vec<GroupStatus> {
        self.groups.iter_mut().map(|g| g.status()).collect()
    }

    /// Connect to the third-level relay named in the parameters.
    pub fn setup_third_level(&mut self) -> Result<(), CombiError> {
        let Some(tl) = self.params.third_level.as_ref() else {
            return Err(CombiError::InvalidConfig(
                "no third-level relay configured".into(),
            ));
        };
        self.relay = Some(ThirdLevelClient::connect(&tl.host, tl.port)?);
        Ok(())
    }

    fn alive_groups(&mut self) -> impl Iterator<Item = &mut ProcessGroupManager<C>> {
        self.groups.iter_mut().filter(|g| g.is_alive())
    }

    /// Poll until no alive group is busy. Groups exceeding the deadline are
    /// removed from the run. Returns the indices whose last operation failed.
    pub fn wait_all_finished(&mut self) -> Result<Vec<usize>, CombiError> {
        let deadline = Instant::now() + self.status_timeout;
        loop {
            let mut busy = false;
            for group in self.alive_groups() {
                if group.status() == GroupStatus::Busy {
                    busy = true;
                }
            }
            if !busy {
                break;
            }
            if Instant::now() > deadline {
                for group in self.groups.iter_mut().filter(|g| g.is_alive()) {
                    if group.status() == GroupStatus::Busy {
                        log::warn!(
                            "group {} unresponsive past the deadline, removing it",
                            group.group_index()
                        );
                        group.mark_removed();
                    }
                }
                break;
            }
            std::thread::yield_now();
        }
        let mut failed = Vec::new();
        for group in self.groups.iter_mut().filter(|g| g.is_alive()) {
            if group.status() == GroupStatus::Fail {
                failed.push(group.group_index());
            }
        }
        Ok(failed)
    }

    /// First WAIT group, preferring the one with the fewest stored tasks.
    fn next_waiting_group(&mut self) -> Result<usize, CombiError> {
        let deadline = Instant::now() + self.status_timeout;
        loop {
            let mut best: Option<(usize, usize)> = None;
            for group in self.groups.iter_mut().filter(|g| g.is_alive()) {
                if group.status() == GroupStatus::Wait {
                    let load = group.task_references().len();
                    if best.map_or(true, |(_, l)| load < l) {
                        best = Some((group.group_index(), load));
                    }
                }
            }
            if let Some((g, _)) = best {
                return Ok(g);
            }
            if Instant::now() > deadline {
                return Err(CombiError::GroupFailure { group: usize::MAX });
            }
            std::thread::yield_now();
        }
    }

    /// Send the combination parameters to every group.
    pub fn update_combi_parameters(&mut self) -> Result<(), CombiError> {
        let record = self.params.encode();
        for group in self.alive_groups() {
            group.update_combi_parameters(&record)?;
        }
        self.wait_all_finished()?;
        Ok(())
    }

    /// Distribute every task to a waiting group, run it once, then allocate
    /// the sparse grids. Not available under static assignment.
    pub fn run_first(&mut self) -> Result<(), CombiError> {
        if self.params.uses_static_assignment() {
            return Err(CombiError::InvalidConfig(
                "static task assignment forbids RUN_FIRST; use run_next".into(),
            ));
        }
        for i in 0..self.tasks.len() {
            let g = self.next_waiting_group()?;
            let record = self.tasks[i].encode();
            let id = self.tasks[i].id();
            self.groups[g].runfirst(&record)?;
            self.groups[g].store_task_reference(id);
        }
        self.wait_all_finished()?;
        self.init_dsgus()
    }

    /// Advance every group's tasks by one step.
    pub fn run_next(&mut self) -> Result<(), CombiError> {
        for group in self.alive_groups() {
            group.runnext()?;
        }
        self.wait_all_finished()?;
        Ok(())
    }

    /// Allocate and size-unify the distributed sparse grids.
    pub fn init_dsgus(&mut self) -> Result<(), CombiError> {
        for group in self.alive_groups() {
            group.init_dsgus()?;
        }
        self.wait_all_finished()?;
        Ok(())
    }

    /// Local + global combine on every group, no third level.
    pub fn combine(&mut self) -> Result<(), CombiError> {
        for group in self.alive_groups() {
            group.combine()?;
        }
        self.wait_all_finished()?;
        Ok(())
    }

    fn tl_op(&self, op: TlOp) -> Result<(), CombiError> {
        let tl = self.sys.third_level().expect("manager in third-level comm");
        let frame = TlOpFrame::new(op.code());
        let mut bytes: Vec<u8> = bytemuck::cast_slice(std::slice::from_ref(&frame)).to_vec();
        collectives::broadcast(tl, self.sys.tl_manager_rank(), CommTag(chan::SIGNAL), &mut bytes)
    }

    /// Exchange common-subspace sizes with the remote system and install the
    /// unified sizes on every group. Must run once before the first
    /// third-level combine.
    pub fn unify_subspace_sizes_third_level(&mut self) -> Result<(), CombiError> {
        if self.relay.is_none() {
            self.setup_third_level()?;
        }
        let tl_group = self.sys.tl_group();
        let common_record = payloads::encode_common_levels(&self.common_subspaces);
        self.groups[tl_group].reduce_subspace_sizes_tl(&common_record)?;

        // gather per-rank common sizes from the third-level group
        let tl = self.sys.third_level().expect("manager in third-level comm");
        let (flat, counts) = collectives::gatherv::<_, u64>(
            tl,
            self.sys.tl_manager_rank(),
            CommTag(chan::COLLECTIVE),
            &[],
        )?
        .expect("manager is the gather root");
        self.wait_all_finished()?;

        let mut rows: Vec<Vec<u64>> = Vec::with_capacity(self.sys.nprocs());
        let mut cursor = 0usize;
        for &count in counts.iter().take(self.sys.nprocs()) {
            rows.push(flat[cursor..cursor + count].to_vec());
            cursor += count;
        }

        // exchange the flat size table through the relay; the receiver side
        // unifies and sends the result back
        let unified_flat: Vec<u64> = {
            let client = self.relay.as_mut().expect("relay connected");
            client.signal_ready()?;
            match client.fetch_instruction()? {
                RelayInstruction::SendFirst => {
                    client.send_block(&flat)?;
                    let unified: Vec<u64> = client.recv_block()?;
                    if unified.len() != flat.len() {
                        return Err(CombiError::ThirdLevelLayout(format!(
                            "remote size table holds {} entries, local {}",
                            unified.len(),
                            flat.len()
                        )));
                    }
                    unified
                }
                RelayInstruction::ReceiveFirst => {
                    let remote: Vec<u64> = client.recv_block()?;
                    if remote.len() != flat.len() {
                        return Err(CombiError::ThirdLevelLayout(format!(
                            "remote size table holds {} entries, local {}",
                            remote.len(),
                            flat.len()
                        )));
                    }
                    let unified: Vec<u64> = flat
                        .iter()
                        .zip(&remote)
                        .map(|(&a, &b)| a.max(b))
                        .collect();
                    client.send_block(&unified)?;
                    unified
                }
            }
        };

        let mut unified_rows: Vec<Vec<u64>> = Vec::with_capacity(rows.len());
        let mut cursor = 0usize;
        for row in &rows {
            unified_rows.push(unified_flat[cursor..cursor + row.len()].to_vec());
            cursor += row.len();
        }

        let record = payloads::encode_size_update(&self.common_subspaces, &unified_rows);
        for group in self.alive_groups() {
            group.wait_for_tl_size_update(&record)?;
        }
        self.wait_all_finished()?;
        self.tl_part_sizes = Some(unified_rows);
        Ok(())
    }

    /// One combination step with third-level exchange. Falls back to
    /// local+global reduction when the relay fails; the run continues.
    pub fn combine_third_level(&mut self) -> Result<TlOutcome, CombiError> {
        if self.tl_part_sizes.is_none() {
            return Err(CombiError::SignalOrder {
                signal: Signal::CombineThirdLevel,
                reason: "unify_subspace_sizes_third_level must run first".into(),
            });
        }
        for group in self.alive_groups() {
            group.combine_third_level()?;
        }

        if self.relay.is_none() {
            // the relay was lost in an earlier step; keep combining locally
            self.tl_op(TlOp::Abort)?;
            self.wait_all_finished()?;
            return Ok(TlOutcome::LocalOnly);
        }

        let outcome = match self.drive_third_level_exchange() {
            Ok(()) => TlOutcome::Exchanged,
            Err(CombiError::Relay(msg)) => {
                log::warn!("third-level exchange failed ({}), falling back to local", msg);
                self.tl_op(TlOp::Abort)?;
                self.relay = None;
                TlOutcome::LocalOnly
            }
            Err(other) => return Err(other),
        };
        self.wait_all_finished()?;
        Ok(outcome)
    }

    /// The relay handshake and gather/scatter choreography of one step.
    fn drive_third_level_exchange(&mut self) -> Result<(), CombiError> {
        let instruction = {
            let client = self.relay.as_mut().expect("relay connected");
            client.signal_ready()?;
            client.fetch_instruction()?
        };
        let tl = self
            .sys
            .third_level()
            .expect("manager in third-level comm")
            .clone();
        let root = self.sys.tl_manager_rank();

        match instruction {
            RelayInstruction::SendFirst => {
                self.tl_op(TlOp::Gather)?;
                let (flat, counts) =
                    collectives::gatherv::<_, E>(&tl, root, CommTag(chan::COLLECTIVE), &[])?
                        .expect("manager is the gather root");
                let reduced: Vec<E> = {
                    let client = self.relay.as_mut().expect("relay connected");
                    client.send_block(&flat)?;
                    client.recv_block()?
                };
                if reduced.len() != flat.len() {
                    return Err(CombiError::Relay(format!(
                        "reduced payload holds {} elements, sent {}",
                        reduced.len(),
                        flat.len()
                    )));
                }
                self.tl_op(TlOp::ScatterAssign)?;
                let parts = split_by_counts(reduced, &counts);
                collectives::scatterv(&tl, root, CommTag(chan::COLLECTIVE_B), Some(parts))?;
                self.tl_op(TlOp::Done)?;
            }
            RelayInstruction::ReceiveFirst => {
                let sizes = self.tl_part_sizes.as_ref().expect("sizes unified");
                let totals: Vec<usize> = sizes
                    .iter()
                    .map(|row| row.iter().sum::<u64>() as usize)
                    .collect();
                let expected: usize = totals.iter().sum();
                let remote: Vec<E> = {
                    let client = self.relay.as_mut().expect("relay connected");
                    client.recv_block()?
                };
                if remote.len() != expected {
                    return Err(CombiError::Relay(format!(
                        "remote payload holds {} elements, expected {}",
                        remote.len(),
                        expected
                    )));
                }
                self.tl_op(TlOp::ScatterAccumulate)?;
                let mut counts = totals;
                counts.push(0); // the manager's own empty part
                let parts = split_by_counts(remote, &counts);
                collectives::scatterv(&tl, root, CommTag(chan::COLLECTIVE_B), Some(parts))?;

                self.tl_op(TlOp::Gather)?;
                let (flat, _counts) =
                    collectives::gatherv::<_, E>(&tl, root, CommTag(chan::COLLECTIVE), &[])?
                        .expect("manager is the gather root");
                {
                    let client = self.relay.as_mut().expect("relay connected");
                    client.send_block(&flat)?;
                }
                self.tl_op(TlOp::Done)?;
            }
        }
        Ok(())
    }

    /// The evaluation reductions run over the full global communicator and
    /// cannot proceed once a group has been removed from the run.
    fn require_all_groups(&self) -> Result<(), CombiError> {
        match self.groups.iter().find(|g| !g.is_alive()) {
            Some(group) => Err(CombiError::GroupFailure {
                group: group.group_index(),
            }),
            None => Ok(()),
        }
    }

    /// Evaluate the combined solution on a dense grid of `leval`, summed
    /// across all groups onto the manager.
    pub fn grid_eval(&mut self, leval: &LevelVector) -> Result<Vec<E>, CombiError> {
        self.require_all_groups()?;
        let record = payloads::encode_leval(leval);
        for group in self.alive_groups() {
            group.grid_eval(&record)?;
        }
        let mut dense = vec![E::default(); dense_len(leval, &self.params.boundary)];
        let global = self.sys.global().expect("manager rank");
        collectives::reduce_to_root(
            global,
            self.sys.global_manager_rank(),
            CommTag(chan::COLLECTIVE_B),
            &mut dense,
            |a: &mut E, b| *a += b,
        )?;
        self.wait_all_finished()?;
        Ok(dense)
    }

    /// Discrete L2 norm of the combined solution on a grid of `leval`.
    pub fn eval_norm(&mut self, leval: &LevelVector) -> Result<f64, CombiError> {
        self.require_all_groups()?;
        let record = payloads::encode_leval(leval);
        for group in self.alive_groups() {
            group.eval_norm(&record)?;
        }
        let mut dense = vec![E::default(); dense_len(leval, &self.params.boundary)];
        let global = self.sys.global().expect("manager rank");
        collectives::reduce_to_root(
            global,
            self.sys.global_manager_rank(),
            CommTag(chan::COLLECTIVE_B),
            &mut dense,
            |a: &mut E, b| *a += b,
        )?;
        self.wait_all_finished()?;
        let sum: f64 = dense.iter().map(|v| v.modulus() * v.modulus()).sum();
        Ok((sum / dense.len() as f64).sqrt())
    }

    /// Interpolate the combined solution at the given coordinates.
    pub fn interpolate_values(&mut self, coords: &[Vec<f64>]) -> Result<Vec<E>, CombiError> {
        self.require_all_groups()?;
        let record = payloads::encode_coords(coords);
        for group in self.alive_groups() {
            group.interpolate_values(&record)?;
        }
        let mut values = vec![E::default(); coords.len()];
        let global = self.sys.global().expect("manager rank");
        collectives::reduce_to_root(
            global,
            self.sys.global_manager_rank(),
            CommTag(chan::COLLECTIVE_B),
            &mut values,
            |a: &mut E, b| *a += b,
        )?;
        self.wait_all_finished()?;
        Ok(values)
    }

    /// Seeded Monte-Carlo sample of the combined solution; both systems use
    /// the same seed so their samples align.
    pub fn monte_carlo_values(
        &mut self,
        n: usize,
        seed: u64,
    ) -> Result<(Vec<Vec<f64>>, Vec<E>), CombiError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let dim = self.params.dim;
        let coords: Vec<Vec<f64>> = (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(0.0..1.0)).collect())
            .collect();
        let values = self.interpolate_values(&coords)?;
        Ok((coords, values))
    }

    /// Write the combined solution at `leval` as per-rank checkpoints of one
    /// group.
    pub fn parallel_eval(
        &mut self,
        leval: &LevelVector,
        path: &str,
        group: usize,
    ) -> Result<(), CombiError> {
        let record = payloads::encode_parallel_eval(leval, path);
        let g = self
            .groups
            .get_mut(group)
            .filter(|g| g.is_alive())
            .ok_or(CombiError::GroupFailure { group })?;
        g.parallel_eval(&record)?;
        self.wait_all_finished()?;
        Ok(())
    }

    /// Zero the coefficient of a failed task and resend the parameters, so
    /// subsequent combines exclude it.
    pub fn exclude_task(&mut self, task_id: u64) -> Result<(), CombiError> {
        let Some(pos) = self.params.task_ids.iter().position(|&t| t == task_id) else {
            return Err(CombiError::TaskFailure {
                task: task_id,
                level: Vec::new(),
            });
        };
        self.params.coeffs[pos] = 0.0;
        if let Some(task) = self.tasks.iter_mut().find(|t| t.id() == task_id) {
            task.info_mut().coeff = 0.0;
        }
        self.update_combi_parameters()
    }

    /// Remove groups from the run (e.g. after a detected group failure).
    pub fn remove_groups(&mut self, indices: &[usize]) {
        for &g in indices {
            if let Some(group) = self.groups.get_mut(g) {
                group.mark_removed();
            }
        }
    }

    /// Send the exit signal to every group. Statuses settle to WAIT; no
    /// READY follows.
    pub fn exit(&mut self) -> Result<(), CombiError> {
        for group in self.alive_groups() {
            group.exit()?;
        }
        Ok(())
    }
}

fn split_by_counts<T>(flat: Vec<T>, counts: &[usize]) -> Vec<Vec<T>> {
    let mut parts = Vec::with_capacity(counts.len());
    let mut rest = flat;
    for &count in counts {
        let tail = rest.split_off(count.min(rest.len()));
        parts.push(rest);
        rest = tail;
    }
    parts
}
