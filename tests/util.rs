#![allow(dead_code)]
//! Shared helpers for the integration suite: a constant-paraboloid task
//! kind, an in-process stand-in for the third-level relay daemon, and a
//! thread-per-rank runner for two-system scenarios.

use std::io::{Read, Write};
use std::marker::PhantomData;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use combigrid::combi_error::CombiError;
use combigrid::comm::communicator::pending_messages_in_tag_range;
use combigrid::comm::system::chan;
use combigrid::grid::DomainDecomposition;
use combigrid::manager::process_manager::TlOutcome;
use combigrid::prelude::*;
use combigrid::task::{Task, TaskHeader, TaskInfo};

/// Communicator type used by every multi-rank test: one system's slice of
/// the thread-per-rank world.
pub type TestComm = SubComm<RayonComm>;

pub const PARABOLOID_KIND: u16 = 1;

/// `±prod_d x_d (x_d - 1)`: vanishes on the boundary, is reproduced exactly
/// by the combination at grid points.
pub fn paraboloid(x: &[f64]) -> f64 {
    let sign = if x.len() % 2 == 1 { 1.0 } else { -1.0 };
    x.iter().fold(sign, |acc, &c| acc * c * (c - 1.0))
}

/// Constant task: the initial function values never change, so the combined
/// solution must keep reproducing them. Optionally armed to fail on one run
/// for the fault-tolerance tests.
pub struct ParaboloidTask<C: Communicator> {
    info: TaskInfo,
    dfg: Option<DistributedFullGrid<f64>>,
    fail_at_run: u64,
    runs: u64,
    _comm: PhantomData<C>,
}

impl<C: Communicator> ParaboloidTask<C> {
    pub fn new(id: u64, level: LevelVector, coeff: f64, boundary: Vec<bool>) -> Self {
        Self {
            info: TaskInfo::new(id, level, coeff, boundary),
            dfg: None,
            fail_at_run: u64::MAX,
            runs: 0,
            _comm: PhantomData,
        }
    }

    pub fn failing_at(mut self, run: u64) -> Self {
        self.fail_at_run = run;
        self
    }
}

impl<C: Communicator> Task<f64, C> for ParaboloidTask<C> {
    fn info(&self) -> &TaskInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut TaskInfo {
        &mut self.info
    }

    fn kind(&self) -> u16 {
        PARABOLOID_KIND
    }

    fn encode_payload(&self) -> Vec<u8> {
        self.fail_at_run.to_le_bytes().to_vec()
    }

    fn init(
        &mut self,
        lcomm: &SubComm<C>,
        decomposition: &DomainDecomposition,
    ) -> Result<(), CombiError> {
        let mut dfg = DistributedFullGrid::new(
            self.info.level.clone(),
            self.info.boundary.clone(),
            decomposition.clone(),
            lcomm.rank(),
        )?;
        dfg.fill_with(paraboloid);
        self.dfg = Some(dfg);
        Ok(())
    }

    fn run(&mut self, lcomm: &SubComm<C>) -> Result<(), CombiError> {
        self.runs += 1;
        if self.runs == self.fail_at_run {
            return Err(CombiError::TaskFailure {
                task: self.info.id,
                level: self.info.level.clone(),
            });
        }
        combigrid::comm::collectives::barrier(lcomm, CommTag(chan::BARRIER))
    }

    fn dfg(&self, g: usize) -> &DistributedFullGrid<f64> {
        assert_eq!(g, 0);
        self.dfg.as_ref().expect("task initialised")
    }

    fn dfg_mut(&mut self, g: usize) -> &mut DistributedFullGrid<f64> {
        assert_eq!(g, 0);
        self.dfg.as_mut().expect("task initialised")
    }
}

pub fn paraboloid_ctor<C: Communicator>(
    header: &TaskHeader,
    payload: &[u8],
) -> Result<Box<dyn Task<f64, C>>, CombiError> {
    let mut task: ParaboloidTask<C> = ParaboloidTask::new(
        header.id,
        header.level.clone(),
        header.coeff,
        header.boundary.clone(),
    );
    if payload.len() == 8 {
        task.fail_at_run = u64::from_le_bytes(payload.try_into().unwrap());
    }
    Ok(Box::new(task))
}

pub fn test_registry<C: Communicator>() -> TaskRegistry<f64, C> {
    let mut registry = TaskRegistry::new();
    registry.register(PARABOLOID_KIND, paraboloid_ctor::<C>);
    registry
}

// --- relay stand-in ------------------------------------------------------

fn read_line(conn: &mut TcpStream) -> std::io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        conn.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    Ok(String::from_utf8(line).expect("ascii control line"))
}

fn pipe_block(from: &mut TcpStream, to: &mut TcpStream) -> std::io::Result<()> {
    let mut len = [0u8; 8];
    from.read_exact(&mut len)?;
    let mut payload = vec![0u8; u64::from_le_bytes(len) as usize];
    from.read_exact(&mut payload)?;
    to.write_all(&len)?;
    to.write_all(&payload)
}

/// In-process relay: accepts the two system managers, alternates the
/// send/receive roles each round, and forwards one block each way per
/// round. After `rounds` exchanges the connections are dropped, which lets
/// the fallback tests observe a relay failure.
pub fn spawn_relay(rounds: usize) -> (u16, std::thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind relay");
    let port = listener.local_addr().unwrap().port();
    let handle = std::thread::spawn(move || {
        let (a, _) = listener.accept().expect("first system");
        let (b, _) = listener.accept().expect("second system");
        let mut conns = [a, b];
        for round in 0..rounds {
            if read_line(&mut conns[0]).is_err() || read_line(&mut conns[1]).is_err() {
                return;
            }
            let (s, r) = if round % 2 == 0 { (0, 1) } else { (1, 0) };
            if conns[s].write_all(b"sendSubspaces\n").is_err()
                || conns[r].write_all(b"receiveSubspaces\n").is_err()
            {
                return;
            }
            let [ref mut first, ref mut second] = conns;
            let (sender, receiver) = if s == 0 {
                (first, second)
            } else {
                (second, first)
            };
            if pipe_block(sender, receiver).is_err() || pipe_block(receiver, sender).is_err() {
                return;
            }
        }
    });
    (port, handle)
}

// --- two-system scenario runner ------------------------------------------

#[derive(Clone)]
pub struct Scenario {
    pub lmin: LevelVector,
    pub lmax: LevelVector,
    pub boundary: bool,
    pub ngroup: usize,
    pub nprocs: usize,
    pub parallelization: Vec<usize>,
    pub ncombi: usize,
    /// Disjoint 0x1000-wide tag window per scenario in one test binary.
    pub base_tag: u16,
    /// Write and verify checkpoint files from the final solution.
    pub write_checkpoint: bool,
    /// Rounds the relay serves; `None` means sizes + every combine step.
    pub relay_rounds: Option<usize>,
}

impl Scenario {
    pub fn new(lmin: &[u32], lmax: &[u32], boundary: bool, base_tag: u16) -> Self {
        Self {
            lmin: lmin.to_vec(),
            lmax: lmax.to_vec(),
            boundary,
            ngroup: 1,
            nprocs: 1,
            parallelization: vec![1; lmin.len()],
            ncombi: 3,
            base_tag,
            write_checkpoint: false,
            relay_rounds: None,
        }
    }
}

pub struct SystemOutcome {
    pub coords: Vec<Vec<f64>>,
    pub values: Vec<f64>,
    pub single_error: f64,
    pub tl_outcomes: Vec<TlOutcome>,
}

pub struct WorkerOutcome {
    pub points_checked: usize,
}

enum ThreadOutcome {
    Manager(SystemOutcome),
    Worker(WorkerOutcome),
}

pub struct ScenarioOutcome {
    pub systems: Vec<SystemOutcome>,
    pub points_checked: usize,
}

fn manager_main(
    sys: CombiSystem<TestComm>,
    sc: &Scenario,
    system_number: usize,
    port: u16,
) -> SystemOutcome {
    let scheme = CombiScheme::classical(&sc.lmin, &sc.lmax).expect("valid scheme");
    let boundary = vec![sc.boundary; sc.lmin.len()];
    let tl = create_third_level_scheme(&scheme, &boundary, system_number, 2).expect("decompose");

    let mut tasks: Vec<Box<dyn Task<f64, TestComm>>> = Vec::new();
    let mut task_ids = Vec::new();
    for (i, (level, &coeff)) in tl.part.levels().iter().zip(tl.part.coeffs()).enumerate() {
        let id = i as u64;
        tasks.push(Box::new(ParaboloidTask::<TestComm>::new(
            id,
            level.clone(),
            coeff,
            boundary.clone(),
        )));
        task_ids.push(id);
    }

    let params = CombiParameters {
        dim: sc.lmin.len(),
        lmin: sc.lmin.clone(),
        lmax: sc.lmax.clone(),
        boundary: boundary.clone(),
        levels: tl.part.levels().to_vec(),
        coeffs: tl.part.coeffs().to_vec(),
        task_ids,
        ncombi: sc.ncombi,
        num_grids: 1,
        parallelization: sc.parallelization.clone(),
        reduce_lmin: vec![0; sc.lmin.len()],
        reduce_lmax: vec![1; sc.lmin.len()],
        element_kind: ElementKind::Real,
        third_level: Some(ThirdLevelConfig {
            host: "127.0.0.1".into(),
            port,
            system_number,
        }),
        group_assignment: vec![],
    };

    let mut manager: ProcessManager<f64, TestComm> = ProcessManager::new(
        sys,
        CombiConfig::default(),
        tasks,
        params,
        tl.common_subspaces,
    )
    .expect("manager");

    manager.update_combi_parameters().expect("send parameters");

    let mut tl_outcomes = Vec::new();
    for step in 0..sc.ncombi {
        if step == 0 {
            manager.run_first().expect("first run");
            manager
                .unify_subspace_sizes_third_level()
                .expect("size unification");
        } else {
            manager.run_next().expect("run next");
        }
        let outcome = manager.combine_third_level().expect("combine");
        tl_outcomes.push(outcome);
    }

    let (coords, values) = manager.monte_carlo_values(1000, 42).expect("interpolate");
    let single_error: f64 = coords
        .iter()
        .zip(&values)
        .map(|(x, v)| (paraboloid(x) - v).powi(2))
        .sum();

    if sc.write_checkpoint {
        let dir =
            std::env::temp_dir().join(format!("combigrid_tl_{}_{}", sc.base_tag, system_number));
        std::fs::create_dir_all(&dir).unwrap();
        let base = dir.join("solution").to_string_lossy().into_owned();
        manager
            .parallel_eval(&sc.lmax, &base, 0)
            .expect("parallel eval");
        for rank in 0..sc.nprocs {
            assert!(
                combigrid::io::checkpoint::checkpoint_piece_exists(&base, rank),
                "missing checkpoint piece {}",
                rank
            );
            combigrid::io::checkpoint::remove_checkpoint_piece(&base, rank);
        }
    }

    manager.exit().expect("exit");
    for status in manager.group_statuses() {
        assert_eq!(status, GroupStatus::Wait, "group not WAIT at teardown");
    }

    SystemOutcome {
        coords,
        values,
        single_error,
        tl_outcomes,
    }
}

fn worker_main(sys: CombiSystem<TestComm>, sc: &Scenario) -> WorkerOutcome {
    let mut worker: ProcessGroupWorker<f64, TestComm> =
        ProcessGroupWorker::new(sys, CombiConfig::default(), test_registry()).expect("worker");

    let mut points_checked = 0usize;
    loop {
        let signal = worker.wait().expect("wait");
        match signal {
            Signal::CombineThirdLevel => {
                // only a completed exchange must reproduce the initial
                // function; fallback scenarios leave partial sums behind
                if worker.status() == GroupStatus::Wait && sc.relay_rounds.is_none() {
                    points_checked += check_grids_against_paraboloid(&worker);
                }
            }
            Signal::Exit => break,
            _ => {}
        }
    }

    let params = worker.combi_parameters().expect("parameters installed");
    for &b in &params.boundary {
        assert_eq!(b, sc.boundary, "boundary flag echo");
    }
    assert_eq!(worker.status(), GroupStatus::Wait);
    WorkerOutcome { points_checked }
}

/// Every local point of every task grid must equal the paraboloid after a
/// completed third-level combine.
pub fn check_grids_against_paraboloid(worker: &ProcessGroupWorker<f64, TestComm>) -> usize {
    let mut checked = 0usize;
    for task in worker.tasks() {
        let dfg = task.dfg(0);
        for li in 0..dfg.nr_local_elements() {
            let x = dfg.coords_local(li);
            let expected = paraboloid(&x);
            let got = dfg.data()[li];
            assert!(
                (got - expected).abs() < 1e-10,
                "task {} point {:?}: got {}, expected {}",
                task.id(),
                x,
                got,
                expected
            );
            checked += 1;
        }
    }
    checked
}

/// Run a full two-system scenario on threads and return both systems'
/// outcomes plus the total number of grid points verified in workers.
pub fn run_two_system_scenario(sc: Scenario) -> ScenarioOutcome {
    let per_system = sc.ngroup * sc.nprocs + 1;
    let total = 2 * per_system;
    let relay_rounds = sc.relay_rounds.unwrap_or(1 + sc.ncombi);
    let (port, relay) = spawn_relay(relay_rounds);

    let handles: Vec<_> = (0..total)
        .map(|rank| {
            let sc = sc.clone();
            std::thread::spawn(move || {
                let system_number = rank / per_system;
                let world = Arc::new(RayonComm::new(rank, total));
                let members: Vec<usize> =
                    (system_number * per_system..(system_number + 1) * per_system).collect();
                let tag = CommTag(sc.base_tag + system_number as u16 * 0x0800);
                let system_world =
                    SubComm::split(&world, members, tag).expect("rank in its system");
                let sys =
                    CombiSystem::init(system_world, sc.ngroup, sc.nprocs, 0).expect("topology");
                if sys.is_manager() {
                    ThreadOutcome::Manager(manager_main(sys, &sc, system_number, port))
                } else {
                    ThreadOutcome::Worker(worker_main(sys, &sc))
                }
            })
        })
        .collect();

    let mut systems = Vec::new();
    let mut points_checked = 0usize;
    for handle in handles {
        match handle.join().expect("rank thread") {
            ThreadOutcome::Manager(out) => systems.push(out),
            ThreadOutcome::Worker(out) => points_checked += out.points_checked,
        }
    }
    relay.join().expect("relay thread");

    // no stray messages after EXIT anywhere in this scenario's tag window
    assert_eq!(
        pending_messages_in_tag_range(sc.base_tag..sc.base_tag + 0x1000),
        0,
        "stray messages left in the mailbox"
    );

    ScenarioOutcome {
        systems,
        points_checked,
    }
}

/// Shared assertions of the third-level scenarios: the exchange happened
/// every step, workers verified points, and the cross-system Monte-Carlo
/// error does not exceed either single-system error.
pub fn assert_third_level_outcome(sc: &Scenario, outcome: &ScenarioOutcome) {
    assert_eq!(outcome.systems.len(), 2);
    assert!(outcome.points_checked > 0, "no grid data was verified");
    let [sys0, sys1] = &outcome.systems[..] else {
        unreachable!()
    };
    for out in [sys0, sys1] {
        assert_eq!(out.tl_outcomes.len(), sc.ncombi);
        assert!(out.tl_outcomes.iter().all(|&o| o == TlOutcome::Exchanged));
    }
    assert_eq!(sys0.coords, sys1.coords, "seeded samples must align");

    let two_system_error: f64 = sys0
        .coords
        .iter()
        .zip(sys0.values.iter().zip(&sys1.values))
        .map(|(x, (a, b))| (paraboloid(x) - (a + b)).powi(2))
        .sum();
    assert!(
        two_system_error <= sys0.single_error + 1e-12,
        "cross-system error {} exceeds system 0's {}",
        two_system_error,
        sys0.single_error
    );
    assert!(
        two_system_error <= sys1.single_error + 1e-12,
        "cross-system error {} exceeds system 1's {}",
        two_system_error,
        sys1.single_error
    );
}
