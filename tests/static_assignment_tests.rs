//! Static task assignment: both systems read their placement from
//! `tests/data/test_scheme.json`, workers instantiate only the tasks tagged
//! with their own group number, and RUN_FIRST must never fire.

mod util;

use std::sync::Arc;

use combigrid::comm::communicator::pending_messages_in_tag_range;
use combigrid::manager::process_manager::TlOutcome;
use combigrid::prelude::*;
use combigrid::scheme::file::SchemeFromFile;
use combigrid::scheme::subspace_levels;
use combigrid::scheme::third_level::common_subspaces;
use combigrid::scheme::dominates;
use combigrid::task::Task;
use util::{paraboloid_ctor, ParaboloidTask, TestComm, PARABOLOID_KIND};

const SCHEME_FILE: &str = "tests/data/test_scheme.json";
const NGROUP: usize = 3;
const NCOMBI: usize = 10;

fn load_scheme() -> SchemeFromFile {
    SchemeFromFile::load(SCHEME_FILE).expect("test scheme file")
}

/// Subspaces every system's sparse grid carries: the file scheme is shared,
/// so the common set is the dominated part of the reduced reference box.
fn static_common_subspaces(
    loaded: &SchemeFromFile,
    params: &CombiParameters,
) -> Vec<LevelVector> {
    let parts = [loaded.scheme.levels(), loaded.scheme.levels()];
    let sg_max = params.sparse_grid_max();
    common_subspaces(&parts, &params.boundary)
        .into_iter()
        .filter(|sub| dominates(&sg_max, sub))
        .collect()
}

fn build_params(loaded: &SchemeFromFile, boundary: bool, port: u16, system: usize) -> CombiParameters {
    let dim = 2;
    CombiParameters {
        dim,
        lmin: vec![3, 6],
        lmax: vec![7, 10],
        boundary: vec![boundary; dim],
        levels: loaded.scheme.levels().to_vec(),
        coeffs: loaded.scheme.coeffs().to_vec(),
        task_ids: (0..loaded.scheme.len() as u64).collect(),
        ncombi: NCOMBI,
        num_grids: 1,
        parallelization: vec![1, 1],
        reduce_lmin: vec![0, 0],
        reduce_lmax: vec![1, 1],
        element_kind: ElementKind::Real,
        third_level: Some(ThirdLevelConfig {
            host: "127.0.0.1".into(),
            port,
            system_number: system,
        }),
        group_assignment: loaded.group_assignment.clone().expect("static file"),
    }
}

fn static_manager_main(sys: CombiSystem<TestComm>, boundary: bool, port: u16, system: usize) {
    let loaded = load_scheme();
    let params = build_params(&loaded, boundary, port, system);
    let common = static_common_subspaces(&loaded, &params);
    assert!(!common.is_empty());

    let tasks: Vec<Box<dyn Task<f64, TestComm>>> = loaded
        .scheme
        .levels()
        .iter()
        .zip(loaded.scheme.coeffs())
        .enumerate()
        .map(|(i, (level, &coeff))| {
            Box::new(ParaboloidTask::<TestComm>::new(
                i as u64,
                level.clone(),
                coeff,
                params.boundary.clone(),
            )) as Box<dyn Task<f64, TestComm>>
        })
        .collect();

    let mut manager: ProcessManager<f64, TestComm> =
        ProcessManager::new(sys, CombiConfig::default(), tasks, params, common)
            .expect("manager");

    // static placement forbids the serialised dispatch path entirely
    assert!(manager.run_first().is_err());

    manager.update_combi_parameters().expect("send parameters");
    for step in 0..NCOMBI {
        manager.run_next().expect("run next");
        if step == 0 {
            manager.init_dsgus().expect("init dsgus");
            manager
                .unify_subspace_sizes_third_level()
                .expect("size unification");
        }
        let outcome = manager.combine_third_level().expect("combine");
        assert_eq!(outcome, TlOutcome::Exchanged);
    }
    manager.exit().expect("exit");
    for status in manager.group_statuses() {
        assert_eq!(status, GroupStatus::Wait);
    }
}

fn static_worker_main(sys: CombiSystem<TestComm>, boundary: bool) {
    let group = sys.group_index().expect("worker rank");
    let mut registry = TaskRegistry::new();
    registry.register(PARABOLOID_KIND, paraboloid_ctor::<TestComm>);
    let mut worker: ProcessGroupWorker<f64, TestComm> =
        ProcessGroupWorker::new(sys, CombiConfig::default(), registry).expect("worker");

    let loaded = load_scheme();
    let assignment = loaded.group_assignment.clone().expect("static file");

    loop {
        let signal = worker.wait().expect("wait");
        match signal {
            Signal::UpdateCombiParameters => {
                // instantiate exactly the tasks assigned to this group
                for (i, (level, &coeff)) in loaded
                    .scheme
                    .levels()
                    .iter()
                    .zip(loaded.scheme.coeffs())
                    .enumerate()
                {
                    if assignment[i] != group {
                        continue;
                    }
                    let task = ParaboloidTask::<TestComm>::new(
                        i as u64,
                        level.clone(),
                        coeff,
                        vec![boundary; 2],
                    );
                    worker.initialize_task(Box::new(task)).expect("init task");
                }
            }
            Signal::RunFirst => panic!("RUN_FIRST must never fire under static assignment"),
            Signal::Exit => break,
            _ => {}
        }
    }

    let expected: usize = assignment.iter().filter(|&&g| g == group).count();
    assert!(expected > 0);
    let params = worker.combi_parameters().expect("parameters installed");
    for &b in &params.boundary {
        assert_eq!(b, boundary);
    }
    assert_eq!(worker.status(), GroupStatus::Wait);
}

#[test]
fn static_assignment_from_scheme_file() {
    let boundary = true;
    let per_system = NGROUP + 1;
    let total = 2 * per_system;
    let (port, relay) = util::spawn_relay(1 + NCOMBI);

    let handles: Vec<_> = (0..total)
        .map(|rank| {
            std::thread::spawn(move || {
                let system = rank / per_system;
                let world = Arc::new(RayonComm::new(rank, total));
                let members: Vec<usize> =
                    (system * per_system..(system + 1) * per_system).collect();
                let tag = CommTag(system as u16 * 0x0800);
                let system_world = SubComm::split(&world, members, tag).expect("member");
                let sys = CombiSystem::init(system_world, NGROUP, 1, 0).expect("topology");
                if sys.is_manager() {
                    static_manager_main(sys, boundary, port, system);
                } else {
                    static_worker_main(sys, boundary);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("rank thread");
    }
    relay.join().expect("relay thread");
    assert_eq!(pending_messages_in_tag_range(0x0000..0x1000), 0);
}

#[test]
fn scheme_file_matches_the_classical_scheme() {
    let loaded = load_scheme();
    let classical = CombiScheme::classical(&vec![3, 6], &vec![7, 10]).unwrap();
    let mut from_file: Vec<_> = loaded.scheme.levels().to_vec();
    let mut reference: Vec<_> = classical.levels().to_vec();
    from_file.sort();
    reference.sort();
    assert_eq!(from_file, reference);
    assert_eq!(
        loaded.scheme.coeffs().iter().sum::<f64>(),
        classical.coeffs().iter().sum::<f64>()
    );
}

#[test]
fn static_common_set_is_within_the_sparse_box() {
    let loaded = load_scheme();
    let params = build_params(&loaded, true, 0, 0);
    let common = static_common_subspaces(&loaded, &params);
    let table = subspace_levels(&params.sparse_grid_max(), &params.boundary);
    for sub in &common {
        assert!(table.contains(sub));
    }
}
