//! Wire-stability tests: the records that cross rank and system boundaries
//! must keep their exact layout.

use combigrid::comm::wire::{SignalFrame, WireReader, WireWriter, WIRE_VERSION};
use combigrid::element::ElementKind;
use combigrid::manager::params::{CombiParameters, ThirdLevelConfig};
use combigrid::manager::signals::{GroupStatus, Signal, TlOp};
use combigrid::task::TaskHeader;

#[test]
fn signal_codes_are_identical_on_both_systems() {
    // values are part of the cross-system contract; renumbering breaks runs
    let expected: [(Signal, u16); 13] = [
        (Signal::RunFirst, 1),
        (Signal::RunNext, 2),
        (Signal::Combine, 3),
        (Signal::InitDsgus, 4),
        (Signal::CombineThirdLevel, 5),
        (Signal::ReduceSubspaceSizesTl, 6),
        (Signal::WaitForTlSizeUpdate, 7),
        (Signal::UpdateCombiParameters, 8),
        (Signal::GridEval, 9),
        (Signal::ParallelEval, 10),
        (Signal::EvalNorm, 11),
        (Signal::InterpolateValues, 12),
        (Signal::Exit, 13),
    ];
    for (signal, code) in expected {
        assert_eq!(signal.code(), code);
        assert_eq!(Signal::from_code(code).unwrap(), signal);
    }
}

#[test]
fn status_and_opcode_values() {
    assert_eq!(GroupStatus::Wait.code(), 0);
    assert_eq!(GroupStatus::Busy.code(), 1);
    assert_eq!(GroupStatus::Fail.code(), 2);
    for op in [
        TlOp::Gather,
        TlOp::ScatterAssign,
        TlOp::ScatterAccumulate,
        TlOp::Abort,
        TlOp::Done,
    ] {
        assert_eq!(TlOp::from_code(op.code()).unwrap(), op);
    }
}

#[test]
fn signal_frame_is_little_endian() {
    let frame = SignalFrame::new(0x0102);
    let bytes: [u8; 4] = bytemuck::cast(frame);
    assert_eq!(bytes, [WIRE_VERSION as u8, 0, 0x02, 0x01]);
}

#[test]
fn parameters_roundtrip_with_and_without_third_level() {
    let mut params = CombiParameters {
        dim: 2,
        lmin: vec![4, 4],
        lmax: vec![7, 7],
        boundary: vec![false, true],
        levels: vec![vec![7, 4], vec![4, 7], vec![5, 5]],
        coeffs: vec![1.0, 1.0, -1.0],
        task_ids: vec![10, 11, 12],
        ncombi: 10,
        num_grids: 2,
        parallelization: vec![2, 1],
        reduce_lmin: vec![0, 0],
        reduce_lmax: vec![1, 1],
        element_kind: ElementKind::Complex,
        third_level: Some(ThirdLevelConfig {
            host: "relayhost".into(),
            port: 9999,
            system_number: 1,
        }),
        group_assignment: vec![0, 1, 0],
    };
    let back = CombiParameters::decode(&params.encode()).unwrap();
    assert_eq!(back, params);

    params.third_level = None;
    params.group_assignment = vec![];
    let back = CombiParameters::decode(&params.encode()).unwrap();
    assert_eq!(back, params);
}

#[test]
fn parameter_version_is_checked() {
    let params = CombiParameters {
        dim: 1,
        lmin: vec![1],
        lmax: vec![1],
        boundary: vec![true],
        levels: vec![vec![1]],
        coeffs: vec![1.0],
        task_ids: vec![0],
        ncombi: 1,
        num_grids: 1,
        parallelization: vec![1],
        reduce_lmin: vec![0],
        reduce_lmax: vec![0],
        element_kind: ElementKind::Real,
        third_level: None,
        group_assignment: vec![],
    };
    let mut bytes = params.encode();
    bytes[0] ^= 0xFF; // corrupt the version tag
    assert!(CombiParameters::decode(&bytes).is_err());
}

#[test]
fn task_records_carry_kind_and_payload() {
    let header = TaskHeader {
        id: 7,
        kind: 3,
        level: vec![5, 6],
        coeff: -2.0,
        boundary: vec![true, false],
    };
    let bytes = header.encode(&[0xAB, 0xCD]);
    let (back, payload) = TaskHeader::decode(&bytes).unwrap();
    assert_eq!(back, header);
    assert_eq!(payload, vec![0xAB, 0xCD]);
}

#[test]
fn writer_is_byte_stable() {
    let mut w = WireWriter::new();
    w.put_u32(0x01020304);
    w.put_f64(1.0);
    let bytes = w.finish();
    assert_eq!(&bytes[..4], &[0x04, 0x03, 0x02, 0x01]);
    let mut r = WireReader::new(&bytes);
    assert_eq!(r.get_u32("x").unwrap(), 0x01020304);
    assert_eq!(r.get_f64("y").unwrap(), 1.0);
}
