mod common;

use std::collections::BTreeSet;

use common::{
    delta_stage, excavation_model, explicit_stage, three_stage_schedule, RecordingSolver,
    ANCHOR_ELEMENTS, CLAY, CLAY_ELEMENTS, CONCRETE, SAND, SOIL_ELEMENTS, STEEL, WALL_ELEMENTS,
};
use geostage::{
    anchors::Topology,
    config::PipelineConfig,
    constraints::CouplingKind,
    driver::CancellationToken,
    error::{IdKind, StagingError, WarningKind},
    pipeline::{prepare, run},
    stages::{Schedule, StageDelta},
};

#[test]
fn preparation_finds_two_anchors_and_couples_them() {
    let prepared = prepare(excavation_model(), &PipelineConfig::default()).unwrap();

    let segmentation = &prepared.segmentation;
    assert_eq!(segmentation.anchor_count(), 2);
    assert!(segmentation.components.iter().all(|c| c.topology == Topology::Chain));
    assert_eq!(segmentation.head_nodes(), vec![1, 21]);
    assert_eq!(segmentation.tail_nodes(), vec![11, 31]);
    assert!(segmentation
        .components
        .iter()
        .all(|c| c.prestress_n == Some(345_000.0)));

    let report = &prepared.constraints.report;
    assert_eq!(report.heads, 2);
    assert_eq!(report.bonded, 10);
    assert_eq!(report.head_to_wall, 2);
    assert_eq!(report.bonded_to_soil, 10);
    assert_eq!(report.unreachable, 0);
    assert_eq!(report.heads_beyond_tolerance, 0);

    for constraint in prepared.constraints.iter() {
        assert!((constraint.weight_sum() - 1.0).abs() < 1e-9);
        assert!(constraint.masters.len() <= 8);
    }
    let head = &prepared.constraints.wall_anchor[0];
    assert_eq!(head.coupling, CouplingKind::HeadToWall);
    assert!(head.masters.iter().all(|m| (100..200).contains(&m.node)));

    assert!(prepared.warnings.is_empty());
    assert_eq!(
        prepared.support_materials(),
        &BTreeSet::from([CONCRETE, STEEL])
    );
}

#[test]
fn stages_run_in_order_and_hand_over_state() {
    let prepared = prepare(excavation_model(), &PipelineConfig::default()).unwrap();
    let mut solver = RecordingSolver::default();

    let report = run(
        &prepared,
        &three_stage_schedule(),
        &mut solver,
        &PipelineConfig::default(),
        CancellationToken::new(),
    )
    .unwrap();

    let ids: Vec<u32> = report.stages.iter().map(|r| r.stage_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(report.cancelled_before.is_none());

    let previous: Vec<Option<u32>> = solver.calls.iter().map(|c| c.previous_stage).collect();
    assert_eq!(previous, vec![None, Some(1), Some(2)]);

    let all = SOIL_ELEMENTS + WALL_ELEMENTS + ANCHOR_ELEMENTS;
    assert_eq!(solver.calls[0].active_elements, all);
    assert_eq!(solver.calls[1].active_elements, all - CLAY_ELEMENTS);
    assert_eq!(solver.calls[1].materials, vec![SAND, CONCRETE, STEEL]);
    assert_eq!(solver.calls[2].loads, vec![1, 2]);
    assert_eq!(solver.calls[0].constraints, 12);

    assert!((report.stages[2].max_displacement - 0.015).abs() < 1e-12);
    assert!(report.stages.iter().all(|r| r.converged));
}

#[test]
fn constraints_lose_excavated_masters() {
    let prepared = prepare(excavation_model(), &PipelineConfig::default()).unwrap();
    let schedule = Schedule::new(vec![
        explicit_stage(1, &[CLAY, SAND, CONCRETE, STEEL]),
        delta_stage(
            2,
            StageDelta {
                excavate: BTreeSet::from([CLAY, SAND]),
                ..StageDelta::default()
            },
        ),
    ]);
    let mut solver = RecordingSolver::default();

    let report = run(
        &prepared,
        &schedule,
        &mut solver,
        &PipelineConfig::default(),
        CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(report.stages[1].active_elements, WALL_ELEMENTS + ANCHOR_ELEMENTS);
    assert_eq!(report.stages[1].active_constraints, 2);
}

#[test]
fn broken_reference_aborts_before_the_stage_is_solved() {
    let prepared = prepare(excavation_model(), &PipelineConfig::default()).unwrap();
    let schedule = Schedule::new(vec![
        explicit_stage(1, &[CLAY, SAND, CONCRETE, STEEL]),
        explicit_stage(2, &[SAND, CONCRETE, STEEL, 42]),
        explicit_stage(3, &[SAND, CONCRETE, STEEL]),
    ]);
    let mut solver = RecordingSolver::default();

    let failure = run(
        &prepared,
        &schedule,
        &mut solver,
        &PipelineConfig::default(),
        CancellationToken::new(),
    )
    .unwrap_err();

    assert_eq!(solver.calls.len(), 1);
    assert_eq!(failure.completed.len(), 1);
    assert!(matches!(
        failure.error,
        StagingError::StageDependencyBroken {
            stage_id: 2,
            kind: IdKind::Material,
            id: 42
        }
    ));
}

#[test]
fn solver_failure_keeps_completed_records() {
    let prepared = prepare(excavation_model(), &PipelineConfig::default()).unwrap();
    let mut solver = RecordingSolver {
        failing: BTreeSet::from([3]),
        ..RecordingSolver::default()
    };

    let failure = run(
        &prepared,
        &three_stage_schedule(),
        &mut solver,
        &PipelineConfig::default(),
        CancellationToken::new(),
    )
    .unwrap_err();

    assert_eq!(failure.completed.len(), 2);
    assert!(failure.to_string().contains("matrix is singular"));
}

#[test]
fn divergence_is_recorded_or_fatal_by_configuration() {
    let prepared = prepare(excavation_model(), &PipelineConfig::default()).unwrap();

    let mut solver = RecordingSolver {
        diverging: BTreeSet::from([2]),
        ..RecordingSolver::default()
    };
    let report = run(
        &prepared,
        &three_stage_schedule(),
        &mut solver,
        &PipelineConfig::default(),
        CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(report.stages.len(), 3);
    assert!(!report.stages[1].converged);

    let mut config = PipelineConfig::default();
    config.driver.stop_on_divergence = true;
    let mut solver = RecordingSolver {
        diverging: BTreeSet::from([2]),
        ..RecordingSolver::default()
    };
    let schedule = three_stage_schedule();
    let failure =
        run(&prepared, &schedule, &mut solver, &config, CancellationToken::new()).unwrap_err();
    assert_eq!(failure.completed.len(), 2);
    assert_eq!(solver.calls.len(), 2);
}

#[test]
fn cancellation_is_honoured_between_stages() {
    let prepared = prepare(excavation_model(), &PipelineConfig::default()).unwrap();
    let token = CancellationToken::new();
    let mut solver = RecordingSolver {
        cancel_after: Some((1, token.clone())),
        ..RecordingSolver::default()
    };

    let report = run(
        &prepared,
        &three_stage_schedule(),
        &mut solver,
        &PipelineConfig::default(),
        token,
    )
    .unwrap();

    assert_eq!(report.stages.len(), 1);
    assert_eq!(report.cancelled_before, Some(2));
    assert_eq!(solver.calls.len(), 1);
}

#[test]
fn re_adding_material_is_flagged() {
    let prepared = prepare(excavation_model(), &PipelineConfig::default()).unwrap();
    let schedule = Schedule::new(vec![
        explicit_stage(1, &[CLAY, SAND, CONCRETE, STEEL]),
        explicit_stage(2, &[SAND, CONCRETE, STEEL]),
        explicit_stage(3, &[CLAY, SAND, CONCRETE, STEEL]),
    ]);
    let mut solver = RecordingSolver::default();

    let report = run(
        &prepared,
        &schedule,
        &mut solver,
        &PipelineConfig::default(),
        CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(report.stages.len(), 3);
    assert_eq!(report.warnings.count(WarningKind::ScheduleInconsistent), 1);
    assert_eq!(
        report.warnings.tallies[&WarningKind::ScheduleInconsistent].samples,
        vec![3]
    );
}

#[test]
fn rejected_material_blocks_the_run() {
    let mut model = excavation_model();
    model.materials[0].poisson_ratio = 0.5;
    let prepared = prepare(model, &PipelineConfig::default()).unwrap();
    let mut solver = RecordingSolver::default();

    let failure = run(
        &prepared,
        &three_stage_schedule(),
        &mut solver,
        &PipelineConfig::default(),
        CancellationToken::new(),
    )
    .unwrap_err();

    assert!(matches!(
        failure.error,
        StagingError::MaterialsRejected { ref ids } if ids == &vec![CLAY]
    ));
    assert!(solver.calls.is_empty());
    assert!(prepared.materials.get(SAND).is_some());
}

#[test]
fn out_of_order_stage_ids_are_fatal() {
    let prepared = prepare(excavation_model(), &PipelineConfig::default()).unwrap();
    let schedule = Schedule::new(vec![
        explicit_stage(2, &[CLAY, SAND, CONCRETE, STEEL]),
        explicit_stage(1, &[SAND, CONCRETE, STEEL]),
    ]);
    let mut solver = RecordingSolver::default();

    let failure = run(
        &prepared,
        &schedule,
        &mut solver,
        &PipelineConfig::default(),
        CancellationToken::new(),
    )
    .unwrap_err();

    assert!(matches!(
        failure.error,
        StagingError::StageDependencyBroken {
            kind: IdKind::Stage,
            ..
        }
    ));
    assert!(solver.calls.is_empty());
}

#[test]
fn unvalidated_settings_are_rejected_by_prepare() {
    let mut config = PipelineConfig::default();
    config.coupling.growth_factor = 1.0;

    let err = prepare(excavation_model(), &config).err().unwrap();
    assert!(matches!(err, StagingError::Config(_)));
    assert!(err.to_string().contains("coupling.growth_factor"));
}
