//! End-to-end volume acquisitions against the simulated rig.

use fluor_daq::acquisition::{
    acquire_volume, frame_index, AcquisitionPlan, AcquisitionState, VolumeAcquisition,
};
use fluor_daq::config::Settings;
use fluor_daq::hardware::detector::{MountOrientation, TriggerMode};
use fluor_daq::hardware::laser::LaserBank;
use fluor_daq::hardware::mirror::MirrorMacro;
use fluor_daq::hardware::mock::{
    MirrorEvent, MockDetector, MockLaserLink, MockMirror, MockStage, MockTriggerSequencer,
    MoveModel, TriggerEvent,
};
use fluor_daq::hardware::trigger::{DigitalLine, SequenceProgram};
use fluor_daq::DaqError;
use std::time::Duration;

const ROWS: usize = 4;
const COLS: usize = 6;

struct Rig {
    link: MockLaserLink,
    lasers: LaserBank,
    mirror: MockMirror,
    stage: MockStage,
    detector: MockDetector,
    trigger: MockTriggerSequencer,
}

impl Rig {
    fn new() -> Self {
        let link = MockLaserLink::new();
        let lasers =
            LaserBank::from_settings(&Settings::default(), Box::new(link.clone())).unwrap();
        Self {
            link,
            lasers,
            mirror: MockMirror::new(),
            stage: MockStage::at(12_345),
            detector: MockDetector::new(ROWS, COLS).with_orientation(MountOrientation::half_turn()),
            trigger: MockTriggerSequencer::new(),
        }
    }

    fn only_volume_channels(mut self, names: &[&str]) -> Self {
        let all: Vec<String> =
            self.lasers.channels().iter().map(|c| c.name().to_string()).collect();
        for name in all {
            self.lasers
                .channel_mut(&name)
                .unwrap()
                .set_volume_enabled(names.contains(&name.as_str()));
        }
        self
    }

    fn acquisition(&mut self, plan: AcquisitionPlan) -> VolumeAcquisition<'_> {
        VolumeAcquisition::new(
            plan,
            &mut self.lasers,
            &mut self.mirror,
            &mut self.stage,
            &mut self.detector,
            &mut self.trigger,
        )
    }
}

fn widefield(slices: usize, distance: i64) -> AcquisitionPlan {
    AcquisitionPlan::widefield(slices, distance).with_time_delay(Duration::ZERO)
}

#[test]
fn widefield_four_channels_five_slices() {
    let mut rig = Rig::new();
    let report = rig.acquisition(widefield(5, 1000)).run().unwrap();

    assert_eq!(report.state, AcquisitionState::Done);
    assert_eq!(report.volume.shape(), [4, 1, 5, 1, ROWS, COLS]);
    assert_eq!(report.corrections.len(), 5);

    // Frame 0 is the shape probe; then one frame per channel per slice
    let frames = rig.detector.frames();
    assert_eq!(frames.len(), 1 + 4 * 5);
    for z in 0..5 {
        for c in 0..4 {
            assert_eq!(report.volume.frame(c, 0, z, 0), frames[1 + z * 4 + c]);
        }
    }

    assert_eq!(rig.stage.position(), 12_345);
    assert_eq!(rig.stage.absolute_moves(), &[12_345]);
    assert_eq!(rig.stage.relative_moves()[0], 2000);
}

#[test]
fn widefield_hardware_trigger_pulses_each_laser_line() {
    let mut rig = Rig::new();
    rig.acquisition(widefield(2, 100)).run().unwrap();

    let pulses: Vec<_> = rig
        .trigger
        .events()
        .iter()
        .map(|event| match event {
            TriggerEvent::Pulse(line, duration) => (line.to_string(), *duration),
            other => panic!("unexpected trigger event {other:?}"),
        })
        .collect();
    let expected: Vec<_> = ["P03", "P02", "P01", "P00"]
        .iter()
        .map(|line| (line.to_string(), Duration::from_micros(200)))
        .collect();
    assert_eq!(pulses, [expected.clone(), expected].concat());
    assert_eq!(
        &rig.trigger.wire()[..4],
        &["Dev1/port0/line3", "Dev1/port0/line2", "Dev1/port0/line1", "Dev1/port0/line0"]
    );

    assert_eq!(rig.detector.bursts(), &[1; 8]);
    assert!(rig.detector.exposures().iter().all(|&e| e == 200.0));
}

#[test]
fn widefield_parks_mirror_every_slice() {
    let mut rig = Rig::new();
    rig.acquisition(widefield(3, 100)).run().unwrap();

    let parked = [MirrorEvent::Stop, MirrorEvent::MoveTo("WIDEFIELD".into())];
    assert_eq!(rig.mirror.events(), [parked.clone(), parked.clone(), parked].concat());
}

#[test]
fn widefield_software_trigger_gates_emission() {
    let mut rig = Rig::new().only_volume_channels(&["laser488"]);
    let plan = widefield(1, 0).with_trigger_mode(TriggerMode::Software);
    let report = rig.acquisition(plan).run().unwrap();

    assert_eq!(report.volume.shape(), [1, 1, 1, 1, ROWS, COLS]);
    assert!(rig.detector.bursts().is_empty());
    assert!(rig.trigger.events().is_empty());
    assert_eq!(
        rig.link.commands(),
        [
            "(param-set! 'laser4:level 0)\r",
            "(param-set! 'laser4:level 1)\r",
            "(param-set! 'laser2:cw #t)\r",
            "(param-set! 'laser2:cw #f)\r",
        ]
    );
}

#[test]
fn probe_silences_and_restores_active_laser() {
    let mut rig = Rig::new();
    rig.lasers.select("laser561").unwrap();
    rig.acquisition(widefield(1, 0)).run().unwrap();

    assert_eq!(
        rig.link.commands(),
        [
            "(param-set! 'laser3:level 0)\r",
            "(param-set! 'laser3:level 1)\r",
        ]
    );
    assert_eq!(rig.lasers.current().power(), 1.0);
}

#[test]
fn probe_failure_still_restores_power() {
    let mut rig = Rig::new();
    rig.detector = MockDetector::new(ROWS, COLS).fail_on_frame(0);
    let mut acquisition = rig.acquisition(widefield(3, 100));

    let err = acquisition.run().unwrap_err();
    assert!(matches!(err, DaqError::FrameAcquisition(_)));
    assert_eq!(acquisition.state(), AcquisitionState::Aborted);
    assert_eq!(
        rig.link.commands().last().map(String::as_str),
        Some("(param-set! 'laser4:level 1)\r")
    );
}

#[test]
fn single_slice_has_no_net_displacement() {
    for distance in [0, 750, 5000] {
        let mut rig = Rig::new();
        let report = rig.acquisition(widefield(1, distance)).run().unwrap();

        assert_eq!(report.volume.shape()[2], 1);
        assert_eq!(rig.stage.relative_moves()[0], 0);
        assert_eq!(rig.stage.position(), 12_345);
    }
}

#[test]
fn zero_distance_is_accepted() {
    let mut rig = Rig::new();
    let report = rig.acquisition(widefield(4, 0)).run().unwrap();

    assert_eq!(report.volume.shape()[2], 4);
    assert!(report.corrections.iter().all(|c| c.iterations == 0 && c.converged));
    assert_eq!(rig.stage.position(), 12_345);
}

#[test]
fn returns_to_origin_despite_drift() {
    let mut rig = Rig::new();
    rig.stage = MockStage::at(-400).with_offsets([37, -250, 120, 90, -15, 300]);
    rig.acquisition(widefield(6, 200)).run().unwrap();
    assert_eq!(rig.stage.position(), -400);
}

#[test]
fn correction_converges_in_one_move_within_a_run() {
    let mut rig = Rig::new().only_volume_channels(&["laser640"]);
    // Second relative move (the step down) lands 300 nm off target
    rig.stage = MockStage::at(0).with_offsets([0, 300]);
    let report = rig.acquisition(widefield(1, 0).with_correction(5, 100.0)).run().unwrap();

    assert_eq!(report.corrections[0].iterations, 1);
    assert!(report.corrections[0].converged);
    assert_eq!(report.corrections[0].residual_nm, 0);
    assert_eq!(rig.stage.relative_moves(), &[0, 0, -300]);
}

#[test]
fn exhausted_correction_does_not_abort() {
    let mut rig = Rig::new().only_volume_channels(&["laser640"]);
    rig.stage = MockStage::at(0).with_model(MoveModel::Stuck);
    let plan = widefield(2, 1000).with_correction(3, 100.0);
    let report = rig.acquisition(plan).run().unwrap();

    assert_eq!(report.state, AcquisitionState::Done);
    assert_eq!(report.unconverged_slices(), vec![0, 1]);
    assert!(report.corrections.iter().all(|c| c.iterations == 3));
    assert_eq!(report.corrections[0].residual_nm, -500);
    assert_eq!(report.corrections[1].residual_nm, 500);
    assert_eq!(rig.stage.position(), 0);
}

#[test]
fn sim_burst_is_demultiplexed() {
    let mut rig = Rig::new().only_volume_channels(&["laser640", "laser488"]);
    let plan = AcquisitionPlan::sim(2, 500, 3, 2).with_time_delay(Duration::ZERO);
    let report = rig.acquisition(plan).run().unwrap();

    assert_eq!(report.volume.shape(), [2, 3, 2, 2, ROWS, COLS]);
    assert_eq!(rig.detector.bursts(), &[12, 12]);

    let frames = rig.detector.frames();
    for z in 0..2 {
        for p in 0..2 {
            for a in 0..3 {
                for c in 0..2 {
                    let flat = 1 + z * 12 + frame_index(c, a, p, 2, 3);
                    assert_eq!(report.volume.frame(c, a, z, p), frames[flat]);
                }
            }
        }
    }
    // Counter pattern: idx(1,2,1) of slice 0 is burst frame 11, sequence number 12
    assert!(report.volume.frame(1, 2, 0, 1).iter().all(|&v| v == 12));
}

#[test]
fn sim_fires_program_and_macro_per_slice() {
    let mut rig = Rig::new().only_volume_channels(&["laser640", "laser488"]);
    let plan = AcquisitionPlan::sim(2, 500, 3, 3).with_time_delay(Duration::ZERO);
    rig.acquisition(plan).run().unwrap();

    let program = SequenceProgram::new(vec![200.0, 0.0, 200.0, 0.0]);
    assert_eq!(
        rig.trigger.events(),
        &[TriggerEvent::Program(program.clone()), TriggerEvent::Program(program)]
    );
    assert_eq!(
        rig.mirror.events(),
        &[
            MirrorEvent::Stop,
            MirrorEvent::Macro("MAIN".into()),
            MirrorEvent::Stop,
            MirrorEvent::Macro("MAIN".into()),
        ]
    );
    assert_eq!(rig.mirror.running_macro(), Some(&MirrorMacro::new("MAIN")));
}

#[test]
fn short_burst_aborts() {
    let mut rig = Rig::new();
    rig.detector = MockDetector::new(ROWS, COLS).dropping(1);
    let plan = AcquisitionPlan::sim(3, 100, 3, 3).with_time_delay(Duration::ZERO);
    let mut acquisition = rig.acquisition(plan);

    assert!(matches!(acquisition.run(), Err(DaqError::FrameAcquisition(_))));
    assert_eq!(acquisition.state(), AcquisitionState::Aborted);
    assert!(rig.stage.absolute_moves().is_empty());
}

#[test]
fn frame_timeout_aborts() {
    let mut rig = Rig::new();
    // Default exposures are 200 us
    rig.detector = MockDetector::new(ROWS, COLS).with_timeout(Duration::from_micros(100));
    let mut acquisition = rig.acquisition(widefield(2, 100));

    let err = acquisition.run().unwrap_err();
    assert!(matches!(err, DaqError::FrameAcquisition(_)));
    assert!(err.to_string().contains("timed out"));
    assert_eq!(acquisition.state(), AcquisitionState::Aborted);
    assert!(rig.detector.frames().is_empty());
}

#[test]
fn grab_failure_leaves_stage_in_place() {
    let mut rig = Rig::new();
    rig.stage = MockStage::at(0);
    // Third channel of the first slice
    rig.detector = MockDetector::new(ROWS, COLS).fail_on_frame(3);
    let result = rig.acquisition(widefield(5, 1000)).run();

    assert!(result.unwrap_err().is_fatal());
    assert!(rig.stage.absolute_moves().is_empty());
    assert_eq!(rig.stage.position(), 2000);
}

#[test]
fn stage_failure_aborts() {
    let mut rig = Rig::new();
    rig.stage = MockStage::at(0).fail_after(4);
    let mut acquisition = rig.acquisition(widefield(5, 1000));

    let err = acquisition.run().unwrap_err();
    assert!(matches!(err, DaqError::DeviceCommunication { .. }));
    assert_eq!(acquisition.state(), AcquisitionState::Aborted);
}

#[test]
fn invalid_plan_touches_no_hardware() {
    let mut rig = Rig::new();
    let err = rig.acquisition(widefield(0, 1000)).run().unwrap_err();
    assert!(matches!(err, DaqError::Range { parameter: "num_z_slices", .. }));

    let err = rig.acquisition(widefield(3, -5)).run().unwrap_err();
    assert!(matches!(err, DaqError::Range { .. }));

    assert_eq!(rig.stage.position_queries(), 0);
    assert!(rig.link.commands().is_empty());
    assert!(rig.detector.frames().is_empty());
}

#[test]
fn no_volume_channels_is_rejected() {
    let mut rig = Rig::new().only_volume_channels(&[]);
    let err = rig.acquisition(widefield(2, 100)).run().unwrap_err();
    assert!(matches!(err, DaqError::Configuration(_)));
    assert_eq!(rig.stage.position_queries(), 0);
}

#[test]
fn slice_interrupt_pulses_after_each_slice() {
    let mut rig = Rig::new().only_volume_channels(&["laser405"]);
    let line = DigitalLine::parse("P10").unwrap();
    let plan = widefield(3, 100)
        .with_trigger_mode(TriggerMode::Software)
        .with_slice_interrupt(line, Duration::from_micros(100_000));
    rig.acquisition(plan).run().unwrap();

    let interrupt = TriggerEvent::Pulse(line, Duration::from_millis(100));
    assert_eq!(rig.trigger.events(), &[interrupt.clone(), interrupt.clone(), interrupt]);
}

#[test]
fn acquire_volume_returns_tensor() {
    let mut rig = Rig::new();
    let volume = acquire_volume(
        widefield(2, 300),
        &mut rig.lasers,
        &mut rig.mirror,
        &mut rig.stage,
        &mut rig.detector,
        &mut rig.trigger,
    )
    .unwrap();

    assert_eq!(volume.shape(), [4, 1, 2, 1, ROWS, COLS]);
    assert_eq!(volume.max_intensity_projection().dim(), (4, ROWS, COLS));
}
