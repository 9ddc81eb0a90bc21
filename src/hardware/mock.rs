//! Mock Hardware Implementations
//!
//! Provides simulated hardware devices for testing without physical hardware.
//! Every mock records what it was asked to do so tests can assert on the exact
//! command sequence afterwards.
//!
//! # Available Mocks
//!
//! - `MockStage` - Simulated objective stage with a configurable move error model
//! - `MockDetector` - Simulated camera with software grabs and hardware bursts
//! - `MockMirror` - Simulated pattern mirror
//! - `MockTriggerSequencer` - Simulated digital-output card / trigger generator
//! - `MockLaserLink` - Shared command log standing in for the laser serial port
//!
//! # Performance Characteristics
//!
//! All mocks complete instantly unless a settle delay is configured.

use crate::config::DetectorConfig;
use crate::error::{DaqError, DaqResult};
use crate::hardware::capabilities::{
    BurstTrigger, Detector, MirrorController, ObjectiveStage, TriggerSequencer,
};
use crate::hardware::detector::{Frame, MountOrientation};
use crate::hardware::laser::LaserLink;
use crate::hardware::mirror::{MirrorMacro, MirrorPosition};
use crate::hardware::trigger::{DigitalLine, SequenceProgram};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::thread::sleep;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// MockStage - Simulated Objective Stage
// =============================================================================

/// How the simulated stage responds to relative moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveModel {
    /// Moves land exactly where commanded
    Exact,
    /// Each relative move lands off by the next queued offset; once the queue is
    /// empty moves are exact
    Offsets(VecDeque<i64>),
    /// Relative moves have no effect (absolute moves still work)
    Stuck,
}

/// Mock objective stage
///
/// Simulates a positioner with:
/// - Integer nanometer positions
/// - Optional settle delay before each position query
/// - A [`MoveModel`] for drift between commanded and reached positions
/// - Optional failure injection after a number of operations
///
/// # Example
///
/// ```rust,ignore
/// let mut stage = MockStage::new().with_offsets([300]);
/// stage.move_relative(-1000)?;
/// assert_eq!(stage.current_position()?, -700);
/// ```
#[derive(Debug, Clone)]
pub struct MockStage {
    position: i64,
    settle: Duration,
    model: MoveModel,
    relative_moves: Vec<i64>,
    absolute_moves: Vec<i64>,
    position_queries: usize,
    operations: usize,
    fail_after: Option<usize>,
}

impl MockStage {
    /// Create new mock stage at position 0 nm
    pub fn new() -> Self {
        Self::at(0)
    }

    /// Create a mock stage at the given position
    pub fn at(position: i64) -> Self {
        Self {
            position,
            settle: Duration::ZERO,
            model: MoveModel::Exact,
            relative_moves: Vec::new(),
            absolute_moves: Vec::new(),
            position_queries: 0,
            operations: 0,
            fail_after: None,
        }
    }

    /// Sleep for `settle` before every position query
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Use a specific move model
    pub fn with_model(mut self, model: MoveModel) -> Self {
        self.model = model;
        self
    }

    /// Queue per-move landing errors, in nm
    pub fn with_offsets(self, offsets: impl IntoIterator<Item = i64>) -> Self {
        self.with_model(MoveModel::Offsets(offsets.into_iter().collect()))
    }

    /// Fail every operation after the first `operations` succeed
    pub fn fail_after(mut self, operations: usize) -> Self {
        self.fail_after = Some(operations);
        self
    }

    /// Position without settle delay or bookkeeping
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Every relative move commanded so far
    pub fn relative_moves(&self) -> &[i64] {
        &self.relative_moves
    }

    /// Every absolute move commanded so far
    pub fn absolute_moves(&self) -> &[i64] {
        &self.absolute_moves
    }

    /// Number of position queries answered
    pub fn position_queries(&self) -> usize {
        self.position_queries
    }

    fn check_link(&mut self) -> DaqResult<()> {
        self.operations += 1;
        match self.fail_after {
            Some(limit) if self.operations > limit => Err(DaqError::device(
                "objective stage",
                format!("simulated link failure on operation {}", self.operations),
            )),
            _ => Ok(()),
        }
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectiveStage for MockStage {
    fn current_position(&mut self) -> DaqResult<i64> {
        self.check_link()?;
        sleep(self.settle);
        self.position_queries += 1;
        Ok(self.position)
    }

    fn move_relative(&mut self, delta_nm: i64) -> DaqResult<()> {
        self.check_link()?;
        self.relative_moves.push(delta_nm);
        let landed = match &mut self.model {
            MoveModel::Exact => delta_nm,
            MoveModel::Offsets(offsets) => delta_nm + offsets.pop_front().unwrap_or(0),
            MoveModel::Stuck => 0,
        };
        self.position += landed;
        debug!("MockStage: relative {} nm -> {} nm", delta_nm, self.position);
        Ok(())
    }

    fn move_absolute(&mut self, position_nm: i64) -> DaqResult<()> {
        self.check_link()?;
        self.absolute_moves.push(position_nm);
        self.position = position_nm;
        debug!("MockStage: absolute -> {} nm", self.position);
        Ok(())
    }
}

// =============================================================================
// MockDetector - Simulated Camera
// =============================================================================

/// Pixel content produced by [`MockDetector`].
#[derive(Debug, Clone)]
pub enum FramePattern {
    /// Every frame is filled with its sequence number (wrapping at 256)
    Counter,
    /// Uniform noise from a seeded generator
    Noise(StdRng),
}

/// Mock camera
///
/// Simulates a camera with:
/// - Configurable resolution and mount orientation
/// - Software grabs and hardware-triggered bursts with a bounded buffer
/// - Dropped-frame and grab-failure injection
/// - A per-frame retrieve timeout: a frame cannot arrive before its exposure
///   ends, so an exposure longer than the timeout fails the grab
/// - A log of every frame returned, in order
#[derive(Debug, Clone)]
pub struct MockDetector {
    rows: usize,
    cols: usize,
    orientation: MountOrientation,
    pattern: FramePattern,
    max_buffer: usize,
    exposure_us: f64,
    timeout: Option<Duration>,
    exposures: Vec<f64>,
    frames: Vec<Frame>,
    bursts: Vec<usize>,
    sequence: u64,
    drop_frames: usize,
    fail_on_grab: Option<u64>,
}

impl MockDetector {
    /// Create new mock detector with the given frame shape
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            orientation: MountOrientation::default(),
            pattern: FramePattern::Counter,
            max_buffer: 256,
            exposure_us: 0.0,
            timeout: None,
            exposures: Vec::new(),
            frames: Vec::new(),
            bursts: Vec::new(),
            sequence: 0,
            drop_frames: 0,
            fail_on_grab: None,
        }
    }

    /// Create from the `[detector]` configuration section, with noise frames
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(config.height, config.width)
            .with_orientation(MountOrientation {
                flip_rows: config.flip_rows,
                flip_cols: config.flip_cols,
            })
            .with_buffer(config.max_num_buffer)
            .with_timeout(Duration::from_millis(config.timeout_ms))
            .with_pattern(FramePattern::Noise(StdRng::seed_from_u64(0x5eed)))
    }

    /// Apply a mount orientation to generated frames
    pub fn with_orientation(mut self, orientation: MountOrientation) -> Self {
        self.orientation = orientation;
        self
    }

    /// Use a specific pixel pattern
    pub fn with_pattern(mut self, pattern: FramePattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Limit the number of frames one burst may hold
    pub fn with_buffer(mut self, max_buffer: usize) -> Self {
        self.max_buffer = max_buffer;
        self
    }

    /// Fail any frame whose exposure outlasts `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Deliver this many frames fewer than requested in every burst
    pub fn dropping(mut self, frames: usize) -> Self {
        self.drop_frames = frames;
        self
    }

    /// Fail the grab that would produce frame number `sequence` (0-based)
    pub fn fail_on_frame(mut self, sequence: u64) -> Self {
        self.fail_on_grab = Some(sequence);
        self
    }

    /// Every frame returned so far, in order
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Exposure in effect for each returned frame
    pub fn exposures(&self) -> &[f64] {
        &self.exposures
    }

    /// Requested length of every burst so far
    pub fn bursts(&self) -> &[usize] {
        &self.bursts
    }

    fn next_frame(&mut self) -> DaqResult<Frame> {
        if self.fail_on_grab == Some(self.sequence) {
            return Err(DaqError::FrameAcquisition(format!(
                "simulated grab failure on frame {}",
                self.sequence
            )));
        }
        if let Some(timeout) = self.timeout {
            if self.exposure_us > timeout.as_secs_f64() * 1e6 {
                return Err(DaqError::FrameAcquisition(format!(
                    "frame {} timed out after {} ms ({} us exposure)",
                    self.sequence,
                    timeout.as_millis(),
                    self.exposure_us
                )));
            }
        }

        let raw = match &mut self.pattern {
            FramePattern::Counter => {
                Frame::from_elem((self.rows, self.cols), (self.sequence % 256) as u8)
            }
            FramePattern::Noise(rng) => {
                Frame::from_shape_fn((self.rows, self.cols), |_| rng.gen::<u8>())
            }
        };
        self.sequence += 1;

        let frame = self.orientation.apply(raw);
        self.frames.push(frame.clone());
        self.exposures.push(self.exposure_us);
        Ok(frame)
    }
}

impl Default for MockDetector {
    fn default() -> Self {
        Self::new(1200, 1920)
    }
}

impl Detector for MockDetector {
    fn frame_shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn set_exposure(&mut self, exposure_us: f64) -> DaqResult<()> {
        self.exposure_us = exposure_us;
        Ok(())
    }

    fn grab(&mut self) -> DaqResult<Frame> {
        self.next_frame()
    }

    fn grab_burst(
        &mut self,
        expected: usize,
        trigger: &mut BurstTrigger<'_>,
    ) -> DaqResult<Vec<Frame>> {
        if expected > self.max_buffer {
            return Err(DaqError::FrameAcquisition(format!(
                "burst of {} frames exceeds buffer depth {}",
                expected, self.max_buffer
            )));
        }
        self.bursts.push(expected);
        debug!("MockDetector: armed for {} frames", expected);

        trigger()?;

        let delivered = expected.saturating_sub(self.drop_frames);
        let frames = (0..delivered)
            .map(|_| self.next_frame())
            .collect::<DaqResult<Vec<_>>>()?;

        if frames.len() != expected {
            return Err(DaqError::FrameAcquisition(format!(
                "burst delivered {} of {} frames",
                frames.len(),
                expected
            )));
        }
        Ok(frames)
    }
}

// =============================================================================
// MockMirror - Simulated Pattern Mirror
// =============================================================================

/// One command received by [`MockMirror`].
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorEvent {
    /// `stop_all`
    Stop,
    /// Axes commanded to a named position
    MoveTo(String),
    /// Macro started
    Macro(String),
}

/// Mock pattern mirror that records its commands.
#[derive(Debug, Clone, Default)]
pub struct MockMirror {
    events: Vec<MirrorEvent>,
    running: Option<MirrorMacro>,
    confirmation: Option<MirrorMacro>,
}

impl MockMirror {
    /// Create a mirror with no confirmation macro
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `confirmation` after every `move_to`
    pub fn with_confirmation(mut self, confirmation: MirrorMacro) -> Self {
        self.confirmation = Some(confirmation);
        self
    }

    /// Commands received so far
    pub fn events(&self) -> &[MirrorEvent] {
        &self.events
    }

    /// Macro currently running, if any
    pub fn running_macro(&self) -> Option<&MirrorMacro> {
        self.running.as_ref()
    }
}

impl MirrorController for MockMirror {
    fn move_to(&mut self, position: &MirrorPosition) -> DaqResult<()> {
        self.stop_all();
        self.events.push(MirrorEvent::MoveTo(position.name().to_string()));
        if let Some(confirmation) = self.confirmation.clone() {
            self.start_macro(&confirmation)?;
        }
        Ok(())
    }

    fn start_macro(&mut self, name: &MirrorMacro) -> DaqResult<()> {
        self.events.push(MirrorEvent::Macro(name.to_string()));
        self.running = Some(name.clone());
        Ok(())
    }

    fn stop_all(&mut self) {
        self.events.push(MirrorEvent::Stop);
        self.running = None;
    }
}

// =============================================================================
// MockTriggerSequencer - Simulated Digital Outputs
// =============================================================================

/// One operation performed by [`MockTriggerSequencer`].
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerEvent {
    /// Single-line pulse
    Pulse(DigitalLine, Duration),
    /// Simultaneous pulse on several lines
    MultiPulse(Vec<DigitalLine>, Duration),
    /// Persistent level change
    Level(DigitalLine, bool),
    /// Burst program loaded into the generator
    Program(SequenceProgram),
}

/// Mock digital-output card that records operations without sleeping.
///
/// Alongside the typed events it keeps the wire form each operation would put on
/// the hardware: physical channel paths on `Dev1` for line operations and the
/// encoded program for the generator.
#[derive(Debug, Clone, Default)]
pub struct MockTriggerSequencer {
    events: Vec<TriggerEvent>,
    wire: Vec<String>,
    levels: HashMap<DigitalLine, bool>,
    unavailable: bool,
}

impl MockTriggerSequencer {
    /// Device name used for physical channel paths
    pub const DEVICE: &'static str = "Dev1";

    /// Create a sequencer with all lines low
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a card that cannot be opened
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Operations performed so far
    pub fn events(&self) -> &[TriggerEvent] {
        &self.events
    }

    /// Wire form of every operation so far
    pub fn wire(&self) -> &[String] {
        &self.wire
    }

    /// Current level of a line
    pub fn level(&self, line: &DigitalLine) -> bool {
        self.levels.get(line).copied().unwrap_or(false)
    }

    fn open(&self) -> DaqResult<()> {
        if self.unavailable {
            return Err(DaqError::device(
                "trigger sequencer",
                "could not connect to digital output device",
            ));
        }
        Ok(())
    }
}

impl TriggerSequencer for MockTriggerSequencer {
    fn pulse(&mut self, line: &DigitalLine, duration: Duration) -> DaqResult<()> {
        self.open()?;
        self.events.push(TriggerEvent::Pulse(*line, duration));
        self.wire.push(line.channel_path(Self::DEVICE));
        self.levels.insert(*line, false);
        Ok(())
    }

    fn multi_pulse(&mut self, lines: &[DigitalLine], duration: Duration) -> DaqResult<()> {
        self.open()?;
        self.events.push(TriggerEvent::MultiPulse(lines.to_vec(), duration));
        let paths: Vec<String> = lines.iter().map(|l| l.channel_path(Self::DEVICE)).collect();
        self.wire.push(paths.join(","));
        for line in lines {
            self.levels.insert(*line, false);
        }
        Ok(())
    }

    fn set_level(&mut self, line: &DigitalLine, on: bool) -> DaqResult<()> {
        self.open()?;
        self.events.push(TriggerEvent::Level(*line, on));
        self.wire.push(format!("{}={}", line.channel_path(Self::DEVICE), u8::from(on)));
        self.levels.insert(*line, on);
        Ok(())
    }

    fn load_program(&mut self, program: &SequenceProgram) -> DaqResult<()> {
        self.open()?;
        self.events.push(TriggerEvent::Program(program.clone()));
        self.wire.push(program.encode());
        Ok(())
    }
}

// =============================================================================
// MockLaserLink - Shared Command Log
// =============================================================================

/// Laser link that logs commands; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MockLaserLink {
    commands: Rc<RefCell<Vec<String>>>,
}

impl MockLaserLink {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands sent so far
    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl LaserLink for MockLaserLink {
    fn send(&mut self, command: &str) -> DaqResult<()> {
        self.commands.borrow_mut().push(command.to_string());
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
