//! `dvrk-runtime` – runs the arm exercise.
//!
//! # Modules
//!
//! - [`sequencer`] – [`MotionSequencer`]: home, direct-joint sweep,
//!   goal-joint round trip and cartesian setup, strictly in that order, over
//!   one [`ArmSession`][dvrk_kernel::ArmSession].
//! - [`telemetry`] – [`init_tracing`]: global `tracing` subscriber with an
//!   optional OTLP span exporter.

pub mod sequencer;
pub mod telemetry;

pub use sequencer::{
    BaselinePolicy, DEFAULT_AMPLITUDE, DEFAULT_CARTESIAN_THRESHOLD, MotionSequencer,
    SequenceReport, SequencerConfig, Stage, sweep_sample, sweep_sample_count,
};
pub use telemetry::{TracerProviderGuard, init_tracing};
