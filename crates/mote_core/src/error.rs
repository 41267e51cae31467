//! Error types for mote_core

use thiserror::Error;

/// Errors surfaced by the simulation to its caller
#[derive(Error, Debug)]
pub enum MoteError {
    /// A backend `create*` call returned the invalid sentinel, or the parent
    /// handle was already invalid
    #[error("failed to create {kind} '{label}'")]
    ResourceCreation {
        /// Resource category
        kind: &'static str,
        /// Debug label of the resource
        label: String,
    },

    /// Rejected configuration or parameter value
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// No adapter or device could be acquired
    #[error("compute backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend reported failed dispatches while executing a frame
    #[error("frame {frame} reported {faults} failed dispatch(es)")]
    FrameFault {
        /// Index of the failing frame
        frame: u64,
        /// Number of failed dispatches
        faults: u32,
    },

    /// Stepping was attempted after a frame fault
    #[error("simulation halted after a frame fault; regenerate or reconfigure to resume")]
    Halted,

    /// Reading a buffer back to the host failed
    #[error("buffer readback failed: {0}")]
    Readback(String),
}

/// Configuration values that are rejected rather than clamped
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("species count {count} outside 1..={max}")]
    SpeciesCount { count: usize, max: usize },

    #[error("particle count {count} outside 1..={max}")]
    ParticleCount { count: u32, max: u32 },

    #[error("world dimensions {width}x{height} must be positive and finite")]
    WorldSize { width: f32, height: f32 },

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("parameter '{name}' rejects value {value}")]
    ParameterValue { name: &'static str, value: f32 },

    #[error("force matrix covers {actual} species, simulation has {expected}")]
    ForceMatrixShape { expected: usize, actual: usize },

    #[error("interaction radius {radius} outside (0, {max}]")]
    ForceRadius { radius: f32, max: f32 },

    #[error("expected {expected} particles, got {actual}")]
    ParticleUpload { expected: usize, actual: usize },
}

/// Failures raised while the software backend executes a kernel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("no buffer bound at group {group} binding {binding}")]
    MissingBinding { group: u32, binding: u32 },

    #[error("binding {group}:{binding} cannot be viewed as {type_name}")]
    Layout {
        group: u32,
        binding: u32,
        type_name: &'static str,
    },

    #[error("binding {group}:{binding} is already borrowed by this dispatch")]
    Aliased { group: u32, binding: u32 },

    #[error("scatter index {index} outside destination of length {len}")]
    ScatterOutOfRange { index: u32, len: usize },
}

/// Result type for mote_core operations
pub type Result<T> = std::result::Result<T, MoteError>;
