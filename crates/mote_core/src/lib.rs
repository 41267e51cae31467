//! Mote Core
//!
//! Multi-species particle life on a compute backend that the simulation only
//! ever sees through opaque handles.
//!
//! # Architecture
//!
//! ```text
//! Simulation (frame driver)
//!        │
//!        ├── SimulationState      species, force matrix, scalar parameters
//!        │
//!        └── SpatialForcePipeline one ordered command stream per frame
//!              ├── BufferStore        particles, bins, options, tables
//!              └── PipelineCatalog    compiled kernels + binding layouts
//!                     │
//!                     ▼
//!              GpuContext ── ComputeBackend (software emulator or wgpu)
//! ```
//!
//! Each frame runs bin-clear, bin-fill, a Hillis-Steele prefix sum, a
//! counting sort, force accumulation over the 3x3 bin neighborhood and
//! finally integration.
//!
//! # Example
//!
//! ```
//! use mote_core::{Simulation, SimulationConfig, SoftwareBackend};
//!
//! let config = SimulationConfig {
//!     particle_count: 256,
//!     species_count: 3,
//!     ..Default::default()
//! };
//! let mut sim = Simulation::initialize(SoftwareBackend::new(), config).unwrap();
//! sim.step_frame(0.016).unwrap();
//! assert_eq!(sim.read_particles().unwrap().len(), 256);
//! ```

pub mod backend;
pub mod buffers;
pub mod config;
pub mod context;
pub mod error;
pub mod generation;
pub mod grid;
pub mod handle;
pub mod kernels;
pub mod pipelines;
pub mod records;
pub mod registry;
pub mod rng;
pub mod shaders;
pub mod simulation;
pub mod software;
pub mod spatial;
pub mod state;
pub mod stats;
pub mod types;

pub use backend::{BufferDescriptor, BufferUsages, ComputeBackend};
pub use config::{Parameter, SimulationConfig};
pub use context::GpuContext;
pub use error::{ConfigError, KernelError, MoteError, Result};
pub use generation::{ForceMatrix, SpeciesTable, SystemDescription};
pub use grid::GridLayout;
pub use handle::{Handle, HandleKind, RawHandle, HANDLE_INVALID};
pub use registry::ResourceRegistry;
pub use simulation::{FrameStats, Simulation};
pub use software::SoftwareBackend;
pub use state::{Action, SimulationState};
pub use stats::ParticleStats;
pub use types::{ForceEntry, GpuOptions, Particle, Species};
