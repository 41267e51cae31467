//! Mote GPU
//!
//! The compute protocol of `mote_core` implemented over wgpu, so the same
//! frame stream that runs on the software backend runs on Vulkan, Metal or
//! DX12.
//!
//! ```no_run
//! use mote_core::{Simulation, SimulationConfig};
//! use mote_gpu::WgpuBackend;
//!
//! let mut sim = Simulation::initialize(WgpuBackend::new(), SimulationConfig::default())?;
//! sim.step_frame(0.016)?;
//! # Ok::<(), mote_core::MoteError>(())
//! ```

mod backend;
mod convert;
mod device;

pub use backend::WgpuBackend;
pub use device::{preferred_backends, DeviceError, DeviceOptions};
