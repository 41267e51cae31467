//! Mote CLI
//!
//! Headless particle life runs, kernel inspection and pipeline self-checks.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mote_core::shaders::{entry_points, ShaderModule};
use mote_core::{
    ComputeBackend, FrameStats, ParticleStats, Simulation, SimulationConfig, SoftwareBackend,
};

mod config;

use config::ConfigArgs;

#[derive(Parser)]
#[command(name = "mote")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Mote particle life CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation headless and print a summary
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Compute backend
        #[arg(short, long, value_enum, default_value_t = BackendKind::default())]
        backend: BackendKind,

        /// Frames to simulate
        #[arg(short, long, default_value = "60")]
        frames: u32,

        /// Timestep per frame in seconds
        #[arg(long, default_value = "0.016")]
        dt: f32,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check the bin offsets and sort order of one frame against the host
    Scan {
        #[command(flatten)]
        config: ConfigArgs,

        /// Compute backend
        #[arg(short, long, value_enum, default_value_t = BackendKind::default())]
        backend: BackendKind,
    },

    /// Show kernels, backends and defaults
    Info,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// CPU emulation of the compute protocol
    #[default]
    Software,
    /// wgpu on the platform's primary GPU API
    #[cfg(feature = "gpu")]
    Gpu,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Run {
            config,
            backend,
            frames,
            dt,
            json,
        } => {
            let config = config.resolve()?;
            let report = match backend {
                BackendKind::Software => cmd_run(SoftwareBackend::new(), config, frames, dt)?,
                #[cfg(feature = "gpu")]
                BackendKind::Gpu => cmd_run(mote_gpu::WgpuBackend::new(), config, frames, dt)?,
            };
            print_report(&report, json)
        }

        Commands::Scan { config, backend } => {
            let config = config.resolve()?;
            match backend {
                BackendKind::Software => cmd_scan(SoftwareBackend::new(), config),
                #[cfg(feature = "gpu")]
                BackendKind::Gpu => cmd_scan(mote_gpu::WgpuBackend::new(), config),
            }
        }

        Commands::Info => cmd_info(),
    }
}

// =============================================================================
// run
// =============================================================================

#[derive(Serialize)]
struct RunReport {
    backend: String,
    frames: FrameStats,
    particles: ParticleStats,
    elapsed_ms: f64,
    ms_per_frame: f64,
}

fn cmd_run<B: ComputeBackend>(
    backend: B,
    config: SimulationConfig,
    frames: u32,
    dt: f32,
) -> Result<RunReport> {
    let species = config.species_count;
    let mut sim = Simulation::initialize(backend, config).context("Failed to initialize")?;
    let backend_name = sim.backend().name().to_string();

    info!("Running {} frames on {}", frames, backend_name);
    let start = Instant::now();
    for frame in 0..frames {
        sim.step_frame(dt)
            .with_context(|| format!("Frame {} failed", frame))?;
    }
    let particles = sim.read_particles().context("Failed to read particles")?;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let report = RunReport {
        backend: backend_name,
        frames: sim.stats(),
        particles: ParticleStats::from_particles(&particles, species),
        elapsed_ms,
        ms_per_frame: elapsed_ms / f64::from(frames.max(1)),
    };
    sim.teardown();
    Ok(report)
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let frames = &report.frames;
    let particles = &report.particles;
    println!("Backend:    {}", report.backend);
    println!(
        "Frames:     {} ({:.2} ms/frame, last dt {:.4})",
        frames.frame, report.ms_per_frame, frames.last_dt
    );
    println!(
        "Grid:       {}x{} bins, {} prefix passes",
        frames.grid_width, frames.grid_height, frames.prefix_passes
    );
    println!(
        "Particles:  {} in [{:.1}, {:.1}] x [{:.1}, {:.1}]",
        particles.count,
        particles.bounds[0],
        particles.bounds[2],
        particles.bounds[1],
        particles.bounds[3]
    );
    println!(
        "Speed:      mean {:.3}, max {:.3}",
        particles.mean_speed, particles.max_speed
    );
    println!("Species:    {:?}", particles.species_counts);
    if particles.non_finite > 0 {
        println!("Non-finite: {}", particles.non_finite);
    }
    Ok(())
}

// =============================================================================
// scan
// =============================================================================

fn cmd_scan<B: ComputeBackend>(backend: B, config: SimulationConfig) -> Result<()> {
    let mut sim = Simulation::initialize(backend, config).context("Failed to initialize")?;
    let before = sim.read_particles()?;

    // dt = 0 bins, scans and sorts without moving anything
    sim.step_frame(0.0).context("Frame failed")?;
    let offsets = sim.read_bin_offsets()?;
    let after = sim.read_particles()?;

    let grid = *sim.state().grid();
    let mut counts = vec![0u32; grid.bin_count() as usize];
    for p in &before {
        counts[grid.bin_index(p.x, p.y) as usize] += 1;
    }

    let mut expected = Vec::with_capacity(counts.len() + 1);
    let mut running = 0u32;
    expected.push(0);
    for count in &counts {
        running += count;
        expected.push(running);
    }
    anyhow::ensure!(
        offsets == expected,
        "Bin offsets differ from the host prefix sum"
    );

    for (bin, range) in offsets.windows(2).enumerate() {
        for p in &after[range[0] as usize..range[1] as usize] {
            anyhow::ensure!(
                grid.bin_index(p.x, p.y) as usize == bin,
                "Particle at ({}, {}) sorted into bin {}",
                p.x,
                p.y,
                bin
            );
        }
    }

    println!(
        "OK: {} particles in {} bins ({} prefix passes) on {}",
        after.len(),
        counts.len(),
        sim.stats().prefix_passes,
        sim.backend().name()
    );
    sim.teardown();
    Ok(())
}

// =============================================================================
// info
// =============================================================================

fn cmd_info() -> Result<()> {
    println!("Mote");
    println!("====");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Backends:");
    println!("  - software (CPU emulation)");
    #[cfg(feature = "gpu")]
    println!("  - gpu (wgpu, {:?})", mote_gpu::preferred_backends());
    println!();
    println!("Kernels:");
    for module in ShaderModule::ALL {
        let names: Vec<String> = entry_points(&module.source())
            .into_iter()
            .map(|(name, size)| format!("{}@{}", name, size))
            .collect();
        println!("  - {:<11} {}", module.label(), names.join(", "));
    }
    println!();
    println!("Default configuration:");
    print!("{}", toml::to_string_pretty(&SimulationConfig::default())?);
    Ok(())
}
