//! Compiled kernels and their binding layouts
//!
//! The catalog does not depend on any size, so it outlives buffer
//! reinitialization.

use tracing::debug;

use crate::backend::ComputeBackend;
use crate::context::GpuContext;
use crate::error::Result;
use crate::handle::{BindGroupLayoutHandle, ComputePipelineHandle, PipelineLayoutHandle, ShaderModuleHandle};
use crate::records::LayoutEntry;
use crate::shaders::{self, ShaderModule};

/// One kernel of the frame stream or of particle generation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    BinClear,
    BinFill,
    PrefixSumStep,
    SortClear,
    Sort,
    ComputeForces,
    Advance,
    Generate,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::BinClear,
        Stage::BinFill,
        Stage::PrefixSumStep,
        Stage::SortClear,
        Stage::Sort,
        Stage::ComputeForces,
        Stage::Advance,
        Stage::Generate,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Stage::BinClear => "bin_clear",
            Stage::BinFill => "bin_fill",
            Stage::PrefixSumStep => "prefix_sum_step",
            Stage::SortClear => "sort_clear",
            Stage::Sort => "sort",
            Stage::ComputeForces => "compute_forces",
            Stage::Advance => "advance",
            Stage::Generate => "generate",
        }
    }

    pub fn module(self) -> ShaderModule {
        match self {
            Stage::BinClear | Stage::BinFill => ShaderModule::Binning,
            Stage::PrefixSumStep => ShaderModule::PrefixSum,
            Stage::SortClear | Stage::Sort => ShaderModule::Sort,
            Stage::ComputeForces => ShaderModule::Forces,
            Stage::Advance => ShaderModule::Advance,
            Stage::Generate => ShaderModule::Generate,
        }
    }

    pub fn entry_point(self) -> &'static str {
        match self {
            Stage::BinClear => shaders::CLEAR_BIN_SIZE,
            Stage::BinFill => shaders::FILL_BIN_SIZE,
            Stage::PrefixSumStep => shaders::PREFIX_SUM_STEP,
            Stage::SortClear => shaders::CLEAR_BIN_CURSOR,
            Stage::Sort => shaders::SORT_PARTICLES,
            Stage::ComputeForces => shaders::COMPUTE_FORCES,
            Stage::Advance => shaders::PARTICLE_ADVANCE,
            Stage::Generate => shaders::GENERATE_PARTICLES,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Bind group layouts, named by the bindings they carry
#[derive(Clone, Copy, Debug)]
pub struct BindLayouts {
    /// Particles (read only) and options
    pub particles_read: BindGroupLayoutHandle,
    /// One atomic counter array
    pub counters: BindGroupLayoutHandle,
    /// Scan source, scan destination, dynamic step size
    pub prefix_step: BindGroupLayoutHandle,
    /// Particles in (read only), particles out, options
    pub particle_pair: BindGroupLayoutHandle,
    /// Bin offsets (read only) and cursors
    pub sort_bins: BindGroupLayoutHandle,
    /// Bin offsets and force matrix, both read only
    pub force_tables: BindGroupLayoutHandle,
    /// Particles (read write) and options
    pub particles_rw: BindGroupLayoutHandle,
}

impl BindLayouts {
    fn create<B: ComputeBackend>(ctx: &mut GpuContext<B>) -> Result<Self> {
        Ok(Self {
            particles_read: ctx.create_bind_group_layout(
                "particles_read",
                &[LayoutEntry::read_only(0), LayoutEntry::uniform(1)],
            )?,
            counters: ctx.create_bind_group_layout("counters", &[LayoutEntry::storage(0)])?,
            prefix_step: ctx.create_bind_group_layout(
                "prefix_step",
                &[
                    LayoutEntry::read_only(0),
                    LayoutEntry::storage(1),
                    LayoutEntry::dynamic_uniform(2),
                ],
            )?,
            particle_pair: ctx.create_bind_group_layout(
                "particle_pair",
                &[
                    LayoutEntry::read_only(0),
                    LayoutEntry::storage(1),
                    LayoutEntry::uniform(2),
                ],
            )?,
            sort_bins: ctx.create_bind_group_layout(
                "sort_bins",
                &[LayoutEntry::read_only(0), LayoutEntry::storage(1)],
            )?,
            force_tables: ctx.create_bind_group_layout(
                "force_tables",
                &[LayoutEntry::read_only(0), LayoutEntry::read_only(1)],
            )?,
            particles_rw: ctx.create_bind_group_layout(
                "particles_rw",
                &[LayoutEntry::storage(0), LayoutEntry::uniform(1)],
            )?,
        })
    }

    /// Group layouts of a stage, in group order
    pub fn for_stage(&self, stage: Stage) -> Vec<BindGroupLayoutHandle> {
        match stage {
            Stage::BinClear | Stage::BinFill => vec![self.particles_read, self.counters],
            Stage::PrefixSumStep => vec![self.prefix_step],
            Stage::SortClear | Stage::Sort => vec![self.particle_pair, self.sort_bins],
            Stage::ComputeForces => vec![self.particle_pair, self.force_tables],
            Stage::Advance | Stage::Generate => vec![self.particles_rw],
        }
    }

    fn all(&self) -> [BindGroupLayoutHandle; 7] {
        [
            self.particles_read,
            self.counters,
            self.prefix_step,
            self.particle_pair,
            self.sort_bins,
            self.force_tables,
            self.particles_rw,
        ]
    }
}

/// Every kernel the simulation dispatches, compiled once
pub struct PipelineCatalog {
    pub layouts: BindLayouts,
    modules: Vec<ShaderModuleHandle>,
    pipeline_layouts: Vec<PipelineLayoutHandle>,
    pipelines: [ComputePipelineHandle; Stage::ALL.len()],
}

impl PipelineCatalog {
    /// Compile every module and create every pipeline
    ///
    /// On failure everything created so far is released.
    pub fn build<B: ComputeBackend>(ctx: &mut GpuContext<B>) -> Result<Self> {
        let mark = ctx.checkpoint();
        let result = Self::build_inner(ctx);
        if result.is_err() {
            ctx.rollback(mark);
        }
        result
    }

    fn build_inner<B: ComputeBackend>(ctx: &mut GpuContext<B>) -> Result<Self> {
        let layouts = BindLayouts::create(ctx)?;

        let mut modules = Vec::with_capacity(ShaderModule::ALL.len());
        for module in ShaderModule::ALL {
            modules.push(ctx.create_shader_module(module.label(), &module.source())?);
        }

        let mut pipeline_layouts = Vec::new();
        let mut pipelines = [ComputePipelineHandle::invalid(); Stage::ALL.len()];
        for stage in Stage::ALL {
            let pipeline_layout =
                ctx.create_pipeline_layout(stage.label(), &layouts.for_stage(stage))?;
            pipeline_layouts.push(pipeline_layout);

            let module_index = ShaderModule::ALL
                .iter()
                .position(|m| *m == stage.module())
                .unwrap_or_default();
            pipelines[stage.index()] = ctx.create_compute_pipeline(
                stage.label(),
                pipeline_layout,
                modules[module_index],
                stage.entry_point(),
            )?;
        }

        debug!(
            "pipeline catalog: {} modules, {} pipelines",
            modules.len(),
            pipelines.len()
        );
        Ok(Self {
            layouts,
            modules,
            pipeline_layouts,
            pipelines,
        })
    }

    pub fn pipeline(&self, stage: Stage) -> ComputePipelineHandle {
        self.pipelines[stage.index()]
    }

    pub fn release<B: ComputeBackend>(self, ctx: &mut GpuContext<B>) {
        for pipeline in self.pipelines {
            ctx.release(pipeline);
        }
        for layout in self.pipeline_layouts {
            ctx.release(layout);
        }
        for module in self.modules {
            ctx.release(module);
        }
        for layout in self.layouts.all() {
            ctx.release(layout);
        }
    }
}
