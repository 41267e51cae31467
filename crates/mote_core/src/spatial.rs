//! The per-frame compute stream
//!
//! ```text
//! bin clear ─▶ bin fill ─▶ prefix sum x N ─▶ sort clear ─▶ sort ─▶ forces ─▶ advance
//!  (A = 0)     (A[b+1]++)   (A ⇄ B, ends A)   (cursor = 0)  (cur→scr) (scr→cur)  (cur)
//! ```
//!
//! Every stage is its own compute pass, so each one sees all writes of the
//! previous one. Forces read the sorted copy and write velocities back into
//! the current buffer, which advance then integrates in place; no buffer
//! swap is needed between frames.

use tracing::debug;

use crate::backend::{workgroup_count, ComputeBackend, UNIFORM_OFFSET_ALIGNMENT};
use crate::buffers::BufferStore;
use crate::context::GpuContext;
use crate::error::Result;
use crate::handle::BindGroupHandle;
use crate::pipelines::{PipelineCatalog, Stage};
use crate::records::BufferBinding;
use crate::shaders::WORKGROUP_SIZE;
use crate::state::SimulationState;
use crate::types::GpuOptions;

/// Bind groups over one [`BufferStore`]
struct BindGroups {
    /// Current particles (read only) and options
    binning: BindGroupHandle,
    /// Offsets `A` as counters
    bin_counts: BindGroupHandle,
    /// `A -> B` and `B -> A`
    prefix: [BindGroupHandle; 2],
    /// Current into scratch
    sort_pair: BindGroupHandle,
    sort_bins: BindGroupHandle,
    /// Scratch into current
    forces_pair: BindGroupHandle,
    force_tables: BindGroupHandle,
    /// Current particles (read write) and options
    particles: BindGroupHandle,
}

impl BindGroups {
    fn create<B: ComputeBackend>(
        ctx: &mut GpuContext<B>,
        catalog: &PipelineCatalog,
        buffers: &BufferStore,
    ) -> Result<Self> {
        let layouts = &catalog.layouts;
        let [offsets_a, offsets_b] = buffers.bin_offsets;
        let step = |binding| BufferBinding::range(binding, buffers.prefix_steps, 0, 4);

        Ok(Self {
            binning: ctx.create_bind_group(
                "binning",
                layouts.particles_read,
                &[
                    BufferBinding::whole(0, buffers.particles),
                    BufferBinding::whole(1, buffers.options),
                ],
            )?,
            bin_counts: ctx.create_bind_group(
                "bin_counts",
                layouts.counters,
                &[BufferBinding::whole(0, offsets_a)],
            )?,
            prefix: [
                ctx.create_bind_group(
                    "prefix_a_to_b",
                    layouts.prefix_step,
                    &[
                        BufferBinding::whole(0, offsets_a),
                        BufferBinding::whole(1, offsets_b),
                        step(2),
                    ],
                )?,
                ctx.create_bind_group(
                    "prefix_b_to_a",
                    layouts.prefix_step,
                    &[
                        BufferBinding::whole(0, offsets_b),
                        BufferBinding::whole(1, offsets_a),
                        step(2),
                    ],
                )?,
            ],
            sort_pair: ctx.create_bind_group(
                "sort_pair",
                layouts.particle_pair,
                &[
                    BufferBinding::whole(0, buffers.particles),
                    BufferBinding::whole(1, buffers.scratch),
                    BufferBinding::whole(2, buffers.options),
                ],
            )?,
            sort_bins: ctx.create_bind_group(
                "sort_bins",
                layouts.sort_bins,
                &[
                    BufferBinding::whole(0, offsets_a),
                    BufferBinding::whole(1, buffers.bin_cursor),
                ],
            )?,
            forces_pair: ctx.create_bind_group(
                "forces_pair",
                layouts.particle_pair,
                &[
                    BufferBinding::whole(0, buffers.scratch),
                    BufferBinding::whole(1, buffers.particles),
                    BufferBinding::whole(2, buffers.options),
                ],
            )?,
            force_tables: ctx.create_bind_group(
                "force_tables",
                layouts.force_tables,
                &[
                    BufferBinding::whole(0, offsets_a),
                    BufferBinding::whole(1, buffers.forces),
                ],
            )?,
            particles: ctx.create_bind_group(
                "particles",
                layouts.particles_rw,
                &[
                    BufferBinding::whole(0, buffers.particles),
                    BufferBinding::whole(1, buffers.options),
                ],
            )?,
        })
    }

    fn release<B: ComputeBackend>(self, ctx: &mut GpuContext<B>) {
        for group in [
            self.particles,
            self.force_tables,
            self.forces_pair,
            self.sort_bins,
            self.sort_pair,
            self.prefix[1],
            self.prefix[0],
            self.bin_counts,
            self.binning,
        ] {
            ctx.release(group);
        }
    }
}

/// Buffers plus bind groups for one simulation size
pub struct SpatialForcePipeline {
    buffers: BufferStore,
    groups: BindGroups,
}

impl SpatialForcePipeline {
    /// Create buffers and bind groups for `state`
    ///
    /// On failure everything created so far is released.
    pub fn new<B: ComputeBackend>(
        ctx: &mut GpuContext<B>,
        catalog: &PipelineCatalog,
        state: &SimulationState,
    ) -> Result<Self> {
        let mark = ctx.checkpoint();
        let result = BufferStore::create(ctx, state).and_then(|buffers| {
            let groups = BindGroups::create(ctx, catalog, &buffers)?;
            Ok(Self { buffers, groups })
        });
        if result.is_err() {
            ctx.rollback(mark);
        }
        result
    }

    pub fn buffers(&self) -> &BufferStore {
        &self.buffers
    }

    /// Upload species and forces of `state`
    pub fn upload_tables<B: ComputeBackend>(&self, ctx: &mut GpuContext<B>, state: &SimulationState) {
        self.buffers.upload_species(ctx, &state.system().species);
        self.buffers.upload_forces(ctx, &state.force_table());
    }

    /// Fill the particle buffer from `options.seed`
    pub fn generate<B: ComputeBackend>(
        &self,
        ctx: &mut GpuContext<B>,
        catalog: &PipelineCatalog,
        options: &GpuOptions,
    ) -> Result<()> {
        self.buffers.upload_options(ctx, options);
        let groups = &self.groups;
        let particle_groups = workgroup_count(options.particle_count, WORKGROUP_SIZE);
        ctx.submit_commands("generate", |rec| {
            rec.compute_pass("generate", |pass| {
                pass.set_pipeline(catalog.pipeline(Stage::Generate));
                pass.set_bind_group(0, groups.particles, &[]);
                pass.dispatch(particle_groups, 1, 1);
            });
        })
    }

    /// Record and submit one frame
    pub fn encode_frame<B: ComputeBackend>(
        &self,
        ctx: &mut GpuContext<B>,
        catalog: &PipelineCatalog,
        options: &GpuOptions,
    ) -> Result<()> {
        self.buffers.upload_options(ctx, options);

        let groups = &self.groups;
        let particle_groups = workgroup_count(options.particle_count, WORKGROUP_SIZE);
        let bin_groups = workgroup_count(self.buffers.bin_count() + 1, WORKGROUP_SIZE);
        let passes = self.buffers.prefix_passes();

        ctx.submit_commands("frame", |rec| {
            rec.compute_pass("bin_clear", |pass| {
                pass.set_pipeline(catalog.pipeline(Stage::BinClear));
                pass.set_bind_group(0, groups.binning, &[]);
                pass.set_bind_group(1, groups.bin_counts, &[]);
                pass.dispatch(bin_groups, 1, 1);
            });
            rec.compute_pass("bin_fill", |pass| {
                pass.set_pipeline(catalog.pipeline(Stage::BinFill));
                pass.set_bind_group(0, groups.binning, &[]);
                pass.set_bind_group(1, groups.bin_counts, &[]);
                pass.dispatch(particle_groups, 1, 1);
            });
            for step in 0..passes {
                rec.compute_pass("prefix_sum", |pass| {
                    pass.set_pipeline(catalog.pipeline(Stage::PrefixSumStep));
                    pass.set_bind_group(
                        0,
                        groups.prefix[(step % 2) as usize],
                        &[step * UNIFORM_OFFSET_ALIGNMENT],
                    );
                    pass.dispatch(bin_groups, 1, 1);
                });
            }
            rec.compute_pass("sort_clear", |pass| {
                pass.set_pipeline(catalog.pipeline(Stage::SortClear));
                pass.set_bind_group(0, groups.sort_pair, &[]);
                pass.set_bind_group(1, groups.sort_bins, &[]);
                pass.dispatch(bin_groups, 1, 1);
            });
            rec.compute_pass("sort", |pass| {
                pass.set_pipeline(catalog.pipeline(Stage::Sort));
                pass.set_bind_group(0, groups.sort_pair, &[]);
                pass.set_bind_group(1, groups.sort_bins, &[]);
                pass.dispatch(particle_groups, 1, 1);
            });
            rec.compute_pass("compute_forces", |pass| {
                pass.set_pipeline(catalog.pipeline(Stage::ComputeForces));
                pass.set_bind_group(0, groups.forces_pair, &[]);
                pass.set_bind_group(1, groups.force_tables, &[]);
                pass.dispatch(particle_groups, 1, 1);
            });
            rec.compute_pass("advance", |pass| {
                pass.set_pipeline(catalog.pipeline(Stage::Advance));
                pass.set_bind_group(0, groups.particles, &[]);
                pass.dispatch(particle_groups, 1, 1);
            });
        })?;

        debug!(
            "frame encoded: {} particles, {} prefix passes",
            options.particle_count, passes
        );
        Ok(())
    }

    pub fn release<B: ComputeBackend>(self, ctx: &mut GpuContext<B>) {
        self.groups.release(ctx);
        self.buffers.release(ctx);
    }
}
