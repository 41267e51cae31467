//! Native counterparts of the WGSL kernels
//!
//! The software backend binds each WGSL entry point to one of these. They
//! read the same bindings at the same `(group, binding)` slots and follow
//! the shader arithmetic step for step. Atomics become plain increments
//! because invocations run one after another.

use crate::error::KernelError;
use crate::grid::neighbor_cells;
use crate::rng::{pcg_hash, unit_float};
use crate::shaders;
use crate::software::Bindings;
use crate::types::{ForceEntry, GpuOptions, Particle};

/// Signature of a native kernel: bindings plus the total invocation count
pub type KernelFn = fn(&Bindings<'_>, u32) -> Result<(), KernelError>;

/// Native kernel for a WGSL entry point
pub fn lookup(entry_point: &str) -> Option<KernelFn> {
    let kernel: KernelFn = match entry_point {
        shaders::CLEAR_BIN_SIZE => clear_bin_size,
        shaders::FILL_BIN_SIZE => fill_bin_size,
        shaders::PREFIX_SUM_STEP => prefix_sum_step,
        shaders::CLEAR_BIN_CURSOR => clear_bin_cursor,
        shaders::SORT_PARTICLES => sort_particles,
        shaders::COMPUTE_FORCES => compute_forces,
        shaders::PARTICLE_ADVANCE => particle_advance,
        shaders::GENERATE_PARTICLES => generate_particles,
        _ => return None,
    };
    Some(kernel)
}

// === Shared arithmetic ===

/// Bin column and row, clamped into the grid
pub fn bin_coords(options: &GpuOptions, x: f32, y: f32) -> (u32, u32) {
    let gx = ((x - options.left) / options.bin_size_x).floor() as i32;
    let gy = ((y - options.bottom) / options.bin_size_y).floor() as i32;
    (
        gx.clamp(0, options.grid_width as i32 - 1) as u32,
        gy.clamp(0, options.grid_height as i32 - 1) as u32,
    )
}

pub fn bin_index(options: &GpuOptions, particle: &Particle) -> u32 {
    let (bx, by) = bin_coords(options, particle.x, particle.y);
    by * options.grid_width + bx
}

/// Shortest displacement along one axis when borders wrap
pub fn minimum_image(options: &GpuOptions, delta: f32, extent: f32) -> f32 {
    if !options.wraps() {
        delta
    } else if delta >= 0.5 * extent {
        delta - extent
    } else if delta <= -0.5 * extent {
        delta + extent
    } else {
        delta
    }
}

/// One Hillis-Steele step over `dst.len()` elements
pub fn scan_step(src: &[u32], dst: &mut [u32], step: u32) {
    let step = step as usize;
    for (idx, out) in dst.iter_mut().enumerate() {
        *out = match src.get(idx) {
            Some(&value) if idx < step => value,
            Some(&value) => src[idx - step].wrapping_add(value),
            None => 0,
        };
    }
}

/// Net force on `sorted[index]` from every partner in the neighborhood
pub fn accumulate_force(
    options: &GpuOptions,
    sorted: &[Particle],
    offsets: &[u32],
    forces: &[ForceEntry],
    index: usize,
) -> (f32, f32) {
    let particle = sorted[index];
    let species_count = options.species_count;
    let species = particle.species_index(species_count);
    let width = options.width();
    let height = options.height();

    let (cx, cy) = bin_coords(options, particle.x, particle.y);
    let columns = neighbor_cells(cx, options.grid_width, options.wraps());
    let rows = neighbor_cells(cy, options.grid_height, options.wraps());

    let (mut fx, mut fy) = (0.0f32, 0.0f32);
    for &row in &rows {
        for &column in &columns {
            let bin = (row * options.grid_width + column) as usize;
            let (start, end) = match (offsets.get(bin), offsets.get(bin + 1)) {
                (Some(&start), Some(&end)) => (start as usize, end as usize),
                _ => continue,
            };
            for j in start..end.min(sorted.len()) {
                if j == index {
                    continue;
                }
                let other = &sorted[j];
                let pair = (species * species_count + other.species_index(species_count)) as usize;
                let Some(entry) = forces.get(pair) else {
                    continue;
                };
                let dx = minimum_image(options, other.x - particle.x, width);
                let dy = minimum_image(options, other.y - particle.y, height);
                let d = (dx * dx + dy * dy).sqrt();
                if d <= 0.0 || d >= entry.radius {
                    continue;
                }
                let magnitude = entry.magnitude_at(d);
                fx += magnitude * (dx / d);
                fy += magnitude * (dy / d);
            }
        }
    }

    fx -= options.central_force * particle.x;
    fy -= options.central_force * particle.y;
    (fx, fy)
}

/// Action kick, friction, integration and border handling for one particle
pub fn advance(options: &GpuOptions, p: &mut Particle) {
    let width = options.width();
    let height = options.height();

    if options.action_force != 0.0 && options.action_radius > 0.0 {
        let dx = minimum_image(options, p.x - options.action_x, width);
        let dy = minimum_image(options, p.y - options.action_y, height);
        let falloff = (-(dx * dx + dy * dy) / (options.action_radius * options.action_radius)).exp();
        let kick = options.action_force * falloff * options.dt;
        p.vx += options.action_vx * kick;
        p.vy += options.action_vy * kick;
    }

    p.vx *= options.friction;
    p.vy *= options.friction;
    p.x += p.vx * options.dt;
    p.y += p.vy * options.dt;

    if options.wraps() {
        p.x = wrap_axis(p.x, options.left, options.right, width);
        p.y = wrap_axis(p.y, options.bottom, options.top, height);
    } else {
        reflect_axis(&mut p.x, &mut p.vx, options.left, options.right);
        reflect_axis(&mut p.y, &mut p.vy, options.bottom, options.top);
    }
}

fn wrap_axis(value: f32, min: f32, max: f32, extent: f32) -> f32 {
    if (min..=max).contains(&value) {
        return value;
    }
    // Rounding can land exactly on `max` for tiny negative offsets
    (min + (value - min).rem_euclid(extent)).clamp(min, max)
}

fn reflect_axis(value: &mut f32, velocity: &mut f32, min: f32, max: f32) {
    if *value < min {
        *value = min;
        *velocity = -*velocity;
    } else if *value > max {
        *value = max;
        *velocity = -*velocity;
    }
}

/// Particle `index` of the system seeded by `options.seed`
pub fn generate(options: &GpuOptions, index: u32) -> Particle {
    let mut state = pcg_hash(index ^ pcg_hash(options.seed));
    let u = unit_float(state);
    state = pcg_hash(state);
    let v = unit_float(state);
    state = pcg_hash(state);
    let s = unit_float(state);

    let species_count = options.species_count.max(1);
    let species = ((s * species_count as f32).floor() as u32).min(species_count - 1);
    Particle::new(
        options.left + u * options.width(),
        options.bottom + v * options.height(),
        species,
    )
}

// === Kernels ===

fn active(invocations: u32, limit: usize) -> usize {
    (invocations as usize).min(limit)
}

fn clear_bin_size(b: &Bindings<'_>, invocations: u32) -> Result<(), KernelError> {
    let mut bins = b.storage_mut::<u32>(1, 0)?;
    let n = active(invocations, bins.len());
    bins[..n].fill(0);
    Ok(())
}

fn fill_bin_size(b: &Bindings<'_>, invocations: u32) -> Result<(), KernelError> {
    let options = b.uniform::<GpuOptions>(0, 1)?;
    let particles = b.storage::<Particle>(0, 0)?;
    let mut bins = b.storage_mut::<u32>(1, 0)?;

    let n = active(invocations.min(options.particle_count), particles.len());
    for particle in &particles[..n] {
        let slot = bin_index(&options, particle) + 1;
        let len = bins.len();
        let counter = bins
            .get_mut(slot as usize)
            .ok_or(KernelError::ScatterOutOfRange { index: slot, len })?;
        *counter += 1;
    }
    Ok(())
}

fn prefix_sum_step(b: &Bindings<'_>, invocations: u32) -> Result<(), KernelError> {
    let step = b.uniform::<u32>(0, 2)?;
    let src = b.storage::<u32>(0, 0)?;
    let mut dst = b.storage_mut::<u32>(0, 1)?;
    let n = active(invocations, dst.len());
    scan_step(&src, &mut dst[..n], step);
    Ok(())
}

fn clear_bin_cursor(b: &Bindings<'_>, invocations: u32) -> Result<(), KernelError> {
    let mut cursor = b.storage_mut::<u32>(1, 1)?;
    let n = active(invocations, cursor.len());
    cursor[..n].fill(0);
    Ok(())
}

fn sort_particles(b: &Bindings<'_>, invocations: u32) -> Result<(), KernelError> {
    let options = b.uniform::<GpuOptions>(0, 2)?;
    let source = b.storage::<Particle>(0, 0)?;
    let mut sorted = b.storage_mut::<Particle>(0, 1)?;
    let offsets = b.storage::<u32>(1, 0)?;
    let mut cursor = b.storage_mut::<u32>(1, 1)?;

    let n = active(invocations.min(options.particle_count), source.len());
    for particle in &source[..n] {
        let bin = bin_index(&options, particle) as usize;
        let (Some(&offset), Some(count)) = (offsets.get(bin), cursor.get_mut(bin)) else {
            return Err(KernelError::ScatterOutOfRange {
                index: bin as u32,
                len: offsets.len(),
            });
        };
        let slot = offset + *count;
        *count += 1;
        let len = sorted.len();
        *sorted
            .get_mut(slot as usize)
            .ok_or(KernelError::ScatterOutOfRange { index: slot, len })? = *particle;
    }
    Ok(())
}

fn compute_forces(b: &Bindings<'_>, invocations: u32) -> Result<(), KernelError> {
    let options = b.uniform::<GpuOptions>(0, 2)?;
    let sorted = b.storage::<Particle>(0, 0)?;
    let mut updated = b.storage_mut::<Particle>(0, 1)?;
    let offsets = b.storage::<u32>(1, 0)?;
    let forces = b.storage::<ForceEntry>(1, 1)?;

    let n = active(invocations.min(options.particle_count), sorted.len().min(updated.len()));
    for index in 0..n {
        let (fx, fy) = accumulate_force(&options, &sorted, &offsets, &forces, index);
        let mut particle = sorted[index];
        particle.vx += fx * options.dt;
        particle.vy += fy * options.dt;
        updated[index] = particle;
    }
    Ok(())
}

fn particle_advance(b: &Bindings<'_>, invocations: u32) -> Result<(), KernelError> {
    let options = b.uniform::<GpuOptions>(0, 1)?;
    let mut particles = b.storage_mut::<Particle>(0, 0)?;
    let n = active(invocations.min(options.particle_count), particles.len());
    for particle in particles[..n].iter_mut() {
        advance(&options, particle);
    }
    Ok(())
}

fn generate_particles(b: &Bindings<'_>, invocations: u32) -> Result<(), KernelError> {
    let options = b.uniform::<GpuOptions>(0, 1)?;
    let mut particles = b.storage_mut::<Particle>(0, 0)?;
    let n = active(invocations.min(options.particle_count), particles.len());
    for (index, particle) in particles[..n].iter_mut().enumerate() {
        *particle = generate(&options, index as u32);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{prefix_passes, prefix_step, GridLayout};
    use proptest::prelude::*;

    fn options(width: f32, height: f32, wrap: bool) -> GpuOptions {
        let grid = GridLayout::new(width, height);
        GpuOptions {
            left: grid.left(),
            right: grid.right(),
            bottom: grid.bottom(),
            top: grid.top(),
            friction: 1.0,
            dt: 0.01,
            bin_size_x: grid.bin_size_x,
            bin_size_y: grid.bin_size_y,
            grid_width: grid.grid_width,
            grid_height: grid.grid_height,
            species_count: 1,
            looping_borders: wrap as u32,
            ..GpuOptions::default()
        }
    }

    /// Counts, scan and scatter exactly as the frame stream runs them
    fn bin_and_sort(options: &GpuOptions, particles: &[Particle]) -> (Vec<u32>, Vec<Particle>) {
        let bins = options.bin_count();
        let mut a = vec![0u32; bins as usize + 1];
        for p in particles {
            a[bin_index(options, p) as usize + 1] += 1;
        }
        let mut b = vec![0u32; a.len()];
        for pass in 0..prefix_passes(bins) {
            if pass % 2 == 0 {
                scan_step(&a, &mut b, prefix_step(pass));
            } else {
                scan_step(&b, &mut a, prefix_step(pass));
            }
        }

        let mut cursor = vec![0u32; a.len()];
        let mut sorted = vec![Particle::default(); particles.len()];
        for p in particles {
            let bin = bin_index(options, p) as usize;
            sorted[(a[bin] + cursor[bin]) as usize] = *p;
            cursor[bin] += 1;
        }
        (a, sorted)
    }

    fn particle_strategy() -> impl Strategy<Value = Particle> {
        (-200.0f32..200.0, -200.0f32..200.0).prop_map(|(x, y)| Particle::new(x, y, 0))
    }

    proptest! {
        #[test]
        fn test_offsets_are_an_exclusive_scan(
            particles in prop::collection::vec(particle_strategy(), 0..400),
            width in 10.0f32..400.0,
            height in 10.0f32..400.0,
        ) {
            let options = options(width, height, true);
            let (offsets, _) = bin_and_sort(&options, &particles);

            prop_assert_eq!(offsets.len() as u32, options.bin_count() + 1);
            prop_assert_eq!(offsets[0], 0);
            prop_assert_eq!(*offsets.last().unwrap() as usize, particles.len());
            prop_assert!(offsets.windows(2).all(|w| w[0] <= w[1]));

            for bin in 0..options.bin_count() as usize {
                let count = particles
                    .iter()
                    .filter(|p| bin_index(&options, p) as usize == bin)
                    .count();
                prop_assert_eq!((offsets[bin + 1] - offsets[bin]) as usize, count);
            }
        }

        #[test]
        fn test_sort_is_a_grouped_permutation(
            particles in prop::collection::vec(particle_strategy(), 1..400),
        ) {
            let options = options(256.0, 160.0, false);
            let (offsets, sorted) = bin_and_sort(&options, &particles);

            for bin in 0..options.bin_count() as usize {
                for p in &sorted[offsets[bin] as usize..offsets[bin + 1] as usize] {
                    prop_assert_eq!(bin_index(&options, p) as usize, bin);
                }
            }

            let key = |p: &Particle| (p.x.to_bits(), p.y.to_bits());
            let mut before: Vec<_> = particles.iter().map(key).collect();
            let mut after: Vec<_> = sorted.iter().map(key).collect();
            before.sort_unstable();
            after.sort_unstable();
            prop_assert_eq!(before, after);
        }
    }

    #[test]
    fn test_scan_step_matches_definition() {
        let src = [0, 3, 1, 4, 1];
        let mut dst = [0; 5];
        scan_step(&src, &mut dst, 2);
        assert_eq!(dst, [0, 3, 1, 7, 2]);
    }

    #[test]
    fn test_minimum_image() {
        let wrap = options(100.0, 100.0, true);
        assert_eq!(minimum_image(&wrap, 60.0, 100.0), -40.0);
        assert_eq!(minimum_image(&wrap, -60.0, 100.0), 40.0);
        assert_eq!(minimum_image(&wrap, 10.0, 100.0), 10.0);

        let walls = options(100.0, 100.0, false);
        assert_eq!(minimum_image(&walls, 60.0, 100.0), 60.0);
    }

    #[test]
    fn test_force_reaches_across_wrapped_border() {
        let mut options = options(128.0, 128.0, true);
        options.species_count = 1;
        let forces = [ForceEntry::new(10.0, 8.0, 0.0, 1.0)];
        // Four units apart through the left/right border
        let sorted = [Particle::new(-62.0, 0.0, 0), Particle::new(62.0, 0.0, 0)];
        let bins = options.bin_count() as usize;
        let mut offsets = vec![0u32; bins + 1];
        let a = bin_index(&options, &sorted[0]) as usize;
        let b = bin_index(&options, &sorted[1]) as usize;
        assert!(a < b);
        for slot in offsets.iter_mut().skip(a + 1) {
            *slot += 1;
        }
        for slot in offsets.iter_mut().skip(b + 1) {
            *slot += 1;
        }

        let (fx, fy) = accumulate_force(&options, &sorted, &offsets, &forces, 0);
        assert!(fx < 0.0, "attraction must point through the border, got {}", fx);
        assert_eq!(fy, 0.0);
        assert!((fx + 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_reflect_negates_velocity() {
        let options = options(100.0, 100.0, false);
        let mut p = Particle::new(49.9, 0.0, 0).with_velocity(100.0, 0.0);
        advance(&options, &mut p);
        assert_eq!(p.x, 50.0);
        assert_eq!(p.vx, -100.0);
    }

    #[test]
    fn test_wrap_moves_to_opposite_side() {
        let options = options(100.0, 100.0, true);
        let mut p = Particle::new(49.9, 0.0, 0).with_velocity(100.0, 0.0);
        advance(&options, &mut p);
        assert!((p.x - (-49.1)).abs() < 1e-4, "x = {}", p.x);
        assert_eq!(p.vx, 100.0);
    }

    #[test]
    fn test_wrap_survives_displacement_of_several_extents() {
        let options = options(100.0, 100.0, true);
        let mut p = Particle::new(0.0, 0.0, 0).with_velocity(23_000.0, -23_000.0);
        advance(&options, &mut p);
        assert!((p.x - 30.0).abs() < 1e-3, "x = {}", p.x);
        assert!((p.y - (-30.0)).abs() < 1e-3, "y = {}", p.y);
    }

    #[test]
    fn test_action_kick_decays_with_distance() {
        let mut options = options(100.0, 100.0, false);
        options.action_force = 10.0;
        options.action_radius = 5.0;
        options.action_vx = 1.0;

        let mut near = Particle::new(0.0, 0.0, 0);
        let mut far = Particle::new(20.0, 0.0, 0);
        advance(&options, &mut near);
        advance(&options, &mut far);
        assert!((near.vx - 0.1).abs() < 1e-6);
        assert!(far.vx < near.vx * 1e-6);
    }

    #[test]
    fn test_generate_is_deterministic_and_in_bounds() {
        let mut options = options(256.0, 128.0, true);
        options.species_count = 5;
        options.seed = 42;
        let mut seen = [0usize; 5];
        for index in 0..2000 {
            let p = generate(&options, index);
            assert_eq!(p, generate(&options, index));
            assert!(p.x >= options.left && p.x <= options.right);
            assert!(p.y >= options.bottom && p.y <= options.top);
            assert_eq!((p.vx, p.vy), (0.0, 0.0));
            seen[p.species as usize] += 1;
        }
        assert!(seen.iter().all(|&n| n > 250), "{:?}", seen);
    }

    #[test]
    fn test_every_entry_point_has_a_kernel() {
        for module in shaders::ShaderModule::ALL {
            for (name, _) in shaders::entry_points(&module.source()) {
                assert!(lookup(&name).is_some(), "{} has no native kernel", name);
            }
        }
        assert!(lookup("mainImage").is_none());
    }
}
