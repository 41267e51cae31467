//! WGSL kernels for the spatial-hash pipeline
//!
//! Every module except the prefix sum is [`COMMON`] followed by its own
//! body. The shared part declares the data layouts and the binning helpers;
//! each body declares its bindings, including the `options` uniform the
//! helpers read. The prefix sum has no `options` and stands alone.
//!
//! Bind group shapes:
//!
//! | module   | group 0                                   | group 1                       |
//! |----------|-------------------------------------------|-------------------------------|
//! | binning  | particles (ro), options                   | binSize (atomic)              |
//! | prefix   | scanSource (ro), scanDestination, stepSize (dynamic) | -                  |
//! | sort     | particlesSource (ro), particlesSorted, options | binOffset (ro), binCursor (atomic) |
//! | forces   | particlesSorted (ro), particlesUpdated, options | binOffset (ro), forces (ro) |
//! | advance  | particles, options                        | -                             |
//! | generate | particles, options                        | -                             |

/// Invocations per workgroup in every kernel
pub const WORKGROUP_SIZE: u32 = 64;

// === Entry points ===

pub const CLEAR_BIN_SIZE: &str = "clearBinSize";
pub const FILL_BIN_SIZE: &str = "fillBinSize";
pub const PREFIX_SUM_STEP: &str = "prefixSumStep";
pub const CLEAR_BIN_CURSOR: &str = "clearBinCurrentSize";
pub const SORT_PARTICLES: &str = "sortParticles";
pub const COMPUTE_FORCES: &str = "computeForces";
pub const PARTICLE_ADVANCE: &str = "particleAdvance";
pub const GENERATE_PARTICLES: &str = "generateParticles";

/// Layouts and helpers shared by all modules
pub const COMMON: &str = r#"
struct Particle {
    x: f32,
    y: f32,
    vx: f32,
    vy: f32,
    species: f32,
}

struct SimulationOptions {
    left: f32,
    right: f32,
    bottom: f32,
    top: f32,
    friction: f32,
    dt: f32,
    bin_size_x: f32,
    bin_size_y: f32,
    grid_width: u32,
    grid_height: u32,
    species_count: u32,
    particle_count: u32,
    central_force: f32,
    looping_borders: u32,
    action_x: f32,
    action_y: f32,
    action_vx: f32,
    action_vy: f32,
    action_force: f32,
    action_radius: f32,
    seed: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}

struct ForceEntry {
    strength: f32,
    radius: f32,
    collision_strength: f32,
    collision_radius: f32,
}

struct CellRange {
    cells: array<u32, 3>,
    count: u32,
}

fn binCoords(x: f32, y: f32) -> vec2<u32> {
    let gx = i32(floor((x - options.left) / options.bin_size_x));
    let gy = i32(floor((y - options.bottom) / options.bin_size_y));
    return vec2<u32>(
        u32(clamp(gx, 0, i32(options.grid_width) - 1)),
        u32(clamp(gy, 0, i32(options.grid_height) - 1)),
    );
}

fn binIndex(cell: vec2<u32>) -> u32 {
    return cell.y * options.grid_width + cell.x;
}

fn speciesIndex(species: f32) -> u32 {
    return u32(clamp(floor(species), 0.0, f32(options.species_count - 1u)));
}

fn minimumImage(delta: f32, extent: f32) -> f32 {
    if options.looping_borders == 0u {
        return delta;
    }
    if delta >= 0.5 * extent {
        return delta - extent;
    }
    if delta <= -0.5 * extent {
        return delta + extent;
    }
    return delta;
}

fn neighborCells(cell: u32, dim: u32) -> CellRange {
    var result: CellRange;
    if options.looping_borders != 0u {
        if dim >= 3u {
            result.cells[0] = (cell + dim - 1u) % dim;
            result.cells[1] = cell;
            result.cells[2] = (cell + 1u) % dim;
            result.count = 3u;
        } else {
            for (var i = 0u; i < dim; i += 1u) {
                result.cells[i] = i;
            }
            result.count = dim;
        }
        return result;
    }
    var n = 0u;
    if cell > 0u {
        result.cells[n] = cell - 1u;
        n += 1u;
    }
    result.cells[n] = cell;
    n += 1u;
    if cell + 1u < dim {
        result.cells[n] = cell + 1u;
        n += 1u;
    }
    result.count = n;
    return result;
}
"#;

/// Bin-clear and bin-fill
pub const BINNING: &str = r#"
@group(0) @binding(0) var<storage, read> particles: array<Particle>;
@group(0) @binding(1) var<uniform> options: SimulationOptions;
@group(1) @binding(0) var<storage, read_write> binSize: array<atomic<u32>>;

@compute @workgroup_size(64)
fn clearBinSize(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x >= arrayLength(&binSize) {
        return;
    }
    atomicStore(&binSize[id.x], 0u);
}

@compute @workgroup_size(64)
fn fillBinSize(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x >= options.particle_count {
        return;
    }
    let particle = particles[id.x];
    let bin = binIndex(binCoords(particle.x, particle.y));
    atomicAdd(&binSize[bin + 1u], 1u);
}
"#;

/// One Hillis-Steele step
pub const PREFIX_SUM: &str = r#"
@group(0) @binding(0) var<storage, read> scanSource: array<u32>;
@group(0) @binding(1) var<storage, read_write> scanDestination: array<u32>;
@group(0) @binding(2) var<uniform> stepSize: u32;

@compute @workgroup_size(64)
fn prefixSumStep(@builtin(global_invocation_id) id: vec3<u32>) {
    let idx = id.x;
    if idx >= arrayLength(&scanDestination) {
        return;
    }
    if idx < stepSize {
        scanDestination[idx] = scanSource[idx];
    } else {
        scanDestination[idx] = scanSource[idx - stepSize] + scanSource[idx];
    }
}
"#;

/// Cursor clear and counting-sort scatter
pub const SORT: &str = r#"
@group(0) @binding(0) var<storage, read> particlesSource: array<Particle>;
@group(0) @binding(1) var<storage, read_write> particlesSorted: array<Particle>;
@group(0) @binding(2) var<uniform> options: SimulationOptions;
@group(1) @binding(0) var<storage, read> binOffset: array<u32>;
@group(1) @binding(1) var<storage, read_write> binCursor: array<atomic<u32>>;

@compute @workgroup_size(64)
fn clearBinCurrentSize(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x >= arrayLength(&binCursor) {
        return;
    }
    atomicStore(&binCursor[id.x], 0u);
}

@compute @workgroup_size(64)
fn sortParticles(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x >= options.particle_count {
        return;
    }
    let particle = particlesSource[id.x];
    let bin = binIndex(binCoords(particle.x, particle.y));
    let slot = binOffset[bin] + atomicAdd(&binCursor[bin], 1u);
    particlesSorted[slot] = particle;
}
"#;

/// Neighbor force accumulation over sorted particles
pub const FORCES: &str = r#"
@group(0) @binding(0) var<storage, read> particlesSorted: array<Particle>;
@group(0) @binding(1) var<storage, read_write> particlesUpdated: array<Particle>;
@group(0) @binding(2) var<uniform> options: SimulationOptions;
@group(1) @binding(0) var<storage, read> binOffset: array<u32>;
@group(1) @binding(1) var<storage, read> forces: array<ForceEntry>;

@compute @workgroup_size(64)
fn computeForces(@builtin(global_invocation_id) id: vec3<u32>) {
    let index = id.x;
    if index >= options.particle_count {
        return;
    }
    var particle = particlesSorted[index];
    let species = speciesIndex(particle.species);
    let width = options.right - options.left;
    let height = options.top - options.bottom;

    let cell = binCoords(particle.x, particle.y);
    var columns = neighborCells(cell.x, options.grid_width);
    var rows = neighborCells(cell.y, options.grid_height);

    var force = vec2<f32>(0.0, 0.0);
    for (var r = 0u; r < rows.count; r += 1u) {
        for (var c = 0u; c < columns.count; c += 1u) {
            let bin = rows.cells[r] * options.grid_width + columns.cells[c];
            let end = binOffset[bin + 1u];
            for (var j = binOffset[bin]; j < end; j += 1u) {
                if j == index {
                    continue;
                }
                let other = particlesSorted[j];
                let entry = forces[species * options.species_count + speciesIndex(other.species)];
                let delta = vec2<f32>(
                    minimumImage(other.x - particle.x, width),
                    minimumImage(other.y - particle.y, height),
                );
                let d = length(delta);
                if d <= 0.0 || d >= entry.radius {
                    continue;
                }
                let attraction = entry.strength * max(0.0, 1.0 - d / entry.radius);
                let collision = entry.collision_strength * max(0.0, 1.0 - d / entry.collision_radius);
                force += (attraction - collision) * (delta / d);
            }
        }
    }

    force -= options.central_force * vec2<f32>(particle.x, particle.y);
    particle.vx += force.x * options.dt;
    particle.vy += force.y * options.dt;
    particlesUpdated[index] = particle;
}
"#;

/// Action kick, friction, integration and borders
pub const ADVANCE: &str = r#"
@group(0) @binding(0) var<storage, read_write> particles: array<Particle>;
@group(0) @binding(1) var<uniform> options: SimulationOptions;

fn wrapAxis(value: f32, lower: f32, upper: f32, extent: f32) -> f32 {
    if value >= lower && value <= upper {
        return value;
    }
    let offset = value - lower;
    return clamp(lower + offset - extent * floor(offset / extent), lower, upper);
}

@compute @workgroup_size(64)
fn particleAdvance(@builtin(global_invocation_id) id: vec3<u32>) {
    let index = id.x;
    if index >= options.particle_count {
        return;
    }
    var p = particles[index];
    let width = options.right - options.left;
    let height = options.top - options.bottom;

    if options.action_force != 0.0 && options.action_radius > 0.0 {
        let dx = minimumImage(p.x - options.action_x, width);
        let dy = minimumImage(p.y - options.action_y, height);
        let falloff = exp(-(dx * dx + dy * dy) / (options.action_radius * options.action_radius));
        let kick = options.action_force * falloff * options.dt;
        p.vx += options.action_vx * kick;
        p.vy += options.action_vy * kick;
    }

    p.vx *= options.friction;
    p.vy *= options.friction;
    p.x += p.vx * options.dt;
    p.y += p.vy * options.dt;

    if options.looping_borders != 0u {
        p.x = wrapAxis(p.x, options.left, options.right, width);
        p.y = wrapAxis(p.y, options.bottom, options.top, height);
    } else {
        if p.x < options.left {
            p.x = options.left;
            p.vx = -p.vx;
        } else if p.x > options.right {
            p.x = options.right;
            p.vx = -p.vx;
        }
        if p.y < options.bottom {
            p.y = options.bottom;
            p.vy = -p.vy;
        } else if p.y > options.top {
            p.y = options.top;
            p.vy = -p.vy;
        }
    }
    particles[index] = p;
}
"#;

/// Seeded particle generation
pub const GENERATE: &str = r#"
@group(0) @binding(0) var<storage, read_write> particles: array<Particle>;
@group(0) @binding(1) var<uniform> options: SimulationOptions;

fn pcgHash(value: u32) -> u32 {
    let state = value * 747796405u + 2891336453u;
    let word = ((state >> ((state >> 28u) + 4u)) ^ state) * 277803737u;
    return (word >> 22u) ^ word;
}

fn unitFloat(bits: u32) -> f32 {
    return f32(bits >> 8u) / 16777216.0;
}

@compute @workgroup_size(64)
fn generateParticles(@builtin(global_invocation_id) id: vec3<u32>) {
    let index = id.x;
    if index >= options.particle_count {
        return;
    }
    var state = pcgHash(index ^ pcgHash(options.seed));
    let u = unitFloat(state);
    state = pcgHash(state);
    let v = unitFloat(state);
    state = pcgHash(state);
    let s = unitFloat(state);

    let width = options.right - options.left;
    let height = options.top - options.bottom;
    let species = min(u32(floor(s * f32(options.species_count))), options.species_count - 1u);
    particles[index] = Particle(options.left + u * width, options.bottom + v * height, 0.0, 0.0, f32(species));
}
"#;

/// A shader module of the pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderModule {
    Binning,
    PrefixSum,
    Sort,
    Forces,
    Advance,
    Generate,
}

impl ShaderModule {
    pub const ALL: [ShaderModule; 6] = [
        ShaderModule::Binning,
        ShaderModule::PrefixSum,
        ShaderModule::Sort,
        ShaderModule::Forces,
        ShaderModule::Advance,
        ShaderModule::Generate,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ShaderModule::Binning => "binning",
            ShaderModule::PrefixSum => "prefix_sum",
            ShaderModule::Sort => "sort",
            ShaderModule::Forces => "forces",
            ShaderModule::Advance => "advance",
            ShaderModule::Generate => "generate",
        }
    }

    fn body(self) -> &'static str {
        match self {
            ShaderModule::Binning => BINNING,
            ShaderModule::PrefixSum => PREFIX_SUM,
            ShaderModule::Sort => SORT,
            ShaderModule::Forces => FORCES,
            ShaderModule::Advance => ADVANCE,
            ShaderModule::Generate => GENERATE,
        }
    }

    /// Complete WGSL source
    pub fn source(self) -> String {
        match self {
            ShaderModule::PrefixSum => self.body().to_string(),
            _ => format!("{}\n{}", COMMON, self.body()),
        }
    }
}

/// Entry points declared in WGSL source, with their workgroup sizes
///
/// Only the single-line form `@compute @workgroup_size(N)` followed by
/// `fn name(` is recognized; that is the form every kernel here uses.
pub fn entry_points(source: &str) -> Vec<(String, u32)> {
    let mut found = Vec::new();
    let mut pending: Option<u32> = None;
    for line in source.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("@compute @workgroup_size(") {
            pending = rest
                .split(')')
                .next()
                .and_then(|n| n.trim().parse().ok());
            continue;
        }
        if let (Some(size), Some(rest)) = (pending, line.strip_prefix("fn ")) {
            if let Some(name) = rest.split('(').next() {
                found.push((name.trim().to_string(), size));
            }
        }
        pending = None;
    }
    found
}
