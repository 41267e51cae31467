//! Deterministic species and force-matrix generation
//!
//! A system is fully determined by `(seed, species_count, symmetric)`. Draw
//! order is fixed: every species color first, then the force matrix row by
//! row, so the same seed always yields bit-identical tables.

use smallvec::SmallVec;

use crate::error::ConfigError;
use crate::rng::SplitMix32;
use crate::types::{ForceEntry, Species};

/// Hard cap on species; the force matrix grows with its square
pub const MAX_SPECIES: usize = 16;

/// Upper bound on any interaction radius; also the minimum bin size
pub const MAX_FORCE_RADIUS: f32 = 32.0;

/// Lower bound of generated interaction radii
pub const MIN_FORCE_RADIUS: f32 = 2.0;

/// Peak magnitude of generated strengths
pub const MAX_STRENGTH: f32 = 100.0;

/// Default ratio of collision strength to `|strength|`
pub const DEFAULT_COLLISION_SCALE: f32 = 2.0;

/// Species colors with a validated capacity
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpeciesTable {
    species: SmallVec<[Species; MAX_SPECIES]>,
}

impl SpeciesTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a species, refusing to grow past [`MAX_SPECIES`]
    pub fn push(&mut self, species: Species) -> Result<(), ConfigError> {
        if self.species.len() >= MAX_SPECIES {
            return Err(ConfigError::SpeciesCount {
                count: self.species.len() + 1,
                max: MAX_SPECIES,
            });
        }
        self.species.push(species);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.species.len()
    }

    pub fn is_empty(&self) -> bool {
        self.species.is_empty()
    }

    pub fn as_slice(&self) -> &[Species] {
        &self.species
    }
}

/// Row-major `n x n` interaction table indexed `(own, other)`
#[derive(Clone, Debug, PartialEq)]
pub struct ForceMatrix {
    species_count: usize,
    entries: Vec<ForceEntry>,
}

impl ForceMatrix {
    /// All-zero matrix
    pub fn new(species_count: usize) -> Result<Self, ConfigError> {
        check_species_count(species_count)?;
        Ok(Self {
            species_count,
            entries: vec![ForceEntry::default(); species_count * species_count],
        })
    }

    /// Every pair gets the same entry
    pub fn uniform(species_count: usize, entry: ForceEntry) -> Result<Self, ConfigError> {
        let mut matrix = Self::new(species_count)?;
        matrix.entries.fill(entry);
        Ok(matrix)
    }

    pub fn species_count(&self) -> usize {
        self.species_count
    }

    pub fn get(&self, own: usize, other: usize) -> &ForceEntry {
        &self.entries[own * self.species_count + other]
    }

    pub fn set(&mut self, own: usize, other: usize, entry: ForceEntry) {
        self.entries[own * self.species_count + other] = entry;
    }

    pub fn entries(&self) -> &[ForceEntry] {
        &self.entries
    }

    /// Largest interaction radius in the table
    pub fn max_radius(&self) -> f32 {
        self.entries.iter().map(|e| e.radius).fold(0.0, f32::max)
    }

    /// Reject radii the bin grid cannot cover
    pub fn validate(&self) -> Result<(), ConfigError> {
        for entry in &self.entries {
            let radius = entry.radius;
            if !(radius > 0.0 && radius <= MAX_FORCE_RADIUS) {
                return Err(ConfigError::ForceRadius {
                    radius,
                    max: MAX_FORCE_RADIUS,
                });
            }
        }
        Ok(())
    }

    /// Average each `(i, j)` / `(j, i)` pair, field by field
    pub fn symmetrize(&mut self) {
        let n = self.species_count;
        for i in 0..n {
            for j in (i + 1)..n {
                let a = *self.get(i, j);
                let b = *self.get(j, i);
                let mean = ForceEntry {
                    strength: (a.strength + b.strength) * 0.5,
                    radius: (a.radius + b.radius) * 0.5,
                    collision_strength: (a.collision_strength + b.collision_strength) * 0.5,
                    collision_radius: (a.collision_radius + b.collision_radius) * 0.5,
                };
                self.set(i, j, mean);
                self.set(j, i, mean);
            }
        }
    }

    /// Copy with every attraction strength multiplied by `scale`
    pub fn scaled(&self, scale: f32) -> Vec<ForceEntry> {
        self.entries
            .iter()
            .map(|e| ForceEntry {
                strength: e.strength * scale,
                ..*e
            })
            .collect()
    }
}

/// Species plus forces, regenerated from a seed
#[derive(Clone, Debug, PartialEq)]
pub struct SystemDescription {
    pub seed: u32,
    pub symmetric: bool,
    pub species: SpeciesTable,
    pub forces: ForceMatrix,
}

impl SystemDescription {
    /// Generate a system from `seed`
    pub fn generate(
        seed: u32,
        species_count: usize,
        symmetric: bool,
        collision_scale: f32,
    ) -> Result<Self, ConfigError> {
        check_species_count(species_count)?;
        let mut rng = SplitMix32::new(seed);

        let mut species = SpeciesTable::new();
        for _ in 0..species_count {
            species.push(Species {
                color: [
                    gamma_channel(rng.next_f32()),
                    gamma_channel(rng.next_f32()),
                    gamma_channel(rng.next_f32()),
                    1.0,
                ],
            })?;
        }

        let mut forces = ForceMatrix::new(species_count)?;
        for own in 0..species_count {
            for other in 0..species_count {
                forces.set(own, other, random_entry(&mut rng, collision_scale));
            }
        }
        if symmetric {
            forces.symmetrize();
        }

        Ok(Self {
            seed,
            symmetric,
            species,
            forces,
        })
    }
}

fn gamma_channel(u: f32) -> f32 {
    (0.25 + 0.75 * u).powf(2.2)
}

fn random_entry(rng: &mut SplitMix32, collision_scale: f32) -> ForceEntry {
    let magnitude = MAX_STRENGTH * (0.25 + 0.75 * rng.next_f32());
    let strength = if rng.coin() { magnitude } else { -magnitude };
    let radius = rng.range(MIN_FORCE_RADIUS, MAX_FORCE_RADIUS);
    // Strictly inside (0, radius / 2)
    let collision_radius = 0.5 * radius * (0.01 + 0.98 * rng.next_f32());

    ForceEntry {
        strength,
        radius,
        collision_strength: collision_scale * strength.abs(),
        collision_radius,
    }
}

fn check_species_count(count: usize) -> Result<(), ConfigError> {
    if count == 0 || count > MAX_SPECIES {
        return Err(ConfigError::SpeciesCount {
            count,
            max: MAX_SPECIES,
        });
    }
    Ok(())
}
