//! Plain-old-data types shared with the kernels
//!
//! Every struct here must match its WGSL counterpart in [`crate::shaders`]
//! field for field.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// One point particle
///
/// The species index is stored as a float so every field has the same type
/// on the kernel side; kernels floor and clamp it before use.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Particle {
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub species: f32,
}

impl Particle {
    pub fn new(x: f32, y: f32, species: u32) -> Self {
        Self {
            x,
            y,
            vx: 0.0,
            vy: 0.0,
            species: species as f32,
        }
    }

    pub fn with_velocity(mut self, vx: f32, vy: f32) -> Self {
        self.vx = vx;
        self.vy = vy;
        self
    }

    /// Species index clamped into `[0, species_count - 1]`
    pub fn species_index(&self, species_count: u32) -> u32 {
        let max = species_count.saturating_sub(1) as f32;
        self.species.floor().clamp(0.0, max) as u32
    }

    pub fn speed(&self) -> f32 {
        (self.vx * self.vx + self.vy * self.vy).sqrt()
    }
}

/// A species; only its color is consumed, by presentation
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Species {
    /// Linear RGBA
    pub color: [f32; 4],
}

/// Interaction between an ordered species pair
///
/// Positive strength attracts, negative repels. The collision term always
/// repels and acts inside `collision_radius`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct ForceEntry {
    pub strength: f32,
    pub radius: f32,
    pub collision_strength: f32,
    pub collision_radius: f32,
}

impl ForceEntry {
    pub fn new(strength: f32, radius: f32, collision_strength: f32, collision_radius: f32) -> Self {
        Self {
            strength,
            radius,
            collision_strength,
            collision_radius,
        }
    }

    /// Scalar force along the unit vector toward the neighbor at distance `d`
    pub fn magnitude_at(&self, d: f32) -> f32 {
        let attraction = self.strength * (1.0 - d / self.radius).max(0.0);
        let collision = self.collision_strength * (1.0 - d / self.collision_radius).max(0.0);
        attraction - collision
    }
}

/// Per-frame uniform block read by every kernel (96 bytes)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GpuOptions {
    pub left: f32,
    pub right: f32,
    pub bottom: f32,
    pub top: f32,

    /// `exp(-dt * friction_coefficient)`
    pub friction: f32,
    /// Clamped timestep
    pub dt: f32,
    pub bin_size_x: f32,
    pub bin_size_y: f32,

    pub grid_width: u32,
    pub grid_height: u32,
    pub species_count: u32,
    pub particle_count: u32,

    pub central_force: f32,
    /// Non-zero selects wrap borders, zero reflect
    pub looping_borders: u32,
    pub action_x: f32,
    pub action_y: f32,

    pub action_vx: f32,
    pub action_vy: f32,
    /// Zero when no interaction is active
    pub action_force: f32,
    pub action_radius: f32,

    pub seed: u32,
    pub _pad0: u32,
    pub _pad1: u32,
    pub _pad2: u32,
}

impl GpuOptions {
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.top - self.bottom
    }

    pub fn wraps(&self) -> bool {
        self.looping_borders != 0
    }

    pub fn bin_count(&self) -> u32 {
        self.grid_width * self.grid_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(std::mem::size_of::<Particle>(), 20);
        assert_eq!(std::mem::size_of::<Species>(), 16);
        assert_eq!(std::mem::size_of::<ForceEntry>(), 16);
        assert_eq!(std::mem::size_of::<GpuOptions>(), 96);
        assert_eq!(std::mem::size_of::<GpuOptions>() % 16, 0);
    }

    #[test]
    fn test_species_index_floors_and_clamps() {
        let mut p = Particle::new(0.0, 0.0, 0);
        p.species = 2.9999;
        assert_eq!(p.species_index(4), 2);
        p.species = 7.0;
        assert_eq!(p.species_index(4), 3);
        p.species = -0.5;
        assert_eq!(p.species_index(4), 0);
        p.species = f32::NAN;
        assert_eq!(p.species_index(4), 0);
    }

    #[test]
    fn test_force_magnitude() {
        let entry = ForceEntry::new(50.0, 10.0, 0.0, 1.0);
        assert_eq!(entry.magnitude_at(5.0), 25.0);
        assert_eq!(entry.magnitude_at(10.0), 0.0);

        let repel = ForceEntry::new(0.0, 10.0, 20.0, 2.0);
        assert_eq!(repel.magnitude_at(1.0), -10.0);
        assert_eq!(repel.magnitude_at(3.0), 0.0);
    }
}
