//! Host-side summaries of a particle readback

use serde::Serialize;

use crate::types::Particle;

/// Aggregate numbers over one readback
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ParticleStats {
    pub count: usize,
    /// `[min_x, min_y, max_x, max_y]`; all zero when there are no particles
    pub bounds: [f32; 4],
    pub mean_speed: f32,
    pub max_speed: f32,
    /// Particles per species index, after clamping
    pub species_counts: Vec<usize>,
    /// Particles with a non-finite coordinate or velocity
    pub non_finite: usize,
}

impl ParticleStats {
    pub fn from_particles(particles: &[Particle], species_count: usize) -> Self {
        let mut stats = Self {
            count: particles.len(),
            species_counts: vec![0; species_count],
            ..Default::default()
        };
        if particles.is_empty() {
            return stats;
        }

        let mut bounds = [f32::INFINITY, f32::INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY];
        let mut speed_sum = 0.0f64;
        let mut finite = 0usize;

        for p in particles {
            if !(p.x.is_finite() && p.y.is_finite() && p.vx.is_finite() && p.vy.is_finite()) {
                stats.non_finite += 1;
                continue;
            }
            finite += 1;
            bounds[0] = bounds[0].min(p.x);
            bounds[1] = bounds[1].min(p.y);
            bounds[2] = bounds[2].max(p.x);
            bounds[3] = bounds[3].max(p.y);

            let speed = p.speed();
            speed_sum += speed as f64;
            stats.max_speed = stats.max_speed.max(speed);

            if species_count > 0 {
                stats.species_counts[p.species_index(species_count as u32) as usize] += 1;
            }
        }

        if finite > 0 {
            stats.bounds = bounds;
            stats.mean_speed = (speed_sum / finite as f64) as f32;
        }
        stats
    }

    /// Whether every particle lies inside the centered `width x height` world
    pub fn within(&self, width: f32, height: f32) -> bool {
        self.non_finite == 0
            && self.bounds[0] >= -0.5 * width
            && self.bounds[2] <= 0.5 * width
            && self.bounds[1] >= -0.5 * height
            && self.bounds[3] <= 0.5 * height
    }
}
