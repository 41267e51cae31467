//! Seeded random streams
//!
//! The host generator is a splitmix32 stream. The generation kernel uses a
//! PCG hash per particle index instead; the two agree in distribution, not
//! in sequence.

/// Sequential splitmix32 generator
#[derive(Clone, Debug)]
pub struct SplitMix32 {
    state: u32,
}

impl SplitMix32 {
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_add(0x9e37_79b9);
        let mut z = self.state;
        z = (z ^ (z >> 16)).wrapping_mul(0x85eb_ca6b);
        z = (z ^ (z >> 13)).wrapping_mul(0xc2b2_ae35);
        z ^ (z >> 16)
    }

    /// Uniform in `[0, 1)`
    pub fn next_f32(&mut self) -> f32 {
        unit_float(self.next_u32())
    }

    /// Uniform in `[min, max)`
    pub fn range(&mut self, min: f32, max: f32) -> f32 {
        min + self.next_f32() * (max - min)
    }

    /// Fair coin
    pub fn coin(&mut self) -> bool {
        self.next_u32() & 1 == 0
    }
}

/// PCG output hash, identical to `pcgHash` in the generation kernel
pub fn pcg_hash(input: u32) -> u32 {
    let state = input.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

/// Map the top 24 bits of a hash onto `[0, 1)`
pub fn unit_float(bits: u32) -> f32 {
    (bits >> 8) as f32 / 16_777_216.0
}
