//! Noise parameter sets and their evaluators.

use glam::DVec3;
use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use serde::{Deserialize, Serialize};

/// Parameters of a fractal noise: `offset + scale * fbm(p / spread)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseParams {
    pub offset: f64,
    pub scale: f64,
    /// Size of the largest feature per axis, in nodes.
    pub spread: DVec3,
    /// Added to the world seed.
    pub seed: i64,
    pub octaves: u32,
    pub persist: f64,
    pub lacunarity: f64,
}

impl NoiseParams {
    pub const fn new(
        offset: f64,
        scale: f64,
        spread: DVec3,
        seed: i64,
        octaves: u32,
        persist: f64,
        lacunarity: f64,
    ) -> Self {
        Self {
            offset,
            scale,
            spread,
            seed,
            octaves,
            persist,
            lacunarity,
        }
    }

    /// Build an evaluator for these parameters under `world_seed`.
    pub fn field(&self, world_seed: u64) -> NoiseField {
        NoiseField::new(*self, world_seed)
    }
}

/// An evaluable noise built from [`NoiseParams`].
#[derive(Debug, Clone)]
pub struct NoiseField {
    params: NoiseParams,
    fbm: Fbm<Perlin>,
}

impl NoiseField {
    pub fn new(params: NoiseParams, world_seed: u64) -> Self {
        let seed = (world_seed as i64).wrapping_add(params.seed) as u32;
        let fbm = Fbm::<Perlin>::new(seed)
            .set_octaves(params.octaves.max(1) as usize)
            .set_persistence(params.persist)
            .set_lacunarity(params.lacunarity);
        Self { params, fbm }
    }

    pub fn params(&self) -> &NoiseParams {
        &self.params
    }

    /// Value at horizontal position (x, z).
    pub fn get_2d(&self, x: f64, z: f64) -> f64 {
        let s = self.params.spread;
        self.params.offset + self.params.scale * self.fbm.get([x / s.x, z / s.z])
    }

    pub fn get_3d(&self, x: f64, y: f64, z: f64) -> f64 {
        let s = self.params.spread;
        self.params.offset + self.params.scale * self.fbm.get([x / s.x, y / s.y, z / s.z])
    }
}
