//! Projection + Quantization (C3): a fixed random projection matrix reduces
//! embedding dimension D down to storage dimension D', then each projected
//! vector is uniformly quantized to 8 bits.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

use crate::error::{CidxError, CidxResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Distance {
    Cosine,
    L2,
}

/// A fixed random matrix `P ∈ R^{D x D'}`. Immutable for the life of a
/// collection — SPEC_FULL.md §3 invariant 3.
#[derive(Debug, Clone)]
pub struct ProjectionMatrix {
    pub input_dim: usize,
    pub output_dim: usize,
    /// Row-major, `input_dim * output_dim` entries.
    data: Vec<f32>,
}

impl ProjectionMatrix {
    /// Fit a new projection matrix with a seed deterministically derived
    /// from `collection_id`, so two fits for the same collection are
    /// byte-identical (§8 "Projection immutability").
    pub fn fit(collection_id: &str, input_dim: usize, output_dim: usize) -> Self {
        let seed = seed_from_collection_id(collection_id);
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0f32 / (output_dim as f32).sqrt();

        let data: Vec<f32> = (0..input_dim * output_dim)
            .map(|_| {
                let sample: f32 = StandardNormal.sample(&mut rng);
                sample * scale
            })
            .collect();

        Self {
            input_dim,
            output_dim,
            data,
        }
    }

    pub fn apply(&self, vector: &[f32]) -> CidxResult<Vec<f32>> {
        if vector.len() != self.input_dim {
            return Err(CidxError::BadInput(format!(
                "vector has dimension {} but projection expects {}",
                vector.len(),
                self.input_dim
            )));
        }

        let mut out = vec![0f32; self.output_dim];
        for (i, &x) in vector.iter().enumerate() {
            if x == 0.0 {
                continue;
            }
            let row_offset = i * self.output_dim;
            for j in 0..self.output_dim {
                out[j] += x * self.data[row_offset + j];
            }
        }
        Ok(out)
    }

    /// Serialize as raw little-endian f32 bytes, shape (D, D') row-major —
    /// the exact `projection.bin` layout from SPEC_FULL.md §4.4.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() * 4);
        for v in &self.data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8], input_dim: usize, output_dim: usize) -> CidxResult<Self> {
        let expected_len = input_dim * output_dim * 4;
        if bytes.len() != expected_len {
            return Err(CidxError::Corruption(format!(
                "projection.bin has {} bytes, expected {}",
                bytes.len(),
                expected_len
            )));
        }
        let data = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self {
            input_dim,
            output_dim,
            data,
        })
    }
}

fn seed_from_collection_id(collection_id: &str) -> u64 {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(collection_id.as_bytes());
    u64::from_le_bytes(digest[0..8].try_into().unwrap())
}

pub fn l2_normalize(vector: &[f32]) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|x| x / norm).collect()
}

/// An 8-bit quantized vector with the scale/offset needed to reconstruct
/// the original float vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizedVector {
    pub bytes: Vec<u8>,
    pub min_bits: u32,
    pub max_bits: u32,
}

impl QuantizedVector {
    pub fn min(&self) -> f32 {
        f32::from_bits(self.min_bits)
    }
    pub fn max(&self) -> f32 {
        f32::from_bits(self.max_bits)
    }
}

/// Uniform 8-bit quantization: `q[i] = round(255 * (v[i] - min) / (max -
/// min))`. A degenerate (constant) vector maps every component to 0.
pub fn quantize(vector: &[f32]) -> QuantizedVector {
    let min = vector.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = vector.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

    let range = max - min;
    let bytes: Vec<u8> = if range.abs() < f32::EPSILON {
        vec![0u8; vector.len()]
    } else {
        vector
            .iter()
            .map(|&v| (255.0 * (v - min) / range).round().clamp(0.0, 255.0) as u8)
            .collect()
    };

    QuantizedVector {
        bytes,
        min_bits: min.to_bits(),
        max_bits: max.to_bits(),
    }
}

pub fn dequantize(q: &QuantizedVector) -> Vec<f32> {
    let min = q.min();
    let max = q.max();
    let range = max - min;
    q.bytes
        .iter()
        .map(|&b| min + (b as f32 / 255.0) * range)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fitting_the_same_collection_id_is_byte_identical() {
        let a = ProjectionMatrix::fit("my-project", 8, 4);
        let b = ProjectionMatrix::fit("my-project", 8, 4);
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn different_collection_ids_yield_different_matrices() {
        let a = ProjectionMatrix::fit("project-a", 8, 4);
        let b = ProjectionMatrix::fit("project-b", 8, 4);
        assert_ne!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn round_trips_through_bytes() {
        let m = ProjectionMatrix::fit("roundtrip", 6, 3);
        let bytes = m.to_bytes();
        let restored = ProjectionMatrix::from_bytes(&bytes, 6, 3).unwrap();
        assert_eq!(m.to_bytes(), restored.to_bytes());
    }

    #[test]
    fn apply_rejects_wrong_dimension() {
        let m = ProjectionMatrix::fit("dims", 4, 2);
        assert!(m.apply(&[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn quantize_dequantize_is_approximately_inverse() {
        let v = vec![-1.0f32, 0.0, 0.5, 1.0, 2.5];
        let q = quantize(&v);
        let restored = dequantize(&q);
        for (orig, got) in v.iter().zip(restored.iter()) {
            assert!((orig - got).abs() < 0.05, "{orig} vs {got}");
        }
    }

    #[test]
    fn quantize_constant_vector_does_not_panic() {
        let v = vec![3.0f32; 10];
        let q = quantize(&v);
        assert!(q.bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn l2_normalize_produces_unit_vector() {
        let v = vec![3.0f32, 4.0];
        let n = l2_normalize(&v);
        let norm: f32 = n.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
