use crate::config::{Number, EPSILON};
use wide::f32x8;

/// Cosine similarity in `[-1, 1]`, accumulated eight lanes at a time.
/// Returns `None` when the lengths differ and `0.0` when either vector is (near) zero.
pub fn cosine_similarity_simd(a: &[Number], b: &[Number]) -> Option<Number> {
    if a.len() != b.len() {
        log::trace!("vector length mismatch: {} vs {}", a.len(), b.len());
        return None;
    }

    let mut dot = f32x8::splat(0.0);
    let mut mag_a = f32x8::splat(0.0);
    let mut mag_b = f32x8::splat(0.0);

    let lanes_a = a.chunks_exact(8);
    let lanes_b = b.chunks_exact(8);
    let tail_a = lanes_a.remainder();
    let tail_b = lanes_b.remainder();

    for (ca, cb) in lanes_a.zip(lanes_b) {
        let va = f32x8::new([ca[0], ca[1], ca[2], ca[3], ca[4], ca[5], ca[6], ca[7]]);
        let vb = f32x8::new([cb[0], cb[1], cb[2], cb[3], cb[4], cb[5], cb[6], cb[7]]);
        dot += va * vb;
        mag_a += va * va;
        mag_b += vb * vb;
    }

    let mut dot = dot.reduce_add();
    let mut mag_a = mag_a.reduce_add();
    let mut mag_b = mag_b.reduce_add();

    for (&x, &y) in tail_a.iter().zip(tail_b) {
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }

    let denominator = (mag_a * mag_b).sqrt();
    if denominator < EPSILON {
        Some(0.0)
    } else {
        Some((dot / denominator).clamp(-1.0, 1.0))
    }
}

/// `1 - cosine`; 0 means identical direction, 2 means opposite.
pub fn cosine_distance(a: &[Number], b: &[Number]) -> Option<Number> {
    cosine_similarity_simd(a, b).map(|similarity| 1.0 - similarity)
}

pub fn normalize_vector(vector: &mut [Number]) {
    let magnitude: Number = vector.iter().map(|&x| x * x).sum::<Number>().sqrt();
    if magnitude > EPSILON {
        for x in vector.iter_mut() {
            *x /= magnitude;
        }
    }
}
