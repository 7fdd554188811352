//! Angular distance helpers shared by the forest builder and the query path.
//!
//! Vectors are unit-normalised once at build time (and once per query), so the
//! hot path only needs a dot product: for unit vectors `a` and `b`,
//! `|a - b|^2 = 2 - 2 * dot(a, b)`.

/// Epsilon for floating-point comparisons.
pub(crate) const EPSILON: f32 = 1e-10;

/// Computes the dot product of two equal-length vectors.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Computes the euclidean norm of a vector.
#[inline]
pub fn norm(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Computes cosine similarity between two vectors.
///
/// Returns a value in `[-1, 1]`, or 0.0 when either vector has zero length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = norm(a);
    let norm_b = norm(b);

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot(a, b) / (norm_a * norm_b)
    }
}

/// Angular distance from a dot product of two unit vectors.
///
/// Clamped at zero so rounding never produces a NaN for identical vectors.
#[inline]
pub fn angular_distance_from_dot(dot_product: f32) -> f32 {
    (2.0 - 2.0 * dot_product).max(0.0).sqrt()
}

/// Angular distance between two arbitrary (not necessarily unit) vectors.
///
/// Invariant to magnitude: `angular_distance(a, 3a) == 0`.
pub fn angular_distance(a: &[f32], b: &[f32]) -> f32 {
    angular_distance_from_dot(cosine_similarity(a, b))
}

/// Normalizes a vector in-place to unit length.
///
/// Returns false (leaving the vector untouched) when its norm is too small.
pub fn normalize_vector(vector: &mut [f32]) -> bool {
    let n = norm(vector);
    if n <= EPSILON {
        return false;
    }
    for value in vector.iter_mut() {
        *value /= n;
    }
    true
}

/// Creates a normalized copy of a vector, or `None` for a zero vector.
pub fn normalize_vector_copy(vector: &[f32]) -> Option<Vec<f32>> {
    let mut normalized = vector.to_vec();
    normalize_vector(&mut normalized).then_some(normalized)
}
