/// Similarity scoring used by [`crate::store::ExperienceMemory::retrieve_similar`].
///
/// Deliberately does **not** clamp to `[0, 1]` the way a tier/recency blended
/// score would: cosine similarity is mathematically defined on `[-1, 1]` and
/// callers (and tests) rely on the sign to distinguish "opposite" from
/// "unrelated".
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}
