use crate::types::Embedding;

/// Element-wise mean of equal-dimension embeddings.
///
/// Returns `None` for an empty input. Mixed dimensions are a programming
/// error and panic.
pub fn aggregate(embeddings: &[Embedding]) -> Option<Embedding> {
    let (first, rest) = embeddings.split_first()?;
    let mut sum = first.values.clone();
    for e in rest {
        assert_eq!(
            e.dim(),
            sum.len(),
            "embedding dimension mismatch: {} vs {}",
            e.dim(),
            sum.len()
        );
        for (acc, v) in sum.iter_mut().zip(e.values.iter()) {
            *acc += v;
        }
    }
    let n = embeddings.len() as f64;
    Some(Embedding::new(sum.into_iter().map(|v| v / n).collect()))
}
