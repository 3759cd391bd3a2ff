// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding provider seam.
//!
//! The engine treats embedding as a pure `text -> vector` function behind the
//! [`Embedder`] trait. Provider failures are recoverable: recall degrades to
//! lexical-only and ingest skips the vector write.

use async_trait::async_trait;

use crate::error::MemoroError;

/// Adapter for generating fixed-dimension embedding vectors from text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// The fixed output dimension of this provider.
    fn dimensions(&self) -> usize;

    /// Embed a single text into a unit-normalized vector of `dimensions()` length.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoroError>;
}

/// Vector width for a known embedding model name.
///
/// Unknown names fall back to 1536, the most common hosted default.
pub fn vector_dims_for_model(name: &str) -> usize {
    match name {
        "text-embedding-3-large" => 3072,
        "text-embedding-3-small" | "text-embedding-ada-002" => 1536,
        "all-MiniLM-L6-v2" | "bge-small-en-v1.5" => 384,
        "nomic-embed-text" | "all-mpnet-base-v2" => 768,
        _ => 1536,
    }
}

/// Deterministic offline embedder: hashed bag-of-tokens, L2-normalized.
///
/// Texts sharing tokens land near each other, which is enough for duplicate
/// suppression and for exercising the hybrid path without a network provider.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn bucket(&self, token: &str) -> usize {
        use std::hash::{DefaultHasher, Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        (hasher.finish() as usize) % self.dims
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoroError> {
        let mut vector = vec![0.0_f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[self.bucket(&token.to_lowercase())] += 1.0;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

/// Cosine similarity of two equal-length vectors.
///
/// For unit-normalized vectors this is the dot product.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vectors must have same length");
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("Fred prefers TypeScript").await.unwrap();
        let b = embedder.embed("Fred prefers TypeScript").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn hash_embedder_output_is_unit_normalized() {
        let embedder = HashEmbedder::new(32);
        let v = embedder.embed("some words to embed here").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "norm should be ~1.0, got {norm}");
    }

    #[tokio::test]
    async fn hash_embedder_empty_text_is_zero_vector() {
        let embedder = HashEmbedder::new(16);
        let v = embedder.embed("").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn overlapping_texts_are_closer_than_disjoint() {
        let embedder = HashEmbedder::new(128);
        let base = embedder.embed("deploy staging cluster tonight").await.unwrap();
        let near = embedder.embed("deploy staging cluster tomorrow").await.unwrap();
        let far = embedder.embed("quantum entanglement paper draft").await.unwrap();

        assert!(cosine_similarity(&base, &near) > cosine_similarity(&base, &far));
    }

    #[test]
    fn model_dims_lookup() {
        assert_eq!(vector_dims_for_model("text-embedding-3-large"), 3072);
        assert_eq!(vector_dims_for_model("text-embedding-3-small"), 1536);
        assert_eq!(vector_dims_for_model("all-MiniLM-L6-v2"), 384);
        assert_eq!(vector_dims_for_model("nomic-embed-text"), 768);
        assert_eq!(vector_dims_for_model("something-unknown"), 1536);
    }

    #[test]
    fn cosine_similarity_identical_and_orthogonal() {
        let v = vec![0.6, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);

        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < f32::EPSILON);
    }
}
