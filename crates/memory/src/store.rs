use std::collections::HashMap;
use std::num::NonZeroUsize;

use chrono::Utc;
use lru::LruCache;
use uuid::Uuid;

use crate::retrieval::cosine_similarity;
use crate::schema::{Experience, MemoryEntry};

/// Bounded experience store. Backed directly by [`lru::LruCache`] — unlike
/// the secondary-index pattern this is generalized from, there is no
/// database underneath; the cache *is* the store, since the engine carries
/// no requirement to persist experiments transactionally across restarts.
pub struct ExperienceMemory {
    cache: LruCache<Uuid, MemoryEntry>,
    /// canonical_summary → id, for exact-match dedup on admission.
    reverse_index: HashMap<String, Uuid>,
    pub similarity_threshold: f32,
}

fn is_successful(experience: &Experience) -> bool {
    experience
        .outcome
        .as_ref()
        .map(|o| o.issue_resolved && !o.has_complaint)
        .unwrap_or(false)
        && !experience.is_violation
}

fn compute_importance(experience: &Experience) -> f32 {
    let base = 0.5 + experience.reward.total / 100.0;
    let violation_term = if experience.is_violation { 0.3 } else { 0.0 };
    let success_term = if is_successful(experience) { 0.1 } else { 0.0 };
    (base + violation_term + success_term).clamp(0.0, 1.0)
}

pub enum Admission {
    Inserted(Uuid),
    Duplicate(Uuid),
}

impl ExperienceMemory {
    pub fn new(max_size: usize, similarity_threshold: f32) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).expect("max_size.max(1) is never zero");
        Self {
            cache: LruCache::new(capacity),
            reverse_index: HashMap::new(),
            similarity_threshold,
        }
    }

    /// Admits an experience, evicting the least-recently-accessed entry if
    /// the store is at capacity. Returns the existing entry's id without
    /// inserting when an entry with the same canonical summary already
    /// exists.
    pub fn admit(&mut self, experience: Experience, embedding: Vec<f32>) -> Admission {
        let summary = experience.canonical_summary();
        if let Some(&existing) = self.reverse_index.get(&summary) {
            return Admission::Duplicate(existing);
        }

        let importance = compute_importance(&experience);
        let id = Uuid::new_v4();
        let now = Utc::now();
        let entry = MemoryEntry {
            id,
            experience,
            embedding,
            importance,
            access_count: 0,
            created_at: now,
            last_access: now,
        };

        if self.cache.len() >= self.cache.cap().get() {
            if let Some((_, evicted)) = self.cache.pop_lru() {
                self.reverse_index.remove(&evicted.experience.canonical_summary());
            }
        }

        self.reverse_index.insert(summary, id);
        self.cache.put(id, entry);
        Admission::Inserted(id)
    }

    /// Returns up to `k` entries whose embedding has cosine similarity to
    /// `query_embedding` at or above `similarity_threshold`, most similar
    /// first. Updates access metadata (and LRU recency) for every entry
    /// returned.
    pub fn retrieve_similar(&mut self, query_embedding: &[f32], k: usize) -> Vec<MemoryEntry> {
        let mut scored: Vec<(Uuid, f32)> = self
            .cache
            .iter()
            .map(|(&id, entry)| (id, cosine_similarity(&entry.embedding, query_embedding)))
            .filter(|&(_, sim)| sim >= self.similarity_threshold)
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);

        let now = Utc::now();
        scored
            .into_iter()
            .filter_map(|(id, _)| {
                let entry = self.cache.get_mut(&id)?;
                entry.access_count += 1;
                entry.last_access = now;
                Some(entry.clone())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    pub fn all(&self) -> Vec<&MemoryEntry> {
        self.cache.iter().map(|(_, v)| v).collect()
    }
}

/// Snapshot of hit/miss counters for observability (exposed on the Control
/// API's metrics endpoint alongside strategy and reward statistics).
#[derive(Debug, Clone, Default)]
pub struct EmbeddingCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
    pub capacity: usize,
}

/// Exact-text-keyed cache in front of [`drift_gateway::ModelGateway::embed`].
/// Never caches the zero-vector sentinel an upstream failure would produce.
pub struct EmbeddingCache {
    cache: LruCache<String, Vec<f32>>,
    hits: u64,
    misses: u64,
    enabled: bool,
}

impl EmbeddingCache {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity.max(1)).expect("capacity.max(1) is never zero")),
            hits: 0,
            misses: 0,
            enabled,
        }
    }

    pub fn get(&mut self, text: &str) -> Option<Vec<f32>> {
        if !self.enabled {
            return None;
        }
        match self.cache.get(text) {
            Some(v) => {
                self.hits += 1;
                Some(v.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn put(&mut self, text: String, embedding: Vec<f32>) {
        if !self.enabled || embedding.is_empty() {
            return;
        }
        self.cache.put(text, embedding);
    }

    pub fn stats(&self) -> EmbeddingCacheStats {
        EmbeddingCacheStats {
            hits: self.hits,
            misses: self.misses,
            len: self.cache.len(),
            capacity: self.cache.cap().get(),
        }
    }
}
