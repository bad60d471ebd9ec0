//! Index observers.
//!
//! Both indexes subscribe to engine apply events and stay off the
//! durability path entirely: nothing here is persisted, and on startup they
//! are re-driven from a full scan of the recovered map.

use drift_kv::{ApplyObserver, StateEngine};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Embedding dimension for the similarity index.
const EMBED_DIM: usize = 64;

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Inverted full-text index over record values.
#[derive(Default)]
pub struct TextIndex {
    /// token -> keys whose value contains it
    postings: RwLock<HashMap<String, BTreeSet<String>>>,
    /// key -> tokens currently indexed for it
    terms: RwLock<HashMap<String, Vec<String>>>,
}

impl TextIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys whose value contains every query token, sorted.
    pub fn search(&self, query: &str) -> Vec<String> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let postings = self.postings.read();
        let mut result: Option<BTreeSet<String>> = None;
        for token in &tokens {
            let keys = match postings.get(token) {
                Some(keys) => keys,
                None => return Vec::new(),
            };
            result = Some(match result {
                Some(acc) => acc.intersection(keys).cloned().collect(),
                None => keys.clone(),
            });
        }
        result.map(|set| set.into_iter().collect()).unwrap_or_default()
    }
}

impl ApplyObserver for TextIndex {
    fn on_apply(&self, key: &str, value: Option<&str>) {
        let mut terms = self.terms.write();
        let mut postings = self.postings.write();

        if let Some(old_tokens) = terms.remove(key) {
            for token in old_tokens {
                if let Some(keys) = postings.get_mut(&token) {
                    keys.remove(key);
                    if keys.is_empty() {
                        postings.remove(&token);
                    }
                }
            }
        }

        if let Some(value) = value {
            let tokens = tokenize(value);
            for token in &tokens {
                postings
                    .entry(token.clone())
                    .or_default()
                    .insert(key.to_string());
            }
            terms.insert(key.to_string(), tokens);
        }
    }
}

fn embed(text: &str) -> [f32; EMBED_DIM] {
    let mut vector = [0f32; EMBED_DIM];
    let lower = text.to_lowercase();
    let bytes = lower.as_bytes();

    if bytes.len() < 3 {
        let mut hasher = DefaultHasher::new();
        bytes.hash(&mut hasher);
        vector[(hasher.finish() % EMBED_DIM as u64) as usize] += 1.0;
    } else {
        for gram in bytes.windows(3) {
            let mut hasher = DefaultHasher::new();
            gram.hash(&mut hasher);
            vector[(hasher.finish() % EMBED_DIM as u64) as usize] += 1.0;
        }
    }

    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
    vector
}

fn cosine(a: &[f32; EMBED_DIM], b: &[f32; EMBED_DIM]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Hashed character-trigram similarity index over record values.
#[derive(Default)]
pub struct SimilarityIndex {
    vectors: RwLock<HashMap<String, [f32; EMBED_DIM]>>,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Top `k` keys by cosine similarity to the query, best first. Ties
    /// break on key so results are stable.
    pub fn search(&self, query: &str, k: usize) -> Vec<(String, f32)> {
        let query_vec = embed(query);
        let vectors = self.vectors.read();

        let mut scored: Vec<(String, f32)> = vectors
            .iter()
            .map(|(key, vec)| (key.clone(), cosine(&query_vec, vec)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }
}

impl ApplyObserver for SimilarityIndex {
    fn on_apply(&self, key: &str, value: Option<&str>) {
        let mut vectors = self.vectors.write();
        match value {
            Some(value) => {
                vectors.insert(key.to_string(), embed(value));
            }
            None => {
                vectors.remove(key);
            }
        }
    }
}

/// The pair of observers behind `--enable-indexes`.
pub struct Indexes {
    pub text: Arc<TextIndex>,
    pub similar: Arc<SimilarityIndex>,
}

impl Indexes {
    pub fn new() -> Self {
        Self {
            text: Arc::new(TextIndex::new()),
            similar: Arc::new(SimilarityIndex::new()),
        }
    }

    /// Register both observers and seed them from the recovered map.
    pub fn attach(self: &Arc<Self>, engine: &StateEngine) {
        engine.register_observer(self.text.clone());
        engine.register_observer(self.similar.clone());
        engine.for_each_visible(|key, value| {
            self.text.on_apply(key, Some(value));
            self.similar.on_apply(key, Some(value));
        });
    }
}

impl Default for Indexes {
    fn default() -> Self {
        Self::new()
    }
}
