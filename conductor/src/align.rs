//! Fuzzy alignment of tool names and argument keys.
//!
//! Models misspell. The aligner repairs a tool invocation whose name or
//! argument keys do not exactly match the registry, by matching each query
//! against pools of known phrases: first lexically (normalized edit
//! similarity on a 0-100 scale), then semantically (cosine similarity of
//! embeddings). Embeddings come from an opaque [`Embedder`]; the optional
//! `fastembed` feature supplies a local implementation.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::chat::ToolCall;
use crate::tool::ToolArgs;

/// Error type for alignment and embedding.
#[derive(Debug, Error)]
pub enum AlignError {
    /// A pool with this name already exists.
    #[error("pool '{0}' already exists")]
    PoolExists(String),

    /// No pool with this name exists.
    #[error("pool '{0}' does not exist")]
    PoolMissing(String),

    /// The embedding backend failed.
    #[error("embedding failed: {0}")]
    Embedding(String),
}

/// Opaque producer of text embeddings.
pub trait Embedder: Send + Sync {
    /// Embed one text into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>, AlignError>;
}

fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// One set of known phrases with its matching thresholds.
///
/// The vector matrix is rebuilt lazily on the first match after an `add`;
/// rebuilds are expected to happen single-threaded during agent setup.
#[derive(Debug)]
pub struct AlignerPool {
    phrases: Vec<String>,
    vectors: Vec<Vec<f32>>,
    matrix: Vec<Vec<f32>>,
    dirty: bool,
    lexical_threshold: f64,
    semantic_threshold: f32,
}

impl AlignerPool {
    /// Create a pool with a lexical threshold (0-100) and a semantic
    /// threshold (0-1).
    #[must_use]
    pub fn new(lexical_threshold: f64, semantic_threshold: f32) -> Self {
        Self {
            phrases: Vec::new(),
            vectors: Vec::new(),
            matrix: Vec::new(),
            dirty: false,
            lexical_threshold,
            semantic_threshold,
        }
    }

    /// Number of phrases stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.phrases.len()
    }

    /// Whether the pool holds no phrases.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    /// Add a phrase, embedding it once at ingestion time.
    pub fn add(&mut self, embedder: &dyn Embedder, phrase: &str) -> Result<(), AlignError> {
        let vector = normalize(embedder.embed(phrase)?);
        self.phrases.push(phrase.to_owned());
        self.vectors.push(vector);
        self.dirty = true;
        Ok(())
    }

    fn rebuild_matrix(&mut self) {
        self.matrix = self.vectors.clone();
        self.dirty = false;
    }

    /// Match a query against the pool.
    ///
    /// 1. Exact hit returns the query unchanged.
    /// 2. The best lexical match wins if it reaches the lexical threshold.
    /// 3. Otherwise, if vectors exist, the embedding argmax wins if it
    ///    reaches the semantic threshold.
    /// 4. Otherwise there is no match.
    pub fn match_phrase(
        &mut self,
        embedder: &dyn Embedder,
        query: &str,
    ) -> Result<Option<String>, AlignError> {
        if self.phrases.iter().any(|p| p == query) {
            return Ok(Some(query.to_owned()));
        }

        let best_lexical = self
            .phrases
            .iter()
            .map(|p| (p, strsim::normalized_levenshtein(query, p) * 100.0))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((phrase, score)) = best_lexical
            && score >= self.lexical_threshold
        {
            debug!(query, phrase = %phrase, score, "lexical match");
            return Ok(Some(phrase.clone()));
        }

        if self.dirty {
            self.rebuild_matrix();
        }
        if self.matrix.is_empty() {
            return Ok(None);
        }

        let query_vector = normalize(embedder.embed(query)?);
        let best = self
            .matrix
            .iter()
            .enumerate()
            .map(|(idx, row)| (idx, dot(row, &query_vector)))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((idx, score)) = best {
            debug!(query, phrase = %self.phrases[idx], score, "semantic best");
            if score >= self.semantic_threshold {
                return Ok(Some(self.phrases[idx].clone()));
            }
        }
        Ok(None)
    }
}

/// A set of named [`AlignerPool`]s sharing one embedder.
pub struct Aligner {
    embedder: Arc<dyn Embedder>,
    pools: HashMap<String, AlignerPool>,
}

impl std::fmt::Debug for Aligner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aligner")
            .field("pools", &self.pools.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Aligner {
    /// Create an aligner around an embedder.
    #[must_use]
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            pools: HashMap::new(),
        }
    }

    /// Create a pool. Fails when the name is taken.
    pub fn create_pool(
        &mut self,
        name: &str,
        lexical_threshold: f64,
        semantic_threshold: f32,
    ) -> Result<(), AlignError> {
        if self.pools.contains_key(name) {
            return Err(AlignError::PoolExists(name.to_owned()));
        }
        self.pools.insert(
            name.to_owned(),
            AlignerPool::new(lexical_threshold, semantic_threshold),
        );
        Ok(())
    }

    /// Add a phrase to a pool.
    pub fn add_phrase(&mut self, pool: &str, phrase: &str) -> Result<(), AlignError> {
        let embedder = Arc::clone(&self.embedder);
        self.pools
            .get_mut(pool)
            .ok_or_else(|| AlignError::PoolMissing(pool.to_owned()))?
            .add(embedder.as_ref(), phrase)
    }

    /// Match a query inside a pool.
    pub fn match_in(&mut self, pool: &str, query: &str) -> Result<Option<String>, AlignError> {
        let embedder = Arc::clone(&self.embedder);
        self.pools
            .get_mut(pool)
            .ok_or_else(|| AlignError::PoolMissing(pool.to_owned()))?
            .match_phrase(embedder.as_ref(), query)
    }

    /// Whether a pool exists.
    #[must_use]
    pub fn has_pool(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }
}

const TOOLS_POOL: &str = "tools";

/// Aligner specialized for tool invocations.
///
/// Owns one pool for tool names and one pool per tool for its argument
/// names. Name thresholds are typically stricter lexically and looser
/// semantically than argument thresholds.
#[derive(Debug)]
pub struct ToolAligner {
    aligner: Aligner,
    args_lexical_threshold: f64,
    args_semantic_threshold: f32,
}

impl ToolAligner {
    /// Create a tool aligner with separate thresholds for tool names and
    /// tool arguments.
    #[must_use]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        name_lexical_threshold: f64,
        name_semantic_threshold: f32,
        args_lexical_threshold: f64,
        args_semantic_threshold: f32,
    ) -> Self {
        let mut aligner = Aligner::new(embedder);
        // Fresh aligner, the pool name cannot collide.
        let _ = aligner.create_pool(TOOLS_POOL, name_lexical_threshold, name_semantic_threshold);
        Self {
            aligner,
            args_lexical_threshold,
            args_semantic_threshold,
        }
    }

    fn args_pool_name(tool: &str) -> String {
        format!("{tool}#args")
    }

    /// Register a tool and its argument names.
    pub fn add_tool(&mut self, name: &str, args: &[String]) -> Result<(), AlignError> {
        self.aligner.add_phrase(TOOLS_POOL, name)?;
        let pool = Self::args_pool_name(name);
        self.aligner.create_pool(
            &pool,
            self.args_lexical_threshold,
            self.args_semantic_threshold,
        )?;
        for arg in args {
            self.aligner.add_phrase(&pool, arg)?;
        }
        Ok(())
    }

    /// Correct a possibly-misspelled tool call.
    ///
    /// The tool name resolves against the tools pool first; each argument
    /// key then resolves against that tool's argument pool. Any miss makes
    /// the whole correction fail. Argument values are never touched.
    pub fn align_tool_call(&mut self, call: &ToolCall) -> Result<Option<ToolCall>, AlignError> {
        let Some(name) = self.aligner.match_in(TOOLS_POOL, &call.name)? else {
            return Ok(None);
        };

        let pool = Self::args_pool_name(&name);
        let mut corrected = ToolArgs::new();
        for (key, value) in &call.args {
            let Some(matched) = self.aligner.match_in(&pool, key)? else {
                return Ok(None);
            };
            corrected.insert(matched, value.clone());
        }
        Ok(Some(ToolCall::new(name, corrected)))
    }
}

#[cfg(feature = "fastembed")]
pub use fast::FastEmbedder;

#[cfg(feature = "fastembed")]
mod fast {
    use std::sync::Mutex;

    use fastembed::{InitOptions, TextEmbedding};

    use super::{AlignError, Embedder};

    /// Local embedding model backed by `fastembed`.
    pub struct FastEmbedder {
        model: Mutex<TextEmbedding>,
    }

    impl std::fmt::Debug for FastEmbedder {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("FastEmbedder").finish_non_exhaustive()
        }
    }

    impl FastEmbedder {
        /// Load a model by its code, e.g. `BAAI/bge-small-en-v1.5`.
        pub fn new(model_code: &str) -> Result<Self, AlignError> {
            let info = TextEmbedding::list_supported_models()
                .into_iter()
                .find(|m| m.model_code == model_code)
                .ok_or_else(|| {
                    AlignError::Embedding(format!("unsupported embedding model '{model_code}'"))
                })?;
            let model = TextEmbedding::try_new(
                InitOptions::new(info.model).with_show_download_progress(false),
            )
            .map_err(|e| AlignError::Embedding(e.to_string()))?;
            Ok(Self {
                model: Mutex::new(model),
            })
        }
    }

    impl Embedder for FastEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, AlignError> {
            let model = self.model.lock().unwrap_or_else(|e| e.into_inner());
            let mut vectors = model
                .embed(vec![text.to_owned()], None)
                .map_err(|e| AlignError::Embedding(e.to_string()))?;
            vectors
                .pop()
                .ok_or_else(|| AlignError::Embedding("empty embedding batch".into()))
        }
    }
}
