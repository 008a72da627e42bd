//! Reference-template lookup for the Generate stage.
//!
//! Templates live in a JSON file of `{ "intent": ..., "template": ... }`
//! entries. Each entry is indexed by its intent text as a TF-IDF vector; a
//! query is embedded against the same vocabulary and the most similar entry
//! wins, provided it shares at least one token with the query.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::refine::errors::RefineError;

/// One library entry as stored on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptTemplate {
    pub intent: String,
    pub template: String,
}

/// Best template for a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateMatch {
    /// The entry's intent, reported as `retrieval_match`.
    pub label: String,
    pub template: String,
    pub score: f32,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str) -> Result<Option<TemplateMatch>, RefineError>;
}

/// Retriever that never matches. Used when no library is available.
pub struct NoRetrieval;

#[async_trait]
impl Retriever for NoRetrieval {
    async fn retrieve(&self, _query: &str) -> Result<Option<TemplateMatch>, RefineError> {
        Ok(None)
    }
}

// ── Index ────────────────────────────────────────────────────────────────────

struct Vocabulary {
    token_to_idx: HashMap<String, usize>,
    idf: Vec<f32>,
}

pub struct TemplateIndex {
    templates: Vec<PromptTemplate>,
    vocab: Vocabulary,
    vectors: Vec<Vec<f32>>,
}

impl TemplateIndex {
    pub fn new(templates: Vec<PromptTemplate>) -> Self {
        let corpus: Vec<&str> = templates.iter().map(|t| t.intent.as_str()).collect();
        let vocab = build_vocab(&corpus);
        let vectors = corpus.iter().map(|doc| tfidf_vector(doc, &vocab)).collect();
        Self {
            templates,
            vocab,
            vectors,
        }
    }

    pub fn load(path: &Path) -> Result<Self, RefineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RefineError::Retrieval(format!("cannot read {}: {e}", path.display()))
        })?;
        let templates: Vec<PromptTemplate> = serde_json::from_str(&raw).map_err(|e| {
            RefineError::Retrieval(format!("cannot parse {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), count = templates.len(), "Template library loaded");
        Ok(Self::new(templates))
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn best_match(&self, query: &str) -> Option<TemplateMatch> {
        let query_vec = tfidf_vector(query, &self.vocab);
        self.vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, cosine_similarity(&query_vec, v)))
            .filter(|(_, score)| *score > 0.0)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, score)| TemplateMatch {
                label: self.templates[i].intent.clone(),
                template: self.templates[i].template.clone(),
                score,
            })
    }
}

#[async_trait]
impl Retriever for TemplateIndex {
    async fn retrieve(&self, query: &str) -> Result<Option<TemplateMatch>, RefineError> {
        Ok(self.best_match(query))
    }
}

/// Load the library at `path`, degrading to [`NoRetrieval`] when it is
/// missing, unreadable or empty.
pub fn load_retriever(path: &Path) -> Arc<dyn Retriever> {
    match TemplateIndex::load(path) {
        Ok(index) if !index.is_empty() => Arc::new(index),
        Ok(_) => {
            warn!(path = %path.display(), "Template library is empty, retrieval disabled");
            Arc::new(NoRetrieval)
        }
        Err(e) => {
            warn!(error = %e, "Template library unavailable, retrieval disabled");
            Arc::new(NoRetrieval)
        }
    }
}

// ── TF-IDF helpers ───────────────────────────────────────────────────────────

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut mag_a = 0.0f32;
    let mut mag_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }

    let denom = mag_a.sqrt() * mag_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF      // kana
        | 0x3400..=0x4DBF    // CJK ext A
        | 0x4E00..=0x9FFF    // CJK unified
        | 0xAC00..=0xD7AF    // hangul
        | 0xF900..=0xFAFF)
}

/// Lowercase, split on non-alphanumerics, keep words of 2+ chars. Runs of
/// CJK characters have no word breaks, so they become overlapping bigrams.
fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut tokens = Vec::new();

    for word in lower.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        let mut latin = String::new();
        let mut cjk: Vec<char> = Vec::new();
        for c in word.chars() {
            if is_cjk(c) {
                flush_latin(&mut latin, &mut tokens);
                cjk.push(c);
            } else {
                flush_cjk(&mut cjk, &mut tokens);
                latin.push(c);
            }
        }
        flush_latin(&mut latin, &mut tokens);
        flush_cjk(&mut cjk, &mut tokens);
    }

    tokens
}

fn flush_latin(buf: &mut String, tokens: &mut Vec<String>) {
    if buf.chars().count() >= 2 {
        tokens.push(std::mem::take(buf));
    } else {
        buf.clear();
    }
}

fn flush_cjk(buf: &mut Vec<char>, tokens: &mut Vec<String>) {
    match buf.len() {
        0 => {}
        1 => tokens.push(buf[0].to_string()),
        _ => tokens.extend(buf.windows(2).map(|w| w.iter().collect::<String>())),
    }
    buf.clear();
}

fn build_vocab(corpus: &[&str]) -> Vocabulary {
    let num_docs = corpus.len().max(1);

    let mut doc_freq: HashMap<String, usize> = HashMap::new();
    for doc in corpus {
        let unique: HashSet<String> = tokenize(doc).into_iter().collect();
        for tok in unique {
            *doc_freq.entry(tok).or_insert(0) += 1;
        }
    }

    let mut entries: Vec<(String, usize)> = doc_freq.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut token_to_idx = HashMap::with_capacity(entries.len());
    let mut idf = Vec::with_capacity(entries.len());
    for (idx, (token, freq)) in entries.into_iter().enumerate() {
        token_to_idx.insert(token, idx);
        idf.push(((num_docs as f32) / (freq as f32)).ln() + 1.0);
    }

    Vocabulary { token_to_idx, idf }
}

fn tfidf_vector(text: &str, vocab: &Vocabulary) -> Vec<f32> {
    let dim = vocab.idf.len();
    if dim == 0 {
        return Vec::new();
    }

    let tokens = tokenize(text);
    let total = tokens.len().max(1) as f32;

    let mut v = vec![0.0f32; dim];
    for tok in &tokens {
        if let Some(&idx) = vocab.token_to_idx.get(tok.as_str()) {
            v[idx] += 1.0 / total;
        }
    }
    for (x, idf) in v.iter_mut().zip(vocab.idf.iter()) {
        *x *= idf;
    }

    let mag: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag > 0.0 {
        for x in &mut v {
            *x /= mag;
        }
    }
    v
}
