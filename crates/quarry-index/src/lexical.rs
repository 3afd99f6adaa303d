//! In-process BM25 index over semantic units.
//!
//! Rebuilt from the `code_units` table at startup and kept in sync by the
//! indexer as files are committed or removed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use crate::category::{CATEGORY_FIELD, Category};
use crate::languages::Lang;
use crate::unit::{
    FILE_PATH_FIELD, LANGUAGE_FIELD, PROJECT_FIELD, ROOT_FIELD, SemanticUnit, UNIT_TYPE_FIELD,
    UnitType,
};

const K1: f64 = 1.5;
const B: f64 = 0.75;
const MIN_TOKEN_LEN: usize = 2;

/// Stored metadata for one unit, used both to filter lexical hits and to
/// hydrate search results.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitDoc {
    pub unit_id: String,
    pub root: String,
    pub file_path: String,
    pub name: String,
    pub unit_type: UnitType,
    pub language: Lang,
    pub category: Category,
    pub project: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
}

impl UnitDoc {
    #[must_use]
    pub fn from_unit(unit: &SemanticUnit, project: &str, root: &str) -> Self {
        Self {
            unit_id: unit.unit_id.clone(),
            root: root.to_owned(),
            file_path: unit.file_path.clone(),
            name: unit.name.clone(),
            unit_type: unit.unit_type,
            language: unit.language,
            category: Category::for_language(unit.language),
            project: project.to_owned(),
            start_line: unit.start_line,
            end_line: unit.end_line,
            content: unit.content.clone(),
        }
    }

    /// Vector-store payload for this unit.
    #[must_use]
    pub fn payload(&self) -> HashMap<String, serde_json::Value> {
        HashMap::from([
            ("unit_id".to_owned(), self.unit_id.clone().into()),
            (ROOT_FIELD.to_owned(), self.root.clone().into()),
            (FILE_PATH_FIELD.to_owned(), self.file_path.clone().into()),
            ("name".to_owned(), self.name.clone().into()),
            (UNIT_TYPE_FIELD.to_owned(), self.unit_type.as_str().into()),
            (LANGUAGE_FIELD.to_owned(), self.language.id().into()),
            (CATEGORY_FIELD.to_owned(), self.category.as_str().into()),
            (PROJECT_FIELD.to_owned(), self.project.clone().into()),
            ("start_line".to_owned(), self.start_line.into()),
            ("end_line".to_owned(), self.end_line.into()),
            ("content".to_owned(), self.content.clone().into()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexicalHit {
    pub unit_id: String,
    pub score: f64,
}

/// Lowercased terms of `text`. Identifiers are kept whole and additionally
/// split on underscores and camelCase boundaries.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
    {
        let whole = word.to_ascii_lowercase();
        let parts = identifier_parts(word);
        if whole.len() >= MIN_TOKEN_LEN {
            tokens.push(whole.clone());
        }
        if parts.len() > 1 {
            tokens.extend(
                parts
                    .into_iter()
                    .filter(|p| p.len() >= MIN_TOKEN_LEN && *p != whole),
            );
        }
    }
    tokens
}

fn identifier_parts(word: &str) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    let mut parts = Vec::new();
    let mut current = String::new();
    for (i, &c) in chars.iter().enumerate() {
        if c == '_' {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            continue;
        }
        if c.is_ascii_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(char::is_ascii_lowercase);
            if prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_is_lower)
            {
                parts.push(std::mem::take(&mut current));
            }
        }
        current.push(c.to_ascii_lowercase());
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

#[derive(Debug, Default)]
struct Corpus {
    docs: HashMap<String, UnitDoc>,
    doc_lengths: HashMap<String, usize>,
    doc_terms: HashMap<String, Vec<String>>,
    postings: HashMap<String, BTreeMap<String, u32>>,
    /// `(root, file_path)` to unit ids.
    by_file: HashMap<(String, String), Vec<String>>,
    total_len: usize,
}

impl Corpus {
    fn insert(&mut self, doc: UnitDoc) {
        self.remove_doc(&doc.unit_id);
        let mut tfs: HashMap<String, u32> = HashMap::new();
        let tokens = tokenize(&format!("{} {}", doc.name, doc.content));
        let len = tokens.len();
        for token in tokens {
            *tfs.entry(token).or_default() += 1;
        }
        let mut terms = Vec::with_capacity(tfs.len());
        for (term, tf) in tfs {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(doc.unit_id.clone(), tf);
            terms.push(term);
        }
        self.doc_terms.insert(doc.unit_id.clone(), terms);
        self.total_len += len;
        self.doc_lengths.insert(doc.unit_id.clone(), len);
        self.by_file
            .entry((doc.root.clone(), doc.file_path.clone()))
            .or_default()
            .push(doc.unit_id.clone());
        self.docs.insert(doc.unit_id.clone(), doc);
    }

    fn remove_doc(&mut self, unit_id: &str) -> bool {
        let Some(doc) = self.docs.remove(unit_id) else {
            return false;
        };
        let len = self.doc_lengths.remove(unit_id).unwrap_or(0);
        self.total_len = self.total_len.saturating_sub(len);
        for term in self.doc_terms.remove(unit_id).unwrap_or_default() {
            if let Some(docs) = self.postings.get_mut(&term) {
                docs.remove(unit_id);
                if docs.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
        let key = (doc.root, doc.file_path);
        if let Some(ids) = self.by_file.get_mut(&key) {
            ids.retain(|id| id != unit_id);
            if ids.is_empty() {
                self.by_file.remove(&key);
            }
        }
        true
    }

    fn remove_file(&mut self, root: &str, file_path: &str) -> usize {
        let key = (root.to_owned(), file_path.to_owned());
        let ids = self.by_file.remove(&key).unwrap_or_default();
        ids.iter().filter(|id| self.remove_doc(id)).count()
    }

    #[allow(clippy::cast_precision_loss)]
    fn idf(&self, doc_freq: usize) -> f64 {
        let n = self.docs.len() as f64;
        let df = doc_freq as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    #[allow(clippy::cast_precision_loss)]
    fn search(&self, query: &str, limit: usize, accept: &dyn Fn(&UnitDoc) -> bool) -> Vec<LexicalHit> {
        if self.docs.is_empty() || limit == 0 {
            return Vec::new();
        }
        let mut seen = HashSet::new();
        let terms: Vec<String> = tokenize(query)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let avg_len = (self.total_len as f64 / self.docs.len() as f64).max(1.0);
        let mut scores: HashMap<&str, f64> = HashMap::new();
        for term in &terms {
            let Some(posting) = self.postings.get(term) else {
                continue;
            };
            let idf = self.idf(posting.len());
            for (unit_id, &tf) in posting {
                let tf = f64::from(tf);
                let len = self.doc_lengths.get(unit_id).copied().unwrap_or(0) as f64;
                let norm = tf + K1 * (1.0 - B + B * len / avg_len);
                *scores.entry(unit_id.as_str()).or_default() += idf * tf * (K1 + 1.0) / norm;
            }
        }

        let mut hits: Vec<LexicalHit> = scores
            .into_iter()
            .filter(|(id, score)| *score > 0.0 && self.docs.get(*id).is_some_and(accept))
            .map(|(id, score)| LexicalHit {
                unit_id: id.to_owned(),
                score,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.unit_id.cmp(&b.unit_id))
        });
        hits.truncate(limit);
        hits
    }
}

/// Shared handle to the BM25 corpus. Cloning is cheap; all clones see the same
/// documents. The lock is never held across an await point.
#[derive(Debug, Clone, Default)]
pub struct LexicalIndex {
    inner: Arc<RwLock<Corpus>>,
}

impl LexicalIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_docs(docs: impl IntoIterator<Item = UnitDoc>) -> Self {
        let index = Self::new();
        {
            let mut corpus = index.write();
            for doc in docs {
                corpus.insert(doc);
            }
        }
        index
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Corpus> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Corpus> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace every document of `file_path` under `root` with `docs`.
    pub fn upsert_file_docs(&self, root: &str, file_path: &str, docs: Vec<UnitDoc>) {
        let mut corpus = self.write();
        corpus.remove_file(root, file_path);
        for doc in docs {
            corpus.insert(doc);
        }
    }

    /// Returns the number of documents removed.
    pub fn remove_file(&self, root: &str, file_path: &str) -> usize {
        self.write().remove_file(root, file_path)
    }

    /// Top `limit` documents accepted by `accept`, best first, ties by unit id.
    pub fn search(
        &self,
        query: &str,
        limit: usize,
        accept: impl Fn(&UnitDoc) -> bool,
    ) -> Vec<LexicalHit> {
        self.read().search(query, limit, &accept)
    }

    #[must_use]
    pub fn get(&self, unit_id: &str) -> Option<UnitDoc> {
        self.read().docs.get(unit_id).cloned()
    }

    #[must_use]
    pub fn unit_ids_for_file(&self, root: &str, file_path: &str) -> Vec<String> {
        let key = (root.to_owned(), file_path.to_owned());
        let mut ids = self.read().by_file.get(&key).cloned().unwrap_or_default();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().docs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.read().by_file.len()
    }

    pub fn clear(&self) {
        *self.write() = Corpus::default();
    }
}
