//! Duplicate detection for scraped job postings.
//!
//! A [`DuplicateDetector`] classifies each incoming [`JobRecord`] exactly once, in
//! arrival order, against every job it has already accepted as unique. Three
//! strategies run in priority order and the first hit wins:
//!
//! 1. exact: primary hash over lower-cased title, company and the raw source URL;
//! 2. fuzzy: weighted similarity over normalized title/company/location signatures;
//! 3. content: hash of the normalized description (descriptions of 100+ chars only).
//!
//! Fuzzy and content checks scan every tracked job, so a run costs O(n²)
//! comparisons. Per-run volumes are in the low thousands.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::LazyLock;

use indexmap::IndexMap;
use jobscout_core::JobRecord;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

pub const CRATE_NAME: &str = "jobscout-dedup";

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

/// Descriptions shorter than this (in chars) never take part in content matching.
pub const MIN_CONTENT_LENGTH: usize = 100;

const TITLE_WEIGHT: f64 = 0.40;
const COMPANY_WEIGHT: f64 = 0.30;
const LOCATION_WEIGHT: f64 = 0.10;
const TITLE_WORDS_WEIGHT: f64 = 0.15;
const COMPANY_WORDS_WEIGHT: f64 = 0.05;

// ---------------------------------------------------------------------------
// Text normalization
// ---------------------------------------------------------------------------

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static SENIORITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:sr|senior|jr|junior)\b\.?").expect("seniority regex"));
static LEVEL_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:i|ii|iii|iv|v|1|2|3|4|5)\b").expect("level suffix regex"));
static LEVEL_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:level|lvl)\s*\d+\b").expect("level number regex"));
const COMPANY_SUFFIXES: &[&str] = &["inc", "corp", "corporation", "llc", "ltd", "limited", "co", "company"];

static COMPANY_SUFFIX_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    COMPANY_SUFFIXES
        .iter()
        .map(|suffix| Regex::new(&format!(r"\b{suffix}\.?$")).expect("company suffix regex"))
        .collect()
});
static REMOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:remote|work from home|wfh)\b").expect("remote regex"));
static US_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:usa|united states|us)\b").expect("us regex"));
static HTML_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("html tag regex"));

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is",
    "are", "was", "were", "be", "been", "being", "have", "has", "had", "do", "does", "did", "will",
    "would", "could", "should",
];

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE_RE.replace_all(text, " ").trim().to_string()
}

/// Lower-case, drop seniority words, level numerals and `level N` markers.
pub fn normalize_title(title: &str) -> String {
    let lower = title.trim().to_lowercase();
    if lower.is_empty() {
        return String::new();
    }
    let without_seniority = SENIORITY_RE.replace_all(&lower, "");
    let without_suffix = LEVEL_SUFFIX_RE.replace_all(&without_seniority, "");
    let without_level = LEVEL_NUMBER_RE.replace_all(&without_suffix, "");
    collapse_whitespace(&without_level)
}

/// Lower-case and strip trailing legal-entity suffixes (`Inc.`, `Corp`, `LLC`, ...).
///
/// Each suffix pattern is tried once, in `COMPANY_SUFFIXES` order, against the
/// untrimmed remainder, so `Tech Corp Inc.` keeps its `corp`.
pub fn normalize_company(company: &str) -> String {
    let mut normalized = company.trim().to_lowercase();
    for suffix in COMPANY_SUFFIX_RES.iter() {
        normalized = suffix.replace(&normalized, "").into_owned();
    }
    collapse_whitespace(&normalized)
}

/// Lower-case and fold remote and United States spellings into `remote` / `us`.
pub fn normalize_location(location: &str) -> String {
    let lower = location.trim().to_lowercase();
    if lower.is_empty() {
        return String::new();
    }
    let remote = REMOTE_RE.replace_all(&lower, "remote");
    let country = US_RE.replace_all(&remote, "us");
    collapse_whitespace(&country)
}

/// Lower-case, strip HTML tags, drop stop words and tokens of two chars or fewer.
pub fn normalize_description(description: &str) -> String {
    let lower = description.to_lowercase();
    let without_tags = HTML_TAG_RE.replace_all(&lower, "");
    without_tags
        .split_whitespace()
        .filter(|word| word.chars().count() > 2 && !STOP_WORDS.contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Signatures and hashes
// ---------------------------------------------------------------------------

/// Normalized-field representation of a job used for fuzzy comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSignature {
    pub normalized_title: String,
    pub normalized_company: String,
    pub normalized_location: String,
    pub title_words: BTreeSet<String>,
    pub company_words: BTreeSet<String>,
}

fn word_set(text: &str) -> BTreeSet<String> {
    text.split_whitespace().map(str::to_string).collect()
}

pub fn build_signature(record: &JobRecord) -> JobSignature {
    let normalized_title = normalize_title(&record.title);
    let normalized_company = normalize_company(&record.company);
    let normalized_location = normalize_location(&record.location);
    JobSignature {
        title_words: word_set(&normalized_title),
        company_words: word_set(&normalized_company),
        normalized_title,
        normalized_company,
        normalized_location,
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Digest of lower-cased title, lower-cased company and the raw source URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobHash(String);

impl JobHash {
    pub fn of(record: &JobRecord) -> Self {
        let primary = format!(
            "{}|{}|{}",
            record.title.trim().to_lowercase(),
            record.company.trim().to_lowercase(),
            record.source_url
        );
        Self(sha256_hex(&primary))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest of a normalized description.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// `None` when the description is too short to take part in content matching.
    pub fn of(description: &str) -> Option<Self> {
        if description.chars().count() < MIN_CONTENT_LENGTH {
            return None;
        }
        Some(Self(sha256_hex(&normalize_description(description))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Scorers
// ---------------------------------------------------------------------------

/// Similarity in [0, 1] and whether it clears the scorer's threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub similarity: f64,
    pub is_match: bool,
}

impl Score {
    fn binary(is_match: bool) -> Self {
        Self {
            similarity: if is_match { 1.0 } else { 0.0 },
            is_match,
        }
    }
}

/// Earliest longest common block as `(start_a, start_b, len)`.
fn longest_common_block(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for i in 0..a.len() {
        for j in 0..b.len() {
            cur[j + 1] = if a[i] == b[j] { prev[j] + 1 } else { 0 };
            let len = cur[j + 1];
            if len > best.2 {
                best = (i + 1 - len, j + 1 - len, len);
            }
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    best
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let mut total = 0;
    let mut pending = vec![(0, a.len(), 0, b.len())];
    while let Some((a_lo, a_hi, b_lo, b_hi)) = pending.pop() {
        let (i, j, len) = longest_common_block(&a[a_lo..a_hi], &b[b_lo..b_hi]);
        if len == 0 {
            continue;
        }
        total += len;
        let (i, j) = (a_lo + i, b_lo + j);
        pending.push((a_lo, i, b_lo, j));
        pending.push((i + len, a_hi, j + len, b_hi));
    }
    total
}

/// Ratcliff/Obershelp (gestalt) similarity: `2 * matched / (len_a + len_b)`.
///
/// Two empty strings are identical (1.0); one empty string scores 0.0.
pub fn string_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    // Unlike difflib, the inputs are sorted first: gestalt matching breaks
    // longest-block ties by position, and sorting keeps the score commutative.
    let (a, b) = if a <= b { (a, b) } else { (b, a) };
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let matched = matching_chars(&a, &b);
    (2 * matched) as f64 / (a.len() + b.len()) as f64
}

/// `|A ∩ B| / max(|A ∪ B|, 1)`; 0.0 when both sets are empty.
pub fn word_jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union.max(1) as f64
}

/// Weighted signature similarity. Commutative and always within [0, 1].
pub fn fuzzy_similarity(a: &JobSignature, b: &JobSignature) -> f64 {
    let similarity = TITLE_WEIGHT * string_similarity(&a.normalized_title, &b.normalized_title)
        + COMPANY_WEIGHT * string_similarity(&a.normalized_company, &b.normalized_company)
        + LOCATION_WEIGHT * string_similarity(&a.normalized_location, &b.normalized_location)
        + TITLE_WORDS_WEIGHT * word_jaccard(&a.title_words, &b.title_words)
        + COMPANY_WORDS_WEIGHT * word_jaccard(&a.company_words, &b.company_words);
    similarity.clamp(0.0, 1.0)
}

pub fn exact_score(a: &JobHash, b: &JobHash) -> Score {
    Score::binary(a == b)
}

pub fn fuzzy_score(a: &JobSignature, b: &JobSignature, threshold: f64) -> Score {
    let similarity = fuzzy_similarity(a, b);
    Score {
        similarity,
        is_match: similarity >= threshold,
    }
}

/// Binary: identical normalized content or nothing. Missing hashes (short
/// descriptions) never match.
pub fn content_score(a: Option<&ContentHash>, b: Option<&ContentHash>) -> Score {
    match (a, b) {
        (Some(a), Some(b)) => Score::binary(a == b),
        _ => Score::binary(false),
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Fuzzy,
    Content,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchType::Exact => "exact",
            MatchType::Fuzzy => "fuzzy",
            MatchType::Content => "content",
        })
    }
}

/// `job1_hash` is the incoming job, `job2_hash` the tracked job it matched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateMatch {
    pub job1_hash: JobHash,
    pub job2_hash: JobHash,
    pub similarity_score: f64,
    pub match_type: MatchType,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Unique,
    Duplicate(DuplicateMatch),
}

impl Verdict {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Verdict::Duplicate(_))
    }

    pub fn duplicate_match(&self) -> Option<&DuplicateMatch> {
        match self {
            Verdict::Unique => None,
            Verdict::Duplicate(m) => Some(m),
        }
    }

    /// `unique`, `exact_match`, `fuzzy_match_0.91` or `content_match_1.00`.
    pub fn reason(&self) -> String {
        match self {
            Verdict::Unique => "unique".to_string(),
            Verdict::Duplicate(m) => match m.match_type {
                MatchType::Exact => "exact_match".to_string(),
                MatchType::Fuzzy => format!("fuzzy_match_{:.2}", m.similarity_score),
                MatchType::Content => format!("content_match_{:.2}", m.similarity_score),
            },
        }
    }
}

impl From<Verdict> for (bool, String) {
    fn from(verdict: Verdict) -> Self {
        (verdict.is_duplicate(), verdict.reason())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectorStats {
    pub total_jobs_tracked: usize,
    pub fuzzy_signatures: usize,
    pub content_hashes: usize,
    pub similarity_threshold: f64,
}

/// Stateful classifier over one scraping run.
///
/// Not synchronized: feed it sequentially (for example after joining concurrent
/// scrapers) or wrap it in a mutex.
#[derive(Debug, Clone)]
pub struct DuplicateDetector {
    similarity_threshold: f64,
    exact_hashes: HashSet<JobHash>,
    signatures: IndexMap<JobHash, JobSignature>,
    content_hashes: IndexMap<JobHash, ContentHash>,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::with_threshold(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl DuplicateDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Threshold is clamped into [0, 1]; NaN falls back to the default.
    pub fn with_threshold(similarity_threshold: f64) -> Self {
        let similarity_threshold = if similarity_threshold.is_nan() {
            DEFAULT_SIMILARITY_THRESHOLD
        } else {
            similarity_threshold.clamp(0.0, 1.0)
        };
        Self {
            similarity_threshold,
            exact_hashes: HashSet::new(),
            signatures: IndexMap::new(),
            content_hashes: IndexMap::new(),
        }
    }

    pub fn similarity_threshold(&self) -> f64 {
        self.similarity_threshold
    }

    /// Classify `record` against every job accepted so far. Unique jobs are
    /// tracked until [`clear`](Self::clear); duplicates leave state untouched.
    pub fn add_job(&mut self, record: &JobRecord) -> Verdict {
        let job_hash = JobHash::of(record);

        if self.exact_hashes.contains(&job_hash) {
            debug!(title = %record.title, company = %record.company, "exact duplicate");
            return Verdict::Duplicate(DuplicateMatch {
                job1_hash: job_hash.clone(),
                job2_hash: job_hash,
                similarity_score: 1.0,
                match_type: MatchType::Exact,
                confidence: 1.0,
            });
        }

        let signature = build_signature(record);
        if let Some(found) = self.find_fuzzy_duplicate(&job_hash, &signature) {
            debug!(
                title = %record.title,
                company = %record.company,
                similarity = found.similarity_score,
                "fuzzy duplicate"
            );
            return Verdict::Duplicate(found);
        }

        let content_hash = ContentHash::of(&record.description);
        if let Some(found) = self.find_content_duplicate(&job_hash, content_hash.as_ref()) {
            debug!(title = %record.title, company = %record.company, "content duplicate");
            return Verdict::Duplicate(found);
        }

        self.exact_hashes.insert(job_hash.clone());
        if let Some(content_hash) = content_hash {
            self.content_hashes.insert(job_hash.clone(), content_hash);
        }
        self.signatures.insert(job_hash, signature);
        Verdict::Unique
    }

    fn find_fuzzy_duplicate(
        &self,
        job_hash: &JobHash,
        signature: &JobSignature,
    ) -> Option<DuplicateMatch> {
        self.signatures
            .iter()
            .filter(|(tracked_hash, _)| *tracked_hash != job_hash)
            .find_map(|(tracked_hash, tracked)| {
                let score = fuzzy_score(signature, tracked, self.similarity_threshold);
                score.is_match.then(|| DuplicateMatch {
                    job1_hash: job_hash.clone(),
                    job2_hash: tracked_hash.clone(),
                    similarity_score: score.similarity,
                    match_type: MatchType::Fuzzy,
                    confidence: score.similarity,
                })
            })
    }

    fn find_content_duplicate(
        &self,
        job_hash: &JobHash,
        content_hash: Option<&ContentHash>,
    ) -> Option<DuplicateMatch> {
        let content_hash = content_hash?;
        self.content_hashes
            .iter()
            .filter(|(tracked_hash, _)| *tracked_hash != job_hash)
            .find_map(|(tracked_hash, tracked)| {
                let score = content_score(Some(content_hash), Some(tracked));
                score.is_match.then(|| DuplicateMatch {
                    job1_hash: job_hash.clone(),
                    job2_hash: tracked_hash.clone(),
                    similarity_score: score.similarity,
                    match_type: MatchType::Content,
                    confidence: score.similarity,
                })
            })
    }

    /// Keep only the records classified unique, preserving order.
    pub fn remove_duplicates(&mut self, records: Vec<JobRecord>) -> Vec<JobRecord> {
        let total = records.len();
        let unique: Vec<JobRecord> = records
            .into_iter()
            .filter(|record| !self.add_job(record).is_duplicate())
            .collect();
        debug!(total, unique = unique.len(), "duplicates removed");
        unique
    }

    pub fn get_stats(&self) -> DetectorStats {
        DetectorStats {
            total_jobs_tracked: self.exact_hashes.len(),
            fuzzy_signatures: self.signatures.len(),
            content_hashes: self.content_hashes.len(),
            similarity_threshold: self.similarity_threshold,
        }
    }

    pub fn clear(&mut self) {
        self.exact_hashes.clear();
        self.signatures.clear();
        self.content_hashes.clear();
        info!("duplicate detector cleared");
    }
}
