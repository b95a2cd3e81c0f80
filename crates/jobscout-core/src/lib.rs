//! Core job model and data-normalization utilities for Job Scout.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobscout-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    #[default]
    FullTime,
    PartTime,
    Contract,
    Internship,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::FullTime => "full-time",
            JobType::PartTime => "part-time",
            JobType::Contract => "contract",
            JobType::Internship => "internship",
        }
    }
}

/// A scraped job posting. Missing text fields deserialize as empty strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRecord {
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub requirements: Vec<String>,
    pub benefits: Vec<String>,
    pub job_type: JobType,
    pub remote: bool,
    pub source: String,
    pub source_url: String,
    pub posted_date: DateTime<Utc>,
    pub discovered_date: DateTime<Utc>,
    pub relevance_score: f64,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub salary_currency: String,
}

impl Default for JobRecord {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            title: String::new(),
            company: String::new(),
            location: String::new(),
            description: String::new(),
            requirements: Vec::new(),
            benefits: Vec::new(),
            job_type: JobType::FullTime,
            remote: false,
            source: String::new(),
            source_url: String::new(),
            posted_date: now,
            discovered_date: now,
            relevance_score: 0.0,
            salary_min: None,
            salary_max: None,
            salary_currency: "USD".to_string(),
        }
    }
}

impl JobRecord {
    pub fn new(
        title: impl Into<String>,
        company: impl Into<String>,
        location: impl Into<String>,
        description: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            company: company.into(),
            location: location.into(),
            description: description.into(),
            source_url: source_url.into(),
            ..Default::default()
        }
    }

    /// Payload shape expected by the remote job API.
    ///
    /// Timestamps are RFC 3339 strings and salary bounds are folded into a nested
    /// `salary` object that is only present when at least one bound is known.
    pub fn to_api_value(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "title": self.title,
            "company": self.company,
            "location": self.location,
            "description": self.description,
            "requirements": self.requirements,
            "benefits": self.benefits,
            "job_type": self.job_type.as_str(),
            "remote": self.remote,
            "source": self.source,
            "source_url": self.source_url,
            "posted_date": self.posted_date.to_rfc3339(),
            "discovered_date": self.discovered_date.to_rfc3339(),
            "relevance_score": self.relevance_score,
            "status": "new",
        });
        if self.salary_min.is_some() || self.salary_max.is_some() {
            value["salary"] = serde_json::json!({
                "min": self.salary_min,
                "max": self.salary_max,
                "currency": self.salary_currency,
            });
        }
        value
    }
}

static JOB_TYPE_MAPPINGS: &[(&str, JobType)] = &[
    ("full time", JobType::FullTime),
    ("fulltime", JobType::FullTime),
    ("full-time", JobType::FullTime),
    ("ft", JobType::FullTime),
    ("part time", JobType::PartTime),
    ("parttime", JobType::PartTime),
    ("part-time", JobType::PartTime),
    ("pt", JobType::PartTime),
    ("contract", JobType::Contract),
    ("contractor", JobType::Contract),
    ("freelance", JobType::Contract),
    ("temporary", JobType::Contract),
    ("temp", JobType::Contract),
    ("intern", JobType::Internship),
    ("internship", JobType::Internship),
];

pub fn normalize_job_type(text: &str) -> JobType {
    let lower = text.trim().to_lowercase();
    JOB_TYPE_MAPPINGS
        .iter()
        .find(|(label, _)| *label == lower)
        .map(|(_, job_type)| *job_type)
        .unwrap_or_default()
}

const REMOTE_INDICATORS: &[&str] = &[
    "remote",
    "work from home",
    "wfh",
    "telecommute",
    "distributed",
    "anywhere",
    "home office",
    "virtual",
    "remote-first",
];

pub fn detect_remote_work(text: &str) -> bool {
    let lower = text.to_lowercase();
    REMOTE_INDICATORS.iter().any(|needle| lower.contains(needle))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SalaryPeriod {
    Hour,
    Day,
    Month,
    #[default]
    Year,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalaryInfo {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub currency: String,
    pub period: SalaryPeriod,
}

impl Default for SalaryInfo {
    fn default() -> Self {
        Self {
            min: None,
            max: None,
            currency: "USD".to_string(),
            period: SalaryPeriod::Year,
        }
    }
}

const AMOUNT: &str = r"\$?\s*(\d[\d,]*(?:\.\d+)?)\s*(k)?";

static SALARY_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i){AMOUNT}\s*(?:-|–|—|to)\s*{AMOUNT}")).expect("salary range regex")
});
static SALARY_UP_TO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?i)up\s+to\s+{AMOUNT}")).expect("salary up-to regex"));
static SALARY_PLUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?i){AMOUNT}\+")).expect("salary plus regex"));
static SALARY_SINGLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?i){AMOUNT}")).expect("salary single regex"));
static SALARY_PERIOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(hourly|hour|hr|daily|day|monthly|month|mo|annually|annual|year|yr)\b")
        .expect("salary period regex")
});

fn parse_amount(digits: &str, thousands: bool) -> Option<f64> {
    let value = digits.replace(',', "").parse::<f64>().ok()?;
    Some(if thousands { value * 1000.0 } else { value })
}

fn salary_period(text: &str) -> SalaryPeriod {
    match SALARY_PERIOD_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
        .as_deref()
    {
        Some("hourly" | "hour" | "hr") => SalaryPeriod::Hour,
        Some("daily" | "day") => SalaryPeriod::Day,
        Some("monthly" | "month" | "mo") => SalaryPeriod::Month,
        _ => SalaryPeriod::Year,
    }
}

/// Parse free-form salary text such as `$50k - $70k`, `$25 - $35 per hour`,
/// `up to $90,000` or `$120,000+`.
pub fn parse_salary(text: &str) -> SalaryInfo {
    let text = text.trim();
    if text.is_empty() {
        return SalaryInfo::default();
    }

    let (min, max, thousands) = if let Some(c) = SALARY_RANGE_RE.captures(text) {
        let k_lo = c.get(2).is_some();
        let k_hi = c.get(4).is_some();
        // "$50 - $70k" means both bounds are in thousands.
        let thousands = k_lo || k_hi;
        (
            parse_amount(&c[1], thousands),
            parse_amount(&c[3], thousands),
            thousands,
        )
    } else if let Some(c) = SALARY_UP_TO_RE.captures(text) {
        let thousands = c.get(2).is_some();
        (None, parse_amount(&c[1], thousands), thousands)
    } else if let Some(c) = SALARY_PLUS_RE.captures(text) {
        let thousands = c.get(2).is_some();
        (parse_amount(&c[1], thousands), None, thousands)
    } else if let Some(c) = SALARY_SINGLE_RE.captures(text) {
        let thousands = c.get(2).is_some();
        (parse_amount(&c[1], thousands), None, thousands)
    } else {
        return SalaryInfo::default();
    };

    if min.is_none() && max.is_none() {
        return SalaryInfo::default();
    }

    SalaryInfo {
        min,
        max,
        currency: "USD".to_string(),
        period: if thousands {
            SalaryPeriod::Year
        } else {
            salary_period(text)
        },
    }
}

static REQUIREMENT_SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)(?:requirements?|qualifications?|skills?|experience|must have|you should have|we're looking for|ideal candidate|preferred):\s*(.*?)(?:\n\n|\n[a-z]|\z)",
    )
    .expect("requirement section regex")
});
static BENEFIT_SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)(?:benefits?|perks?|what we offer|we offer|compensation|package includes):\s*(.*?)(?:\n\n|\n[a-z]|\z)",
    )
    .expect("benefit section regex")
});
static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-•*]\s*").expect("bullet regex"));

const TECH_SKILLS: &[&str] = &[
    "Python", "JavaScript", "Java", "C++", "C#", "Ruby", "PHP", "Go", "Rust", "React", "Vue",
    "Angular", "Node.js", "Django", "Flask", "Spring", "AWS", "Azure", "GCP", "Docker",
    "Kubernetes", "Jenkins", "SQL", "PostgreSQL", "MySQL", "MongoDB", "Redis", "Git", "Linux",
    "Agile", "Scrum", "DevOps", "CI/CD", "Machine Learning", "AI", "Data Science", "TensorFlow",
    "PyTorch",
];

const COMMON_BENEFITS: &[&str] = &[
    "health insurance",
    "dental insurance",
    "vision insurance",
    "401k",
    "retirement plan",
    "pension",
    "paid time off",
    "pto",
    "vacation days",
    "flexible hours",
    "work from home",
    "remote work",
    "stock options",
    "equity",
    "bonus",
    "professional development",
    "training",
    "conferences",
    "gym membership",
    "wellness program",
    "free lunch",
    "snacks",
    "coffee",
];

fn section_items(section_re: &Regex, text: &str, min_len: usize) -> Vec<String> {
    let mut items = Vec::new();
    for caps in section_re.captures_iter(text) {
        let Some(body) = caps.get(1) else { continue };
        for line in body.as_str().lines() {
            let line = BULLET_RE.replace(line.trim(), "").trim().to_string();
            if line.chars().count() > min_len {
                items.push(line);
            }
        }
    }
    items
}

fn dedup_preserving_order(items: Vec<String>, limit: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
        if out.len() == limit {
            break;
        }
    }
    out
}

fn title_case(phrase: &str) -> String {
    phrase
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Requirement bullets found under requirement-style headers, falling back to a
/// keyword scan for well-known technologies. At most 10 entries.
pub fn extract_requirements(description: &str) -> Vec<String> {
    if description.trim().is_empty() {
        return Vec::new();
    }
    let mut items = section_items(&REQUIREMENT_SECTION_RE, description, 10);
    if items.is_empty() {
        let lower = description.to_lowercase();
        items = TECH_SKILLS
            .iter()
            .filter(|skill| lower.contains(&skill.to_lowercase()))
            .map(|skill| skill.to_string())
            .collect();
    }
    dedup_preserving_order(items, 10)
}

/// Benefit bullets found under benefit-style headers, falling back to a keyword
/// scan of common perks. At most 8 entries.
pub fn extract_benefits(description: &str) -> Vec<String> {
    if description.trim().is_empty() {
        return Vec::new();
    }
    let mut items = section_items(&BENEFIT_SECTION_RE, description, 5);
    if items.is_empty() {
        let lower = description.to_lowercase();
        items = COMMON_BENEFITS
            .iter()
            .filter(|benefit| lower.contains(*benefit))
            .map(|benefit| title_case(benefit))
            .collect();
    }
    dedup_preserving_order(items, 8)
}

static RELATIVE_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\s*(hour|day|week|month)s?\s+ago").expect("relative date regex")
});
static COMPACT_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s*([hdwm])\b").expect("compact date regex"));

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y", "%B %d, %Y", "%b %d, %Y", "%d %B %Y", "%d %b %Y"];

/// `None` when the offset or the shifted date is out of range.
fn shift_back(now: DateTime<Utc>, amount: i64, unit: &str) -> Option<DateTime<Utc>> {
    let offset = match unit {
        "hour" | "h" => Duration::try_hours(amount),
        "day" | "d" => Duration::try_days(amount),
        "week" | "w" => Duration::try_weeks(amount),
        "month" | "m" => amount.checked_mul(30).and_then(Duration::try_days),
        _ => None,
    }?;
    now.checked_sub_signed(offset)
}

/// Resolve relative ("3 days ago", "5h") and absolute posting dates against `now`.
/// Unrecognized input resolves to `now`.
pub fn parse_posted_date(text: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();
    if lower.is_empty() || lower == "now" || lower.contains("today") || lower.contains("just posted") {
        return now;
    }
    if lower.contains("yesterday") {
        return now - Duration::days(1);
    }
    if let Some(c) = RELATIVE_DATE_RE.captures(&lower) {
        if let Ok(amount) = c[1].parse::<i64>() {
            return shift_back(now, amount, &c[2]).unwrap_or(now);
        }
    }
    if let Some(c) = COMPACT_DATE_RE.captures(&lower) {
        if let Ok(amount) = c[1].parse::<i64>() {
            return shift_back(now, amount, &c[2]).unwrap_or(now);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                return Utc.from_utc_datetime(&midnight);
            }
        }
    }
    now
}

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static UNWANTED_CHARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s\-.,!?():/]").expect("unwanted chars regex"));

pub fn clean_text(text: &str) -> String {
    let collapsed = WHITESPACE_RE.replace_all(text.trim(), " ");
    UNWANTED_CHARS_RE.replace_all(&collapsed, "").into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationIssue {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("job title too short")]
    TitleTooShort,
    #[error("company name too short")]
    CompanyTooShort,
    #[error("job description too short")]
    DescriptionTooShort,
    #[error("invalid source URL format")]
    InvalidSourceUrl,
}

pub fn validate_job_record(record: &JobRecord) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    let required = [
        ("title", &record.title),
        ("company", &record.company),
        ("location", &record.location),
        ("description", &record.description),
        ("source_url", &record.source_url),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            issues.push(ValidationIssue::MissingField(name));
        }
    }
    if !record.title.is_empty() && record.title.chars().count() < 3 {
        issues.push(ValidationIssue::TitleTooShort);
    }
    if !record.company.is_empty() && record.company.chars().count() < 2 {
        issues.push(ValidationIssue::CompanyTooShort);
    }
    if !record.description.is_empty() && record.description.chars().count() < 50 {
        issues.push(ValidationIssue::DescriptionTooShort);
    }
    if !record.source_url.is_empty() {
        let url = &record.source_url;
        let has_scheme = ["http://", "https://"]
            .iter()
            .any(|scheme| url.starts_with(scheme) && url.len() > scheme.len());
        if !has_scheme {
            issues.push(ValidationIssue::InvalidSourceUrl);
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}
