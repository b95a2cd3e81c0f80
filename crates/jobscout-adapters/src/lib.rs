//! Source adapters: turn listing pages from job boards and company career pages
//! into [`JobRecord`]s.

use async_trait::async_trait;
use chrono::Utc;
use jobscout_core::{
    clean_text, detect_remote_work, normalize_job_type, parse_posted_date, parse_salary, JobRecord,
    JobType,
};
use jobscout_http::{resolve_url, url_with_query, FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobscout-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

/// What to look for, loaded from `search.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    pub job_titles: Vec<String>,
    pub keywords: Vec<String>,
    pub locations: Vec<String>,
    pub remote_ok: bool,
    pub max_pages: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            job_titles: Vec::new(),
            keywords: Vec::new(),
            locations: Vec::new(),
            remote_ok: false,
            max_pages: 1,
        }
    }
}

impl SearchParams {
    fn terms(&self) -> impl Iterator<Item = &String> {
        self.job_titles.iter().chain(self.keywords.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    RemoteOk,
    WeWorkRemotely,
    Indeed,
    #[serde(rename = "linkedin")]
    LinkedIn,
    Company,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    fn search_urls(&self, params: &SearchParams) -> Vec<String>;

    fn parse_listing(&self, html: &str, page_url: &str) -> Result<Vec<JobRecord>, AdapterError>;

    /// Post-parse filter applied by [`scrape`](Self::scrape).
    fn retain_relevant(&self, jobs: Vec<JobRecord>, _params: &SearchParams) -> Vec<JobRecord> {
        jobs
    }

    async fn scrape(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        params: &SearchParams,
    ) -> Result<Vec<JobRecord>, AdapterError> {
        let mut jobs = Vec::new();
        for url in self.search_urls(params).into_iter().take(params.max_pages.max(1)) {
            let page = http.fetch_text(run_id, self.source_id(), &url).await?;
            let parsed = self.parse_listing(&page.body, &page.final_url)?;
            debug!(source_id = self.source_id(), %url, jobs = parsed.len(), "parsed listing page");
            jobs.extend(parsed);
        }
        let jobs = self.retain_relevant(jobs, params);
        info!(source_id = self.source_id(), jobs = jobs.len(), "scrape complete");
        Ok(jobs)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn parse_selectors(selectors: &[String]) -> Result<Vec<Selector>, AdapterError> {
    selectors.iter().map(|s| parse_selector(s)).collect()
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<String>();
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element.select(selector).find_map(element_text)
}

fn first_text_any(element: ElementRef<'_>, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|selector| first_text(element, selector))
}

fn first_href(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .find_map(|e| e.value().attr("href"))
        .map(str::to_string)
}

fn has_any_class(element: ElementRef<'_>, classes: &[&str]) -> bool {
    element
        .value()
        .attr("class")
        .is_some_and(|value| value.split_whitespace().any(|c| classes.contains(&c)))
}

struct Listing<'a> {
    source_id: &'a str,
    title: String,
    company: String,
    url: Option<String>,
}

impl Listing<'_> {
    /// `None` when title, company or URL is missing.
    fn into_record(self, location: String, description: String) -> Option<JobRecord> {
        let title = clean_text(&self.title);
        let company = clean_text(&self.company);
        match self.url {
            Some(url) if !title.is_empty() && !company.is_empty() => {
                let mut record = JobRecord::new(title, company, location, clean_text(&description), url);
                record.source = self.source_id.to_string();
                Some(record)
            }
            _ => {
                debug!(
                    source_id = self.source_id,
                    title = %self.title,
                    company = %self.company,
                    "skipping listing with missing title, company or url"
                );
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RemoteOK
// ---------------------------------------------------------------------------

pub const REMOTE_OK_BASE_URL: &str = "https://remoteok.com";

#[derive(Debug, Clone)]
pub struct RemoteOkAdapter {
    source_id: String,
    base_url: String,
}

impl Default for RemoteOkAdapter {
    fn default() -> Self {
        Self::new("remote_ok")
    }
}

impl RemoteOkAdapter {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            base_url: REMOTE_OK_BASE_URL.to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for RemoteOkAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    /// RemoteOK browses by tag: the first search term becomes a `+`-joined path.
    fn search_urls(&self, params: &SearchParams) -> Vec<String> {
        match params.terms().next() {
            Some(term) => {
                let tag = term.to_lowercase().split_whitespace().collect::<Vec<_>>().join("+");
                vec![format!("{}/{}", self.base_url, tag)]
            }
            None => vec![self.base_url.clone()],
        }
    }

    fn parse_listing(&self, html: &str, page_url: &str) -> Result<Vec<JobRecord>, AdapterError> {
        let document = Html::parse_document(html);
        let row_sel = parse_selector("#jobsboard tr.job")?;
        let link_sel = parse_selector("td.company a[href]")?;
        let title_sel = parse_selector("td.company h2")?;
        let company_sel = parse_selector("td.company h3")?;
        let tag_sel = parse_selector(".tags .tag")?;
        let salary_sel = parse_selector(".salary")?;
        let time_sel = parse_selector("td.time time")?;
        let now = Utc::now();

        let mut jobs = Vec::new();
        for row in document.select(&row_sel) {
            let tags: Vec<String> = row.select(&tag_sel).filter_map(element_text).collect();
            let company = first_text(row, &company_sel).unwrap_or_default();
            let listing = Listing {
                source_id: &self.source_id,
                title: first_text(row, &title_sel).unwrap_or_default(),
                company: company.clone(),
                url: first_href(row, &link_sel).and_then(|href| resolve_url(page_url, &href)),
            };

            let mut description = format!("Remote position at {company}");
            if !tags.is_empty() {
                description.push_str(&format!(". Required skills: {}", tags[..tags.len().min(3)].join(", ")));
            }
            let Some(mut record) = listing.into_record("Remote".to_string(), description) else {
                continue;
            };

            let salary = parse_salary(&first_text(row, &salary_sel).unwrap_or_default());
            record.salary_min = salary.min;
            record.salary_max = salary.max;
            record.salary_currency = salary.currency;
            record.posted_date = parse_posted_date(&first_text(row, &time_sel).unwrap_or_default(), now);
            record.discovered_date = now;
            record.requirements = tags.into_iter().take(5).collect();
            record.job_type = JobType::FullTime;
            record.remote = true;
            jobs.push(record);
        }
        Ok(jobs)
    }
}

// ---------------------------------------------------------------------------
// WeWorkRemotely
// ---------------------------------------------------------------------------

pub const WE_WORK_REMOTELY_BASE_URL: &str = "https://weworkremotely.com";

#[derive(Debug, Clone)]
pub struct WeWorkRemotelyAdapter {
    source_id: String,
    base_url: String,
}

impl Default for WeWorkRemotelyAdapter {
    fn default() -> Self {
        Self::new("weworkremotely")
    }
}

impl WeWorkRemotelyAdapter {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            base_url: WE_WORK_REMOTELY_BASE_URL.to_string(),
        }
    }

    fn category_for(params: &SearchParams) -> &'static str {
        let query = params
            .terms()
            .map(|t| t.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");
        let mentions = |terms: &[&str]| terms.iter().any(|t| query.contains(t));
        if mentions(&["developer", "engineer", "programming", "software"]) {
            "programming"
        } else if mentions(&["design", "ui", "ux"]) {
            "design"
        } else if mentions(&["marketing", "growth"]) {
            "marketing"
        } else {
            "programming"
        }
    }
}

#[async_trait]
impl SourceAdapter for WeWorkRemotelyAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn search_urls(&self, params: &SearchParams) -> Vec<String> {
        vec![format!(
            "{}/remote-jobs/{}",
            self.base_url,
            Self::category_for(params)
        )]
    }

    fn parse_listing(&self, html: &str, page_url: &str) -> Result<Vec<JobRecord>, AdapterError> {
        let document = Html::parse_document(html);
        let item_sel = parse_selector(".jobs li")?;
        let skip_sel = parse_selector(".ad, .category")?;
        let link_sel = parse_selector("a")?;
        let company_sel = parse_selector(".company")?;
        let title_sel = parse_selector(".title")?;
        let region_sel = parse_selector(".region")?;
        let now = Utc::now();

        let mut jobs = Vec::new();
        for item in document.select(&item_sel) {
            if has_any_class(item, &["ad", "category"]) || item.select(&skip_sel).next().is_some() {
                continue;
            }
            let Some(link) = item.select(&link_sel).next() else {
                continue;
            };
            let Some(link_text) = element_text(link) else {
                continue;
            };

            let (company, title) = match link_text.split_once(':') {
                Some((company, title)) => (company.trim().to_string(), title.trim().to_string()),
                None => match (first_text(item, &company_sel), first_text(item, &title_sel)) {
                    (Some(company), Some(title)) => (company, title),
                    _ => ("Unknown".to_string(), link_text.clone()),
                },
            };

            let location = match first_text(item, &region_sel) {
                Some(region) => format!("Remote ({region})"),
                None => "Remote".to_string(),
            };
            let description = format!("Remote position at {company}");
            let listing = Listing {
                source_id: &self.source_id,
                title,
                company,
                url: link
                    .value()
                    .attr("href")
                    .and_then(|href| resolve_url(page_url, href)),
            };
            let Some(mut record) = listing.into_record(location, description) else {
                continue;
            };
            record.posted_date = now;
            record.discovered_date = now;
            record.job_type = JobType::FullTime;
            record.remote = true;
            jobs.push(record);
        }
        Ok(jobs)
    }
}

// ---------------------------------------------------------------------------
// Search-result boards (Indeed, LinkedIn)
// ---------------------------------------------------------------------------

/// Per-field selectors for a board that renders one card per search result.
struct BoardCardSelectors {
    card: Selector,
    title_link: Selector,
    company: Selector,
    location: Selector,
    salary: Selector,
    snippet: Selector,
    date: Selector,
}

impl BoardCardSelectors {
    fn parse(fields: [&str; 7]) -> Result<Self, AdapterError> {
        let [card, title_link, company, location, salary, snippet, date] = fields;
        Ok(Self {
            card: parse_selector(card)?,
            title_link: parse_selector(title_link)?,
            company: parse_selector(company)?,
            location: parse_selector(location)?,
            salary: parse_selector(salary)?,
            snippet: parse_selector(snippet)?,
            date: parse_selector(date)?,
        })
    }

    fn records(&self, source_id: &str, html: &str, page_url: &str) -> Vec<JobRecord> {
        let document = Html::parse_document(html);
        let now = Utc::now();
        let mut jobs = Vec::new();
        for card in document.select(&self.card) {
            let location = first_text(card, &self.location).unwrap_or_default();
            let description = first_text(card, &self.snippet).unwrap_or_default();
            let title = first_text(card, &self.title_link).unwrap_or_default();
            let remote = detect_remote_work(&format!("{title} {description} {location}"));
            let listing = Listing {
                source_id,
                title,
                company: first_text(card, &self.company).unwrap_or_default(),
                url: first_href(card, &self.title_link).and_then(|href| resolve_url(page_url, &href)),
            };
            let Some(mut record) = listing.into_record(clean_text(&location), description) else {
                continue;
            };

            let salary = parse_salary(&first_text(card, &self.salary).unwrap_or_default());
            record.salary_min = salary.min;
            record.salary_max = salary.max;
            record.salary_currency = salary.currency;
            record.posted_date = first_text(card, &self.date)
                .map(|text| parse_posted_date(&text, now))
                .unwrap_or(now);
            record.discovered_date = now;
            record.job_type = normalize_job_type("");
            record.remote = remote;
            jobs.push(record);
        }
        jobs
    }
}

pub const INDEED_BASE_URL: &str = "https://www.indeed.com";
const INDEED_REMOTE_FILTER: &str = "032b3046-06a3-4876-8dfd-474eb5e7ed11";
const INDEED_PAGE_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct IndeedAdapter {
    source_id: String,
    base_url: String,
}

impl Default for IndeedAdapter {
    fn default() -> Self {
        Self::new("indeed")
    }
}

impl IndeedAdapter {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            base_url: INDEED_BASE_URL.to_string(),
        }
    }

    fn query(params: &SearchParams) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        let terms: Vec<String> = params.terms().map(|t| format!("\"{t}\"")).collect();
        if !terms.is_empty() {
            query.push(("q", terms.join(" OR ")));
        }
        if let Some(location) = params.locations.first() {
            query.push(("l", location.clone()));
        }
        if params.remote_ok {
            query.push(("remotejob", INDEED_REMOTE_FILTER.to_string()));
        }
        query.push(("fromage", "7".to_string()));
        query.push(("sort", "date".to_string()));
        query
    }
}

#[async_trait]
impl SourceAdapter for IndeedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    /// One URL per page, paged with Indeed's `start` offset.
    fn search_urls(&self, params: &SearchParams) -> Vec<String> {
        let base = format!("{}/jobs", self.base_url);
        (0..params.max_pages.max(1))
            .filter_map(|page| {
                let mut query = Self::query(params);
                if page > 0 {
                    query.push(("start", (page * INDEED_PAGE_SIZE).to_string()));
                }
                url_with_query(&base, &query)
            })
            .collect()
    }

    fn parse_listing(&self, html: &str, page_url: &str) -> Result<Vec<JobRecord>, AdapterError> {
        let selectors = BoardCardSelectors::parse([
            r#"[data-testid="slider_item"]"#,
            r#"[data-testid="job-title"] a"#,
            r#"[data-testid="company-name"]"#,
            r#"[data-testid="job-location"]"#,
            r#"[data-testid="attribute_snippet_testid"]"#,
            r#"[data-testid="job-snippet"]"#,
            r#"[data-testid="myJobsStateDate"]"#,
        ])?;
        Ok(selectors.records(&self.source_id, html, page_url))
    }
}

pub const LINKEDIN_BASE_URL: &str = "https://www.linkedin.com";
const LINKEDIN_PAGE_SIZE: usize = 25;

#[derive(Debug, Clone)]
pub struct LinkedInAdapter {
    source_id: String,
    base_url: String,
}

impl Default for LinkedInAdapter {
    fn default() -> Self {
        Self::new("linkedin")
    }
}

impl LinkedInAdapter {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            base_url: LINKEDIN_BASE_URL.to_string(),
        }
    }

    fn query(params: &SearchParams) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        let terms: Vec<&str> = params.terms().map(String::as_str).collect();
        if !terms.is_empty() {
            query.push(("keywords", terms.join(" OR ")));
        }
        if let Some(location) = params.locations.first() {
            query.push(("location", location.clone()));
        }
        if params.remote_ok {
            query.push(("f_WT", "2".to_string()));
        }
        // past week
        query.push(("f_TPR", "r604800".to_string()));
        query.push(("sortBy", "DD".to_string()));
        query
    }
}

#[async_trait]
impl SourceAdapter for LinkedInAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    /// The guest search pages by `start`, in steps of one result batch.
    fn search_urls(&self, params: &SearchParams) -> Vec<String> {
        let base = format!("{}/jobs/search", self.base_url);
        (0..params.max_pages.max(1))
            .filter_map(|page| {
                let mut query = Self::query(params);
                if page > 0 {
                    query.push(("start", (page * LINKEDIN_PAGE_SIZE).to_string()));
                }
                url_with_query(&base, &query)
            })
            .collect()
    }

    fn parse_listing(&self, html: &str, page_url: &str) -> Result<Vec<JobRecord>, AdapterError> {
        let selectors = BoardCardSelectors::parse([
            ".job-search-card",
            ".base-search-card__title a",
            ".base-search-card__subtitle",
            ".job-search-card__location",
            ".job-search-card__salary-info",
            ".job-search-card__snippet",
            ".job-search-card__listdate",
        ])?;
        Ok(selectors.records(&self.source_id, html, page_url))
    }
}

// ---------------------------------------------------------------------------
// Company career pages
// ---------------------------------------------------------------------------

/// Ordered selector fallbacks for a careers page. Empty lists use the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanySelectors {
    pub job_container: Vec<String>,
    pub title: Vec<String>,
    pub location: Vec<String>,
    pub department: Vec<String>,
    pub description: Vec<String>,
    pub link: Vec<String>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for CompanySelectors {
    fn default() -> Self {
        Self {
            job_container: owned(&[
                ".job-listing",
                ".job-item",
                ".career-item",
                ".position",
                ".opening",
                "[data-job]",
                ".job-card",
            ]),
            title: owned(&[".job-title", ".title", "h2", "h3", ".position-title", "[data-job-title]"]),
            location: owned(&[".job-location", ".location", ".office", ".city", "[data-location]"]),
            department: owned(&[".department", ".team", ".category", ".job-category"]),
            description: owned(&[".job-description", ".description", ".summary", ".job-summary"]),
            link: owned(&["a[href]", "[href]"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyConfig {
    pub name: String,
    pub careers_url: String,
    #[serde(default)]
    pub selectors: Option<CompanySelectors>,
}

const COMMON_LISTING_PATTERNS: &[&str] = &[
    r#"div[class*="job"]"#,
    r#"li[class*="job"]"#,
    r#"div[class*="career"]"#,
    r#"div[class*="position"]"#,
    r#"div[class*="opening"]"#,
    r#"tr[class*="job"]"#,
    ".careers-list li",
    ".jobs-list li",
    ".positions li",
];

const NON_JOB_LINK_PATTERNS: &[&str] = &[
    "mailto:",
    "tel:",
    "#",
    "javascript:",
    "facebook.com",
    "twitter.com",
    "linkedin.com",
    "instagram.com",
    "youtube.com",
];

const JOB_LINK_KEYWORDS: &[&str] = &[
    "job", "career", "position", "opening", "role", "engineer", "developer", "manager", "analyst",
    "designer", "specialist", "coordinator",
];

const MAX_LINK_CANDIDATES: usize = 20;

pub fn looks_like_job_link(href: &str, text: &str) -> bool {
    if href.is_empty() || text.is_empty() {
        return false;
    }
    let href_lower = href.to_lowercase();
    if NON_JOB_LINK_PATTERNS.iter().any(|p| href_lower.contains(p)) {
        return false;
    }
    let combined = format!("{href_lower} {}", text.to_lowercase());
    JOB_LINK_KEYWORDS.iter().any(|k| combined.contains(k))
}

#[derive(Debug)]
struct CompiledSelectors {
    job_container: Vec<Selector>,
    title: Vec<Selector>,
    location: Vec<Selector>,
    description: Vec<Selector>,
    link: Vec<Selector>,
}

/// Scrapes one company's careers page with configurable selectors.
#[derive(Debug)]
pub struct CompanyAdapter {
    source_id: String,
    company_name: String,
    careers_url: String,
    selectors: CompiledSelectors,
    common_patterns: Vec<Selector>,
    any_link: Selector,
}

impl CompanyAdapter {
    /// Compiles every configured selector up front so a bad config fails fast.
    pub fn new(source_id: Option<&str>, config: &CompanyConfig) -> Result<Self, AdapterError> {
        if config.careers_url.trim().is_empty() {
            return Err(AdapterError::Message(format!(
                "company `{}` has no careers_url",
                config.name
            )));
        }
        let defaults = CompanySelectors::default();
        let configured = config.selectors.clone().unwrap_or_default();
        let pick = |configured: &[String], fallback: &[String]| {
            if configured.is_empty() {
                parse_selectors(fallback)
            } else {
                parse_selectors(configured)
            }
        };

        let selectors = CompiledSelectors {
            job_container: pick(&configured.job_container, &defaults.job_container)?,
            title: pick(&configured.title, &defaults.title)?,
            location: pick(&configured.location, &defaults.location)?,
            description: pick(&configured.description, &defaults.description)?,
            link: pick(&configured.link, &defaults.link)?,
        };
        let common_patterns = COMMON_LISTING_PATTERNS
            .iter()
            .map(|s| parse_selector(s))
            .collect::<Result<Vec<_>, _>>()?;

        let source_id = source_id.map(str::to_string).unwrap_or_else(|| {
            format!("company_{}", config.name.to_lowercase().replace(' ', "_"))
        });

        Ok(Self {
            source_id,
            company_name: config.name.clone(),
            careers_url: config.careers_url.clone(),
            selectors,
            common_patterns,
            any_link: parse_selector("a[href]")?,
        })
    }

    fn job_url(&self, element: ElementRef<'_>, page_url: &str) -> String {
        self.selectors
            .link
            .iter()
            .find_map(|selector| first_href(element, selector))
            .or_else(|| element.value().attr("href").map(str::to_string))
            .and_then(|href| resolve_url(page_url, &href))
            .unwrap_or_else(|| self.careers_url.clone())
    }

    fn record_from_element(&self, element: ElementRef<'_>, page_url: &str) -> Option<JobRecord> {
        let title = first_text_any(element, &self.selectors.title)?;
        let location = first_text_any(element, &self.selectors.location)
            .unwrap_or_else(|| "Not specified".to_string());
        let description = first_text_any(element, &self.selectors.description)
            .unwrap_or_else(|| format!("{title} position at {}", self.company_name));
        let remote = detect_remote_work(&format!("{title} {description} {location}"));

        let listing = Listing {
            source_id: &self.source_id,
            title,
            company: self.company_name.clone(),
            url: Some(self.job_url(element, page_url)),
        };
        let mut record = listing.into_record(clean_text(&location), description)?;
        record.job_type = normalize_job_type("");
        record.remote = remote;
        Some(record)
    }

    fn records_from(&self, elements: Vec<ElementRef<'_>>, page_url: &str) -> Vec<JobRecord> {
        elements
            .into_iter()
            .filter_map(|element| self.record_from_element(element, page_url))
            .collect()
    }

    fn from_configured_containers(&self, document: &Html, page_url: &str) -> Vec<JobRecord> {
        for selector in &self.selectors.job_container {
            let elements: Vec<_> = document.select(selector).collect();
            if !elements.is_empty() {
                return self.records_from(elements, page_url);
            }
        }
        Vec::new()
    }

    fn from_common_patterns(&self, document: &Html, page_url: &str) -> Vec<JobRecord> {
        for selector in &self.common_patterns {
            let elements: Vec<_> = document.select(selector).collect();
            if elements.len() > 1 {
                let jobs = self.records_from(elements, page_url);
                if !jobs.is_empty() {
                    return jobs;
                }
            }
        }
        Vec::new()
    }

    fn from_links(&self, document: &Html, page_url: &str) -> Vec<JobRecord> {
        document
            .select(&self.any_link)
            .filter_map(|link| {
                let href = link.value().attr("href")?;
                let text = element_text(link)?;
                looks_like_job_link(href, &text).then(|| (href.to_string(), text))
            })
            .take(MAX_LINK_CANDIDATES)
            .filter_map(|(href, text)| {
                let title = clean_text(&text);
                let length = title.chars().count();
                if !(3..=100).contains(&length) {
                    return None;
                }
                let listing = Listing {
                    source_id: &self.source_id,
                    title: title.clone(),
                    company: self.company_name.clone(),
                    url: resolve_url(page_url, &href),
                };
                let description = format!("{title} position at {}", self.company_name);
                listing.into_record("Not specified".to_string(), description)
            })
            .collect()
    }
}

#[async_trait]
impl SourceAdapter for CompanyAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn search_urls(&self, _params: &SearchParams) -> Vec<String> {
        vec![self.careers_url.clone()]
    }

    /// Configured containers first, then common listing patterns, then any
    /// job-looking links.
    fn parse_listing(&self, html: &str, page_url: &str) -> Result<Vec<JobRecord>, AdapterError> {
        let document = Html::parse_document(html);
        let strategies: [(&str, fn(&Self, &Html, &str) -> Vec<JobRecord>); 3] = [
            ("configured selectors", Self::from_configured_containers),
            ("common patterns", Self::from_common_patterns),
            ("link analysis", Self::from_links),
        ];
        for (strategy, extract) in strategies {
            let jobs = extract(self, &document, page_url);
            if !jobs.is_empty() {
                debug!(source_id = %self.source_id, strategy, jobs = jobs.len(), "careers page parsed");
                return Ok(jobs);
            }
        }
        debug!(source_id = %self.source_id, "no jobs found on careers page");
        Ok(Vec::new())
    }

    fn retain_relevant(&self, jobs: Vec<JobRecord>, params: &SearchParams) -> Vec<JobRecord> {
        filter_by_criteria(jobs, params)
    }
}

/// Keep jobs matching any search title (in the title), any keyword (in title or
/// description), and remote-only when `remote_ok` is set. Empty criteria pass.
pub fn filter_by_criteria(jobs: Vec<JobRecord>, params: &SearchParams) -> Vec<JobRecord> {
    jobs.into_iter()
        .filter(|job| {
            let title = job.title.to_lowercase();
            let title_ok = params.job_titles.is_empty()
                || params
                    .job_titles
                    .iter()
                    .any(|t| title.contains(&t.to_lowercase()));
            let haystack = format!("{} {}", job.title, job.description).to_lowercase();
            let keyword_ok = params.keywords.is_empty()
                || params
                    .keywords
                    .iter()
                    .any(|k| haystack.contains(&k.to_lowercase()));
            let remote_ok = !params.remote_ok || job.remote;
            title_ok && keyword_ok && remote_ok
        })
        .collect()
}

pub fn adapter_for_source(
    source_id: &str,
    kind: SourceKind,
    company: Option<&CompanyConfig>,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match kind {
        SourceKind::RemoteOk => Ok(Box::new(RemoteOkAdapter::new(source_id))),
        SourceKind::WeWorkRemotely => Ok(Box::new(WeWorkRemotelyAdapter::new(source_id))),
        SourceKind::Indeed => Ok(Box::new(IndeedAdapter::new(source_id))),
        SourceKind::LinkedIn => Ok(Box::new(LinkedInAdapter::new(source_id))),
        SourceKind::Company => {
            let config = company.ok_or_else(|| {
                AdapterError::Message(format!("source `{source_id}` is missing its company block"))
            })?;
            Ok(Box::new(CompanyAdapter::new(Some(source_id), config)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REMOTE_OK_PAGE: &str = r#"
        <html><body><table id="jobsboard">
          <tr class="job">
            <td class="company">
              <a href="/remote-jobs/1001-senior-rust-engineer"><h2>Senior Rust Engineer</h2></a>
              <h3>Ferrous Labs</h3>
              <div class="salary">$120k - $160k</div>
              <div class="tags"><span class="tag">rust</span><span class="tag">tokio</span>
                <span class="tag">postgres</span><span class="tag">aws</span>
                <span class="tag">k8s</span><span class="tag">grpc</span></div>
            </td>
            <td class="time"><time>2d</time></td>
          </tr>
          <tr class="job">
            <td class="company"><a href="/remote-jobs/1002"><h2>Orphan Listing</h2></a></td>
          </tr>
          <tr class="ad"><td>Sponsored</td></tr>
        </table></body></html>
    "#;

    const WWR_PAGE: &str = r#"
        <section class="jobs"><ul>
          <li class="category">Programming</li>
          <li><a href="/remote-jobs/acme-backend">Acme: Backend Developer</a>
              <span class="region">Americas Only</span></li>
          <li><a href="/remote-jobs/globex"><span class="company">Globex</span>
              <span class="title">Frontend Engineer</span></a></li>
          <li><div class="ad"><a href="https://ads.example">Buy stuff</a></div></li>
          <li><a href="/remote-jobs/mystery">Mystery Role</a></li>
        </ul></section>
    "#;

    const CAREERS_PAGE: &str = r#"
        <div class="openings">
          <div class="job-card">
            <h3 class="job-title">Platform Engineer</h3>
            <span class="location">Remote - US</span>
            <p class="description">Own our Kubernetes platform.</p>
            <a href="/careers/platform-engineer">Apply</a>
          </div>
          <div class="job-card">
            <h3 class="job-title">Office Manager</h3>
            <span class="location">Austin, TX</span>
          </div>
          <div class="job-card"><span class="location">No title here</span></div>
        </div>
    "#;

    const INDEED_PAGE: &str = r#"
        <ul class="jobsearch-ResultsList">
          <li><div data-testid="slider_item">
            <h2 data-testid="job-title"><a href="/rc/clk?jk=abc123">Backend Engineer</a></h2>
            <span data-testid="company-name">Hooli</span>
            <div data-testid="job-location">Remote in Austin, TX</div>
            <div data-testid="attribute_snippet_testid">$50,000 - $70,000 per year</div>
            <div data-testid="job-snippet"><ul><li>Build   Rust services.</li></ul></div>
            <span data-testid="myJobsStateDate">Posted 3 days ago</span>
          </div></li>
          <li><div data-testid="slider_item">
            <h2 data-testid="job-title"><a href="/rc/clk?jk=def456">Nameless Co Role</a></h2>
          </div></li>
        </ul>
    "#;

    const LINKEDIN_PAGE: &str = r#"
        <ul class="jobs-search__results-list">
          <li><div class="base-card job-search-card">
            <h3 class="base-search-card__title"><a href="https://www.linkedin.com/jobs/view/987">Data Engineer</a></h3>
            <h4 class="base-search-card__subtitle"><a href="/company/globex">Globex</a></h4>
            <span class="job-search-card__location">New York, NY</span>
            <p class="job-search-card__snippet">Build pipelines.</p>
          </div></li>
          <li><div class="base-card job-search-card">
            <h3 class="base-search-card__title">Promoted</h3>
            <h4 class="base-search-card__subtitle"><a>Initech</a></h4>
          </div></li>
        </ul>
    "#;

    fn company_config() -> CompanyConfig {
        CompanyConfig {
            name: "Initech".to_string(),
            careers_url: "https://initech.example/careers".to_string(),
            selectors: None,
        }
    }

    #[test]
    fn remote_ok_rows_become_remote_records() {
        let adapter = RemoteOkAdapter::default();
        let jobs = adapter
            .parse_listing(REMOTE_OK_PAGE, "https://remoteok.com/rust")
            .expect("parse");
        assert_eq!(jobs.len(), 1);

        let job = &jobs[0];
        assert_eq!(job.title, "Senior Rust Engineer");
        assert_eq!(job.company, "Ferrous Labs");
        assert_eq!(job.source, "remote_ok");
        assert_eq!(
            job.source_url,
            "https://remoteok.com/remote-jobs/1001-senior-rust-engineer"
        );
        assert_eq!(job.location, "Remote");
        assert!(job.remote);
        assert_eq!(job.requirements, vec!["rust", "tokio", "postgres", "aws", "k8s"]);
        assert_eq!(job.salary_min, Some(120_000.0));
        assert_eq!(job.salary_max, Some(160_000.0));
        assert!(job.description.starts_with("Remote position at Ferrous Labs"));
        assert!(job.description.contains("rust, tokio, postgres"));
        assert!(job.posted_date < job.discovered_date);
    }

    #[test]
    fn remote_ok_search_url_uses_first_term() {
        let adapter = RemoteOkAdapter::default();
        let params = SearchParams {
            job_titles: vec!["Rust Engineer".to_string()],
            keywords: vec!["tokio".to_string()],
            ..SearchParams::default()
        };
        assert_eq!(adapter.search_urls(&params), vec!["https://remoteok.com/rust+engineer"]);
        assert_eq!(
            adapter.search_urls(&SearchParams::default()),
            vec!["https://remoteok.com"]
        );
    }

    #[test]
    fn wwr_items_split_company_and_title() {
        let adapter = WeWorkRemotelyAdapter::default();
        let jobs = adapter
            .parse_listing(WWR_PAGE, "https://weworkremotely.com/remote-jobs/programming")
            .expect("parse");
        assert_eq!(jobs.len(), 3);

        assert_eq!(jobs[0].company, "Acme");
        assert_eq!(jobs[0].title, "Backend Developer");
        assert_eq!(jobs[0].location, "Remote (Americas Only)");
        assert_eq!(
            jobs[0].source_url,
            "https://weworkremotely.com/remote-jobs/acme-backend"
        );

        assert_eq!(jobs[1].company, "Globex");
        assert_eq!(jobs[1].title, "Frontend Engineer");
        assert_eq!(jobs[1].location, "Remote");

        assert_eq!(jobs[2].company, "Unknown");
        assert_eq!(jobs[2].title, "Mystery Role");
        assert!(jobs.iter().all(|j| j.remote && j.source == "weworkremotely"));
    }

    #[test]
    fn wwr_category_follows_search_terms() {
        let adapter = WeWorkRemotelyAdapter::default();
        let design = SearchParams {
            keywords: vec!["UX research".to_string()],
            ..SearchParams::default()
        };
        assert_eq!(
            adapter.search_urls(&design),
            vec!["https://weworkremotely.com/remote-jobs/design"]
        );
        assert_eq!(
            adapter.search_urls(&SearchParams::default()),
            vec!["https://weworkremotely.com/remote-jobs/programming"]
        );
    }

    #[test]
    fn indeed_cards_become_records() {
        let adapter = IndeedAdapter::default();
        let jobs = adapter
            .parse_listing(INDEED_PAGE, "https://www.indeed.com/jobs?q=rust")
            .expect("parse");
        assert_eq!(jobs.len(), 1);

        let job = &jobs[0];
        assert_eq!(job.title, "Backend Engineer");
        assert_eq!(job.company, "Hooli");
        assert_eq!(job.location, "Remote in Austin, TX");
        assert_eq!(job.description, "Build Rust services.");
        assert_eq!(job.source, "indeed");
        assert_eq!(job.source_url, "https://www.indeed.com/rc/clk?jk=abc123");
        assert_eq!(job.salary_min, Some(50_000.0));
        assert_eq!(job.salary_max, Some(70_000.0));
        assert_eq!(job.job_type, JobType::FullTime);
        assert!(job.remote);
        assert!(job.posted_date < job.discovered_date);
    }

    #[test]
    fn indeed_search_urls_quote_terms_and_page_by_offset() {
        let adapter = IndeedAdapter::default();
        let params = SearchParams {
            job_titles: vec!["Rust Engineer".to_string()],
            keywords: vec!["tokio".to_string()],
            locations: vec!["New York, NY".to_string(), "Boston, MA".to_string()],
            remote_ok: true,
            max_pages: 2,
        };
        let first = "https://www.indeed.com/jobs?q=%22Rust+Engineer%22+OR+%22tokio%22\
            &l=New+York%2C+NY&remotejob=032b3046-06a3-4876-8dfd-474eb5e7ed11&fromage=7&sort=date";
        assert_eq!(adapter.search_urls(&params), vec![first.to_string(), format!("{first}&start=10")]);
        assert_eq!(
            adapter.search_urls(&SearchParams::default()),
            vec!["https://www.indeed.com/jobs?fromage=7&sort=date"]
        );
    }

    #[test]
    fn linkedin_cards_become_records() {
        let adapter = LinkedInAdapter::default();
        let jobs = adapter
            .parse_listing(LINKEDIN_PAGE, "https://www.linkedin.com/jobs/search?keywords=data")
            .expect("parse");
        assert_eq!(jobs.len(), 1);

        let job = &jobs[0];
        assert_eq!(job.title, "Data Engineer");
        assert_eq!(job.company, "Globex");
        assert_eq!(job.location, "New York, NY");
        assert_eq!(job.description, "Build pipelines.");
        assert_eq!(job.source, "linkedin");
        assert_eq!(job.source_url, "https://www.linkedin.com/jobs/view/987");
        assert_eq!(job.salary_min, None);
        assert!(!job.remote);
        assert_eq!(job.posted_date, job.discovered_date);
    }

    #[test]
    fn linkedin_search_urls_join_terms_and_page_by_offset() {
        let adapter = LinkedInAdapter::default();
        let params = SearchParams {
            keywords: vec!["rust".to_string(), "go".to_string()],
            remote_ok: true,
            max_pages: 2,
            ..SearchParams::default()
        };
        let first = "https://www.linkedin.com/jobs/search?keywords=rust+OR+go&f_WT=2&f_TPR=r604800&sortBy=DD";
        assert_eq!(adapter.search_urls(&params), vec![first.to_string(), format!("{first}&start=25")]);
    }

    #[test]
    fn careers_page_uses_default_selectors() {
        let adapter = CompanyAdapter::new(None, &company_config()).expect("adapter");
        assert_eq!(adapter.source_id(), "company_initech");

        let jobs = adapter
            .parse_listing(CAREERS_PAGE, "https://initech.example/careers")
            .expect("parse");
        assert_eq!(jobs.len(), 2);

        let platform = &jobs[0];
        assert_eq!(platform.title, "Platform Engineer");
        assert_eq!(platform.company, "Initech");
        assert_eq!(platform.location, "Remote - US");
        assert_eq!(platform.description, "Own our Kubernetes platform.");
        assert_eq!(
            platform.source_url,
            "https://initech.example/careers/platform-engineer"
        );
        assert!(platform.remote);

        let office = &jobs[1];
        assert_eq!(office.description, "Office Manager position at Initech");
        assert_eq!(office.source_url, "https://initech.example/careers");
        assert!(!office.remote);
    }

    #[test]
    fn careers_page_honours_configured_selectors() {
        let config = CompanyConfig {
            selectors: Some(CompanySelectors {
                job_container: vec!["article.role".to_string()],
                title: vec!["header".to_string()],
                location: Vec::new(),
                department: Vec::new(),
                description: Vec::new(),
                link: Vec::new(),
            }),
            ..company_config()
        };
        let adapter = CompanyAdapter::new(Some("initech"), &config).expect("adapter");
        let html = r#"<article class="role"><header>Data Analyst</header>
            <div class="location">Chicago</div><a href="https://jobs.example/42">Apply</a></article>"#;
        let jobs = adapter.parse_listing(html, "https://initech.example/careers").expect("parse");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].title, "Data Analyst");
        assert_eq!(jobs[0].location, "Chicago");
        assert_eq!(jobs[0].source_url, "https://jobs.example/42");
        assert_eq!(jobs[0].source, "initech");
    }

    #[test]
    fn careers_page_falls_back_to_job_links() {
        let adapter = CompanyAdapter::new(None, &company_config()).expect("adapter");
        let html = r##"<nav><a href="#top">Top</a><a href="https://twitter.com/initech">Careers on Twitter</a></nav>
            <p><a href="/careers/senior-developer">Senior Developer</a>
               <a href="/about">About us</a></p>"##;
        let jobs = adapter.parse_listing(html, "https://initech.example/careers").expect("parse");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].title, "Senior Developer");
        assert_eq!(jobs[0].location, "Not specified");
        assert_eq!(jobs[0].source_url, "https://initech.example/careers/senior-developer");
    }

    #[test]
    fn invalid_configured_selector_is_rejected() {
        let config = CompanyConfig {
            selectors: Some(CompanySelectors {
                title: vec!["h2[".to_string()],
                ..CompanySelectors::default()
            }),
            ..company_config()
        };
        let err = CompanyAdapter::new(None, &config).expect_err("bad selector");
        assert!(matches!(err, AdapterError::Selector { .. }));
    }

    #[test]
    fn job_link_heuristics() {
        assert!(looks_like_job_link("/careers/123", "Apply"));
        assert!(looks_like_job_link("/p/9", "Staff Engineer"));
        assert!(!looks_like_job_link("mailto:jobs@initech.example", "Email jobs"));
        assert!(!looks_like_job_link("/about", "About us"));
    }

    #[test]
    fn criteria_filter_titles_keywords_and_remote() {
        let mut remote = JobRecord::new("Rust Engineer", "A", "Remote", "tokio services", "u1");
        remote.remote = true;
        let onsite = JobRecord::new("Rust Engineer", "B", "Austin", "embedded firmware", "u2");
        let other = JobRecord::new("Accountant", "C", "Remote", "tokio", "u3");

        let params = SearchParams {
            job_titles: vec!["rust".to_string()],
            keywords: vec!["Tokio".to_string(), "firmware".to_string()],
            ..SearchParams::default()
        };
        let kept = filter_by_criteria(vec![remote.clone(), onsite.clone(), other.clone()], &params);
        assert_eq!(kept, vec![remote.clone(), onsite]);

        let remote_only = SearchParams {
            remote_ok: true,
            ..SearchParams::default()
        };
        assert_eq!(filter_by_criteria(vec![remote.clone(), other], &remote_only), vec![remote]);
    }

    #[test]
    fn source_kinds_deserialize_and_build() {
        let kinds: Vec<SourceKind> =
            serde_yaml::from_str("[remote_ok, we_work_remotely, indeed, linkedin, company]")
                .expect("yaml");
        assert_eq!(
            kinds,
            vec![
                SourceKind::RemoteOk,
                SourceKind::WeWorkRemotely,
                SourceKind::Indeed,
                SourceKind::LinkedIn,
                SourceKind::Company
            ]
        );

        let adapter = adapter_for_source("rok", SourceKind::RemoteOk, None).expect("adapter");
        assert_eq!(adapter.source_id(), "rok");
        let adapter = adapter_for_source("li", SourceKind::LinkedIn, None).expect("adapter");
        assert_eq!(adapter.source_id(), "li");
        assert!(adapter_for_source("acme", SourceKind::Company, None).is_err());
        let company = company_config();
        let adapter =
            adapter_for_source("acme", SourceKind::Company, Some(&company)).expect("adapter");
        assert_eq!(adapter.search_urls(&SearchParams::default()), vec![company.careers_url]);
    }
}
