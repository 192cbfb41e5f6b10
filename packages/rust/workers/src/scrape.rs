//! Website scraper: company attributes and contact form detection.
//!
//! Fetches the entity's URL, pulls the company name, industry, business type
//! and an about text out of the page, and looks for a contact form. When the
//! landing page has none, one same-site link that looks like a contact page
//! is followed.

use std::sync::LazyLock;
use std::time::Duration;

use outreach_core::Scraper;
use outreach_core::forms::is_contact_form;
use outreach_shared::{FieldKind, FormDescriptor, FormField, Result, ScrapeResult, StageError};
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, instrument};
use url::Url;

use crate::http::{
    MAX_PAGE_BYTES, build_client, checked_url, is_ssrf_target, read_body, send_error,
    status_error,
};

/// Upper bound on the about text handed to the generator.
const ABOUT_CHARS: usize = 1_500;

/// Paragraphs shorter than this are navigation or captions, not prose.
const MIN_PARAGRAPH_CHARS: usize = 40;

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("valid selector")
}

static OG_SITE_NAME: LazyLock<Selector> =
    LazyLock::new(|| selector(r#"meta[property="og:site_name"]"#));
static OG_TYPE: LazyLock<Selector> = LazyLock::new(|| selector(r#"meta[property="og:type"]"#));
static DESCRIPTION: LazyLock<Selector> = LazyLock::new(|| {
    selector(r#"meta[name="description"], meta[property="og:description"]"#)
});
static INDUSTRY: LazyLock<Selector> =
    LazyLock::new(|| selector(r#"meta[name="industry"], meta[name="category"]"#));
static BUSINESS_TYPE: LazyLock<Selector> =
    LazyLock::new(|| selector(r#"meta[name="business-type"], meta[name="business_type"]"#));
static TITLE: LazyLock<Selector> = LazyLock::new(|| selector("title"));
static H1: LazyLock<Selector> = LazyLock::new(|| selector("h1"));
static MAIN_PARAGRAPHS: LazyLock<Selector> =
    LazyLock::new(|| selector("main p, article p, [role=\"main\"] p"));
static PARAGRAPHS: LazyLock<Selector> = LazyLock::new(|| selector("p"));
static FORMS: LazyLock<Selector> = LazyLock::new(|| selector("form"));
static CONTROLS: LazyLock<Selector> = LazyLock::new(|| selector("input, textarea, select"));
static OPTIONS: LazyLock<Selector> = LazyLock::new(|| selector("option"));
static FORM_HEADINGS: LazyLock<Selector> =
    LazyLock::new(|| selector("legend, h1, h2, h3, h4, h5"));
static LINKS: LazyLock<Selector> = LazyLock::new(|| selector("a[href]"));

static TITLE_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+[|\-–—:·»]\s+").expect("valid regex"));

/// Title segments that name the page rather than the company.
const GENERIC_TITLES: &[&str] = &["home", "homepage", "home page", "welcome", "index"];

// ---------------------------------------------------------------------------
// HttpScraper
// ---------------------------------------------------------------------------

pub struct HttpScraper {
    client: Client,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_localhost: bool,
}

impl HttpScraper {
    /// `timeout` bounds each HTTP request.
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::build(timeout, false)
    }

    /// Allow localhost/private IPs, redirects included (for integration tests).
    #[cfg(test)]
    pub fn allowing_localhost(timeout: Duration) -> Result<Self> {
        Self::build(timeout, true)
    }

    fn build(timeout: Duration, allow_localhost: bool) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout, allow_localhost)?,
            allow_localhost,
        })
    }

    /// GET a page; returns the final URL after redirects and the body.
    async fn fetch(&self, url: &Url) -> std::result::Result<(Url, String), StageError> {
        debug!(%url, "fetching page");
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| send_error(url, e))?;
        if !response.status().is_success() {
            return Err(status_error(url, &response));
        }
        let final_url = response.url().clone();
        let body = read_body(url, response, MAX_PAGE_BYTES).await?;
        Ok((final_url, body))
    }
}

impl Scraper for HttpScraper {
    #[instrument(skip_all, fields(url = %url))]
    async fn scrape(&self, url: &str) -> std::result::Result<ScrapeResult, StageError> {
        let url = checked_url(url, self.allow_localhost)?;
        let (page_url, body) = self.fetch(&url).await?;
        if body.trim().is_empty() {
            return Err(StageError::permanent(format!("{page_url}: empty page")));
        }

        let page = extract_page(&body, &page_url);
        let mut form = page.contact_form;
        if form.is_none() {
            let link = page
                .contact_link
                .filter(|l| self.allow_localhost || !is_ssrf_target(l));
            if let Some(link) = link {
                match self.fetch(&link).await {
                    Ok((contact_url, body)) => form = find_contact_form(&body, &contact_url),
                    Err(e) => debug!(%link, error = %e, "contact page unavailable"),
                }
            }
        }

        info!(
            company = page.company_name.as_deref().unwrap_or(""),
            has_form = form.is_some(),
            "page scraped"
        );

        let mut result = ScrapeResult::completed();
        result.company_name = page.company_name;
        result.industry = page.industry;
        result.business_type = page.business_type;
        result.about_content = page.about;
        result.has_contact_form = form.is_some();
        result.contact_form_url = form.as_ref().map(|f| f.page_url.clone());
        result.contact_form = form;
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Everything pulled from one landing page.
#[derive(Debug, Default)]
struct PageFacts {
    company_name: Option<String>,
    industry: Option<String>,
    business_type: Option<String>,
    about: Option<String>,
    contact_form: Option<FormDescriptor>,
    contact_link: Option<Url>,
}

fn extract_page(body: &str, page_url: &Url) -> PageFacts {
    let doc = Html::parse_document(body);
    PageFacts {
        company_name: company_name(&doc),
        industry: meta_content(&doc, &INDUSTRY),
        business_type: meta_content(&doc, &BUSINESS_TYPE).or_else(|| {
            meta_content(&doc, &OG_TYPE)
                .filter(|t| !matches!(t.to_lowercase().as_str(), "website" | "article"))
        }),
        about: about_text(&doc),
        contact_form: contact_form_in(&doc, page_url),
        contact_link: contact_link(&doc, page_url),
    }
}

fn find_contact_form(body: &str, page_url: &Url) -> Option<FormDescriptor> {
    contact_form_in(&Html::parse_document(body), page_url)
}

fn contact_form_in(doc: &Html, page_url: &Url) -> Option<FormDescriptor> {
    doc.select(&FORMS)
        .map(|form| form_descriptor(form, page_url))
        .find(is_contact_form)
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn meta_content(doc: &Html, sel: &Selector) -> Option<String> {
    doc.select(sel)
        .filter_map(|el| el.value().attr("content"))
        .map(str::trim)
        .find(|c| !c.is_empty())
        .map(String::from)
}

/// og:site_name, then the most specific `<title>` segment, then the first H1.
fn company_name(doc: &Html) -> Option<String> {
    meta_content(doc, &OG_SITE_NAME)
        .or_else(|| {
            doc.select(&TITLE)
                .next()
                .and_then(|t| company_from_title(&text_of(t)))
        })
        .or_else(|| {
            doc.select(&H1)
                .next()
                .map(text_of)
                .filter(|h| !h.is_empty())
        })
}

/// "Home | Acme Widgets" and "Acme Widgets - Home" both give "Acme Widgets".
fn company_from_title(title: &str) -> Option<String> {
    TITLE_SEPARATORS
        .split(title)
        .map(str::trim)
        .find(|s| !s.is_empty() && !GENERIC_TITLES.contains(&s.to_lowercase().as_str()))
        .map(String::from)
}

/// Meta description, or the page's leading prose paragraphs.
fn about_text(doc: &Html) -> Option<String> {
    if let Some(description) = meta_content(doc, &DESCRIPTION) {
        return Some(truncate(&description, ABOUT_CHARS));
    }
    let mut paragraphs: Vec<String> = doc
        .select(&MAIN_PARAGRAPHS)
        .map(text_of)
        .filter(|p| p.chars().count() >= MIN_PARAGRAPH_CHARS)
        .collect();
    if paragraphs.is_empty() {
        paragraphs = doc
            .select(&PARAGRAPHS)
            .map(text_of)
            .filter(|p| p.chars().count() >= MIN_PARAGRAPH_CHARS)
            .collect();
    }
    if paragraphs.is_empty() {
        return None;
    }
    Some(truncate(&paragraphs.join(" "), ABOUT_CHARS))
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// First same-site link whose target or label mentions contact.
fn contact_link(doc: &Html, page_url: &Url) -> Option<Url> {
    doc.select(&LINKS).find_map(|el| {
        let href = el.value().attr("href")?.trim();
        if href.starts_with('#') || href.starts_with("mailto:") || href.starts_with("tel:") {
            return None;
        }
        let label = text_of(el).to_lowercase();
        if !href.to_lowercase().contains("contact") && !label.contains("contact") {
            return None;
        }
        let mut target = page_url.join(href).ok()?;
        target.set_fragment(None);
        (target.host_str() == page_url.host_str() && target != *page_url).then_some(target)
    })
}

// ---------------------------------------------------------------------------
// Form descriptors
// ---------------------------------------------------------------------------

fn form_descriptor(form: ElementRef<'_>, page_url: &Url) -> FormDescriptor {
    let el = form.value();
    let attr = |name: &str| {
        el.attr(name)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
    };
    FormDescriptor {
        page_url: page_url.to_string(),
        action: attr("action"),
        method: attr("method")
            .map(|m| m.to_ascii_lowercase())
            .unwrap_or_else(|| "get".into()),
        id: attr("id"),
        class: attr("class"),
        caption: attr("aria-label").or_else(|| {
            form.select(&FORM_HEADINGS)
                .map(text_of)
                .find(|h| !h.is_empty())
        }),
        fields: form.select(&CONTROLS).filter_map(form_field).collect(),
    }
}

/// A named, submittable control; buttons and file inputs are dropped.
fn form_field(control: ElementRef<'_>) -> Option<FormField> {
    let el = control.value();
    let name = el.attr("name").map(str::trim).filter(|n| !n.is_empty())?;

    let kind = match el.name() {
        "textarea" => FieldKind::Textarea,
        "select" => FieldKind::Select,
        _ => {
            let input_type = el.attr("type").unwrap_or("text").to_ascii_lowercase();
            if matches!(
                input_type.as_str(),
                "submit" | "button" | "reset" | "image" | "file"
            ) {
                return None;
            }
            FieldKind::from_input_type(&input_type)
        }
    };

    let options = if kind == FieldKind::Select {
        control
            .select(&OPTIONS)
            .filter_map(|o| {
                let value = o
                    .value()
                    .attr("value")
                    .map(String::from)
                    .unwrap_or_else(|| text_of(o));
                (!value.trim().is_empty()).then_some(value)
            })
            .collect()
    } else {
        Vec::new()
    };

    Some(FormField {
        name: name.to_string(),
        id: el.attr("id").map(String::from),
        placeholder: el.attr("placeholder").map(String::from),
        kind,
        required: el.attr("required").is_some() || el.attr("aria-required") == Some("true"),
        options,
        value: match kind {
            FieldKind::Textarea | FieldKind::Select => None,
            _ => el.attr("value").map(String::from),
        },
    })
}
