// src/quartr/locators.rs
//
// Selector fallback chains for the portal UI. The DOM changes without notice,
// so every target is a list of locators tried in order.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// A way of finding one element on the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Css(String),
    XPath(String),
}

impl Locator {
    pub fn css(selector: &str) -> Self {
        Locator::Css(selector.to_string())
    }

    /// Any element whose own text contains `needle` (whitespace-normalised).
    pub fn text_contains(needle: &str) -> Self {
        Locator::XPath(format!(
            "//*[text()[contains(normalize-space(.), {})]]",
            xpath_literal(needle)
        ))
    }

    /// Like `text_contains`, but the match may not run on into another digit,
    /// so "Q1 20" does not hit "Q1 2024".
    pub fn label_text(needle: &str) -> Self {
        Locator::XPath(format!("//*[text()[{}]]", bounded_contains(".", needle)))
    }

    /// The innermost element whose descendant text carries the label `needle`,
    /// for labels rendered across several child nodes.
    pub fn deepest_text(needle: &str) -> Self {
        Locator::XPath(format!(
            "//*[{cond} and not(./*[{cond}])]",
            cond = bounded_contains(".", needle)
        ))
    }

    /// A button whose visible text contains `needle`.
    pub fn button_text(needle: &str) -> Self {
        Locator::XPath(format!(
            "//button[contains(normalize-space(.), {})]",
            xpath_literal(needle)
        ))
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Locator::Css(s) => write!(f, "css={}", s),
            Locator::XPath(s) => write!(f, "xpath={}", s),
        }
    }
}

/// Renders a chain for error messages.
pub fn describe(chain: &[Locator]) -> String {
    chain.iter().map(ToString::to_string).collect::<Vec<_>>().join(" | ")
}

/// Quotes a string as an XPath 1.0 literal. XPath has no escape syntax, so a
/// value containing both quote kinds is built with `concat()`.
pub fn xpath_literal(value: &str) -> String {
    if !value.contains('\'') {
        return format!("'{}'", value);
    }
    if !value.contains('"') {
        return format!("\"{}\"", value);
    }
    let parts: Vec<String> = value
        .split('\'')
        .map(|part| format!("'{}'", part))
        .collect();
    format!("concat({})", parts.join(", \"'\", "))
}

/// XPath condition: the normalised text of `node` contains `needle` and the
/// character right after the first occurrence is not a digit. `translate`
/// strips digits, so a non-digit (or the empty string at end of text) is
/// left unchanged.
fn bounded_contains(node: &str, needle: &str) -> String {
    let text = format!("normalize-space({})", node);
    let lit = xpath_literal(needle);
    let next = format!("substring(substring-after({}, {}), 1, 1)", text, lit);
    format!(
        "contains({text}, {lit}) and translate({next}, '0123456789', '') = {next}",
        text = text,
        lit = lit,
        next = next
    )
}

pub fn email_input() -> Vec<Locator> {
    vec![
        Locator::css("input[placeholder*='Email' i]"),
        Locator::css("input[type='email']"),
        Locator::css("input[name='email']"),
        Locator::css("input[autocomplete='username']"),
    ]
}

pub fn password_input() -> Vec<Locator> {
    vec![
        Locator::css("input[placeholder*='Password' i]"),
        Locator::css("input[type='password']"),
        Locator::css("input[name='password']"),
    ]
}

pub fn login_button() -> Vec<Locator> {
    vec![
        Locator::button_text("Log in"),
        Locator::button_text("Sign in"),
        Locator::css("button[type='submit']"),
        Locator::css("form input[type='submit']"),
    ]
}

pub fn search_input() -> Vec<Locator> {
    vec![
        Locator::css("input[placeholder*='Search' i]"),
        Locator::css("input[type='search']"),
        Locator::css("[role='searchbox']"),
        Locator::css("[role='combobox'] input"),
    ]
}

/// Search result for a company, matched on its ticker.
pub fn company_result(ticker: &str) -> Vec<Locator> {
    let upper = ticker.to_uppercase();
    vec![
        Locator::XPath(format!(
            "//a[.//*[text()[normalize-space(.) = {lit}]] or text()[normalize-space(.) = {lit}]]",
            lit = xpath_literal(&upper)
        )),
        Locator::text_contains(&upper),
    ]
}

/// Tile for one quarter, one locator per label pattern.
pub fn quarter_tile(patterns: &[String]) -> Vec<Locator> {
    patterns.iter().map(|p| Locator::label_text(p)).collect()
}

/// Element carrying a document label.
pub fn document_tile(label: &str) -> Vec<Locator> {
    vec![
        Locator::XPath(format!(
            "//a[contains(normalize-space(.), {})]",
            xpath_literal(label)
        )),
        Locator::XPath(format!(
            "//button[contains(normalize-space(.), {})]",
            xpath_literal(label)
        )),
        Locator::text_contains(label),
    ]
}

static ANCHOR_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("Failed to compile ANCHOR_SELECTOR"));

fn clean_text(element: ElementRef) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Finds the link behind a document tile in a page snapshot. Anchors whose
/// href looks like a PDF are preferred over other anchors with the label.
/// Relative hrefs are resolved against `page_url`.
pub fn find_document_link(html: &str, label: &str, page_url: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let needle = label.to_lowercase();

    let mut fallback: Option<String> = None;
    for anchor in document.select(&ANCHOR_SELECTOR) {
        let text = clean_text(anchor).to_lowercase();
        let aria = anchor.value().attr("aria-label").unwrap_or_default().to_lowercase();
        if !text.contains(&needle) && !aria.contains(&needle) {
            continue;
        }
        let Some(href) = anchor.value().attr("href").map(str::trim) else { continue };
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
            continue;
        }
        let Some(resolved) = resolve_url(page_url, href) else { continue };
        if looks_like_pdf(&resolved) {
            tracing::debug!("Found PDF link for '{}': {}", label, resolved);
            return Some(resolved);
        }
        fallback.get_or_insert(resolved);
    }

    if let Some(link) = &fallback {
        tracing::debug!("Using non-PDF link for '{}': {}", label, link);
    }
    fallback
}

/// Regex for a label that must not run on into a longer word or number.
fn label_regex(label: &str) -> Option<Regex> {
    match Regex::new(&format!(r"\b{}(?:\D|$)", regex::escape(label))) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!("Skipping label pattern {:?}: {}", label, e);
            None
        }
    }
}

/// Returns the first label pattern that appears in the page text, if any.
/// A pattern only counts when the next character is not a digit.
pub fn first_visible_pattern<'a>(html: &str, patterns: &'a [String]) -> Option<&'a str> {
    let document = Html::parse_document(html);
    // Separate text nodes so adjacent tiles do not run together.
    let text = document
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    patterns
        .iter()
        .map(String::as_str)
        .find(|p| label_regex(p).is_some_and(|re| re.is_match(&text)))
}

pub fn resolve_url(base: &str, href: &str) -> Option<String> {
    match Url::parse(href) {
        Ok(url) => Some(url.to_string()),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(base).ok()?.join(href).ok().map(|u| u.to_string())
        }
        Err(_) => None,
    }
}

pub fn looks_like_pdf(url: &str) -> bool {
    let lower = url.to_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or_default();
    path.ends_with(".pdf") || lower.contains("application/pdf") || lower.contains("format=pdf")
}
