//! Config-driven deal extraction: CSS selectors and regex patterns as data.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use sdw_core::{
    ConfigError, DealDraft, ExtractionConfig, Source, DEFAULT_REQUIRED_DIRECT_DEBITS,
};
use sdw_storage::{FetchError, FetchedDocument, HttpFetcher};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "sdw-extract";

/// Formats tried for expiry text, in order, before the free-text fallback.
const STANDARD_DATE_FORMATS: [&str; 3] = ["%d/%m/%Y", "%d-%m-%Y", "%Y-%m-%d"];

#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The structural-drift signal: the page no longer looks like the config
    /// expects. Individual field failures are contained; this one is not.
    #[error("container selector {selector:?} matched no elements")]
    NoContainers { selector: String },
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid {field} pattern: {source}")]
    Pattern {
        field: &'static str,
        source: regex::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("building fetch client: {0}")]
    Client(#[from] anyhow::Error),
}

struct CompiledSelectors {
    container_source: String,
    container: Selector,
    name: Selector,
    reward: Option<Selector>,
    requirements: Option<Selector>,
    expiry: Option<Selector>,
}

struct CompiledPatterns {
    reward: Regex,
    direct_debits: Regex,
    pay_in: Regex,
}

/// One source's extraction behavior, compiled once from its validated config.
pub struct ExtractionEngine {
    fetcher: HttpFetcher,
    selectors: CompiledSelectors,
    patterns: CompiledPatterns,
    date_format_hint: Option<String>,
}

impl ExtractionEngine {
    pub fn for_config(config: &ExtractionConfig) -> Result<Self, ExtractionError> {
        config.validate()?;
        let selectors = CompiledSelectors {
            container_source: config.selectors.container.clone(),
            container: compile_selector(&config.selectors.container)?,
            name: compile_selector(&config.selectors.name)?,
            reward: compile_optional_selector(&config.selectors.reward)?,
            requirements: compile_optional_selector(&config.selectors.requirements)?,
            expiry: compile_optional_selector(&config.selectors.expiry)?,
        };
        let patterns = CompiledPatterns {
            reward: compile_pattern("reward_pattern", &config.parsing.reward_pattern)?,
            direct_debits: compile_pattern(
                "direct_debits_pattern",
                &config.parsing.direct_debits_pattern,
            )?,
            pay_in: compile_pattern("pay_in_pattern", &config.parsing.pay_in_pattern)?,
        };
        Ok(Self {
            fetcher: HttpFetcher::for_options(&config.options)?,
            selectors,
            patterns,
            date_format_hint: config.parsing.date_format_hint.clone(),
        })
    }

    /// Retrieve the raw document, retrying per the source's fetch options.
    pub async fn fetch_document(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        self.fetcher.fetch(url).await
    }

    /// Extract zero or more candidate records from a fetched document.
    ///
    /// A malformed container never aborts the pass: containers yielding an
    /// empty name or an unparseable reward are skipped and extraction
    /// continues. Zero matching containers is the one overall failure.
    pub fn extract_candidates(
        &self,
        body: &str,
        source: &Source,
    ) -> Result<Vec<DealDraft>, ExtractionError> {
        let document = Html::parse_document(body);
        let containers: Vec<ElementRef<'_>> =
            document.select(&self.selectors.container).collect();
        if containers.is_empty() {
            return Err(ExtractionError::NoContainers {
                selector: self.selectors.container_source.clone(),
            });
        }

        let mut drafts = Vec::with_capacity(containers.len());
        for container in containers {
            if let Some(draft) = self.draft_from_container(container, source) {
                drafts.push(draft);
            }
        }
        Ok(drafts)
    }

    fn draft_from_container(&self, el: ElementRef<'_>, source: &Source) -> Option<DealDraft> {
        let raw_text = normalize_whitespace(&el.text().collect::<String>());

        // Empty name is noise, not an error.
        let name = select_first_text(el, &self.selectors.name)?;

        let reward_text = match &self.selectors.reward {
            Some(sel) => select_first_text(el, sel)?,
            None => raw_text.clone(),
        };
        let reward_amount = match parse_money(&self.patterns.reward, &reward_text) {
            Some(amount) => amount,
            None => {
                debug!(
                    source = %source.name,
                    deal = %name,
                    text = %reward_text,
                    "skipping container with unparseable reward"
                );
                return None;
            }
        };

        // Requirements selector configured but matching nothing means the
        // documented defaults apply; no selector at all means the whole
        // container text is the haystack.
        let requirements_text = match &self.selectors.requirements {
            Some(sel) => select_joined_text(el, sel).unwrap_or_default(),
            None => raw_text.clone(),
        };
        let required_direct_debits = parse_count(&self.patterns.direct_debits, &requirements_text)
            .unwrap_or(DEFAULT_REQUIRED_DIRECT_DEBITS);
        let min_pay_in = parse_money(&self.patterns.pay_in, &requirements_text).unwrap_or(0.0);
        let debit_card_transactions =
            parse_count(debit_card_pattern(), &requirements_text).unwrap_or(0);
        let time_to_payout = payout_pattern()
            .find(&requirements_text)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        let expiry_date = self
            .selectors
            .expiry
            .as_ref()
            .and_then(|sel| select_first_text(el, sel))
            .and_then(|text| parse_expiry(&text, self.date_format_hint.as_deref()));

        Some(DealDraft {
            name,
            reward_amount,
            required_direct_debits,
            min_pay_in,
            debit_card_transactions,
            time_to_payout,
            expiry_date,
            source_id: source.id,
            source_name: source.name.clone(),
            source_priority: source.priority,
            raw_text,
        })
    }
}

fn compile_selector(source: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(source).map_err(|e| ExtractionError::Selector {
        selector: source.to_string(),
        message: e.to_string(),
    })
}

fn compile_optional_selector(source: &str) -> Result<Option<Selector>, ExtractionError> {
    if source.trim().is_empty() {
        return Ok(None);
    }
    compile_selector(source).map(Some)
}

fn compile_pattern(field: &'static str, source: &str) -> Result<Regex, ExtractionError> {
    Regex::new(source).map_err(|e| ExtractionError::Pattern { field, source: e })
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = normalize_whitespace(&value);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_joined_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    let parts: Vec<String> = scope
        .select(selector)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

/// First pattern match in `text` as a money amount, thousands separators and
/// currency marks stripped.
pub fn parse_money(pattern: &Regex, text: &str) -> Option<f64> {
    let captures = pattern.captures(text)?;
    let matched = captures.get(1).or_else(|| captures.get(0))?;
    matched
        .as_str()
        .replace([',', '£', ' '], "")
        .parse::<f64>()
        .ok()
}

/// First pattern match in `text` as a small count.
pub fn parse_count(pattern: &Regex, text: &str) -> Option<i32> {
    let captures = pattern.captures(text)?;
    let matched = captures.get(1).or_else(|| captures.get(0))?;
    matched.as_str().trim().parse::<i32>().ok()
}

/// Parse expiry text. Tried in order: the source's format hint, the standard
/// `DD/MM/YYYY` / `DD-MM-YYYY` / `YYYY-MM-DD` formats (against the whole
/// trimmed text, then against a date-shaped token inside it), then free-text
/// month-name formats. Returns None when nothing parses; expiry is optional.
pub fn parse_expiry(text: &str, hint: Option<&str>) -> Option<NaiveDate> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut formats: Vec<&str> = Vec::with_capacity(4);
    if let Some(hint) = hint {
        formats.push(hint);
    }
    formats.extend(STANDARD_DATE_FORMATS);

    for format in &formats {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }

    if let Some(token) = date_token_pattern().find(trimmed) {
        for format in &formats {
            if let Ok(date) = NaiveDate::parse_from_str(token.as_str(), format) {
                return Some(date);
            }
        }
    }

    parse_freeform_date(trimmed)
}

const FREEFORM_DATE_FORMATS: [&str; 4] = ["%d %B %Y", "%d %b %Y", "%B %d %Y", "%b %d %Y"];

fn parse_freeform_date(text: &str) -> Option<NaiveDate> {
    let cleaned = ordinal_suffix_pattern()
        .replace_all(&text.replace(',', ""), "$1")
        .into_owned();
    let cleaned = cleaned.trim();

    for format in FREEFORM_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(cleaned, format) {
            return Some(date);
        }
    }

    // A month-name date buried in longer text, e.g. "Offer ends 31 December 2025".
    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    for window in tokens.windows(3) {
        let candidate = window.join(" ");
        for format in FREEFORM_DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(&candidate, format) {
                return Some(date);
            }
        }
    }
    None
}

fn date_token_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{1,2}[/-]\d{1,2}[/-]\d{4}|\d{4}-\d{2}-\d{2}")
            .expect("static date token pattern")
    })
}

fn ordinal_suffix_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,2})(?:st|nd|rd|th)\b").expect("static ordinal pattern"))
}

fn debit_card_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\d+)\s+debit\s+card").expect("static debit card pattern")
    })
}

fn payout_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)within\s+\d+\s+(?:days?|weeks?|months?)").expect("static payout pattern")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdw_core::{FetchOptions, ParsingConfig, SelectorConfig};
    use uuid::Uuid;

    fn sample_config() -> ExtractionConfig {
        ExtractionConfig {
            selectors: SelectorConfig {
                container: ".deal-card".to_string(),
                name: ".deal-name".to_string(),
                reward: ".reward".to_string(),
                requirements: ".requirements li".to_string(),
                expiry: ".expiry".to_string(),
            },
            parsing: ParsingConfig::default(),
            options: FetchOptions::default(),
        }
    }

    fn sample_source() -> Source {
        Source {
            id: Uuid::new_v4(),
            name: "MoneyCompare".to_string(),
            endpoint: "https://moneycompare.test/switching".to_string(),
            priority: 10,
            active: true,
            extraction: sample_config(),
            last_run_at: None,
            last_run_status: None,
            last_run_deal_count: None,
        }
    }

    const PAGE: &str = r#"
        <html><body>
        <div class="deal-card">
            <h3 class="deal-name">Halifax Reward</h3>
            <span class="reward">£1,250.00 switch bonus</span>
            <ul class="requirements">
                <li>Set up 2 active direct debits</li>
                <li>Pay in £1,500 within 28 days</li>
                <li>Make 5 debit card payments</li>
            </ul>
            <span class="expiry">31/12/2025</span>
        </div>
        <div class="deal-card">
            <h3 class="deal-name">First Direct 1st Account</h3>
            <span class="reward">Get £175 when you switch</span>
        </div>
        <div class="deal-card">
            <h3 class="deal-name"> </h3>
            <span class="reward">£500</span>
        </div>
        <div class="deal-card">
            <h3 class="deal-name">Branch Only Offer</h3>
            <span class="reward">Ask in branch</span>
        </div>
        </body></html>
    "#;

    #[test]
    fn extracts_candidates_and_skips_noise_containers() {
        let engine = ExtractionEngine::for_config(&sample_config()).unwrap();
        let source = sample_source();
        let drafts = engine.extract_candidates(PAGE, &source).unwrap();

        // Empty-name and unparseable-reward containers are skipped silently.
        assert_eq!(drafts.len(), 2);

        let halifax = &drafts[0];
        assert_eq!(halifax.name, "Halifax Reward");
        assert_eq!(halifax.reward_amount, 1250.0);
        assert_eq!(halifax.required_direct_debits, 2);
        assert_eq!(halifax.min_pay_in, 1500.0);
        assert_eq!(halifax.debit_card_transactions, 5);
        assert_eq!(halifax.time_to_payout, "within 28 days");
        assert_eq!(
            halifax.expiry_date,
            NaiveDate::from_ymd_opt(2025, 12, 31)
        );
        assert_eq!(halifax.source_name, "MoneyCompare");
        assert_eq!(halifax.source_priority, 10);

        let first_direct = &drafts[1];
        assert_eq!(first_direct.reward_amount, 175.0);
        assert_eq!(
            first_direct.required_direct_debits,
            DEFAULT_REQUIRED_DIRECT_DEBITS
        );
        assert_eq!(first_direct.min_pay_in, 0.0);
        assert_eq!(first_direct.expiry_date, None);
    }

    #[test]
    fn zero_containers_is_a_structural_failure() {
        let engine = ExtractionEngine::for_config(&sample_config()).unwrap();
        let source = sample_source();
        let err = engine
            .extract_candidates("<html><body><p>redesigned page</p></body></html>", &source)
            .unwrap_err();
        assert!(matches!(err, ExtractionError::NoContainers { .. }));
    }

    #[test]
    fn extraction_is_deterministic() {
        let engine = ExtractionEngine::for_config(&sample_config()).unwrap();
        let source = sample_source();
        let first = engine.extract_candidates(PAGE, &source).unwrap();
        let second = engine.extract_candidates(PAGE, &source).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn reward_parsing_strips_thousands_separators() {
        let pattern = Regex::new(&ParsingConfig::default().reward_pattern).unwrap();
        assert_eq!(
            parse_money(&pattern, "£1,250.00 switch bonus"),
            Some(1250.0)
        );
        assert_eq!(parse_money(&pattern, "£175"), Some(175.0));
        assert_eq!(parse_money(&pattern, "no amount here"), None);
    }

    #[test]
    fn expiry_parses_standard_formats_in_order() {
        let expected = NaiveDate::from_ymd_opt(2025, 12, 31);
        assert_eq!(parse_expiry("31/12/2025", None), expected);
        assert_eq!(parse_expiry("31-12-2025", None), expected);
        assert_eq!(parse_expiry("2025-12-31", None), expected);
    }

    #[test]
    fn expiry_finds_dates_in_longer_text() {
        let expected = NaiveDate::from_ymd_opt(2025, 12, 31);
        assert_eq!(parse_expiry("Offer ends 31/12/2025", None), expected);
        assert_eq!(parse_expiry("Offer ends 31st December 2025", None), expected);
        assert_eq!(parse_expiry("December 31, 2025", None), expected);
    }

    #[test]
    fn unparseable_expiry_is_none_not_an_error() {
        assert_eq!(parse_expiry("no date here", None), None);
        assert_eq!(parse_expiry("", None), None);
    }

    #[test]
    fn format_hint_is_tried_first() {
        // US-ordered hint flips day and month for an ambiguous date.
        let hinted = parse_expiry("03/04/2025", Some("%m/%d/%Y"));
        assert_eq!(hinted, NaiveDate::from_ymd_opt(2025, 3, 4));
        let unhinted = parse_expiry("03/04/2025", None);
        assert_eq!(unhinted, NaiveDate::from_ymd_opt(2025, 4, 3));
    }

    #[test]
    fn whole_container_is_haystack_when_selectors_are_omitted() {
        let mut config = sample_config();
        config.selectors.reward = String::new();
        config.selectors.requirements = String::new();
        config.selectors.expiry = String::new();
        let engine = ExtractionEngine::for_config(&config).unwrap();
        let source = sample_source();

        let page = r#"
            <div class="deal-card">
                <h3 class="deal-name">Lloyds Club</h3>
                Switch and get £200 when you pay in £1,000 and set up 3 direct debits.
            </div>
        "#;
        let drafts = engine.extract_candidates(page, &source).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].reward_amount, 200.0);
        assert_eq!(drafts[0].min_pay_in, 1000.0);
        assert_eq!(drafts[0].required_direct_debits, 3);
    }
}
