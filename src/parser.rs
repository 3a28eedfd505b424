use crate::config::{ExtractConfig, ExtractMode, FieldSpec, default_fields};
use crate::model::Record;
use anyhow::{Context, Result, anyhow};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

/// Item extraction settings: one record per `container` match, one value
/// per field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorConfig {
    pub container: String,
    pub fields: Vec<FieldSpec>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            container: ".item".to_string(),
            fields: default_fields(),
        }
    }
}

impl From<&ExtractConfig> for SelectorConfig {
    fn from(extract: &ExtractConfig) -> Self {
        Self {
            container: extract.container.clone(),
            fields: extract.fields.clone(),
        }
    }
}

const META_TAGS: [(&str, &str); 6] = [
    ("description", r#"meta[name="description"]"#),
    ("keywords", r#"meta[name="keywords"]"#),
    ("author", r#"meta[name="author"]"#),
    ("og_title", r#"meta[property="og:title"]"#),
    ("og_description", r#"meta[property="og:description"]"#),
    ("og_image", r#"meta[property="og:image"]"#),
];

pub fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|err| anyhow!("invalid selector {selector}: {err:?}"))
}

/// Runs the extraction strategy named by `extract.mode` over one document.
pub fn extract_records(
    html: &str,
    extract: &ExtractConfig,
    base_url: Option<&str>,
) -> Result<Vec<Record>> {
    match extract.mode {
        ExtractMode::Items => parse_items_with_base(html, &SelectorConfig::from(extract), base_url),
        ExtractMode::Links => parse_links_with_base(html, &extract.link_selector, base_url),
        ExtractMode::Table => parse_table(html, &extract.table_selector),
        ExtractMode::Meta => Ok(vec![parse_meta(html)]),
    }
}

pub fn parse_items(html: &str, config: &SelectorConfig) -> Result<Vec<Record>> {
    parse_items_with_base(html, config, None)
}

pub fn parse_items_with_base(
    html: &str,
    config: &SelectorConfig,
    base_url: Option<&str>,
) -> Result<Vec<Record>> {
    let container = parse_selector(&config.container)?;
    let fields = config
        .fields
        .iter()
        .map(CompiledField::compile)
        .collect::<Result<Vec<_>>>()?;

    let document = Html::parse_document(html);
    let mut items = Vec::new();

    for card in document.select(&container) {
        let mut item = Record::new();
        for field in &fields {
            item.insert(field.spec.name.as_str(), field.extract(card, base_url));
        }
        items.push(item);
    }

    debug!(items = items.len(), container = %config.container, "parsed items from html");
    Ok(items)
}

struct CompiledField<'a> {
    spec: &'a FieldSpec,
    selector: Selector,
    attr: Option<&'a str>,
    regex: Option<Regex>,
}

impl<'a> CompiledField<'a> {
    fn compile(spec: &'a FieldSpec) -> Result<Self> {
        let (selector_text, inline_attr) = split_selector_attr(&spec.selector);
        let selector = parse_selector(selector_text)
            .with_context(|| format!("field {}", spec.name))?;
        let regex = spec
            .regex
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("invalid regex pattern {pattern}"))
            })
            .transpose()?;
        Ok(Self {
            spec,
            selector,
            attr: spec.attr.as_deref().or(inline_attr),
            regex,
        })
    }

    fn extract(&self, card: ElementRef<'_>, base_url: Option<&str>) -> Option<String> {
        let element = card.select(&self.selector).next()?;
        let mut value = match self.attr {
            Some(attr) => element.value().attr(attr)?.trim().to_string(),
            None => element_text(element),
        };

        if let Some(regex) = &self.regex {
            let capture = self
                .spec
                .capture
                .unwrap_or(if regex.captures_len() > 1 { 1 } else { 0 });
            value = regex
                .captures(&value)?
                .get(capture)?
                .as_str()
                .trim()
                .to_string();
        }

        if self.spec.absolutize {
            value = absolutize_url(base_url, &value);
        }

        Some(value)
    }
}

pub fn parse_links(html: &str, selector: &str) -> Result<Vec<Record>> {
    parse_links_with_base(html, selector, None)
}

pub fn parse_links_with_base(
    html: &str,
    selector: &str,
    base_url: Option<&str>,
) -> Result<Vec<Record>> {
    let anchors = parse_selector(selector)?;
    let document = Html::parse_document(html);

    let links = document
        .select(&anchors)
        .filter_map(|anchor| {
            let href = anchor.value().attr("href")?.trim();
            if href.is_empty() {
                return None;
            }
            let mut link = Record::new();
            link.insert("text", Some(element_text(anchor)));
            link.insert("href", Some(absolutize_url(base_url, href)));
            Some(link)
        })
        .collect::<Vec<_>>();

    debug!(links = links.len(), selector, "parsed links from html");
    Ok(links)
}

/// Reads the first table matching `selector`. Header names come from `th`
/// cells, falling back to the first row's `td` cells; only rows whose cell
/// count matches the header become records.
pub fn parse_table(html: &str, selector: &str) -> Result<Vec<Record>> {
    let table_selector = parse_selector(selector)?;
    let th = parse_selector("th")?;
    let tr = parse_selector("tr")?;
    let td = parse_selector("td")?;

    let document = Html::parse_document(html);
    let Some(table) = document.select(&table_selector).next() else {
        warn!(selector, "no table matched");
        return Ok(Vec::new());
    };

    let mut headers: Vec<String> = table.select(&th).map(element_text).collect();
    let mut skip_first_row = false;
    if headers.is_empty()
        && let Some(first_row) = table.select(&tr).next()
    {
        headers = first_row.select(&td).map(element_text).collect();
        skip_first_row = true;
    }

    let mut rows = Vec::new();
    for row in table.select(&tr).skip(usize::from(skip_first_row)) {
        let cells: Vec<String> = row.select(&td).map(element_text).collect();
        if cells.is_empty() || cells.len() != headers.len() {
            continue;
        }
        rows.push(
            headers
                .iter()
                .cloned()
                .zip(cells.into_iter().map(Some))
                .collect::<Record>(),
        );
    }

    debug!(
        rows = rows.len(),
        columns = headers.len(),
        "parsed table from html"
    );
    Ok(rows)
}

/// Collects the page title and common description/OpenGraph meta tags.
pub fn parse_meta(html: &str) -> Record {
    let document = Html::parse_document(html);
    let mut meta = Record::new();

    let title = Selector::parse("title")
        .ok()
        .and_then(|sel| document.select(&sel).next().map(element_text));
    meta.insert("title", title);

    for (key, selector) in META_TAGS {
        let content = Selector::parse(selector).ok().and_then(|sel| {
            document
                .select(&sel)
                .next()
                .and_then(|el| el.value().attr("content"))
                .map(ToString::to_string)
        });
        meta.insert(key, content);
    }

    meta
}

pub fn split_selector_attr(expression: &str) -> (&str, Option<&str>) {
    if let Some((selector, attr)) = expression.rsplit_once('@')
        && !attr.is_empty()
        && !attr.contains([' ', ']', '\'', '"'])
    {
        return (selector, Some(attr));
    }
    (expression, None)
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn absolutize_url(base_url: Option<&str>, value: &str) -> String {
    if value.starts_with("http://") || value.starts_with("https://") {
        return value.to_string();
    }

    if let Some(base) = base_url
        && let Ok(base_url) = Url::parse(base)
        && let Ok(joined) = base_url.join(value)
    {
        return joined.to_string();
    }

    value.to_string()
}
