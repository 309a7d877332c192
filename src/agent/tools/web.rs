use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{ParamKind, ParamSpec, Tool, ToolContext, ToolOutput, ToolSpec};

const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = concat!("agent_loop/", env!("CARGO_PKG_VERSION"));
const MAX_REDIRECTS: usize = 5;
// raw HTML read beyond max_bytes before text extraction
const BODY_MARGIN_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

fn selector(css: &str) -> anyhow::Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow::anyhow!("invalid selector {}: {:?}", css, e))
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn parse_search_results(html: &str, max: usize) -> anyhow::Result<Vec<SearchHit>> {
    let doc = Html::parse_document(html);
    let result_sel = selector(".result")?;
    let title_sel = selector("a.result__a")?;
    let snippet_sel = selector(".result__snippet")?;
    let mut out = Vec::new();
    for r in doc.select(&result_sel) {
        if out.len() >= max {
            break;
        }
        let Some(a) = r.select(&title_sel).next() else { continue };
        let title = collapse_ws(&a.text().collect::<String>());
        let url = a.value().attr("href").unwrap_or_default().to_string();
        let snippet = r.select(&snippet_sel).next().map(|s| collapse_ws(&s.text().collect::<String>())).unwrap_or_default();
        if title.is_empty() || url.is_empty() {
            continue;
        }
        out.push(SearchHit { title, url, snippet });
    }
    Ok(out)
}

/// Visible text of a page, skipping script and style bodies.
pub fn extract_text(html: &str) -> anyhow::Result<String> {
    let doc = Html::parse_document(html);
    let body_sel = selector("body")?;
    let root = doc.select(&body_sel).next().unwrap_or_else(|| doc.root_element());
    Ok(collapse_ws(&visible_text(root)))
}

fn visible_text(el: ElementRef<'_>) -> String {
    let mut out = String::new();
    for node in el.descendants() {
        let Some(text) = node.value().as_text() else { continue };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| matches!(e.name(), "script" | "style" | "noscript")))
            .unwrap_or(false);
        if !hidden {
            out.push_str(text);
            out.push(' ');
        }
    }
    out
}

fn truncate_chars(mut s: String, max_bytes: usize) -> String {
    if s.len() > max_bytes {
        let mut cut = max_bytes;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

pub fn is_allowed_host(allowlist: &[String], host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    allowlist.iter().any(|h| {
        let h = h.to_ascii_lowercase();
        host == h || host.ends_with(&format!(".{}", h))
    })
}

/// Scheme and host checks applied to the first request and to every redirect hop.
pub fn check_fetch_target(allowlist: &[String], url: &url::Url) -> Result<(), String> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme: {}", url.scheme()));
    }
    match url.host_str() {
        Some(host) if is_allowed_host(allowlist, host) => Ok(()),
        Some(host) => Err(format!("host not allowlisted: {}", host)),
        None => Err("invalid host".to_string()),
    }
}

/// Reads at most `limit` bytes of the body, chunk by chunk.
pub async fn read_capped(mut resp: reqwest::Response, limit: usize) -> reqwest::Result<Vec<u8>> {
    let mut buf = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        let room = limit - buf.len();
        if chunk.len() >= room {
            buf.extend_from_slice(&chunk[..room]);
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

pub struct WebSearchTool {
    client: reqwest::Client,
    endpoint: String,
}

impl WebSearchTool {
    pub fn new() -> Self {
        Self::with_endpoint(SEARCH_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), endpoint: endpoint.into() }
    }
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "web_search".into(),
            description: "Search the web. Returns titles, snippets and URLs of relevant pages; use it for current information.".into(),
            parameters: vec![
                ParamSpec::required("query", ParamKind::String, "The search query"),
                ParamSpec::optional("max_results", ParamKind::Integer, "Maximum results to return", Some(json!(5))),
            ],
        }
    }

    async fn run(&self, _ctx: ToolContext<'_>, args: Value) -> anyhow::Result<ToolOutput> {
        let query = args.get("query").and_then(|v| v.as_str()).ok_or_else(|| anyhow::anyhow!("missing query"))?;
        let max = args.get("max_results").and_then(|v| v.as_u64()).unwrap_or(5).clamp(1, 10) as usize;
        debug!(query, "web search");
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query)])
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("search failed: {}", resp.status());
        }
        let html = resp.text().await?;
        let hits = parse_search_results(&html, max)?;
        Ok(ToolOutput { summary: format!("{} results for {}", hits.len(), query), data: Some(serde_json::to_value(hits)?) })
    }
}

pub struct FetchUrlTool {
    client: reqwest::Client,
    allowlist: Vec<String>,
}

impl FetchUrlTool {
    pub fn new(allowlist: Vec<String>) -> reqwest::Result<Self> {
        let hops = allowlist.clone();
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > MAX_REDIRECTS {
                return attempt.error(format!("more than {} redirects", MAX_REDIRECTS));
            }
            match check_fetch_target(&hops, attempt.url()) {
                Ok(()) => attempt.follow(),
                Err(reason) => attempt.error(format!("redirect refused: {}", reason)),
            }
        });
        let client = reqwest::Client::builder().redirect(policy).build()?;
        Ok(Self { client, allowlist })
    }
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "fetch_url".into(),
            description: "Fetch a web page from an allowlisted host and return its visible text.".into(),
            parameters: vec![
                ParamSpec::required("url", ParamKind::String, "Absolute http(s) URL"),
                ParamSpec::optional("max_bytes", ParamKind::Integer, "Truncate text to this many bytes", Some(json!(16384))),
            ],
        }
    }

    async fn run(&self, _ctx: ToolContext<'_>, args: Value) -> anyhow::Result<ToolOutput> {
        let url = args.get("url").and_then(|v| v.as_str()).ok_or_else(|| anyhow::anyhow!("missing url"))?;
        let max_bytes = args.get("max_bytes").and_then(|v| v.as_u64()).unwrap_or(16384) as usize;
        let parsed = url::Url::parse(url)?;
        check_fetch_target(&self.allowlist, &parsed).map_err(|e| anyhow::anyhow!(e))?;
        let resp = self
            .client
            .get(parsed.clone())
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("fetch failed: {}", resp.status());
        }
        let raw = read_capped(resp, max_bytes.saturating_add(BODY_MARGIN_BYTES)).await?;
        let body = String::from_utf8_lossy(&raw);
        let text = truncate_chars(extract_text(&body)?, max_bytes);
        Ok(ToolOutput {
            summary: format!("url:{} bytes:{}", url, text.len()),
            data: Some(json!({ "url": url, "content": text })),
        })
    }
}
