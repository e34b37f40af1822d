use std::collections::{HashSet, VecDeque};

use anyhow::{Context, Result};
use scraper::{Html, Selector};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use url::Url;

use super::{failed, succeeded, write_output, OperationContext};
use crate::sandbox::SandboxedPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Json,
    Csv,
}

impl DataFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeArgs {
    pub url: String,
    pub selectors: Vec<String>,
    pub output: SandboxedPath,
    pub format: DataFormat,
    pub max_depth: usize,
}

struct PageRecord {
    url: Url,
    data: Map<String, Value>,
    elements: usize,
}

pub async fn run(ctx: &OperationContext, args: ScrapeArgs) -> Result<Value> {
    let start = match Url::parse(args.url.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        _ => return Ok(failed(format!("`{}` is not an http(s) URL", args.url))),
    };
    if let Some(bad) = args
        .selectors
        .iter()
        .find(|selector| Selector::parse(selector).is_err())
    {
        return Ok(failed(format!("invalid CSS selector `{bad}`")));
    }

    let max_pages = ctx.settings.scrape_max_pages.max(1);
    let mut queue = VecDeque::from([(strip_fragment(start.clone()), 1_usize)]);
    let mut seen = HashSet::from([strip_fragment(start.clone())]);
    let mut pages: Vec<PageRecord> = Vec::new();

    while let Some((page_url, depth)) = queue.pop_front() {
        if pages.len() >= max_pages {
            break;
        }
        let body = match fetch_page(ctx, &page_url).await {
            Ok(body) => body,
            Err(err) if pages.is_empty() => return Ok(failed(format!("{err:#}"))),
            Err(err) => {
                warn!(url = %page_url, "skipping page: {err:#}");
                continue;
            }
        };

        let follow = depth < args.max_depth;
        let (data, elements, links) = extract_page(&body, &page_url, &args.selectors, follow);
        debug!(url = %page_url, depth, elements, links = links.len(), "scraped page");
        for link in links {
            if seen.insert(link.clone()) {
                queue.push_back((link, depth + 1));
            }
        }
        pages.push(PageRecord {
            url: page_url,
            data,
            elements,
        });
    }

    let elements_found = pages.iter().map(|page| page.elements).sum::<usize>();
    let rendered = match args.format {
        DataFormat::Json => render_json(&pages)?,
        DataFormat::Csv => render_csv(&pages, &args.selectors),
    };
    write_output(&args.output, rendered).await?;

    Ok(succeeded(
        format!(
            "scraped {elements_found} elements from {} pages into {}",
            pages.len(),
            args.output
        ),
        json!({
            "elements_found": elements_found,
            "pages_visited": pages.len(),
            "output_file": args.output.relative(),
        }),
    ))
}

async fn fetch_page(ctx: &OperationContext, url: &Url) -> Result<String> {
    let response = ctx
        .http
        .get(url.clone())
        .send()
        .await
        .with_context(|| format!("failed fetching {url}"))?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("{url} answered with status {}", status.as_u16());
    }
    response
        .text()
        .await
        .with_context(|| format!("failed reading body of {url}"))
}

/// Parses one page. Kept synchronous: `Html` must not live across an await.
fn extract_page(
    body: &str,
    page_url: &Url,
    selectors: &[String],
    follow_links: bool,
) -> (Map<String, Value>, usize, Vec<Url>) {
    let document = Html::parse_document(body);
    let mut data = Map::new();
    let mut elements = 0;
    for raw in selectors {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        let texts = document
            .select(&selector)
            .map(|element| {
                element
                    .text()
                    .flat_map(str::split_whitespace)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|text| !text.is_empty())
            .map(Value::String)
            .collect::<Vec<_>>();
        elements += texts.len();
        data.insert(raw.clone(), Value::Array(texts));
    }

    let mut links = Vec::new();
    if follow_links {
        if let Ok(anchor) = Selector::parse("a[href]") {
            for element in document.select(&anchor) {
                let Some(href) = element.value().attr("href") else {
                    continue;
                };
                let Ok(target) = page_url.join(href) else {
                    continue;
                };
                if same_origin(page_url, &target) {
                    links.push(strip_fragment(target));
                }
            }
        }
    }
    (data, elements, links)
}

fn same_origin(left: &Url, right: &Url) -> bool {
    matches!(right.scheme(), "http" | "https")
        && left.scheme() == right.scheme()
        && left.host_str() == right.host_str()
        && left.port_or_known_default() == right.port_or_known_default()
}

fn strip_fragment(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

fn render_json(pages: &[PageRecord]) -> Result<String> {
    let documents = pages
        .iter()
        .map(|page| json!({ "url": page.url.as_str(), "data": page.data }))
        .collect::<Vec<_>>();
    serde_json::to_string_pretty(&documents).context("failed serializing scraped data")
}

fn render_csv(pages: &[PageRecord], selectors: &[String]) -> String {
    let mut out = String::new();
    let header = std::iter::once("url")
        .chain(selectors.iter().map(String::as_str))
        .map(csv_field)
        .collect::<Vec<_>>();
    out.push_str(&header.join(","));
    out.push('\n');
    for page in pages {
        let mut row = vec![csv_field(page.url.as_str())];
        for selector in selectors {
            let joined = page
                .data
                .get(selector)
                .and_then(Value::as_array)
                .map(|texts| {
                    texts
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(" | ")
                })
                .unwrap_or_default();
            row.push(csv_field(&joined));
        }
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperationsConfig;
    use crate::llm::testing::{serve_many, serve_once};
    use crate::operations::testing::{context, context_with, status};

    const FIRST_PAGE: &str = r#"<html><body>
<h1 class="title">Quarterly   report</h1>
<ul><li class="item">alpha</li><li class="item">beta, gamma</li></ul>
<a href="/next#top">next</a>
<a href="https://elsewhere.example/">external</a>
</body></html>"#;

    const SECOND_PAGE: &str =
        r#"<html><body><h1 class="title">Next page</h1><a href="/">home</a></body></html>"#;

    #[test]
    fn extract_page_collects_text_and_same_origin_links() {
        let page = Url::parse("http://127.0.0.1:8080/index.html").expect("url");
        let (data, elements, links) = extract_page(
            FIRST_PAGE,
            &page,
            &["h1.title".to_owned(), "li.item".to_owned()],
            true,
        );
        assert_eq!(data["h1.title"], json!(["Quarterly report"]));
        assert_eq!(data["li.item"], json!(["alpha", "beta, gamma"]));
        assert_eq!(elements, 3);
        assert_eq!(
            links,
            vec![Url::parse("http://127.0.0.1:8080/next").expect("url")]
        );
    }

    #[test]
    fn csv_quotes_fields_and_joins_matches() {
        let mut data = Map::new();
        data.insert("li".to_owned(), json!(["alpha", "beta, gamma"]));
        let pages = vec![PageRecord {
            url: Url::parse("http://example.com/").expect("url"),
            data,
            elements: 2,
        }];
        assert_eq!(
            render_csv(&pages, &["li".to_owned()]),
            "url,li\nhttp://example.com/,\"alpha | beta, gamma\"\n"
        );
    }

    #[tokio::test]
    async fn crawls_to_requested_depth() {
        let (base, _captured, server) = serve_many(vec![
            ("200 OK", "text/html", FIRST_PAGE.to_owned()),
            ("200 OK", "text/html", SECOND_PAGE.to_owned()),
        ]);
        let ctx = context("scrape-depth");
        let output = ctx.guard.resolve("/data/scraped.json").expect("output");
        let outcome = run(
            &ctx,
            ScrapeArgs {
                url: format!("{base}/"),
                selectors: vec!["h1.title".to_owned()],
                output: output.clone(),
                format: DataFormat::Json,
                max_depth: 2,
            },
        )
        .await
        .expect("run");
        server.join().expect("join server");

        assert_eq!(status(&outcome), "success");
        assert_eq!(outcome["pages_visited"], json!(2));
        assert_eq!(outcome["elements_found"], json!(2));
        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(output.as_path()).expect("read"))
                .expect("json");
        assert_eq!(written[1]["data"]["h1.title"], json!(["Next page"]));
    }

    #[tokio::test]
    async fn page_cap_limits_crawl() {
        let (base, _captured, server) =
            serve_once("200 OK", "text/html", FIRST_PAGE.to_owned());
        let settings = OperationsConfig {
            scrape_max_pages: 1,
            ..OperationsConfig::default()
        };
        let ctx = context_with("scrape-cap", None, settings);
        let outcome = run(
            &ctx,
            ScrapeArgs {
                url: format!("{base}/"),
                selectors: vec!["li.item".to_owned()],
                output: ctx.guard.resolve("scraped.csv").expect("output"),
                format: DataFormat::Csv,
                max_depth: 5,
            },
        )
        .await
        .expect("run");
        server.join().expect("join server");
        assert_eq!(outcome["pages_visited"], json!(1));
    }

    #[tokio::test]
    async fn invalid_selector_is_an_error_status() {
        let ctx = context("scrape-selector");
        let outcome = run(
            &ctx,
            ScrapeArgs {
                url: "http://127.0.0.1:9/".to_owned(),
                selectors: vec!["div[".to_owned()],
                output: ctx.guard.resolve("scraped.json").expect("output"),
                format: DataFormat::Json,
                max_depth: 1,
            },
        )
        .await
        .expect("run");
        assert_eq!(status(&outcome), "error");
    }
}
