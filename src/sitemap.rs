use anyhow::{Context, Result};
use quick_xml::events::Event;
use regex::Regex;
use tracing::info;

/// Fetch a sitemap and keep the `<loc>` URLs matching `pattern`.
pub async fn fetch_target_urls(sitemap_url: &str, pattern: &str) -> Result<Vec<String>> {
    let re = Regex::new(pattern).with_context(|| format!("Bad URL pattern {:?}", pattern))?;
    let client = reqwest::Client::new();

    info!("Fetching sitemap: {}", sitemap_url);
    let xml = client
        .get(sitemap_url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
        .with_context(|| format!("Failed to fetch sitemap {}", sitemap_url))?;

    let all = parse_locs(&xml)?;
    info!("Sitemap lists {} URLs", all.len());

    let kept = filter_urls(all, &re);
    info!("{} URLs match {:?}", kept.len(), pattern);
    Ok(kept)
}

fn filter_urls(urls: Vec<String>, re: &Regex) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    urls.into_iter()
        .filter(|u| re.is_match(u))
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

/// Every `<loc>` inside a `<url>` element, in document order.
fn parse_locs(xml: &str) -> Result<Vec<String>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut urls = Vec::new();
    let mut in_url = false;
    let mut in_loc = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"url" => in_url = true,
                b"loc" if in_url => in_loc = true,
                _ => {}
            },
            Event::Text(e) if in_loc => {
                let loc = e.unescape()?;
                let loc = loc.trim();
                if !loc.is_empty() {
                    urls.push(loc.to_string());
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"loc" => in_loc = false,
                b"url" => in_url = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(urls)
}
