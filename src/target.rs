use std::sync::LazyLock;

use regex::Regex;

const SLUG_MAX: usize = 64;
const LABEL_DIGEST_LEN: usize = 12;

static SLUG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budgets {
    /// Stop once this many records are admitted.
    pub record_limit: usize,
    /// Reveal/read rounds per attempt.
    pub round_budget: u32,
    /// Total attempts, first one included.
    pub retry_budget: u32,
}

/// One scrape job. Fixed for the duration of a run.
#[derive(Debug, Clone)]
pub struct Target {
    pub label: String,
    pub url: String,
    pub profile: String,
    pub budgets: Budgets,
}

impl Target {
    pub fn new(url: &str, profile: &str, budgets: Budgets) -> Self {
        Target {
            label: label_for(url),
            url: url.to_string(),
            profile: profile.to_string(),
            budgets,
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }
}

/// Output label for a URL: a readable slug plus a short digest of the full
/// URL. Distinct URLs get distinct labels even when their slugs agree
/// (`a/b` and `a-b`) or share a long prefix past the slug's cut-off.
pub fn label_for(url: &str) -> String {
    let digest = blake3::hash(url.as_bytes()).to_hex();
    format!("{}-{}", slugify(url), &digest.as_str()[..LABEL_DIGEST_LEN])
}

/// File-name-safe form of a URL or query: lowercase, runs of anything else
/// collapsed to `-`, scheme dropped.
pub fn slugify(s: &str) -> String {
    let s = s.to_lowercase();
    let s = s
        .strip_prefix("https://")
        .or_else(|| s.strip_prefix("http://"))
        .unwrap_or(&s);
    let slug = SLUG_RE.replace_all(s, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "target".to_string()
    } else {
        slug.chars().take(SLUG_MAX).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs() {
        assert_eq!(
            slugify("https://www.example.com/product/42/reviews?page={page}"),
            "www-example-com-product-42-reviews-page-page"
        );
        assert_eq!(slugify("best hiking boots"), "best-hiking-boots");
        assert_eq!(slugify("???"), "target");
    }

    #[test]
    fn labels_keep_the_slug_readable() {
        let label = label_for("https://shop.test/p/1/reviews");
        assert!(label.starts_with("shop-test-p-1-reviews-"));
        assert_eq!(label.len(), "shop-test-p-1-reviews-".len() + LABEL_DIGEST_LEN);
        assert_eq!(label, label_for("https://shop.test/p/1/reviews"));
    }

    #[test]
    fn distinct_urls_never_share_a_label() {
        let stem = format!("https://shop.test/{}", "category/".repeat(12));
        let a = format!("{}item-1/reviews", stem);
        let b = format!("{}item-2/reviews", stem);
        assert_eq!(slugify(&a), slugify(&b));
        assert_ne!(label_for(&a), label_for(&b));

        assert_eq!(slugify("https://x.test/a/b"), slugify("https://x.test/a-b"));
        assert_ne!(label_for("https://x.test/a/b"), label_for("https://x.test/a-b"));
    }
}
