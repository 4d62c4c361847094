//! Source descriptors: one capability struct per external source.
//!
//! Every source shares the same retry/cache/concurrency wrapper in
//! [`BoundedFetcher`](super::BoundedFetcher); only the pieces described
//! here differ between sources.

use regex::Regex;
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Builds the request URL from the base URL and a normalized key.
pub type EndpointBuilder = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// Parses a successful response body for a normalized key.
pub type ResponseParser = Arc<dyn Fn(&str, &str) -> Result<Value, String> + Send + Sync>;

/// Produces the canonical empty shape for a normalized key.
pub type DefaultValue = Arc<dyn Fn(&str) -> Value + Send + Sync>;

/// Normalizes a caller-supplied key before caching and fetching.
pub type KeyNormalizer = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// How results from a source are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Content-stable data, cached with no expiry.
    AppendOnly,
    /// Mutable reference data, cached with a bounded lifetime.
    ///
    /// `None` uses the fetcher's configured default lifetime.
    Refreshable(Option<Duration>),
}

impl CachePolicy {
    /// Lifetime for a new entry, given the configured default.
    #[must_use]
    pub fn ttl(&self, default_ttl: Duration) -> Option<Duration> {
        match self {
            Self::AppendOnly => None,
            Self::Refreshable(ttl) => Some(ttl.unwrap_or(default_ttl)),
        }
    }
}

/// Everything the fetcher needs to know about one external source.
#[derive(Clone)]
pub struct SourceDescriptor {
    name: String,
    endpoint: EndpointBuilder,
    parser: ResponseParser,
    default_value: DefaultValue,
    cache_policy: CachePolicy,
    max_concurrency: Option<usize>,
    normalizer: KeyNormalizer,
}

impl SourceDescriptor {
    /// Creates a descriptor.
    ///
    /// Defaults to the append-only policy, the fetcher-wide concurrency cap,
    /// and a trimming normalizer.
    pub fn new<E, P, D>(name: impl Into<String>, endpoint: E, parser: P, default_value: D) -> Self
    where
        E: Fn(&str, &str) -> String + Send + Sync + 'static,
        P: Fn(&str, &str) -> Result<Value, String> + Send + Sync + 'static,
        D: Fn(&str) -> Value + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            endpoint: Arc::new(endpoint),
            parser: Arc::new(parser),
            default_value: Arc::new(default_value),
            cache_policy: CachePolicy::AppendOnly,
            max_concurrency: None,
            normalizer: Arc::new(normalize_trimmed),
        }
    }

    /// A JSON source served at `{base}/{path}/{key}`.
    pub fn json<D>(name: impl Into<String>, path: impl Into<String>, default_value: D) -> Self
    where
        D: Fn(&str) -> Value + Send + Sync + 'static,
    {
        let path = path.into();
        Self::new(
            name,
            move |base, key| format!("{}/{}/{}", base.trim_end_matches('/'), path.trim_matches('/'), key),
            parse_json_body,
            default_value,
        )
    }

    /// Sets the cache policy.
    #[must_use]
    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Sets the in-flight cap for this source.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    /// Sets the key normalizer.
    #[must_use]
    pub fn with_normalizer<N>(mut self, normalizer: N) -> Self
    where
        N: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.normalizer = Arc::new(normalizer);
        self
    }

    /// The source name, also the cache key prefix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cache policy.
    #[must_use]
    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// The in-flight cap, if the source sets one.
    #[must_use]
    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    /// Normalizes a key.
    #[must_use]
    pub fn normalize(&self, key: &str) -> String {
        (self.normalizer)(key)
    }

    /// Builds the URL for a normalized key.
    #[must_use]
    pub fn endpoint(&self, base_url: &str, normalized_key: &str) -> String {
        (self.endpoint)(base_url, normalized_key)
    }

    /// Parses a response body.
    pub fn parse(&self, normalized_key: &str, body: &str) -> Result<Value, String> {
        (self.parser)(normalized_key, body)
    }

    /// The canonical empty shape for a key.
    #[must_use]
    pub fn default_value(&self, normalized_key: &str) -> Value {
        (self.default_value)(normalized_key)
    }
}

impl fmt::Debug for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceDescriptor")
            .field("name", &self.name)
            .field("cache_policy", &self.cache_policy)
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

/// Parses a body as JSON.
pub fn parse_json_body(_key: &str, body: &str) -> Result<Value, String> {
    serde_json::from_str(body).map_err(|e| e.to_string())
}

/// Trims surrounding whitespace.
#[must_use]
pub fn normalize_trimmed(key: &str) -> String {
    key.trim().to_string()
}

/// Trims and upper-cases a gene symbol.
#[must_use]
pub fn normalize_gene_symbol(key: &str) -> String {
    key.trim().to_uppercase()
}

fn accession_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(?:[^|]*\|)?([^|\-\s]+)").ok())
        .as_ref()
}

/// Extracts a bare protein accession.
///
/// `sp|P31749|AKT1_HUMAN` becomes `P31749` and the isoform suffix of
/// `P31749-2` is dropped.
#[must_use]
pub fn normalize_protein_accession(key: &str) -> String {
    let trimmed = key.trim();
    accession_pattern()
        .and_then(|re| re.captures(trimmed))
        .and_then(|caps| caps.get(1))
        .map_or_else(|| trimmed.to_string(), |m| m.as_str().to_string())
}

/// Protein annotation lookups. Content-stable, so cached forever.
#[must_use]
pub fn uniprot() -> SourceDescriptor {
    SourceDescriptor::json("uniprot", "tools/uniprot", |key| {
        json!({
            "protein_id": key,
            "subcellular_location": [],
            "function_summary": "",
            "go_terms_bp": [],
            "go_terms_mf": [],
            "go_terms_cc": [],
        })
    })
    .with_normalizer(normalize_protein_accession)
    .with_max_concurrency(5)
}

/// Pathway membership. Curated upstream, so refreshed periodically.
#[must_use]
pub fn kegg() -> SourceDescriptor {
    SourceDescriptor::json("kegg", "tools/kegg", |key| {
        json!({"gene_name": key, "pathways": []})
    })
    .with_cache_policy(CachePolicy::Refreshable(None))
    .with_max_concurrency(3)
}

/// Protein domain annotations.
#[must_use]
pub fn interpro() -> SourceDescriptor {
    SourceDescriptor::json("interpro", "tools/interpro", |key| {
        json!({"protein_id": key, "domains": []})
    })
    .with_normalizer(normalize_protein_accession)
    .with_max_concurrency(4)
}

/// Tissue expression profiles.
#[must_use]
pub fn expression() -> SourceDescriptor {
    SourceDescriptor::json("hpa", "tools/hpa", |key| {
        json!({"gene_name": key, "tissues": []})
    })
    .with_normalizer(normalize_gene_symbol)
    .with_max_concurrency(5)
}

/// Article full text by PubMed id.
#[must_use]
pub fn fulltext() -> SourceDescriptor {
    SourceDescriptor::json("pmc_fulltext", "tools/fulltext", |key| {
        json!({"pmid": key, "available": false, "sections": []})
    })
    .with_max_concurrency(3)
}
