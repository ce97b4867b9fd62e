use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};

use crate::{
    config::ResolverConfig,
    location::{is_relative_path, looks_absolute, Href},
    Result,
};

/// Response returned by a [`Fetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
}

impl FetchResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            body: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network access used to download the build manifest.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchResponse>;
}

/// Read access to the URL of the page hosting the toys.
pub trait PageLocation: Send + Sync {
    /// `None` when there is no browsing context.
    fn current_url(&self) -> Option<String>;
}

/// Base URL that manifest files and module paths are resolved against.
#[derive(Clone)]
pub enum BaseUrl {
    Static(String),
    /// Evaluated at every resolution, so deployments can compute it late.
    Lazy(Arc<dyn Fn() -> Option<String> + Send + Sync>),
}

impl BaseUrl {
    pub fn lazy<F>(f: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        Self::Lazy(Arc::new(f))
    }

    fn get(&self) -> Option<String> {
        match self {
            Self::Static(url) => Some(url.clone()),
            Self::Lazy(f) => f(),
        }
    }
}

impl fmt::Debug for BaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(url) => f.debug_tuple("Static").field(url).finish(),
            Self::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

/// One compiled output recorded in the build manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManifestEntry {
    pub file: Option<String>,
    pub url: Option<String>,
    pub src: Option<String>,
    pub is_entry: bool,
    pub imports: Vec<String>,
    pub dynamic_imports: Vec<String>,
    pub css: Vec<String>,
}

impl ManifestEntry {
    /// The compiled location this entry points at, if any.
    pub fn target(&self) -> Option<&str> {
        let usable = |target: &&str| !target.is_empty();
        self.file
            .as_deref()
            .filter(usable)
            .or_else(|| self.url.as_deref().filter(usable))
    }
}

/// Build manifest mapping logical module keys to compiled files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: HashMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks `key` up exactly, then without a leading `./` or `/`.
    pub fn entry(&self, key: &str) -> Option<&ManifestEntry> {
        self.entries.get(key).or_else(|| {
            let trimmed = key.trim_start_matches("./").trim_start_matches('/');
            self.entries.get(trimmed)
        })
    }
}

type ManifestFuture = Shared<BoxFuture<'static, Option<Arc<Manifest>>>>;

/// Turns logical module keys into loadable paths.
///
/// The manifest is downloaded lazily on first use. The in-flight future is
/// cached, so concurrent callers share one fetch sequence and the sequence
/// runs at most once per resolver.
pub struct ModuleResolver {
    fetcher: Arc<dyn Fetcher>,
    base_url: Option<BaseUrl>,
    location: Option<Arc<dyn PageLocation>>,
    module_origin: Option<String>,
    manifest_candidates: Vec<String>,
    manifest: Mutex<Option<ManifestFuture>>,
}

impl ModuleResolver {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self::from_config(fetcher, &ResolverConfig::default())
    }

    pub fn from_config(fetcher: Arc<dyn Fetcher>, config: &ResolverConfig) -> Self {
        Self {
            fetcher,
            base_url: config.base_url.clone().map(BaseUrl::Static),
            location: None,
            module_origin: config.module_origin.clone(),
            manifest_candidates: config.manifest_candidates.clone(),
            manifest: Mutex::new(None),
        }
    }

    pub fn with_base_url(mut self, base_url: BaseUrl) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn with_location(mut self, location: Arc<dyn PageLocation>) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_module_origin(mut self, origin: impl Into<String>) -> Self {
        self.module_origin = Some(origin.into());
        self
    }

    pub fn with_manifest_candidates(mut self, candidates: Vec<String>) -> Self {
        self.manifest_candidates = candidates;
        self
    }

    /// Explicit base URL if one is configured and yields a value, else the
    /// page location.
    pub fn base_url(&self) -> Option<String> {
        self.base_url
            .as_ref()
            .and_then(BaseUrl::get)
            .or_else(|| self.location.as_ref().and_then(|l| l.current_url()))
    }

    /// Returns the build manifest, downloading it on the first call.
    ///
    /// `None` when every candidate location failed; that outcome is cached
    /// like a successful one.
    pub async fn fetch_manifest(&self) -> Option<Arc<Manifest>> {
        let pending = {
            let mut slot = self.manifest.lock().unwrap_or_else(PoisonError::into_inner);
            slot.get_or_insert_with(|| self.start_manifest_fetch())
                .clone()
        };
        pending.await
    }

    /// Resolves `key` to a path the module loader can import. Never fails:
    /// without a manifest it falls back to plain path rules.
    pub async fn resolve_module_path(&self, key: &str) -> String {
        let manifest = self.fetch_manifest().await;
        let base = self.base_url();

        if let Some(target) = manifest
            .as_deref()
            .and_then(|manifest| manifest.entry(key))
            .and_then(ManifestEntry::target)
        {
            let resolved = match &base {
                Some(base) => resolve_reference(base, target),
                None => target.to_string(),
            };
            tracing::debug!(key, path = %resolved, "resolved module from manifest");
            return resolved;
        }

        if is_relative_path(key) {
            if let Some(origin) = &self.module_origin {
                return resolve_reference(origin, key);
            }
        }

        match &base {
            Some(base) => resolve_reference(base, key),
            None if looks_absolute(key) || is_relative_path(key) => key.to_string(),
            None => format!("/{key}"),
        }
    }

    fn start_manifest_fetch(&self) -> ManifestFuture {
        let fetcher = self.fetcher.clone();
        let urls = self.manifest_urls();
        async move { download_manifest(fetcher, urls).await }
            .boxed()
            .shared()
    }

    fn manifest_urls(&self) -> Vec<String> {
        let base = self.base_url();
        self.manifest_candidates
            .iter()
            .map(|candidate| match &base {
                Some(base) => Href::parse(base).join(candidate).to_string(),
                None if looks_absolute(candidate) => candidate.clone(),
                None => format!("/{}", candidate.trim_start_matches("./")),
            })
            .collect()
    }
}

impl fmt::Debug for ModuleResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleResolver")
            .field("base_url", &self.base_url)
            .field("module_origin", &self.module_origin)
            .field("manifest_candidates", &self.manifest_candidates)
            .finish()
    }
}

/// Same-origin references resolve to a path; references carrying their own
/// scheme or host keep the full URL.
fn resolve_reference(base: &str, reference: &str) -> String {
    let joined = Href::parse(base).join(reference);
    if reference.starts_with("//") || (looks_absolute(reference) && !reference.starts_with('/')) {
        joined.to_string()
    } else {
        joined.path_and_query()
    }
}

async fn download_manifest(fetcher: Arc<dyn Fetcher>, urls: Vec<String>) -> Option<Arc<Manifest>> {
    for url in &urls {
        match fetcher.fetch(url).await {
            Ok(response) if response.is_success() => match Manifest::from_json_str(&response.body) {
                Ok(manifest) => {
                    tracing::info!(candidate = %url, entries = manifest.len(), "loaded build manifest");
                    return Some(Arc::new(manifest));
                }
                Err(err) => tracing::debug!(candidate = %url, %err, "manifest is not valid json"),
            },
            Ok(response) => {
                tracing::debug!(candidate = %url, status = response.status, "manifest not served")
            }
            Err(err) => tracing::debug!(candidate = %url, %err, "manifest fetch failed"),
        }
    }
    tracing::warn!(candidates = urls.len(), "no build manifest found, using default paths");
    None
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::ToyboxError;

    /// Serves canned responses and records every requested URL.
    #[derive(Default)]
    struct FakeFetcher {
        responses: HashMap<String, FetchResponse>,
        requests: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl FakeFetcher {
        fn serving(url: &str, body: &str) -> Self {
            let mut fetcher = Self::default();
            fetcher
                .responses
                .insert(url.to_string(), FetchResponse::ok(body));
            fetcher
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(url.to_string());
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            self.responses
                .get(url)
                .cloned()
                .ok_or_else(|| ToyboxError::msg(format!("connection refused: {url}")))
        }
    }

    struct FixedLocation(Option<&'static str>);

    impl PageLocation for FixedLocation {
        fn current_url(&self) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    const MANIFEST: &str = r#"{ "a.ts": { "file": "a.123.js", "isEntry": true } }"#;

    #[tokio::test]
    async fn resolves_manifest_entry_against_base() {
        let fetcher = Arc::new(FakeFetcher::serving(
            "http://example.com/site/.vite/manifest.json",
            MANIFEST,
        ));
        let resolver = ModuleResolver::new(fetcher.clone())
            .with_base_url(BaseUrl::Static("http://example.com/site/".to_string()));

        assert_eq!(resolver.resolve_module_path("a.ts").await, "/site/a.123.js");
        assert_eq!(resolver.resolve_module_path("./a.ts").await, "/site/a.123.js");
        assert_eq!(fetcher.requests().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_resolutions_share_one_fetch() {
        let fetcher = Arc::new(FakeFetcher::serving(
            "http://example.com/site/manifest.json",
            MANIFEST,
        ));
        let resolver = ModuleResolver::new(fetcher.clone())
            .with_base_url(BaseUrl::Static("http://example.com/site/".to_string()));

        let results =
            futures::future::join_all((0..8).map(|_| resolver.resolve_module_path("a.ts"))).await;

        assert!(results.iter().all(|path| path == "/site/a.123.js"));
        assert_eq!(
            fetcher.requests(),
            vec![
                "http://example.com/site/.vite/manifest.json".to_string(),
                "http://example.com/site/manifest.json".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn missing_manifest_falls_back_to_root_paths() {
        let fetcher = Arc::new(FakeFetcher::default());
        let resolver = ModuleResolver::new(fetcher.clone());

        assert!(resolver.fetch_manifest().await.is_none());
        assert_eq!(resolver.resolve_module_path("x.ts").await, "/x.ts");
        assert_eq!(resolver.resolve_module_path("/abs/x.ts").await, "/abs/x.ts");
        assert_eq!(resolver.resolve_module_path("./rel/x.ts").await, "./rel/x.ts");
        assert_eq!(
            fetcher.requests(),
            vec!["/.vite/manifest.json".to_string(), "/manifest.json".to_string()]
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn skips_unsuccessful_and_malformed_candidates() {
        let mut fetcher = FakeFetcher::default();
        fetcher
            .responses
            .insert("/one.json".to_string(), FetchResponse::not_found());
        fetcher
            .responses
            .insert("/two.json".to_string(), FetchResponse::ok("<html>"));
        fetcher
            .responses
            .insert("/three.json".to_string(), FetchResponse::ok(MANIFEST));
        let fetcher = Arc::new(fetcher);
        let resolver = ModuleResolver::new(fetcher.clone()).with_manifest_candidates(vec![
            "one.json".to_string(),
            "two.json".to_string(),
            "three.json".to_string(),
            "four.json".to_string(),
        ]);

        let manifest = resolver.fetch_manifest().await.expect("third candidate wins");
        assert!(manifest.entry("a.ts").is_some());
        assert_eq!(fetcher.requests().len(), 3);
        assert_eq!(resolver.resolve_module_path("a.ts").await, "a.123.js");
    }

    #[tokio::test]
    async fn falls_back_to_page_location() {
        let fetcher = Arc::new(FakeFetcher::default());
        let resolver = ModuleResolver::new(fetcher)
            .with_location(Arc::new(FixedLocation(Some("https://toys.test/app/index.html?toy=x"))));

        assert_eq!(resolver.resolve_module_path("toys/x.ts").await, "/app/toys/x.ts");
        assert_eq!(
            resolver.resolve_module_path("https://cdn.test/x.js").await,
            "https://cdn.test/x.js"
        );
    }

    #[tokio::test]
    async fn lazy_base_is_evaluated_per_call() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let resolver = ModuleResolver::new(Arc::new(FakeFetcher::default())).with_base_url(
            BaseUrl::lazy(move || {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                Some(format!("http://example.com/v{n}/"))
            }),
        );

        let first = resolver.resolve_module_path("x.ts").await;
        let second = resolver.resolve_module_path("x.ts").await;
        assert_ne!(first, second);
        assert!(second.ends_with("/x.ts"));
    }

    #[tokio::test]
    async fn relative_keys_use_module_origin() {
        let resolver = ModuleResolver::new(Arc::new(FakeFetcher::default()))
            .with_base_url(BaseUrl::Static("http://example.com/site/".to_string()))
            .with_module_origin("http://example.com/site/assets/js/loader.js");

        assert_eq!(
            resolver.resolve_module_path("./toys/a.js").await,
            "/site/assets/js/toys/a.js"
        );
        assert_eq!(resolver.resolve_module_path("../b.js").await, "/site/assets/b.js");
        assert_eq!(resolver.resolve_module_path("c.js").await, "/site/c.js");
    }

    #[test]
    fn entries_prefer_file_over_url() {
        let manifest = Manifest::from_json_str(
            r#"{
                "a.ts": { "file": "a.js", "url": "ignored.js" },
                "b.ts": { "url": "https://cdn.test/b.js" },
                "c.css": { "css": ["c.css"] },
                "d.ts": { "file": "", "url": "d.js" },
                "e.ts": { "file": "", "url": "" }
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.entry("a.ts").and_then(ManifestEntry::target), Some("a.js"));
        assert_eq!(
            manifest.entry("/b.ts").and_then(ManifestEntry::target),
            Some("https://cdn.test/b.js")
        );
        assert_eq!(manifest.entry("c.css").and_then(ManifestEntry::target), None);
        assert_eq!(manifest.entry("d.ts").and_then(ManifestEntry::target), Some("d.js"));
        assert_eq!(manifest.entry("e.ts").and_then(ManifestEntry::target), None);
    }
}
