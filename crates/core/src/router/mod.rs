use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};

use crate::{config::RouterConfig, location::Href, resolver::PageLocation, Result};

/// Callback run when the user navigates back or forward.
pub type PopStateListener = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Browser-style session history.
pub trait Navigation: PageLocation {
    /// Adds a history entry for `url` and makes it current.
    fn push_state(&self, url: &str);

    fn on_pop_state(&self, listener: PopStateListener);
}

/// What the router asks the host to show.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn load_toy(&self, slug: &str) -> Result<()>;

    async fn show_library(&self) -> Result<()>;
}

/// Keeps the shown toy in sync with one query parameter of the page URL.
///
/// The URL is the only state: every decision reads it afresh, so back and
/// forward navigation need no bookkeeping beyond re-reading it.
pub struct Router {
    navigation: Arc<dyn Navigation>,
    handler: Arc<dyn RouteHandler>,
    param: String,
    wired: AtomicBool,
}

impl Router {
    pub fn new(navigation: Arc<dyn Navigation>, handler: Arc<dyn RouteHandler>) -> Self {
        Self::from_config(navigation, handler, &RouterConfig::default())
    }

    pub fn from_config(
        navigation: Arc<dyn Navigation>,
        handler: Arc<dyn RouteHandler>,
        config: &RouterConfig,
    ) -> Self {
        Self {
            navigation,
            handler,
            param: config.query_param.clone(),
            wired: AtomicBool::new(false),
        }
    }

    /// The toy slug in the current URL. Empty values count as absent.
    pub fn current_slug(&self) -> Option<String> {
        let url = self.navigation.current_url()?;
        Href::parse(&url)
            .query_param(&self.param)
            .filter(|slug| !slug.is_empty())
    }

    /// Points the URL at `slug` with a new history entry.
    pub fn push_toy_state(&self, slug: &str) {
        let Some(url) = self.navigation.current_url() else {
            tracing::debug!(slug, "no navigation context, not pushing state");
            return;
        };
        let mut href = Href::parse(&url);
        href.set_query_param(&self.param, slug);
        self.navigation.push_state(&href.to_string());
    }

    /// Drops the toy parameter with a new history entry, if it is present.
    pub fn update_history_to_library_view(&self) {
        let Some(url) = self.navigation.current_url() else {
            return;
        };
        let mut href = Href::parse(&url);
        if href.remove_query_param(&self.param) {
            self.navigation.push_state(&href.to_string());
        }
    }

    /// Shows whatever the current URL asks for: the toy named by the
    /// parameter, or the library when there is none.
    pub async fn load_from_query(&self) -> Result<()> {
        match self.current_slug() {
            Some(slug) => self.handler.load_toy(&slug).await,
            None => self.handler.show_library().await,
        }
    }

    /// Re-runs [`Router::load_from_query`] on every back/forward navigation.
    ///
    /// Only the first call registers a listener. Returns whether this call
    /// did.
    pub fn init_navigation(self: &Arc<Self>) -> bool {
        if self.wired.swap(true, Ordering::SeqCst) {
            return false;
        }

        let router: Weak<Router> = Arc::downgrade(self);
        self.navigation.on_pop_state(Arc::new(move || {
            let router = router.clone();
            async move {
                let Some(router) = router.upgrade() else {
                    return;
                };
                if let Err(err) = router.load_from_query().await {
                    tracing::warn!(%err, "navigation could not be applied");
                }
            }
            .boxed()
        }));
        true
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("param", &self.param)
            .field("wired", &self.wired.load(Ordering::SeqCst))
            .finish()
    }
}

#[derive(Debug, Default)]
struct HistoryState {
    entries: Vec<String>,
    index: usize,
}

/// In-memory session history for hosts without a browser.
#[derive(Default)]
pub struct MemoryHistory {
    state: Mutex<HistoryState>,
    listeners: Mutex<Vec<PopStateListener>>,
}

impl MemoryHistory {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(HistoryState {
                entries: vec![url.into()],
                index: 0,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// History with no current page, like a headless test environment.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    pub fn entries(&self) -> Vec<String> {
        self.state().entries.clone()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Moves one entry back and notifies listeners. `false` at the start of
    /// history.
    pub async fn back(&self) -> bool {
        let moved = {
            let mut state = self.state();
            if state.index > 0 {
                state.index -= 1;
                true
            } else {
                false
            }
        };
        if moved {
            self.notify().await;
        }
        moved
    }

    pub async fn forward(&self) -> bool {
        let moved = {
            let mut state = self.state();
            if state.index + 1 < state.entries.len() {
                state.index += 1;
                true
            } else {
                false
            }
        };
        if moved {
            self.notify().await;
        }
        moved
    }

    async fn notify(&self) {
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener().await;
        }
    }

    fn state(&self) -> MutexGuard<'_, HistoryState> {
        lock(&self.state)
    }
}

impl PageLocation for MemoryHistory {
    fn current_url(&self) -> Option<String> {
        let state = self.state();
        state.entries.get(state.index).cloned()
    }
}

impl Navigation for MemoryHistory {
    fn push_state(&self, url: &str) {
        let mut state = self.state();
        if state.entries.is_empty() {
            return;
        }
        let keep = state.index + 1;
        state.entries.truncate(keep);
        state.entries.push(url.to_string());
        state.index = keep;
    }

    fn on_pop_state(&self, listener: PopStateListener) {
        lock(&self.listeners).push(listener);
    }
}

impl fmt::Debug for MemoryHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHistory")
            .field("state", &*self.state())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Load(String),
        Library,
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RouteHandler for Recorder {
        async fn load_toy(&self, slug: &str) -> Result<()> {
            tokio::task::yield_now().await;
            self.calls.lock().unwrap().push(Call::Load(slug.to_string()));
            Ok(())
        }

        async fn show_library(&self) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Library);
            Ok(())
        }
    }

    fn router(url: &str) -> (Arc<Router>, Arc<MemoryHistory>, Arc<Recorder>) {
        let history = Arc::new(MemoryHistory::new(url));
        let recorder = Arc::new(Recorder::default());
        let router = Arc::new(Router::new(history.clone(), recorder.clone()));
        (router, history, recorder)
    }

    #[test]
    fn push_adds_exactly_one_entry() {
        let (router, history, _) = router("http://example.com/");

        router.push_toy_state("demo");

        assert_eq!(history.len(), 2);
        assert_eq!(router.current_slug().as_deref(), Some("demo"));
        assert_eq!(
            history.current_url().as_deref(),
            Some("http://example.com/?toy=demo")
        );
    }

    #[test]
    fn library_view_only_pushes_when_param_present() {
        let (router, history, _) = router("http://example.com/?x=1");

        router.update_history_to_library_view();
        assert_eq!(history.len(), 1);

        router.push_toy_state("demo");
        router.update_history_to_library_view();
        assert_eq!(history.len(), 3);
        assert_eq!(history.current_url().as_deref(), Some("http://example.com/?x=1"));
    }

    #[test]
    fn detached_history_is_a_no_op() {
        let history = Arc::new(MemoryHistory::detached());
        let router = Router::new(history.clone(), Arc::new(Recorder::default()));

        router.push_toy_state("demo");
        router.update_history_to_library_view();

        assert!(history.is_empty());
        assert_eq!(router.current_slug(), None);
    }

    #[tokio::test]
    async fn load_from_query_fires_exactly_one_callback() {
        let (router, _, recorder) = router("http://example.com/?toy=bars");
        router.load_from_query().await.unwrap();
        assert_eq!(recorder.calls(), vec![Call::Load("bars".to_string())]);

        let (router, _, recorder) = router_without_param();
        router.load_from_query().await.unwrap();
        assert_eq!(recorder.calls(), vec![Call::Library]);
    }

    fn router_without_param() -> (Arc<Router>, Arc<MemoryHistory>, Arc<Recorder>) {
        router("http://example.com/?toy=")
    }

    #[tokio::test]
    async fn navigation_is_wired_once() {
        let (router, history, recorder) = router("http://example.com/");
        assert!(router.init_navigation());
        assert!(!router.init_navigation());
        assert_eq!(history.listener_count(), 1);

        router.push_toy_state("a");
        router.push_toy_state("b");

        assert!(history.back().await);
        assert_eq!(recorder.calls(), vec![Call::Load("a".to_string())]);

        assert!(history.back().await);
        assert!(!history.back().await);
        assert!(history.forward().await);
        assert_eq!(
            recorder.calls(),
            vec![
                Call::Load("a".to_string()),
                Call::Library,
                Call::Load("a".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn custom_param_name() {
        let history = Arc::new(MemoryHistory::new("http://example.com/?scene=x&toy=y"));
        let recorder = Arc::new(Recorder::default());
        let router = Router::from_config(
            history,
            recorder.clone(),
            &RouterConfig {
                query_param: "scene".to_string(),
            },
        );

        router.load_from_query().await.unwrap();
        assert_eq!(recorder.calls(), vec![Call::Load("x".to_string())]);
    }
}
