use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    audio::AudioCapability,
    lifecycle::{
        dispose_reporting, normalize_toy, SetOptions, StartOutput, ToyInstance, ToyLifecycle,
    },
    resolver::ModuleResolver,
    router::RouteHandler,
    Result, ToyboxError,
};

/// Mount point a toy renders into.
pub trait Container: Send + Sync {
    fn id(&self) -> &str;

    fn render(&self, content: &str);

    fn clear(&self);
}

/// Container that keeps what was rendered in memory. Used when no display
/// is attached.
#[derive(Debug, Default)]
pub struct MemoryContainer {
    id: String,
    content: Mutex<Vec<String>>,
}

impl MemoryContainer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: Mutex::new(Vec::new()),
        }
    }

    pub fn content(&self) -> Vec<String> {
        self.content
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Container for MemoryContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn render(&self, content: &str) {
        self.content
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(content.to_string());
    }

    fn clear(&self) {
        self.content
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Optional host services a toy may use.
#[derive(Debug, Clone, Default)]
pub struct ToyCapabilities {
    pub audio: Option<AudioCapability>,
}

/// Arguments passed to a toy module's start routine.
#[derive(Clone)]
pub struct StartOptions {
    pub container: Arc<dyn Container>,
    pub slug: String,
    pub capabilities: ToyCapabilities,
}

impl fmt::Debug for StartOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartOptions")
            .field("container", &self.container.id())
            .field("slug", &self.slug)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Entry point every toy module exposes.
#[async_trait]
pub trait ToyModule: Send + Sync {
    async fn start(&self, options: StartOptions) -> Result<StartOutput>;
}

/// Loads a toy module from a resolved path.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, path: &str) -> Result<Arc<dyn ToyModule>>;
}

/// In-process module table keyed by resolved path.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn ToyModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, path: impl Into<String>, module: Arc<dyn ToyModule>) {
        self.modules.insert(path.into(), module);
    }

    pub fn with(mut self, path: impl Into<String>, module: Arc<dyn ToyModule>) -> Self {
        self.register(path, module);
        self
    }
}

#[async_trait]
impl ModuleLoader for ModuleRegistry {
    async fn load(&self, path: &str) -> Result<Arc<dyn ToyModule>> {
        self.modules
            .get(path)
            .cloned()
            .ok_or_else(|| ToyboxError::ModuleNotFound(path.to_string()))
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.modules.keys()).finish()
    }
}

/// One toy listed in the library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub slug: String,
    pub title: String,
    /// Logical module key handed to the resolver.
    pub module: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// The toys the host knows about, in library order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToyCatalog {
    entries: Vec<CatalogEntry>,
}

impl ToyCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn get(&self, slug: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|entry| entry.slug == slug)
    }

    /// The entry after `slug`, wrapping around. First entry when `slug` is
    /// unknown or absent.
    pub fn next_after(&self, slug: Option<&str>) -> Option<&CatalogEntry> {
        let position = slug.and_then(|slug| self.entries.iter().position(|e| e.slug == slug));
        match position {
            Some(index) => self.entries.get((index + 1) % self.entries.len()),
            None => self.entries.first(),
        }
    }
}

/// Orchestrates resolving, starting and swapping toys.
pub struct ToyHost {
    catalog: ToyCatalog,
    resolver: Arc<ModuleResolver>,
    loader: Arc<dyn ModuleLoader>,
    container: Arc<dyn Container>,
    capabilities: ToyCapabilities,
    lifecycle: Mutex<ToyLifecycle>,
    active_slug: Mutex<Option<String>>,
}

impl ToyHost {
    pub fn new(
        catalog: ToyCatalog,
        resolver: Arc<ModuleResolver>,
        loader: Arc<dyn ModuleLoader>,
        container: Arc<dyn Container>,
    ) -> Self {
        Self {
            catalog,
            resolver,
            loader,
            container,
            capabilities: ToyCapabilities::default(),
            lifecycle: Mutex::new(ToyLifecycle::new()),
            active_slug: Mutex::new(None),
        }
    }

    pub fn with_capabilities(mut self, capabilities: ToyCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn catalog(&self) -> &ToyCatalog {
        &self.catalog
    }

    pub fn active_toy(&self) -> Option<ToyInstance> {
        self.lifecycle().active_toy()
    }

    /// Slug of the toy most recently started, `None` in the library view.
    pub fn active_slug(&self) -> Option<String> {
        lock(&self.active_slug).clone()
    }

    /// Starts the toy registered under `slug` and makes it the active one.
    ///
    /// On failure the previously active toy keeps running and the error is
    /// reported as [`ToyboxError::ToyFailedToStart`].
    pub async fn activate_toy(&self, slug: &str) -> Result<Option<ToyInstance>> {
        match self.start_toy(slug).await {
            Ok(toy) => {
                let (active, outgoing) = {
                    let mut lifecycle = self.lifecycle();
                    let outgoing = lifecycle.replace_active_toy(toy, SetOptions::default());
                    *lock(&self.active_slug) = Some(slug.to_string());
                    (lifecycle.active_toy(), outgoing)
                };
                // Disposal runs unlocked so the outgoing toy may call back into the host.
                if let Some(outgoing) = outgoing {
                    dispose_reporting(&outgoing, "replacing active toy");
                }
                tracing::info!(slug, "toy started");
                Ok(active)
            }
            Err(err) => {
                tracing::warn!(slug, %err, "toy failed to load");
                Err(ToyboxError::ToyFailedToStart {
                    slug: slug.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Tears down the active toy and clears the stage for the library.
    pub fn return_to_library(&self) {
        let outgoing = {
            let toy = self.lifecycle().take_active_toy();
            *lock(&self.active_slug) = None;
            toy
        };
        if let Some(toy) = outgoing {
            dispose_reporting(&toy, "tearing down active toy");
        }
        self.container.clear();
        tracing::info!("showing library");
    }

    async fn start_toy(&self, slug: &str) -> Result<Option<ToyInstance>> {
        let entry = self
            .catalog
            .get(slug)
            .ok_or_else(|| ToyboxError::UnknownToy(slug.to_string()))?;
        let path = self.resolver.resolve_module_path(&entry.module).await;
        tracing::debug!(slug, %path, "loading toy module");

        let module = self.loader.load(&path).await?;
        let output = module
            .start(StartOptions {
                container: self.container.clone(),
                slug: slug.to_string(),
                capabilities: self.capabilities.clone(),
            })
            .await?;
        normalize_toy(output)
    }

    fn lifecycle(&self) -> MutexGuard<'_, ToyLifecycle> {
        lock(&self.lifecycle)
    }
}

impl fmt::Debug for ToyHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToyHost")
            .field("catalog", &self.catalog.entries().len())
            .field("resolver", &self.resolver)
            .field("container", &self.container.id())
            .field("active_slug", &self.active_slug())
            .finish()
    }
}

#[async_trait]
impl RouteHandler for ToyHost {
    async fn load_toy(&self, slug: &str) -> Result<()> {
        self.activate_toy(slug).await.map(|_| ())
    }

    async fn show_library(&self) -> Result<()> {
        self.return_to_library();
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
