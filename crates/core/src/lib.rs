//! Core library for the Toybox host.
//!
//! Toybox loads interchangeable audio-reactive "toys" into a single stage,
//! one at a time, with the page URL deciding which toy is shown. Each module
//! owns one piece of that pipeline: spectral analysis off the main thread,
//! module path resolution, toy lifecycle, URL routing and idle scheduling.
//! Environment access (network, history, timers, audio input) goes through
//! small traits so the crate runs the same in a browser shell, a terminal or
//! a test.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod loader;
pub mod location;
pub mod resolver;
pub mod router;
pub mod scheduler;

pub use analysis::{AnalysisFrame, FrameRecycler, SpectralAnalyser, DEFAULT_FFT_SIZE};
pub use audio::{AnalyserNode, AudioCapability, AudioSource, InputPort, MicrophoneState};
pub use config::{AnalysisConfig, AppConfig, FlowConfig, ResolverConfig, RouterConfig};
pub use error::{DisposeError, Result, ToyboxError};
pub use lifecycle::{normalize_toy, SetOptions, StartOutput, Toy, ToyInstance, ToyLifecycle};
pub use loader::{
    CatalogEntry, Container, MemoryContainer, ModuleLoader, ModuleRegistry, StartOptions,
    ToyCapabilities, ToyCatalog, ToyHost, ToyModule,
};
pub use location::Href;
pub use resolver::{BaseUrl, FetchResponse, Fetcher, Manifest, ManifestEntry, ModuleResolver, PageLocation};
pub use router::{MemoryHistory, Navigation, PopStateListener, RouteHandler, Router};
pub use scheduler::{
    flow_interval, flow_interval_ms, FlowScheduler, FlowState, TimerCallback, TimerId,
    TimerProvider,
};
