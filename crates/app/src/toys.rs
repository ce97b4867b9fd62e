use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::json;
use tokio::task::AbortHandle;
use toybox_core::{
    AnalysisFrame, CatalogEntry, Container, DisposeError, ModuleRegistry, ModuleResolver, Result,
    StartOptions, StartOutput, Toy, ToyCatalog, ToyModule, ToyboxError,
};

const BAR_COUNT: usize = 16;
const BAR_GLYPHS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Prints whatever toys render, one line per update.
#[derive(Debug)]
pub struct TerminalContainer {
    id: String,
}

impl TerminalContainer {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Container for TerminalContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn render(&self, content: &str) {
        println!("[{}] {content}", self.id);
    }

    fn clear(&self) {
        println!("[{}] --", self.id);
    }
}

/// The toys compiled into the binary.
pub fn builtin_catalog() -> ToyCatalog {
    ToyCatalog::new(vec![
        CatalogEntry {
            slug: "spectrum".to_string(),
            title: "Spectrum Bars".to_string(),
            module: "toys/spectrum.ts".to_string(),
            description: Some("Live frequency bars from the audio input".to_string()),
        },
        CatalogEntry {
            slug: "pulse".to_string(),
            title: "Pulse".to_string(),
            module: "toys/pulse.ts".to_string(),
            description: None,
        },
    ])
}

/// Registers the built-in modules under the paths the resolver produces for
/// them, so hashed build output and plain paths both load.
pub async fn builtin_registry(resolver: &ModuleResolver, catalog: &ToyCatalog) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    for entry in catalog.entries() {
        let module: Arc<dyn ToyModule> = match entry.slug.as_str() {
            "spectrum" => Arc::new(SpectrumModule),
            "pulse" => Arc::new(PulseModule),
            _ => continue,
        };
        let path = resolver.resolve_module_path(&entry.module).await;
        tracing::debug!(slug = %entry.slug, %path, "registered builtin toy");
        registry.register(path, module);
    }
    registry
}

/// Draws frequency bars from the analyser at a fixed refresh rate.
#[derive(Debug)]
struct SpectrumModule;

#[async_trait]
impl ToyModule for SpectrumModule {
    async fn start(&self, options: StartOptions) -> Result<StartOutput> {
        let Some(audio) = options.capabilities.audio else {
            options.container.render("spectrum: no audio capability");
            return Ok(StartOutput::Empty);
        };
        let node = match audio.attach() {
            Ok(node) => node,
            Err(ToyboxError::AudioUnavailable(state)) => {
                options
                    .container
                    .render(&format!("spectrum: microphone {state:?}, showing nothing"));
                return Ok(StartOutput::Empty);
            }
            Err(err) => return Err(err),
        };
        let container = options.container.clone();

        let task = tokio::spawn(async move {
            let recycler = node.recycler();
            let mut ticker = tokio::time::interval(Duration::from_millis(250));
            loop {
                ticker.tick().await;
                let mut latest = None;
                while let Some(frame) = node.try_frame() {
                    if let Some(stale) = latest.replace(frame) {
                        recycler.recycle(stale);
                    }
                }
                if let Some(frame) = latest {
                    container.render(&draw_bars(&frame));
                    recycler.recycle(frame);
                }
            }
        });

        Ok(StartOutput::Instance(Arc::new(SpectrumToy {
            task: task.abort_handle(),
        })))
    }
}

struct SpectrumToy {
    task: AbortHandle,
}

impl Toy for SpectrumToy {
    fn dispose(&self) -> std::result::Result<(), DisposeError> {
        self.task.abort();
        Ok(())
    }
}

fn draw_bars(frame: &AnalysisFrame) -> String {
    let bins = frame.frequency_data.len().max(1);
    let per_bar = (bins / BAR_COUNT).max(1);
    let bars: String = frame
        .frequency_data
        .chunks(per_bar)
        .take(BAR_COUNT)
        .map(|chunk| {
            let peak = chunk.iter().copied().max().unwrap_or(0) as usize;
            BAR_GLYPHS[peak * (BAR_GLYPHS.len() - 1) / 255]
        })
        .collect();
    format!("{bars} rms {:.3}", frame.rms)
}

/// A data-only toy: it renders once and hands back plain state.
#[derive(Debug)]
struct PulseModule;

#[async_trait]
impl ToyModule for PulseModule {
    async fn start(&self, options: StartOptions) -> Result<StartOutput> {
        options.container.render("pulse: ● ○ ● ○");
        Ok(StartOutput::Value(json!({ "slug": options.slug, "bpm": 120 })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bars_follow_the_loudest_bin_per_group() {
        let mut frequency_data = vec![0u8; 128];
        frequency_data[16] = 255;
        let frame = AnalysisFrame {
            index: 0,
            frequency_data,
            rms: 0.5,
        };
        let drawn = draw_bars(&frame);
        let bars: Vec<char> = drawn.chars().take(BAR_COUNT).collect();
        assert_eq!(bars[2], '█');
        assert!(bars.iter().enumerate().all(|(i, c)| i == 2 || *c == '▁'));
        assert!(drawn.ends_with("rms 0.500"));
    }

    #[test]
    fn catalog_cycles_through_builtins() {
        let catalog = builtin_catalog();
        assert_eq!(catalog.next_after(None).unwrap().slug, "spectrum");
        assert_eq!(catalog.next_after(Some("spectrum")).unwrap().slug, "pulse");
    }
}
