use std::{fmt, sync::Arc};

use serde_json::Value;

use crate::{error::DisposeError, Result, ToyboxError};

/// A running toy.
///
/// The default `dispose` does nothing, for toys that hold no resources.
pub trait Toy: Send + Sync {
    fn dispose(&self) -> std::result::Result<(), DisposeError> {
        Ok(())
    }
}

/// Shared handle to a running toy. Identity is pointer identity.
pub type ToyInstance = Arc<dyn Toy>;

/// Raw value produced by a toy module's start routine, before validation.
pub enum StartOutput {
    /// The module rendered something but kept no handle.
    Empty,
    Instance(ToyInstance),
    /// A data value, as produced by scripted or remote modules.
    Value(Value),
}

impl fmt::Debug for StartOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Instance(_) => f.write_str("Instance(..)"),
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

/// Toy described only by data. It has nothing to release.
#[derive(Debug, Clone)]
pub struct InertToy {
    pub state: Value,
}

impl Toy for InertToy {}

/// Validates a start routine's output before it may become the active toy.
///
/// Nothing, `null` and toy instances pass. A JSON object passes only when
/// it has no `dispose` member, since data can never be called. Any other
/// value is rejected.
pub fn normalize_toy(output: StartOutput) -> Result<Option<ToyInstance>> {
    match output {
        StartOutput::Empty | StartOutput::Value(Value::Null) => Ok(None),
        StartOutput::Instance(toy) => Ok(Some(toy)),
        StartOutput::Value(Value::Object(map)) => {
            if let Some(dispose) = map.get("dispose") {
                return Err(ToyboxError::MalformedToy(format!(
                    "`dispose` must be callable, got {}",
                    json_kind(dispose)
                )));
            }
            Ok(Some(Arc::new(InertToy {
                state: Value::Object(map),
            })))
        }
        StartOutput::Value(other) => Err(ToyboxError::MalformedToy(format!(
            "expected an object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SetOptions {
    pub dispose_existing: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            dispose_existing: true,
        }
    }
}

/// Owner of the single active toy slot.
#[derive(Default)]
pub struct ToyLifecycle {
    active: Option<ToyInstance>,
}

impl ToyLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `next` and disposes the toy it replaces.
    ///
    /// The previous toy is left alone when it is the same instance as `next`
    /// or when `options.dispose_existing` is false. A failing dispose is
    /// logged and does not stop `next` from becoming active.
    pub fn set_active_toy(
        &mut self,
        next: Option<ToyInstance>,
        options: SetOptions,
    ) -> Option<ToyInstance> {
        if let Some(outgoing) = self.replace_active_toy(next, options) {
            dispose_reporting(&outgoing, "replacing active toy");
        }
        self.active.clone()
    }

    /// Installs `next` and returns the toy the caller must dispose, if any.
    ///
    /// Owners that share the lifecycle behind a lock use this to run the
    /// disposal after releasing it.
    pub fn replace_active_toy(
        &mut self,
        next: Option<ToyInstance>,
        options: SetOptions,
    ) -> Option<ToyInstance> {
        let previous = std::mem::replace(&mut self.active, next)?;
        let same = self
            .active
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &previous));
        (!same && options.dispose_existing).then_some(previous)
    }

    pub fn active_toy(&self) -> Option<ToyInstance> {
        self.active.clone()
    }

    pub fn has_active_toy(&self) -> bool {
        self.active.is_some()
    }

    /// Empties the slot without disposing what was in it.
    pub fn take_active_toy(&mut self) -> Option<ToyInstance> {
        self.active.take()
    }

    /// Disposes and clears the active toy. The slot is empty afterwards even
    /// if disposal fails.
    pub fn dispose_active_toy(&mut self) {
        if let Some(toy) = self.take_active_toy() {
            dispose_reporting(&toy, "tearing down active toy");
        }
    }
}

impl fmt::Debug for ToyLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToyLifecycle")
            .field("active", &self.active.is_some())
            .finish()
    }
}

pub(crate) fn dispose_reporting(toy: &ToyInstance, context: &'static str) {
    if let Err(err) = toy.dispose() {
        tracing::warn!(%err, context, "toy disposal failed");
    }
}
