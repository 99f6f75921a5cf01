//! Task handler registry
//!
//! Maps task names to handlers. Handlers are stored behind the object-safe
//! [`TaskHandler`] trait so async closures, blocking closures and hand-written
//! handler types all live in one map.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

use crate::types::TaskStatus;

/// Positional and keyword arguments handed to a handler or hook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub args: Vec<JsonValue>,
    pub kwargs: Map<String, JsonValue>,
}

impl CallArgs {
    pub fn new(args: Vec<JsonValue>, kwargs: Map<String, JsonValue>) -> Self {
        Self { args, kwargs }
    }

    /// Decode the positional argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| anyhow!("missing positional argument {}", index))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("invalid positional argument {}", index))
    }

    /// Decode a keyword argument. `Ok(None)` when absent.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.kwargs
            .get(name)
            .map(|value| {
                serde_json::from_value(value.clone())
                    .with_context(|| format!("invalid keyword argument '{}'", name))
            })
            .transpose()
    }
}

/// Runs the main body of a task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, task_id: &str, args: CallArgs) -> Result<JsonValue>;
}

#[derive(Debug, Clone)]
pub struct PrerunContext {
    pub task_id: String,
    pub task_name: String,
    pub args: CallArgs,
}

#[derive(Debug, Clone)]
pub struct PostrunContext {
    pub task_id: String,
    pub task_name: String,
    /// Handler result on success, diagnostic string on failure.
    pub result: JsonValue,
    pub status: TaskStatus,
    pub args: CallArgs,
}

/// Side handler run before or after the main handler. Its outcome never
/// changes the task's status.
#[async_trait]
pub trait Hook<C: Send + 'static>: Send + Sync {
    async fn call(&self, ctx: C) -> Result<()>;
}

struct AsyncFn<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for AsyncFn<F>
where
    F: Fn(String, CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue>> + Send + 'static,
{
    async fn call(&self, task_id: &str, args: CallArgs) -> Result<JsonValue> {
        (self.0)(task_id.to_string(), args).await
    }
}

/// Synchronous handler, run on the blocking pool.
struct BlockingFn<F>(Arc<F>);

#[async_trait]
impl<F> TaskHandler for BlockingFn<F>
where
    F: Fn(String, CallArgs) -> Result<JsonValue> + Send + Sync + 'static,
{
    async fn call(&self, task_id: &str, args: CallArgs) -> Result<JsonValue> {
        let f = Arc::clone(&self.0);
        let task_id = task_id.to_string();

        match tokio::task::spawn_blocking(move || f(task_id, args)).await {
            Ok(result) => result,
            // Re-raise so the caller sees the original panic payload
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(anyhow!("blocking handler did not complete: {}", e)),
        }
    }
}

struct FnHook<F>(F);

#[async_trait]
impl<C, F, Fut> Hook<C> for FnHook<F>
where
    C: Send + 'static,
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(&self, ctx: C) -> Result<()> {
        (self.0)(ctx).await
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a handler for task '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("task name must not be empty")]
    EmptyName,
}

/// Everything a worker can run.
#[derive(Default)]
pub struct Registry {
    handlers: BTreeMap<String, Arc<dyn TaskHandler>>,
    prerun: Option<Arc<dyn Hook<PrerunContext>>>,
    postrun: Option<Arc<dyn Hook<PostrunContext>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(
        &mut self,
        name: impl Into<String>,
        handler: H,
    ) -> Result<&mut Self, RegistryError>
    where
        H: TaskHandler + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }

        self.handlers.insert(name, Arc::new(handler));
        Ok(self)
    }

    /// Register an async closure. It receives the task id and its arguments.
    pub fn task<F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<&mut Self, RegistryError>
    where
        F: Fn(String, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue>> + Send + 'static,
    {
        self.register(name, AsyncFn(f))
    }

    /// Register a synchronous closure. Runs via `spawn_blocking`.
    pub fn blocking_task<F>(
        &mut self,
        name: impl Into<String>,
        f: F,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(String, CallArgs) -> Result<JsonValue> + Send + Sync + 'static,
    {
        self.register(name, BlockingFn(Arc::new(f)))
    }

    pub fn prerun<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(PrerunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.set_prerun(FnHook(f))
    }

    pub fn postrun<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(PostrunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.set_postrun(FnHook(f))
    }

    pub fn set_prerun(&mut self, hook: impl Hook<PrerunContext> + 'static) -> &mut Self {
        self.prerun = Some(Arc::new(hook));
        self
    }

    pub fn set_postrun(&mut self, hook: impl Hook<PostrunContext> + 'static) -> &mut Self {
        self.postrun = Some(Arc::new(hook));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn prerun_hook(&self) -> Option<Arc<dyn Hook<PrerunContext>>> {
        self.prerun.clone()
    }

    pub fn postrun_hook(&self) -> Option<Arc<dyn Hook<PostrunContext>>> {
        self.postrun.clone()
    }

    /// Registered names in sorted order.
    pub fn task_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("tasks", &self.task_names())
            .field("prerun", &self.prerun.is_some())
            .field("postrun", &self.postrun.is_some())
            .finish()
    }
}
