//! Case-insensitive task name to handler lookup.
//!
//! Handlers are stored under their lowercased name. A [`TaskRegistry`] is a
//! cheap handle onto shared state, so clones observe the same registrations.
//! Workers take a registry explicitly; [`TaskRegistry::global`] exists for
//! programs that prefer registering at startup from anywhere.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::{short_type_name, Result, TaskError, TaskResult, TqError};

/// Arguments passed to a handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskArgs {
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Named arguments.
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Deserialize the positional argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, TaskError> {
        let value = self.args.get(index).ok_or_else(|| {
            TaskError::argument(format!(
                "missing positional argument {} (got {})",
                index,
                self.args.len()
            ))
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| TaskError::argument(format!("positional argument {}: {}", index, e)))
    }

    /// Deserialize the named argument `name`.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> std::result::Result<T, TaskError> {
        let value = self
            .kwargs
            .get(name)
            .ok_or_else(|| TaskError::argument(format!("missing named argument {:?}", name)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| TaskError::argument(format!("named argument {:?}: {}", name, e)))
    }
}

/// A type-erased task handler.
pub type TaskFn = Arc<dyn Fn(TaskArgs) -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// Point-in-time copy of a registry's contents.
#[derive(Clone)]
pub struct RegistrySnapshot {
    tasks: HashMap<String, TaskFn>,
}

/// Registry of task handlers keyed by lowercased name.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<String, TaskFn>>>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static TaskRegistry {
        static GLOBAL: OnceLock<TaskRegistry> = OnceLock::new();
        GLOBAL.get_or_init(TaskRegistry::new)
    }

    /// Register an async handler under `name`, replacing any previous one.
    pub fn register<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let task: TaskFn = Arc::new(move |args| handler(args).boxed());
        self.insert(name, task);
    }

    /// Register an async handler under its own type name.
    ///
    /// Meant for `fn` items: `async fn send_report(..)` registers as
    /// `send_report`. Closures have no useful name; use [`register`](Self::register).
    pub fn register_fn<F, Fut>(&self, handler: F) -> String
    where
        F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let name = short_type_name::<F>().to_lowercase();
        self.register(&name, handler);
        name
    }

    /// Register a synchronous handler that runs on the blocking thread pool.
    pub fn register_blocking<F>(&self, name: &str, handler: F)
    where
        F: Fn(TaskArgs) -> TaskResult + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let task: TaskFn = Arc::new(move |args| {
            let handler = handler.clone();
            async move {
                match tokio::task::spawn_blocking(move || handler(args)).await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        Err(TaskError::new("Panic", panic_message(e.into_panic())))
                    }
                    Err(e) => Err(TaskError::new("Cancelled", e.to_string())),
                }
            }
            .boxed()
        });
        self.insert(name, task);
    }

    fn insert(&self, name: &str, task: TaskFn) {
        let key = name.to_lowercase();
        let replaced = self
            .tasks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.clone(), task)
            .is_some();
        tracing::debug!(task = %key, replaced, "Task registered");
    }

    /// Look up the handler for `func_name`, ignoring case.
    pub fn resolve(&self, func_name: &str) -> Result<TaskFn> {
        let tasks = self
            .tasks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match tasks.get(&func_name.to_lowercase()) {
            Some(task) => Ok(task.clone()),
            None => {
                let mut known: Vec<String> = tasks.keys().cloned().collect();
                known.sort();
                Err(TqError::TaskNotFound {
                    name: func_name.to_string(),
                    known,
                })
            }
        }
    }

    /// Whether a handler is registered for `func_name`.
    pub fn contains(&self, func_name: &str) -> bool {
        self.tasks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(&func_name.to_lowercase())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Capture the current registrations.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            tasks: self
                .tasks
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }

    /// Replace all registrations with a previously captured snapshot.
    pub fn restore(&self, snapshot: RegistrySnapshot) {
        *self
            .tasks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot.tasks;
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
