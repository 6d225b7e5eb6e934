//! Function registry - name to handler bindings
//!
//! Central table the dispatcher resolves tool calls against. Built once at
//! startup from the built-in functions plus every configured [`Registrar`],
//! then shared read-only behind an `Arc`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::config::FunctionsConfig;
use crate::core::{FunctionKind, RelayError, Result};
use crate::tools::builtin;
use crate::tools::context::ToolContext;

/// A callable bound to a function name
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    /// Execute with the call's JSON arguments
    async fn call(&self, ctx: ToolContext, args: Value) -> anyhow::Result<Value>;
}

/// Adapter so plain async closures can be registered
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> FunctionHandler for FnHandler<F>
where
    F: Fn(ToolContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, ctx: ToolContext, args: Value) -> anyhow::Result<Value> {
        (self.0)(ctx, args).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn FunctionHandler>
where
    F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Source of user functions, loaded by name at startup
pub trait Registrar: Send + Sync {
    /// Name used in `functions.registrars`
    fn name(&self) -> &str;

    /// Bind this registrar's functions
    fn register(&self, registry: &mut FunctionRegistry) -> Result<()>;
}

/// Registrar built from a name and a closure
pub struct FnRegistrar<F> {
    name: String,
    register: F,
}

impl<F> FnRegistrar<F>
where
    F: Fn(&mut FunctionRegistry) -> Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, register: F) -> Self {
        Self {
            name: name.into(),
            register,
        }
    }
}

impl<F> Registrar for FnRegistrar<F>
where
    F: Fn(&mut FunctionRegistry) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, registry: &mut FunctionRegistry) -> Result<()> {
        (self.register)(registry)
    }
}

#[derive(Clone)]
struct Binding {
    kind: FunctionKind,
    handler: Arc<dyn FunctionHandler>,
}

/// Registry of callable functions
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    bindings: HashMap<String, Binding>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

impl FunctionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding only the built-in functions
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry)?;
        Ok(registry)
    }

    /// Assemble the startup registry.
    ///
    /// Built-ins first, then each registrar named in `config` (all of
    /// `available`, in order, when the list is empty). A configured name with
    /// no matching registrar is skipped with a warning; a registrar that
    /// fails aborts assembly.
    pub fn assemble(config: &FunctionsConfig, available: &[Arc<dyn Registrar>]) -> Result<Self> {
        let mut registry = Self::with_builtins()?;

        let selected: Vec<&Arc<dyn Registrar>> = if config.registrars.is_empty() {
            available.iter().collect()
        } else {
            config
                .registrars
                .iter()
                .filter_map(|name| {
                    let found = available.iter().find(|r| r.name() == name);
                    if found.is_none() {
                        warn!(registrar = %name, "registrar not found, skipping");
                    }
                    found
                })
                .collect()
        };

        for registrar in selected {
            registrar.register(&mut registry).map_err(|e| match e {
                RelayError::Registration { .. } => e,
                other => RelayError::registration(registrar.name(), other.to_string()),
            })?;
            debug!(registrar = %registrar.name(), "registrar loaded");
        }

        info!(
            functions = registry.len(),
            personal = registry.names_of(FunctionKind::Personal).len(),
            assistant_calls = registry.names_of(FunctionKind::AssistantCall).len(),
            "function registry assembled"
        );
        Ok(registry)
    }

    /// Bind a handler, replacing any previous binding of the same name.
    ///
    /// `kind` must agree with the naming convention: assistant-call names end
    /// in `_assistant`, personal names do not.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn FunctionHandler>,
        kind: FunctionKind,
    ) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RelayError::registration(name, "function name is empty"));
        }

        let expected = FunctionKind::for_name(&name);
        if kind != expected {
            return Err(RelayError::registration(
                &name,
                format!("declared {} but the name makes it {}", kind, expected),
            ));
        }

        if self
            .bindings
            .insert(name.clone(), Binding { kind, handler })
            .is_some()
        {
            debug!(function = %name, "binding replaced");
        }
        Ok(())
    }

    /// Bind an async closure, taking the kind from the name
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let name = name.into();
        let kind = FunctionKind::for_name(&name);
        self.register(name, handler_fn(f), kind)
    }

    /// Look up the handler for a call
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn FunctionHandler>> {
        self.bindings
            .get(name)
            .map(|b| b.handler.clone())
            .ok_or_else(|| RelayError::UnknownFunction(name.to_string()))
    }

    pub fn kind(&self, name: &str) -> Option<FunctionKind> {
        self.bindings.get(name).map(|b| b.kind)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// All bound names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.bindings.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Bound names of one kind, sorted
    pub fn names_of(&self, kind: FunctionKind) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .bindings
            .iter()
            .filter(|(_, b)| b.kind == kind)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_registrar() -> Arc<dyn Registrar> {
        Arc::new(FnRegistrar::new("echo", |registry: &mut FunctionRegistry| {
            registry.register_fn("echo", |_ctx, args: Value| async move {
                Ok::<_, anyhow::Error>(args.get("text").cloned().unwrap_or(Value::Null))
            })
        }))
    }

    #[test]
    fn test_builtins_present() {
        let registry = FunctionRegistry::with_builtins().unwrap();
        assert!(registry.contains("save_processed_content"));
        assert!(registry.contains("load_processed_content"));
        assert_eq!(
            registry.kind("communicate_with_assistant"),
            Some(FunctionKind::AssistantCall)
        );
    }

    #[test]
    fn test_kind_must_match_name() {
        let mut registry = FunctionRegistry::new();
        let handler = handler_fn(|_ctx, _args| async { Ok::<_, anyhow::Error>(Value::Null) });

        let err = registry
            .register("lookup", handler.clone(), FunctionKind::AssistantCall)
            .unwrap_err();
        assert!(matches!(err, RelayError::Registration { .. }));

        let err = registry
            .register("ask_assistant", handler.clone(), FunctionKind::Personal)
            .unwrap_err();
        assert!(matches!(err, RelayError::Registration { .. }));

        registry
            .register("ask_assistant", handler, FunctionKind::AssistantCall)
            .unwrap();
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = FunctionRegistry::new();
        assert!(matches!(
            registry.resolve("nope"),
            Err(RelayError::UnknownFunction(name)) if name == "nope"
        ));
    }

    #[tokio::test]
    async fn test_register_overwrites() {
        let mut registry = FunctionRegistry::new();
        registry
            .register_fn("value", |_ctx, _args| async { Ok::<_, anyhow::Error>(json!(1)) })
            .unwrap();
        registry
            .register_fn("value", |_ctx, _args| async { Ok::<_, anyhow::Error>(json!(2)) })
            .unwrap();

        assert_eq!(registry.len(), 1);
        let handler = registry.resolve("value").unwrap();
        let out = handler.call(ToolContext::new(), json!({})).await.unwrap();
        assert_eq!(out, json!(2));
    }

    #[test]
    fn test_assemble_skips_missing_registrar() {
        let config = FunctionsConfig {
            registrars: vec!["missing".into(), "echo".into()],
        };
        let registry = FunctionRegistry::assemble(&config, &[echo_registrar()]).unwrap();
        assert!(registry.contains("echo"));
    }

    #[test]
    fn test_assemble_all_when_unconfigured() {
        let registry =
            FunctionRegistry::assemble(&FunctionsConfig::default(), &[echo_registrar()]).unwrap();
        assert!(registry.contains("echo"));
        assert!(registry.contains("initialize_agent"));
    }

    #[test]
    fn test_failing_registrar_is_fatal() {
        let broken: Arc<dyn Registrar> = Arc::new(FnRegistrar::new("broken", |_r: &mut FunctionRegistry| {
            Err(RelayError::Other("missing credentials".into()))
        }));

        let err = FunctionRegistry::assemble(&FunctionsConfig::default(), &[broken]).unwrap_err();
        match err {
            RelayError::Registration { registrar, message } => {
                assert_eq!(registrar, "broken");
                assert!(message.contains("missing credentials"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
