use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use indexmap::IndexMap;

use crate::config::EngineConfig;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::script::ScriptHost;
use crate::value::Value;

/// Named bindings exported by the surrounding script environment and read
/// by `$env`.
pub trait Environment: Send + Sync {
    fn get(&self, name: &str) -> Option<Value>;
}

/// A fixed set of environment bindings.
#[derive(Debug, Clone, Default)]
pub struct MemoryEnvironment {
    bindings: IndexMap<String, Value>,
}

impl MemoryEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.bindings.insert(name.to_string(), value.into());
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.bindings.insert(name.to_string(), value.into());
    }
}

impl Environment for MemoryEnvironment {
    fn get(&self, name: &str) -> Option<Value> {
        self.bindings.get(name).cloned()
    }
}

/// Services and settings shared by every evaluation within one run.
#[derive(Clone)]
pub struct Runtime {
    pub config: Arc<EngineConfig>,
    pub timezone: Tz,
    pub environment: Option<Arc<dyn Environment>>,
    pub script_host: Option<Arc<dyn ScriptHost>>,
    pub now: DateTime<Utc>,
}

impl Runtime {
    pub fn new(config: Arc<EngineConfig>) -> Result<Self> {
        let timezone = config.timezone()?;
        Ok(Self {
            config,
            timezone,
            environment: None,
            script_host: None,
            now: Utc::now(),
        })
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            config: Arc::new(EngineConfig::default()),
            timezone: chrono_tz::UTC,
            environment: None,
            script_host: None,
            now: Utc::now(),
        }
    }
}

/// Variable bindings introduced by `$let`, `$map`, `$group`, `$transform`
/// and friends. Lookups walk to the parent; bindings never leak upward.
#[derive(Debug, Default)]
pub struct Scope<'a> {
    bindings: IndexMap<String, Value>,
    parent: Option<&'a Scope<'a>>,
}

impl<'a> Scope<'a> {
    pub fn new(bindings: IndexMap<String, Value>) -> Self {
        Self {
            bindings,
            parent: None,
        }
    }

    pub fn child(parent: Option<&'a Scope<'a>>, bindings: IndexMap<String, Value>) -> Self {
        Self { bindings, parent }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        match self.bindings.get(name) {
            Some(v) => Some(v),
            None => self.parent.and_then(|p| p.get(name)),
        }
    }

    /// Bind or rebind `name` in this scope only.
    pub fn set(&mut self, name: &str, value: Value) {
        match self.bindings.get_mut(name) {
            Some(slot) => *slot = value,
            None => {
                self.bindings.insert(name.to_string(), value);
            }
        }
    }

    pub fn into_bindings(self) -> IndexMap<String, Value> {
        self.bindings
    }
}

/// Per-document evaluation context.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub runtime: &'a Runtime,
    root: &'a Value,
    current: &'a Value,
    position: usize,
    scope: Option<&'a Scope<'a>>,
}

impl<'a> EvalContext<'a> {
    pub fn new(runtime: &'a Runtime, root: &'a Value) -> Self {
        Self {
            runtime,
            root,
            current: root,
            position: 0,
            scope: None,
        }
    }

    /// Set the `$$CURSOR.position` of the document being evaluated.
    pub fn at_position(mut self, position: usize) -> Self {
        self.position = position;
        self
    }

    pub fn with_scope(mut self, scope: &'a Scope<'a>) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Rebind the document that bare `$field` references resolve against.
    pub fn with_current(mut self, current: &'a Value) -> Self {
        self.current = current;
        self
    }

    pub fn root(&self) -> &'a Value {
        self.root
    }

    pub fn current(&self) -> &'a Value {
        self.current
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn scope(&self) -> Option<&'a Scope<'a>> {
        self.scope
    }

    /// Resolve a `$$name` variable.
    pub fn variable(&self, name: &str) -> Result<Value> {
        match name {
            "ROOT" => Ok(self.root.clone()),
            "CURRENT" => Ok(self.current.clone()),
            "REMOVE" => Ok(Value::Remove),
            "NOW" => Ok(Value::Date(self.runtime.now)),
            "CURSOR" => {
                let mut cursor = Document::new();
                cursor.insert("position", Value::from(self.position));
                Ok(Value::Object(cursor))
            }
            _ => self
                .scope
                .and_then(|s| s.get(name))
                .cloned()
                .ok_or_else(|| Error::InvalidPath(format!("undefined variable $${name}"))),
        }
    }
}
