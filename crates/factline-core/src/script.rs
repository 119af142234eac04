//! Scripting capability used by filter predicates and transformation steps.
//!
//! The pipeline is free of any particular scripting runtime: an injected
//! [`ScriptEngine`] compiles source text into a [`CompiledScript`] handle
//! that can be invoked any number of times. Compilation is expensive and
//! invocation cheap, so [`ScriptCache`] keeps one handle per distinct
//! source text.
//!
//! Thread affinity of compiled handles, if any, is the engine's concern.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;
use serde_json::Value;

/// Errors raised by a [`ScriptEngine`] or a [`CompiledScript`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    /// The source failed to compile.
    #[error("script compilation failed: {0}")]
    Compile(String),

    /// The named entry point failed or does not exist.
    #[error("script function '{function}' failed: {message}")]
    Invoke {
        /// Entry point that was called.
        function: String,
        /// Engine message.
        message: String,
    },

    /// The engine does not support the requested language.
    #[error("unsupported script language: {0}")]
    UnsupportedLanguage(String),
}

/// A compiled, reusable script.
pub trait CompiledScript: Send + Sync {
    /// Invokes the named function with JSON arguments.
    ///
    /// # Errors
    ///
    /// Returns `ScriptError::Invoke` if the call fails.
    fn invoke(&self, function: &str, args: &[Value]) -> Result<Value, ScriptError>;
}

/// Shared handle to a compiled script.
pub type ScriptHandle = Arc<dyn CompiledScript>;

/// Compiles script source text.
pub trait ScriptEngine: Send + Sync {
    /// Compiles `source`.
    ///
    /// # Errors
    ///
    /// Returns `ScriptError::Compile` if the source is invalid.
    fn compile(&self, source: &str) -> Result<ScriptHandle, ScriptError>;

    /// Returns `true` if this engine runs scripts in `language`. Defaults
    /// to JavaScript (`js` or `javascript`, any case).
    fn supports_language(&self, language: &str) -> bool {
        language.eq_ignore_ascii_case("js") || language.eq_ignore_ascii_case("javascript")
    }
}

// ---------------------------------------------------------------------------
// ScriptCache
// ---------------------------------------------------------------------------

/// Compile cache keyed by source text.
///
/// Shared (via `Arc`) between every filter and transformer in a process.
pub struct ScriptCache {
    engine: Arc<dyn ScriptEngine>,
    compiled: RwLock<FxHashMap<String, ScriptHandle>>,
}

impl ScriptCache {
    /// Creates an empty cache over `engine`.
    #[must_use]
    pub fn new(engine: Arc<dyn ScriptEngine>) -> Self {
        Self {
            engine,
            compiled: RwLock::new(FxHashMap::default()),
        }
    }

    /// Returns the compiled handle for `source`, compiling it on first use.
    ///
    /// # Errors
    ///
    /// Returns the engine's `ScriptError` if compilation fails. Failures
    /// are not cached.
    pub fn get_or_compile(&self, source: &str) -> Result<ScriptHandle, ScriptError> {
        if let Some(handle) = self.compiled.read().get(source) {
            return Ok(Arc::clone(handle));
        }

        // Compile outside the lock; a concurrent compile of the same source
        // keeps whichever handle lands first.
        let handle = self.engine.compile(source)?;
        let mut compiled = self.compiled.write();
        let entry = compiled
            .entry(source.to_string())
            .or_insert_with(|| Arc::clone(&handle));
        Ok(Arc::clone(entry))
    }

    /// Like [`get_or_compile`](Self::get_or_compile), but first checks the
    /// engine supports `language`.
    ///
    /// # Errors
    ///
    /// Returns `ScriptError::UnsupportedLanguage` for a language the engine
    /// does not run, or the engine's compile error.
    pub fn get_or_compile_in(
        &self,
        language: &str,
        source: &str,
    ) -> Result<ScriptHandle, ScriptError> {
        if !self.engine.supports_language(language) {
            return Err(ScriptError::UnsupportedLanguage(language.to_string()));
        }
        self.get_or_compile(source)
    }

    /// Number of distinct compiled sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.compiled.read().len()
    }

    /// Returns `true` if nothing has been compiled yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.compiled.read().is_empty()
    }
}

impl std::fmt::Debug for ScriptCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptCache")
            .field("compiled", &self.len())
            .finish_non_exhaustive()
    }
}

/// Coerces a script result to a boolean using JavaScript truthiness.
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FnScriptEngine;
    use serde_json::json;

    #[test]
    fn test_truthy() {
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&json!(false)));
        assert!(truthy(&json!(true)));
        assert!(!truthy(&json!(0)));
        assert!(truthy(&json!(2.5)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([])));
        assert!(truthy(&json!({})));
    }

    #[test]
    fn test_cache_compiles_once_per_source() {
        let engine = Arc::new(FnScriptEngine::new());
        engine.register("a", "test", |_| Ok(json!(true)));
        engine.register("b", "test", |_| Ok(json!(false)));
        let cache = ScriptCache::new(Arc::clone(&engine) as Arc<dyn ScriptEngine>);

        let first = cache.get_or_compile("a").unwrap();
        let again = cache.get_or_compile("a").unwrap();
        cache.get_or_compile("b").unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(cache.len(), 2);
        assert_eq!(engine.compile_count(), 2);
    }

    #[test]
    fn test_unsupported_language_rejected() {
        let engine = Arc::new(FnScriptEngine::new());
        engine.register("a", "test", |_| Ok(json!(true)));
        let cache = ScriptCache::new(Arc::clone(&engine) as Arc<dyn ScriptEngine>);

        assert!(cache.get_or_compile_in("JavaScript", "a").is_ok());
        assert!(matches!(
            cache.get_or_compile_in("python", "a"),
            Err(ScriptError::UnsupportedLanguage(lang)) if lang == "python"
        ));
        assert_eq!(engine.compile_count(), 1);
    }

    #[test]
    fn test_compile_failure_not_cached() {
        let engine = Arc::new(FnScriptEngine::new());
        let cache = ScriptCache::new(Arc::clone(&engine) as Arc<dyn ScriptEngine>);
        assert!(matches!(
            cache.get_or_compile("missing"),
            Err(ScriptError::Compile(_))
        ));
        assert!(cache.is_empty());
    }
}
