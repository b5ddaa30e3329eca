//! Scripting seam.
//!
//! The embedded scripting runtime is an external collaborator: the router
//! only needs to classify `EVAL`-family commands for lock selection and hand
//! script bodies to an engine, and the scan writer needs `WHEREEVAL`
//! predicate evaluation. Both consume this trait.
//!
//! The crate ships `NoScripting`, which reports scripting as unavailable.
//! An embedding binary can provide a real engine without touching the
//! controller.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("scripting is not available")]
    Unavailable,

    #[error("script error: {0}")]
    Failed(String),
}

/// The surface the controller consumes from a scripting runtime.
pub trait ScriptEngine: Send + Sync {
    /// True when scripts can actually run. Commands that would need the
    /// engine are rejected up front when this is false.
    fn available(&self) -> bool;

    /// Evaluates a script body with key/argument vectors, returning the
    /// script's string result.
    fn eval(&self, script: &str, keys: &[String], args: &[String]) -> Result<String, ScriptError>;

    /// Evaluates a `WHEREEVAL` predicate against an item's field values.
    fn eval_where(
        &self,
        script: &str,
        args: &[String],
        fields: &HashMap<String, f64>,
    ) -> Result<bool, ScriptError>;

    /// Reclaims idle interpreter state. Called periodically by the
    /// script-pool pruner loop.
    fn prune(&self);
}

/// The default engine: scripting disabled.
#[derive(Debug, Default)]
pub struct NoScripting;

impl ScriptEngine for NoScripting {
    fn available(&self) -> bool {
        false
    }

    fn eval(&self, _: &str, _: &[String], _: &[String]) -> Result<String, ScriptError> {
        Err(ScriptError::Unavailable)
    }

    fn eval_where(
        &self,
        _: &str,
        _: &[String],
        _: &HashMap<String, f64>,
    ) -> Result<bool, ScriptError> {
        Err(ScriptError::Unavailable)
    }

    fn prune(&self) {}
}
