//! Submission gate for task specs.
//!
//! Every spec passes a `SpecValidator` before it reaches a pool queue.
//! Failures come back as a list of path-qualified errors so callers can
//! report all of them at once.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::TaskSpec;

/// One rule violation, e.g. `units: must be >= 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: &str, message: &str) -> Self {
        Self {
            path: path.to_string(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Pass/fail contract for submitted specs.
pub trait SpecValidator: Send + Sync {
    fn validate(&self, spec: &TaskSpec) -> Result<(), Vec<ValidationError>>;
}

/// Structural checks on a spec. Pool existence is left to the control
/// surface, which reports it as `UnknownPool` rather than a spec error.
#[derive(Debug, Clone, Default)]
pub struct BasicValidator {
    /// Upper bound on gang size; `None` disables the check.
    pub max_units: Option<u32>,
}

impl BasicValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_units(mut self, max: u32) -> Self {
        self.max_units = Some(max);
        self
    }
}

impl SpecValidator for BasicValidator {
    fn validate(&self, spec: &TaskSpec) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if spec.name.trim().is_empty() {
            errors.push(ValidationError::new("name", "must not be empty"));
        }
        if spec.pool.trim().is_empty() {
            errors.push(ValidationError::new("pool", "must not be empty"));
        }
        if spec.units == 0 {
            errors.push(ValidationError::new("units", "must be >= 1"));
        }
        if let Some(max) = self.max_units {
            if spec.units > max {
                errors.push(ValidationError::new("units", &format!("must be <= {max}")));
            }
        }
        if spec.slots_per_unit == 0 {
            errors.push(ValidationError::new("slots_per_unit", "must be >= 1"));
        }
        if spec.max_attempts == Some(0) {
            errors.push(ValidationError::new("max_attempts", "must be >= 1"));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_minimal_spec() {
        let spec = TaskSpec::new("mnist", "default", 2);
        assert!(BasicValidator::new().validate(&spec).is_ok());
    }

    #[test]
    fn collects_every_violation() {
        let mut spec = TaskSpec::new("", "default", 0);
        spec.slots_per_unit = 0;
        let errors = BasicValidator::new().validate(&spec).unwrap_err();
        let rendered: Vec<String> = errors.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "name: must not be empty",
                "units: must be >= 1",
                "slots_per_unit: must be >= 1",
            ]
        );
    }

    #[test]
    fn max_units_bound() {
        let spec = TaskSpec::new("big", "default", 64);
        let errors = BasicValidator::new()
            .with_max_units(32)
            .validate(&spec)
            .unwrap_err();
        assert_eq!(errors[0].to_string(), "units: must be <= 32");
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut spec = TaskSpec::new("t", "default", 1);
        spec.max_attempts = Some(0);
        let errors = BasicValidator::new().validate(&spec).unwrap_err();
        assert_eq!(errors[0].path, "max_attempts");
    }
}
