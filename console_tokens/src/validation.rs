//! Validation of caller-supplied parameters
//!
//! Each operation on the console API takes a typed parameter struct. Before
//! any token is requested or any request is built, the struct is checked with
//! [`Validate`], and all offending fields are reported together.
//!
//! ```
//! use console_tokens::validation::{FieldErrors, InputValidationError, Validate};
//!
//! struct ListImages<'a> {
//!     device_id: &'a str,
//!     limit: u32,
//!     order_by: &'a str,
//! }
//!
//! impl Validate for ListImages<'_> {
//!     fn validate(&self) -> Result<(), InputValidationError> {
//!         let mut errors = FieldErrors::new();
//!         errors.require_non_empty("device_id", self.device_id);
//!         errors.require_range("limit", self.limit, 1..=256);
//!         errors.require_one_of("order_by", self.order_by, &["ASC", "DESC"]);
//!         errors.finish()
//!     }
//! }
//!
//! let bad = ListImages { device_id: "", limit: 0, order_by: "ASC" };
//! let error = bad.validate().unwrap_err();
//! assert_eq!(error.errors().len(), 2);
//! ```

use std::{borrow::Cow, fmt, ops::RangeInclusive};

use thiserror::Error;

/// A problem with a single named field
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    field: Cow<'static, str>,
    message: String,
}

impl FieldError {
    /// Constructs a new field error
    pub fn new(field: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// The name of the offending field
    pub fn field(&self) -> &str {
        &self.field
    }

    /// What is wrong with the field
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub(crate) fn join(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parameters failed validation; no request was attempted
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid parameters: {}", join(.errors))]
pub struct InputValidationError {
    errors: Vec<FieldError>,
}

impl InputValidationError {
    /// The individual field errors, in the order they were found
    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }
}

/// A parameter type that can check itself before use
pub trait Validate {
    /// Checks every field, reporting all problems found
    fn validate(&self) -> Result<(), InputValidationError>;
}

/// Validates `value`, handing it back only if it passes
pub fn validated<T: Validate>(value: T) -> Result<T, InputValidationError> {
    value.validate()?;
    Ok(value)
}

/// An accumulator for field errors
#[derive(Debug, Default)]
pub struct FieldErrors {
    errors: Vec<FieldError>,
}

impl FieldErrors {
    /// An empty accumulator
    pub const fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Records an error against a field
    pub fn push(&mut self, field: impl Into<Cow<'static, str>>, message: impl Into<String>) {
        self.errors.push(FieldError::new(field, message));
    }

    /// Requires a string field to contain something other than whitespace
    pub fn require_non_empty(&mut self, field: &'static str, value: &str) {
        if value.trim().is_empty() {
            self.push(field, "must not be empty");
        }
    }

    /// Requires a numeric field to lie within `range`
    pub fn require_range<T>(&mut self, field: &'static str, value: T, range: RangeInclusive<T>)
    where
        T: PartialOrd + fmt::Display,
    {
        if !range.contains(&value) {
            self.push(
                field,
                format!(
                    "must be between {} and {}, got {}",
                    range.start(),
                    range.end(),
                    value
                ),
            );
        }
    }

    /// Requires a string field to be one of the allowed values
    pub fn require_one_of(&mut self, field: &'static str, value: &str, allowed: &[&str]) {
        if !allowed.contains(&value) {
            self.push(
                field,
                format!("must be one of {}, got {:?}", allowed.join(", "), value),
            );
        }
    }

    /// Whether no errors have been recorded
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn into_inner(self) -> Vec<FieldError> {
        self.errors
    }

    /// Completes validation
    pub fn finish(self) -> Result<(), InputValidationError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(InputValidationError {
                errors: self.errors,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StartUpload {
        device_id: String,
        frequency_secs: u32,
        mode: &'static str,
    }

    impl Validate for StartUpload {
        fn validate(&self) -> Result<(), InputValidationError> {
            let mut errors = FieldErrors::new();
            errors.require_non_empty("device_id", &self.device_id);
            errors.require_range("frequency_secs", self.frequency_secs, 1..=3600);
            errors.require_one_of("mode", self.mode, &["image", "inference", "both"]);
            errors.finish()
        }
    }

    #[test]
    fn valid_parameters_pass_through() {
        let params = StartUpload {
            device_id: "sensor-1".to_owned(),
            frequency_secs: 60,
            mode: "image",
        };
        let params = validated(params).unwrap();
        assert_eq!(params.device_id, "sensor-1");
    }

    #[test]
    fn every_offending_field_is_reported() {
        let params = StartUpload {
            device_id: "  ".to_owned(),
            frequency_secs: 0,
            mode: "video",
        };
        let error = validated(params).err().unwrap();
        let fields: Vec<_> = error.errors().iter().map(FieldError::field).collect();
        assert_eq!(fields, ["device_id", "frequency_secs", "mode"]);
        assert_eq!(
            error.to_string(),
            "invalid parameters: device_id: must not be empty; \
             frequency_secs: must be between 1 and 3600, got 0; \
             mode: must be one of image, inference, both, got \"video\""
        );
    }

    #[test]
    fn empty_accumulator_finishes_cleanly() {
        let errors = FieldErrors::default();
        assert!(errors.is_empty());
        assert!(errors.finish().is_ok());
    }
}
