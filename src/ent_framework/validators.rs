// Validators - pluggable per-property and per-type validation capability

use regex::Regex;
use std::fmt;
use std::sync::Arc;

use crate::core::data_value::{DataValue, PropertySource};
use crate::error::{AppError, AppResult};

/// What a validator is looking at.
pub struct ValidationContext<'a> {
    pub entity_type: &'a str,
    /// `None` for entity-level validators.
    pub property_name: Option<&'a str>,
    pub display_name: &'a str,
    /// The entity being validated, for validators that look across properties.
    pub entity: Option<&'a dyn PropertySource>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub validator_name: String,
    pub property_name: Option<String>,
    pub error_message: String,
}

impl ValidationError {
    pub fn new(validator_name: &str, property_name: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            validator_name: validator_name.to_string(),
            property_name: property_name.map(str::to_string),
            error_message: message.into(),
        }
    }

    /// Errors are unique per (validator, property).
    pub fn key(&self) -> String {
        Self::key_for(&self.validator_name, self.property_name.as_deref())
    }

    pub fn key_for(validator_name: &str, property_name: Option<&str>) -> String {
        format!("{}:{}", validator_name, property_name.unwrap_or(""))
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.error_message)
    }
}

/// Returning `Err` aborts the whole validation pass.
pub trait Validator: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn validate(
        &self,
        value: &DataValue,
        context: &ValidationContext<'_>,
    ) -> AppResult<Option<ValidationError>>;
}

#[derive(Debug, Clone, Default)]
pub struct RequiredValidator {
    pub allow_empty_strings: bool,
}

impl Validator for RequiredValidator {
    fn name(&self) -> &str {
        "required"
    }

    fn validate(
        &self,
        value: &DataValue,
        context: &ValidationContext<'_>,
    ) -> AppResult<Option<ValidationError>> {
        let missing = match value {
            DataValue::Null => true,
            DataValue::String(s) => !self.allow_empty_strings && s.trim().is_empty(),
            _ => false,
        };
        Ok(missing.then(|| {
            ValidationError::new(
                self.name(),
                context.property_name,
                format!("'{}' is required", context.display_name),
            )
        }))
    }
}

#[derive(Debug, Clone)]
pub struct MaxLengthValidator {
    pub max_length: usize,
}

impl Validator for MaxLengthValidator {
    fn name(&self) -> &str {
        "maxLength"
    }

    fn validate(
        &self,
        value: &DataValue,
        context: &ValidationContext<'_>,
    ) -> AppResult<Option<ValidationError>> {
        let too_long = value
            .as_str()
            .map(|s| s.chars().count() > self.max_length)
            .unwrap_or(false);
        Ok(too_long.then(|| {
            ValidationError::new(
                self.name(),
                context.property_name,
                format!(
                    "'{}' must be a string with {} characters or less",
                    context.display_name, self.max_length
                ),
            )
        }))
    }
}

#[derive(Debug, Clone)]
pub struct RegexValidator {
    name: String,
    regex: Regex,
    message: String,
}

impl RegexValidator {
    pub fn new(name: &str, pattern: &str, message: &str) -> AppResult<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| AppError::Configuration(format!("invalid pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            name: name.to_string(),
            regex,
            message: message.to_string(),
        })
    }
}

impl Validator for RegexValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(
        &self,
        value: &DataValue,
        context: &ValidationContext<'_>,
    ) -> AppResult<Option<ValidationError>> {
        // absent values are the required validator's business
        if value.is_empty() {
            return Ok(None);
        }
        let text = value.to_string();
        if self.regex.is_match(&text) {
            return Ok(None);
        }
        Ok(Some(ValidationError::new(
            &self.name,
            context.property_name,
            self.message.replace("%displayName%", context.display_name),
        )))
    }
}

pub type ValidatorFn =
    dyn Fn(&DataValue, &ValidationContext<'_>) -> AppResult<Option<String>> + Send + Sync;

/// Closure-backed validator; the closure returns the error message, if any.
#[derive(Clone)]
pub struct FnValidator {
    name: String,
    f: Arc<ValidatorFn>,
}

impl FnValidator {
    pub fn new<F>(name: &str, f: F) -> Self
    where
        F: Fn(&DataValue, &ValidationContext<'_>) -> AppResult<Option<String>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.to_string(),
            f: Arc::new(f),
        }
    }
}

impl fmt::Debug for FnValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnValidator").field("name", &self.name).finish()
    }
}

impl Validator for FnValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(
        &self,
        value: &DataValue,
        context: &ValidationContext<'_>,
    ) -> AppResult<Option<ValidationError>> {
        Ok((self.f)(value, context)?
            .map(|message| ValidationError::new(&self.name, context.property_name, message)))
    }
}
