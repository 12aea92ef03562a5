//! Config item definitions and value validators.

use std::fmt;
use std::sync::Arc;

use crate::types::{Error, Result};

/// Custom validation capability: `(item_name, value)`.
pub type CustomValidator = Arc<dyn Fn(&str, &str) -> Result<()> + Send + Sync>;

/// Validator kind; it also determines the value type.
#[derive(Clone)]
pub enum Validator {
    String,
    Int,
    PosInt,
    Float,
    PosFloat,
    Bool,
    Custom(CustomValidator),
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Validator {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str, &str) -> Result<()> + Send + Sync + 'static,
    {
        Validator::Custom(Arc::new(f))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Validator::String => "string",
            Validator::Int => "int",
            Validator::PosInt => "pos-int",
            Validator::Float => "float",
            Validator::PosFloat => "pos-float",
            Validator::Bool => "bool",
            Validator::Custom(_) => "custom",
        }
    }

    /// Check a non-empty value.
    pub fn check(&self, name: &str, value: &str) -> Result<()> {
        match self {
            Validator::String => Ok(()),
            Validator::Int => parse_int(name, value).map(|_| ()),
            Validator::PosInt => {
                if parse_int(name, value)? <= 0 {
                    return Err(not_positive(name, value));
                }
                Ok(())
            }
            Validator::Float => parse_float(name, value).map(|_| ()),
            Validator::PosFloat => {
                if parse_float(name, value)? <= 0.0 {
                    return Err(not_positive(name, value));
                }
                Ok(())
            }
            Validator::Bool => parse_bool(name, value).map(|_| ()),
            Validator::Custom(f) => f(name, value),
        }
    }
}

pub(crate) fn parse_int(name: &str, value: &str) -> Result<i64> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| Error::config_validation(format!("invalid int value for config item {name}: {value}")))
}

pub(crate) fn parse_float(name: &str, value: &str) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::config_validation(format!("invalid float value for config item {name}: {value}")))
}

pub(crate) fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::config_validation(format!(
            "invalid bool value for config item {name}: {value}"
        ))),
    }
}

fn not_positive(name: &str, value: &str) -> Error {
    Error::config_validation(format!(
        "expected strictly positive value for config item {name} but got {value}"
    ))
}

/// Static items are frozen once loaded; user items can be set at runtime
/// and are persisted in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutability {
    Static,
    User,
}

impl fmt::Display for Mutability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutability::Static => write!(f, "static"),
            Mutability::User => write!(f, "user"),
        }
    }
}

/// Definition of a configuration item.
#[derive(Debug, Clone)]
pub struct ConfigItem {
    pub name: String,
    pub description: String,
    pub validator: Validator,
    pub mutability: Mutability,
    /// Lowest precedence default value.
    pub hard_coded: String,
    pub can_be_empty: bool,
}

impl ConfigItem {
    /// New user item validated as a plain string.
    pub fn new(name: impl Into<String>, hard_coded: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            validator: Validator::String,
            mutability: Mutability::User,
            hard_coded: hard_coded.into(),
            can_be_empty: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_mutability(mut self, mutability: Mutability) -> Self {
        self.mutability = mutability;
        self
    }

    pub fn allow_empty(mut self) -> Self {
        self.can_be_empty = true;
        self
    }

    /// Names match `[a-z][a-z0-9-]*`.
    pub fn check_name(&self) -> Result<()> {
        let mut chars = self.name.chars();
        let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if valid {
            Ok(())
        } else {
            Err(Error::validation(format!("invalid config item name: {:?}", self.name)))
        }
    }

    pub fn validate(&self, value: &str) -> Result<()> {
        if value.is_empty() {
            if self.can_be_empty {
                return Ok(());
            }
            return Err(Error::config_validation(format!(
                "empty value provided for config item {} (not supported)",
                self.name
            )));
        }
        self.validator.check(&self.name, value)
    }
}
