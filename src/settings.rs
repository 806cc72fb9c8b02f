//! Adjustable settings published by the server.
//!
//! A `SettingsBundle` is an ordered list of typed `Setting`s plus the path
//! of the configuration script the server last loaded. Names are unique
//! within a bundle and every value has the shape its setting's type asks
//! for; both are checked on construction, so a bundle that exists is valid.

use std::collections::HashMap;
use std::fmt;

/// Type of a setting's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Str,
    Int,
    Float,
    List,
}

impl ValueType {
    /// Wire name of the type.
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Str => "str",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::List => "list",
        }
    }

    /// Parse a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "str" => Some(ValueType::Str),
            "int" => Some(ValueType::Int),
            "float" => Some(ValueType::Float),
            "list" => Some(ValueType::List),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A setting value.
#[derive(Debug, Clone)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    List(Vec<Value>),
}

impl Value {
    /// Name of the value's shape, as used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "str",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::List(_) => "list",
        }
    }

    /// Convert to `value_type`, widening integers to floats.
    fn coerce(self, value_type: ValueType) -> Option<Value> {
        match (value_type, self) {
            (ValueType::Str, v @ Value::Str(_)) => Some(v),
            (ValueType::Int, v @ Value::Int(_)) => Some(v),
            (ValueType::Float, v @ Value::Float(_)) => Some(v),
            (ValueType::Float, Value::Int(i)) => Some(Value::Float(i as f64)),
            (ValueType::List, v @ Value::List(_)) => Some(v),
            _ => None,
        }
    }

    /// The quantity compared against minimum and maximum.
    fn magnitude(&self) -> f64 {
        match self {
            Value::Str(s) => s.chars().count() as f64,
            Value::Int(i) => *i as f64,
            Value::Float(x) => *x,
            Value::List(items) => items.len() as f64,
        }
    }
}

fn float_eq(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

// NaN compares equal to NaN so that bundles survive an encode/decode cycle.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => float_eq(*a, *b),
            (Value::List(a), Value::List(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

/// Numeric bound or step of a setting.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(x) => x,
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a == b,
            (Number::Float(a), Number::Float(b)) => float_eq(*a, *b),
            _ => false,
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(i) => write!(f, "{}", i),
            Number::Float(x) => write!(f, "{:?}", x),
        }
    }
}

impl From<i64> for Number {
    fn from(i: i64) -> Self {
        Number::Int(i)
    }
}

impl From<f64> for Number {
    fn from(x: f64) -> Self {
        Number::Float(x)
    }
}

/// Settings validation errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsError {
    /// Names must be non-empty ASCII without whitespace.
    InvalidName(String),
    /// A bundle already holds a setting of this name.
    DuplicateName(String),
    /// No setting of this name exists.
    UnknownSetting(String),
    /// A value does not have the setting's type.
    TypeMismatch {
        name: String,
        expected: ValueType,
        found: &'static str,
    },
    /// A value lies outside `[minimum, maximum]`.
    OutOfRange { name: String, value: String },
    /// A value is not among the setting's possible values.
    NotAllowed { name: String, value: String },
    /// Inconsistent bounds or step.
    InvalidBounds { name: String, reason: &'static str },
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::InvalidName(name) => write!(f, "invalid setting name: {:?}", name),
            SettingsError::DuplicateName(name) => write!(f, "duplicate setting: {}", name),
            SettingsError::UnknownSetting(name) => write!(f, "unknown setting: {}", name),
            SettingsError::TypeMismatch {
                name,
                expected,
                found,
            } => write!(f, "setting {} expects {}, got {}", name, expected, found),
            SettingsError::OutOfRange { name, value } => {
                write!(f, "value {} is out of range for setting {}", value, name)
            }
            SettingsError::NotAllowed { name, value } => {
                write!(f, "value {} is not allowed for setting {}", value, name)
            }
            SettingsError::InvalidBounds { name, reason } => {
                write!(f, "setting {}: {}", name, reason)
            }
        }
    }
}

impl std::error::Error for SettingsError {}

/// Every field of a setting, unvalidated.
///
/// Turned into a `Setting` with `Setting::from_parts`.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingParts {
    pub name: String,
    pub title: String,
    pub value_type: ValueType,
    pub default_value: Value,
    pub current_value: Value,
    pub minimum: Option<Number>,
    pub maximum: Option<Number>,
    pub epsilon: Option<Number>,
    pub possible_values: Option<Vec<Value>>,
}

/// One adjustable setting.
///
/// For `str` settings the minimum and maximum bound the length in
/// characters, for `list` settings the number of items. For `list`
/// settings the possible values constrain each item.
#[derive(Debug, Clone, PartialEq)]
pub struct Setting {
    name: String,
    title: String,
    value_type: ValueType,
    default_value: Value,
    current_value: Value,
    minimum: Option<Number>,
    maximum: Option<Number>,
    epsilon: Option<Number>,
    possible_values: Option<Vec<Value>>,
}

impl Setting {
    /// Create a setting whose type follows from its default value.
    ///
    /// The current value starts out as the default.
    pub fn new(
        name: impl Into<String>,
        title: impl Into<String>,
        default_value: impl Into<Value>,
    ) -> Result<Self, SettingsError> {
        let default_value = default_value.into();
        let value_type = match default_value {
            Value::Str(_) => ValueType::Str,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::List(_) => ValueType::List,
        };
        Self::from_parts(SettingParts {
            name: name.into(),
            title: title.into(),
            value_type,
            current_value: default_value.clone(),
            default_value,
            minimum: None,
            maximum: None,
            epsilon: None,
            possible_values: None,
        })
    }

    /// Validate a full set of fields.
    pub fn from_parts(parts: SettingParts) -> Result<Self, SettingsError> {
        let SettingParts {
            name,
            title,
            value_type,
            default_value,
            current_value,
            minimum,
            maximum,
            epsilon,
            possible_values,
        } = parts;

        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(SettingsError::InvalidName(name));
        }

        if let (Some(min), Some(max)) = (minimum, maximum) {
            if min.as_f64() > max.as_f64() {
                return Err(SettingsError::InvalidBounds {
                    name,
                    reason: "minimum exceeds maximum",
                });
            }
        }
        if let Some(epsilon) = epsilon {
            if !(epsilon.as_f64() >= 0.0) {
                return Err(SettingsError::InvalidBounds {
                    name,
                    reason: "epsilon must be non-negative",
                });
            }
        }

        let possible_values = match possible_values {
            Some(values) => {
                let item_type = match value_type {
                    ValueType::List => None,
                    other => Some(other),
                };
                let mut coerced = Vec::with_capacity(values.len());
                for value in values {
                    coerced.push(match item_type {
                        Some(t) => coerce(&name, value, t)?,
                        None => value,
                    });
                }
                Some(coerced)
            }
            None => None,
        };

        let mut setting = Self {
            name,
            title,
            value_type,
            default_value: Value::Int(0),
            current_value: Value::Int(0),
            minimum,
            maximum,
            epsilon,
            possible_values,
        };
        setting.default_value = setting.validate(default_value)?;
        setting.current_value = setting.validate(current_value)?;
        Ok(setting)
    }

    /// Restrict values to `[minimum, maximum]`.
    pub fn with_range(
        self,
        minimum: impl Into<Number>,
        maximum: impl Into<Number>,
    ) -> Result<Self, SettingsError> {
        let mut parts = self.into_parts();
        parts.minimum = Some(minimum.into());
        parts.maximum = Some(maximum.into());
        Self::from_parts(parts)
    }

    /// Set the smallest meaningful step.
    pub fn with_epsilon(self, epsilon: impl Into<Number>) -> Result<Self, SettingsError> {
        let mut parts = self.into_parts();
        parts.epsilon = Some(epsilon.into());
        Self::from_parts(parts)
    }

    /// Restrict values to an enumeration.
    pub fn with_possible_values(self, values: Vec<Value>) -> Result<Self, SettingsError> {
        let mut parts = self.into_parts();
        parts.possible_values = Some(values);
        Self::from_parts(parts)
    }

    /// Replace the current value.
    pub fn with_current(mut self, value: impl Into<Value>) -> Result<Self, SettingsError> {
        self.set_current(value.into())?;
        Ok(self)
    }

    /// Check `value` against type, range and enumeration.
    pub fn validate(&self, value: Value) -> Result<Value, SettingsError> {
        let value = coerce(&self.name, value, self.value_type)?;

        let magnitude = value.magnitude();
        let below = self.minimum.is_some_and(|min| magnitude < min.as_f64());
        let above = self.maximum.is_some_and(|max| magnitude > max.as_f64());
        if below || above {
            return Err(SettingsError::OutOfRange {
                name: self.name.clone(),
                value: value.to_string(),
            });
        }

        if let Some(allowed) = &self.possible_values {
            let permitted = match &value {
                Value::List(items) => items.iter().all(|item| allowed.contains(item)),
                single => allowed.contains(single),
            };
            if !permitted {
                return Err(SettingsError::NotAllowed {
                    name: self.name.clone(),
                    value: value.to_string(),
                });
            }
        }

        Ok(value)
    }

    /// Replace the current value. Returns true if it changed.
    pub fn set_current(&mut self, value: Value) -> Result<bool, SettingsError> {
        let value = self.validate(value)?;
        let changed = value != self.current_value;
        self.current_value = value;
        Ok(changed)
    }

    /// Reset the current value to the default.
    pub fn reset(&mut self) {
        self.current_value = self.default_value.clone();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn default_value(&self) -> &Value {
        &self.default_value
    }

    pub fn current_value(&self) -> &Value {
        &self.current_value
    }

    pub fn minimum(&self) -> Option<Number> {
        self.minimum
    }

    pub fn maximum(&self) -> Option<Number> {
        self.maximum
    }

    pub fn epsilon(&self) -> Option<Number> {
        self.epsilon
    }

    pub fn possible_values(&self) -> Option<&[Value]> {
        self.possible_values.as_deref()
    }

    /// Decompose into unvalidated fields.
    pub fn into_parts(self) -> SettingParts {
        SettingParts {
            name: self.name,
            title: self.title,
            value_type: self.value_type,
            default_value: self.default_value,
            current_value: self.current_value,
            minimum: self.minimum,
            maximum: self.maximum,
            epsilon: self.epsilon,
            possible_values: self.possible_values,
        }
    }
}

fn coerce(name: &str, value: Value, value_type: ValueType) -> Result<Value, SettingsError> {
    let found = value.kind();
    value
        .coerce(value_type)
        .ok_or_else(|| SettingsError::TypeMismatch {
            name: name.to_string(),
            expected: value_type,
            found,
        })
}

/// Outcome of merging client-sent values into a bundle.
#[derive(Debug, Default, PartialEq)]
pub struct ApplyReport {
    /// Names whose current value changed.
    pub changed: Vec<String>,
    /// Values that were refused.
    pub rejected: Vec<SettingsError>,
}

/// Ordered, name-indexed collection of settings plus the loaded script.
#[derive(Debug, Clone, Default)]
pub struct SettingsBundle {
    script: Option<String>,
    settings: Vec<Setting>,
    /// Name to position in `settings`.
    index: HashMap<String, usize>,
}

impl SettingsBundle {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty bundle announcing `script`.
    pub fn with_script(script: Option<String>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Path of the configuration script last loaded by the server.
    pub fn script(&self) -> Option<&str> {
        self.script.as_deref()
    }

    pub fn set_script(&mut self, script: Option<String>) {
        self.script = script;
    }

    /// Append a setting. Names must be unique.
    pub fn add(&mut self, setting: Setting) -> Result<(), SettingsError> {
        if self.index.contains_key(setting.name()) {
            return Err(SettingsError::DuplicateName(setting.name().to_string()));
        }
        self.index.insert(setting.name().to_string(), self.settings.len());
        self.settings.push(setting);
        Ok(())
    }

    /// Look up a setting by name.
    pub fn get(&self, name: &str) -> Option<&Setting> {
        self.index.get(name).map(|&i| &self.settings[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Settings in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, Setting> {
        self.settings.iter()
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    /// Update the current value of one setting. Returns true if it changed.
    pub fn set_current(&mut self, name: &str, value: Value) -> Result<bool, SettingsError> {
        let &i = self
            .index
            .get(name)
            .ok_or_else(|| SettingsError::UnknownSetting(name.to_string()))?;
        self.settings[i].set_current(value)
    }

    /// Take the current values of every setting in `update` that this
    /// bundle knows. Unknown names and invalid values are reported, not
    /// applied; the script and all other fields stay as they are.
    pub fn apply_current(&mut self, update: &SettingsBundle) -> ApplyReport {
        let mut report = ApplyReport::default();
        for setting in update.iter() {
            match self.set_current(setting.name(), setting.current_value().clone()) {
                Ok(true) => report.changed.push(setting.name().to_string()),
                Ok(false) => {}
                Err(e) => report.rejected.push(e),
            }
        }
        report
    }
}

impl PartialEq for SettingsBundle {
    fn eq(&self, other: &Self) -> bool {
        self.script == other.script && self.settings == other.settings
    }
}

impl<'a> IntoIterator for &'a SettingsBundle {
    type Item = &'a Setting;
    type IntoIter = std::slice::Iter<'a, Setting>;

    fn into_iter(self) -> Self::IntoIter {
        self.settings.iter()
    }
}
