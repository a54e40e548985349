use std::fmt;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::{PersonaError, PersonaResult};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Integer,
    String,
    Code,
    CodeList,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Integer => "integer",
            ValueType::String => "string",
            ValueType::Code => "code",
            ValueType::CodeList => "code_list",
        }
    }
}

/// A resolved entry of a reference vocabulary, identified by its code.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeRef(String);

impl CodeRef {
    pub fn new(code: impl Into<String>) -> PersonaResult<Self> {
        let code = code.into();
        let trimmed = code.trim();
        if trimmed.is_empty() {
            return Err(PersonaError::validation("reference code must not be blank"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Integer(i64),
    String(String),
    Code(CodeRef),
    CodeList(Vec<CodeRef>),
}

impl FieldValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            FieldValue::Integer(_) => ValueType::Integer,
            FieldValue::String(_) => ValueType::String,
            FieldValue::Code(_) => ValueType::Code,
            FieldValue::CodeList(_) => ValueType::CodeList,
        }
    }

    /// Canonical form used for change detection: NFC text and a sorted,
    /// de-duplicated code list.
    pub fn normalized(self) -> Self {
        match self {
            FieldValue::String(text) => FieldValue::String(text.nfc().collect()),
            FieldValue::CodeList(mut codes) => {
                codes.sort();
                codes.dedup();
                FieldValue::CodeList(codes)
            }
            other => other,
        }
    }
}
