//! The closed catalog of versioned person fields.
//!
//! Each [`Field`] declares its value type and a typed accessor pair against
//! [`PersonState`]. Dispatch is an explicit `match` so adding a field forces
//! every accessor to be updated.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{CodeRef, FieldValue, PersonaError, PersonaResult, ValueType};

const MAX_HEIGHT_CM: i64 = 300;
const MAX_DEPENDANTS: i64 = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    GivenName,
    FamilyName,
    HeightCm,
    Dependants,
    Nationality,
    MaritalStatus,
    Languages,
}

impl Field {
    pub const ALL: [Field; 7] = [
        Field::GivenName,
        Field::FamilyName,
        Field::HeightCm,
        Field::Dependants,
        Field::Nationality,
        Field::MaritalStatus,
        Field::Languages,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Field::GivenName => "given_name",
            Field::FamilyName => "family_name",
            Field::HeightCm => "height_cm",
            Field::Dependants => "dependants",
            Field::Nationality => "nationality",
            Field::MaritalStatus => "marital_status",
            Field::Languages => "languages",
        }
    }

    pub fn value_type(self) -> ValueType {
        match self {
            Field::GivenName | Field::FamilyName => ValueType::String,
            Field::HeightCm | Field::Dependants => ValueType::Integer,
            Field::Nationality | Field::MaritalStatus => ValueType::Code,
            Field::Languages => ValueType::CodeList,
        }
    }

    /// Type- and domain-checks a value for this field and returns its
    /// canonical form. `None` (explicitly empty) is always accepted.
    pub fn check(self, value: Option<FieldValue>) -> PersonaResult<Option<FieldValue>> {
        let Some(value) = value else {
            return Ok(None);
        };
        if value.value_type() != self.value_type() {
            return Err(PersonaError::validation(format!(
                "field {self} expects {}, got {}",
                self.value_type().as_str(),
                value.value_type().as_str()
            )));
        }
        match (self, &value) {
            (Field::GivenName | Field::FamilyName, FieldValue::String(text))
                if text.trim().is_empty() =>
            {
                Err(PersonaError::validation(format!(
                    "field {self} must not be blank; send null to clear it"
                )))
            }
            (Field::HeightCm, FieldValue::Integer(cm)) if !(1..=MAX_HEIGHT_CM).contains(cm) => {
                Err(PersonaError::validation(format!(
                    "height_cm {cm} outside 1..={MAX_HEIGHT_CM}"
                )))
            }
            (Field::Dependants, FieldValue::Integer(count))
                if !(0..=MAX_DEPENDANTS).contains(count) =>
            {
                Err(PersonaError::validation(format!(
                    "dependants {count} outside 0..={MAX_DEPENDANTS}"
                )))
            }
            _ => Ok(Some(value.normalized())),
        }
    }

    pub fn get(self, state: &PersonState) -> Option<FieldValue> {
        match self {
            Field::GivenName => state.given_name.clone().map(FieldValue::String),
            Field::FamilyName => state.family_name.clone().map(FieldValue::String),
            Field::HeightCm => state.height_cm.map(FieldValue::Integer),
            Field::Dependants => state.dependants.map(FieldValue::Integer),
            Field::Nationality => state.nationality.clone().map(FieldValue::Code),
            Field::MaritalStatus => state.marital_status.clone().map(FieldValue::Code),
            Field::Languages => state.languages.clone().map(FieldValue::CodeList),
        }
    }

    pub fn set(self, state: &mut PersonState, value: Option<FieldValue>) -> PersonaResult<()> {
        let value = self.check(value)?;
        match (self, value) {
            (Field::GivenName, value) => state.given_name = value.and_then(into_string),
            (Field::FamilyName, value) => state.family_name = value.and_then(into_string),
            (Field::HeightCm, value) => state.height_cm = value.and_then(into_integer),
            (Field::Dependants, value) => state.dependants = value.and_then(into_integer),
            (Field::Nationality, value) => state.nationality = value.and_then(into_code),
            (Field::MaritalStatus, value) => state.marital_status = value.and_then(into_code),
            (Field::Languages, value) => state.languages = value.and_then(into_code_list),
        }
        Ok(())
    }
}

fn into_string(value: FieldValue) -> Option<String> {
    match value {
        FieldValue::String(text) => Some(text),
        _ => None,
    }
}

fn into_integer(value: FieldValue) -> Option<i64> {
    match value {
        FieldValue::Integer(number) => Some(number),
        _ => None,
    }
}

fn into_code(value: FieldValue) -> Option<CodeRef> {
    match value {
        FieldValue::Code(code) => Some(code),
        _ => None,
    }
}

fn into_code_list(value: FieldValue) -> Option<Vec<CodeRef>> {
    match value {
        FieldValue::CodeList(codes) => Some(codes),
        _ => None,
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Field {
    type Err = PersonaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Field::ALL
            .into_iter()
            .find(|field| field.as_str() == value)
            .ok_or_else(|| PersonaError::validation(format!("unknown field '{value}'")))
    }
}

/// Live attribute values of a person; the head of every field's history.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonState {
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub height_cm: Option<i64>,
    pub dependants: Option<i64>,
    pub nationality: Option<CodeRef>,
    pub marital_status: Option<CodeRef>,
    pub languages: Option<Vec<CodeRef>>,
}

#[cfg(test)]
mod tests {
    use super::{Field, PersonState};
    use crate::{CodeRef, FieldValue};

    #[test]
    fn every_field_roundtrips_through_its_accessors() {
        let samples = [
            (Field::GivenName, FieldValue::String("Aino".into())),
            (Field::FamilyName, FieldValue::String("Virtanen".into())),
            (Field::HeightCm, FieldValue::Integer(172)),
            (Field::Dependants, FieldValue::Integer(2)),
            (Field::Nationality, FieldValue::Code(CodeRef::new("FIN").unwrap())),
            (Field::MaritalStatus, FieldValue::Code(CodeRef::new("married").unwrap())),
            (
                Field::Languages,
                FieldValue::CodeList(vec![CodeRef::new("fi").unwrap(), CodeRef::new("sv").unwrap()]),
            ),
        ];
        let mut state = PersonState::default();
        for (field, value) in samples {
            field.set(&mut state, Some(value.clone())).expect("set");
            assert_eq!(field.get(&state), Some(value));
            field.set(&mut state, None).expect("clear");
            assert_eq!(field.get(&state), None);
        }
    }

    #[test]
    fn rejects_values_of_the_wrong_type() {
        let mut state = PersonState::default();
        let err = Field::HeightCm
            .set(&mut state, Some(FieldValue::String("tall".into())))
            .unwrap_err();
        assert!(err.to_string().contains("height_cm expects integer"));
        assert_eq!(state, PersonState::default());
    }

    #[test]
    fn rejects_out_of_domain_values() {
        assert!(Field::HeightCm.check(Some(FieldValue::Integer(0))).is_err());
        assert!(Field::Dependants.check(Some(FieldValue::Integer(-1))).is_err());
        assert!(Field::GivenName.check(Some(FieldValue::String("  ".into()))).is_err());
        assert!(Field::Dependants.check(Some(FieldValue::Integer(0))).is_ok());
    }

    #[test]
    fn names_parse_back_to_fields() {
        for field in Field::ALL {
            assert_eq!(field.as_str().parse::<Field>().expect("parse"), field);
        }
        assert!("shoe_size".parse::<Field>().is_err());
    }
}
