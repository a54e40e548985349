//! Partial updates with explicit field presence.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{CodeRef, Field, FieldValue, PersonState, PersonaResult};

/// Whether a request mentioned a field, and if so what it set it to.
///
/// A missing JSON key deserializes to `Absent` (with `#[serde(default)]`),
/// `null` to `SetTo(None)` and anything else to `SetTo(Some(_))`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Presence<T> {
    Absent,
    SetTo(Option<T>),
}

impl<T> Default for Presence<T> {
    fn default() -> Self {
        Presence::Absent
    }
}

impl<T> Presence<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Presence::Absent)
    }

    pub fn value(value: T) -> Self {
        Presence::SetTo(Some(value))
    }

    pub fn cleared() -> Self {
        Presence::SetTo(None)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Presence<U> {
        match self {
            Presence::Absent => Presence::Absent,
            Presence::SetTo(value) => Presence::SetTo(value.map(f)),
        }
    }
}

impl<T: Serialize> Serialize for Presence<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Presence::Absent | Presence::SetTo(None) => serializer.serialize_none(),
            Presence::SetTo(Some(value)) => value.serialize(serializer),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Presence<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Presence::SetTo)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersonPatch {
    #[serde(default, skip_serializing_if = "Presence::is_absent")]
    pub given_name: Presence<String>,
    #[serde(default, skip_serializing_if = "Presence::is_absent")]
    pub family_name: Presence<String>,
    #[serde(default, skip_serializing_if = "Presence::is_absent")]
    pub height_cm: Presence<i64>,
    #[serde(default, skip_serializing_if = "Presence::is_absent")]
    pub dependants: Presence<i64>,
    #[serde(default, skip_serializing_if = "Presence::is_absent")]
    pub nationality: Presence<CodeRef>,
    #[serde(default, skip_serializing_if = "Presence::is_absent")]
    pub marital_status: Presence<CodeRef>,
    #[serde(default, skip_serializing_if = "Presence::is_absent")]
    pub languages: Presence<Vec<CodeRef>>,
}

impl PersonPatch {
    /// Builds a patch from generic field values, type-checking each one.
    pub fn from_values(
        values: impl IntoIterator<Item = (Field, Option<FieldValue>)>,
    ) -> PersonaResult<Self> {
        let mut patch = PersonPatch::default();
        for (field, value) in values {
            patch.set(field, value)?;
        }
        Ok(patch)
    }

    pub fn set(&mut self, field: Field, value: Option<FieldValue>) -> PersonaResult<()> {
        let mut scratch = PersonState::default();
        field.set(&mut scratch, value)?;
        match field {
            Field::GivenName => self.given_name = Presence::SetTo(scratch.given_name),
            Field::FamilyName => self.family_name = Presence::SetTo(scratch.family_name),
            Field::HeightCm => self.height_cm = Presence::SetTo(scratch.height_cm),
            Field::Dependants => self.dependants = Presence::SetTo(scratch.dependants),
            Field::Nationality => self.nationality = Presence::SetTo(scratch.nationality),
            Field::MaritalStatus => {
                self.marital_status = Presence::SetTo(scratch.marital_status)
            }
            Field::Languages => self.languages = Presence::SetTo(scratch.languages),
        }
        Ok(())
    }

    pub fn get(&self, field: Field) -> Presence<FieldValue> {
        match field {
            Field::GivenName => self.given_name.clone().map(FieldValue::String),
            Field::FamilyName => self.family_name.clone().map(FieldValue::String),
            Field::HeightCm => self.height_cm.clone().map(FieldValue::Integer),
            Field::Dependants => self.dependants.clone().map(FieldValue::Integer),
            Field::Nationality => self.nationality.clone().map(FieldValue::Code),
            Field::MaritalStatus => self.marital_status.clone().map(FieldValue::Code),
            Field::Languages => self.languages.clone().map(FieldValue::CodeList),
        }
    }

    /// Fields the request explicitly mentioned, in catalog order.
    pub fn mentioned_fields(&self) -> Vec<Field> {
        Field::ALL
            .into_iter()
            .filter(|field| !self.get(*field).is_absent())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.mentioned_fields().is_empty()
    }

    /// Checks every mentioned value without touching any state.
    pub fn validate(&self) -> PersonaResult<()> {
        for field in self.mentioned_fields() {
            if let Presence::SetTo(value) = self.get(field) {
                field.check(value)?;
            }
        }
        Ok(())
    }

    /// Writes the mentioned fields into `state`. Validation runs first, so a
    /// rejected patch leaves `state` untouched.
    pub fn apply_to(&self, state: &mut PersonState) -> PersonaResult<Vec<Field>> {
        self.validate()?;
        let mentioned = self.mentioned_fields();
        for field in &mentioned {
            if let Presence::SetTo(value) = self.get(*field) {
                field.set(state, value)?;
            }
        }
        Ok(mentioned)
    }
}
