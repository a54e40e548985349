use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::{PersonaError, PersonaResult};

/// 16-byte identifier rendered as a UUID; ULID strings are accepted on input
/// because some upstream identity systems hand those out.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Id(pub [u8; 16]);

impl Id {
    pub fn new() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn parse(value: &str) -> PersonaResult<Self> {
        if let Ok(uuid) = Uuid::parse_str(value) {
            return Ok(Self(*uuid.as_bytes()));
        }
        if let Ok(ulid) = ulid::Ulid::from_string(value) {
            return Ok(Self(ulid.to_bytes()));
        }
        Err(PersonaError::validation(format!(
            "invalid id '{value}': expected uuid or ulid"
        )))
    }

    pub fn from_uuid_str(value: &str) -> PersonaResult<Self> {
        let uuid = Uuid::parse_str(value)
            .map_err(|err| PersonaError::validation(format!("invalid uuid '{value}': {err}")))?;
        Ok(Self(*uuid.as_bytes()))
    }

    pub fn to_uuid_string(self) -> String {
        Uuid::from_bytes(self.0).to_string()
    }

    pub fn to_ulid_string(self) -> String {
        ulid::Ulid::from_bytes(self.0).to_string()
    }

    pub fn as_bytes(self) -> [u8; 16] {
        self.0
    }

    pub fn as_vec(self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uuid = Uuid::from_bytes(self.0);
        write!(f, "{uuid}")
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_uuid_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Id::parse(&value).map_err(serde::de::Error::custom)
    }
}

/// The person whose fields are versioned.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubjectId(pub Id);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ActorId(pub Id);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntryId(pub Id);

macro_rules! id_wrapper {
    ($name:ident) => {
        impl $name {
            pub fn new() -> Self {
                Self(Id::new())
            }

            pub fn parse(value: &str) -> PersonaResult<Self> {
                Id::parse(value).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                self.0.serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                Ok(Self(Id::deserialize(deserializer)?))
            }
        }
    };
}

id_wrapper!(SubjectId);
id_wrapper!(ActorId);
id_wrapper!(EntryId);

#[cfg(test)]
mod tests {
    use super::{Id, SubjectId};

    #[test]
    fn parse_accepts_uuid_and_ulid() {
        let id = Id::new();
        let from_uuid = Id::parse(&id.to_uuid_string()).expect("uuid parse");
        let from_ulid = Id::parse(&id.to_ulid_string()).expect("ulid parse");
        assert_eq!(from_uuid, id);
        assert_eq!(from_ulid, id);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Id::parse("not-an-id").is_err());
        assert!(Id::from_uuid_str("01ARZ3NDEKTSV4RRFFQ69G5FAV").is_err());
    }

    #[test]
    fn subject_ids_serialize_as_uuid_strings() {
        let subject = SubjectId::new();
        let encoded = serde_json::to_string(&subject).expect("encode");
        assert_eq!(encoded, format!("\"{}\"", subject.0.to_uuid_string()));
        let decoded: SubjectId = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, subject);
    }

    #[test]
    fn ordering_matches_uuid_string_order() {
        let a = Id::from_uuid_str("00000000-0000-0000-0000-00000000000a").expect("a");
        let b = Id::from_uuid_str("00000000-0000-0000-0000-0000000000b0").expect("b");
        assert!(a < b);
        assert!(a.to_uuid_string() < b.to_uuid_string());
    }
}
