use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use ::time::OffsetDateTime;
use ::time::format_description::well_known::Rfc3339;

use crate::{PersonaError, PersonaResult};

/// Microseconds since the Unix epoch. Used for both validity bounds and
/// record times.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

static LAST_NOW: Lazy<Mutex<i64>> = Lazy::new(|| Mutex::new(0));

impl Timestamp {
    /// Wall clock, strictly increasing within the process so that two
    /// operations never share a record time.
    pub fn now() -> Self {
        let physical = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as i64;
        let mut guard = LAST_NOW
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = if physical > *guard {
            physical
        } else {
            *guard + 1
        };
        *guard = next;
        Timestamp(next)
    }

    pub fn from_micros(micros: i64) -> Self {
        Timestamp(micros)
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }

    pub fn parse_rfc3339(value: &str) -> PersonaResult<Self> {
        let parsed = OffsetDateTime::parse(value, &Rfc3339).map_err(|err| {
            PersonaError::validation(format!("invalid timestamp '{value}': {err}"))
        })?;
        let micros = parsed.unix_timestamp_nanos() / 1_000;
        i64::try_from(micros)
            .map(Timestamp)
            .map_err(|_| PersonaError::validation(format!("timestamp out of range: {value}")))
    }

    pub fn to_rfc3339(self) -> PersonaResult<String> {
        let nanos = i128::from(self.0) * 1_000;
        let datetime = OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .map_err(|err| PersonaError::validation(format!("timestamp out of range: {err}")))?;
        datetime
            .format(&Rfc3339)
            .map_err(|err| PersonaError::validation(format!("format timestamp: {err}")))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_rfc3339() {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "{}us", self.0),
        }
    }
}
