pub mod aggregate;
pub mod api;
pub mod entry;
pub mod error;
pub mod field;
pub mod ids;
pub mod merge;
pub mod migration;
pub mod notify;
pub mod patch;
pub mod sync;
pub mod time;
pub mod value;

pub use aggregate::*;
pub use api::*;
pub use entry::{CloseOutcome, FieldMetadata, HistoryEntry, Source, entry_order};
pub use error::{PersonaError, PersonaResult};
pub use field::*;
pub use ids::*;
pub use merge::*;
pub use migration::*;
pub use notify::*;
pub use patch::*;
pub use sync::*;
pub use self::time::*;
pub use value::*;
