//! Row-to-value mapping.
//!
//! - `coerce`: per-field conversion of raw values
//! - `record`: field tables for typed records
//! - `materializer`: row projection, accessor cache and shape collapse

pub mod coerce;
pub mod materializer;
#[macro_use]
pub mod record;

pub use coerce::{Coerce, CoercionFailure, Json, coerce_enum, parse_time_span};
pub use materializer::{RowShape, Shape, collapse_rows, collapse_typed, first_scalar, to_rows};
pub use record::{FieldDef, Record};
