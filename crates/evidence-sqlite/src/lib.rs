//! SQLite-backed evidence and alert store.

mod alerts;
mod domains;
mod evidence;
mod jobs;
mod models;
mod modules;
mod open;
mod risk;
mod schema;

pub use threatscope_core::{FAVICON_HASH_KEY, FAVICON_REUSED_SIGNAL};
pub use models::*;
pub use open::Db;

use std::str::FromStr;

/// Read a text column through `FromStr`, surfacing bad values as conversion errors.
pub(crate) fn parse_col<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}
