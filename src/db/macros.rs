//! Database dispatch macros for reducing code duplication.
//!
//! Engine-specific values (pools, pooled connections) are held in enums with
//! one variant per backend. The macro here writes the per-variant match arms
//! so each call site stays a single readable block.

/// Macro for generating backend dispatch match arms.
///
/// The first argument names the enum (it must be in scope), the second is the
/// value to match on.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(DbPool, pool, {
///     MySql(p) => do_mysql(p),
///     Postgres(p) => do_postgres(p),
///     SQLite(p) => do_sqlite(p),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($enum:ident, $value:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $value {
            $(
                $enum::$variant($p) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
