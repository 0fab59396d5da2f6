//! Field tables for typed records.
//!
//! A record type declares which of its fields are mappable, how each one is
//! named in a result set and how a raw value is assigned to it. The table is
//! written once per type with [`impl_record!`](crate::impl_record) and never
//! changes at runtime.

use crate::mapping::coerce::CoercionFailure;
use crate::models::DbValue;

/// Assign a raw value to one field of `T`.
pub type AssignFn<T> = fn(&mut T, &DbValue) -> Result<(), CoercionFailure>;

/// One mappable field of a record type.
pub struct FieldDef<T> {
    /// Column name, matched case-insensitively
    pub name: &'static str,
    /// Whether a storage null may be assigned
    pub nullable: bool,
    /// Declared field type, for diagnostics
    pub target: &'static str,
    pub assign: AssignFn<T>,
}

impl<T> std::fmt::Debug for FieldDef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("nullable", &self.nullable)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// A type rows can be materialized into.
///
/// Fields not listed in [`Record::fields`] keep their `Default` value.
pub trait Record: Default + Send + Sync + 'static {
    fn fields() -> &'static [FieldDef<Self>];
}

#[doc(hidden)]
#[macro_export]
macro_rules! __record_column {
    ($field:ident) => {
        stringify!($field)
    };
    ($field:ident, $column:literal) => {
        $column
    };
}

/// Implement [`Record`](crate::mapping::Record) from a field list.
///
/// Each entry is `field: Type` or `field as "column": Type`. Types must
/// implement [`Coerce`](crate::mapping::Coerce); `Option<_>` fields accept null.
///
/// # Example
///
/// ```ignore
/// #[derive(Default)]
/// struct User {
///     id: i64,
///     name: String,
///     email: Option<String>,
/// }
///
/// impl_record!(User {
///     id: i64,
///     name as "user_name": String,
///     email: Option<String>,
/// });
/// ```
#[macro_export]
macro_rules! impl_record {
    ($ty:ty { $($field:ident $(as $column:literal)? : $fty:ty),* $(,)? }) => {
        impl $crate::mapping::Record for $ty {
            fn fields() -> &'static [$crate::mapping::FieldDef<Self>] {
                static FIELDS: &[$crate::mapping::FieldDef<$ty>] = &[
                    $(
                        $crate::mapping::FieldDef {
                            name: $crate::__record_column!($field $(, $column)?),
                            nullable: <$fty as $crate::mapping::Coerce>::NULLABLE,
                            target: stringify!($fty),
                            assign: |record: &mut $ty, raw: &$crate::models::DbValue| {
                                if let Some(value) = <$fty as $crate::mapping::Coerce>::coerce(raw)? {
                                    record.$field = value;
                                }
                                Ok(())
                            },
                        },
                    )*
                ];
                FIELDS
            }
        }
    };
}

/// Declare a field enum with explicit discriminants and its coercion.
///
/// The generated enum derives `Debug`, `Clone`, `Copy`, `PartialEq` and `Eq`.
/// Values are matched by variant name (case-insensitive) or discriminant.
///
/// # Example
///
/// ```ignore
/// db_enum! {
///     #[derive(Default)]
///     pub enum OrderStatus {
///         #[default]
///         Pending = 0,
///         Shipped = 1,
///     }
/// }
/// ```
#[macro_export]
macro_rules! db_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $disc:literal ),+ $(,)?
        }
    ) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $(#[$meta])*
        $vis enum $name {
            $( $(#[$vmeta])* $variant = $disc ),+
        }

        impl $name {
            /// Variant names and discriminants.
            pub const VARIANTS: &'static [(&'static str, i64, $name)] = &[
                $( (stringify!($variant), $disc, $name::$variant) ),+
            ];
        }

        impl $crate::mapping::Coerce for $name {
            fn coerce(
                raw: &$crate::models::DbValue,
            ) -> Result<Option<Self>, $crate::mapping::CoercionFailure> {
                $crate::mapping::coerce_enum(raw, Self::VARIANTS, stringify!($name))
            }
        }
    };
}
