//! Declarative conversion of raw native rows into typed rows.
//!
//! Row types are declared with [`counter_row!`](crate::counter_row), which
//! pairs every struct field with the name of the column or counter it is read
//! from. The same declaration produces the field list used to build queries,
//! open counter handles and validate schemas, so the list and the conversion
//! cannot drift apart.
//!
//! ```
//! use winperf_core::counter_row;
//! use winperf_core::mapper::{FromRow, map_rows};
//! use winperf_core::session::RawRow;
//!
//! counter_row! {
//!     pub struct JitRow {
//!         #[source = "Name"]
//!         pub name: String,
//!         #[source = "NumberofMethodsJitted"]
//!         pub methods_jitted: u32,
//!         #[source = "StandardJitFailures", optional]
//!         pub failures: u32,
//!     }
//! }
//!
//! let rows = vec![RawRow::new().with("Name", "w3wp").with("NumberofMethodsJitted", 12u32)];
//! let typed: Vec<JitRow> = map_rows(&rows).unwrap();
//! assert_eq!(typed[0].methods_jitted, 12);
//! assert_eq!(typed[0].failures, 0);
//! assert_eq!(JitRow::FIELDS.len(), 3);
//! ```

use crate::session::{INSTANCE_FIELD, RawRow, Value};

/// One declared field of a typed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Column or counter name in the native row.
    pub source: &'static str,
    /// Whether a missing value is a mapping error (otherwise zero value).
    pub required: bool,
}

/// Error type for row mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum MapError {
    /// A required field is absent or null.
    MissingField(&'static str),
    /// The value cannot be represented in the declared type without loss.
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
        found: String,
    },
    /// Schema check: required fields the native source does not provide.
    MissingFields {
        row: &'static str,
        fields: Vec<&'static str>,
    },
}

impl std::fmt::Display for MapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapError::MissingField(field) => write!(f, "required field {:?} missing", field),
            MapError::TypeMismatch {
                field,
                expected,
                found,
            } => write!(
                f,
                "field {:?}: cannot convert {} to {}",
                field, found, expected
            ),
            MapError::MissingFields { row, fields } => {
                write!(f, "{}: unresolved fields {}", row, fields.join(", "))
            }
        }
    }
}

impl std::error::Error for MapError {}

/// A struct that can be built from a [`RawRow`].
pub trait FromRow: Sized {
    /// Type name used in error messages.
    const NAME: &'static str;
    /// Declared fields, in declaration order.
    const FIELDS: &'static [Field];

    fn from_row(row: &RawRow) -> Result<Self, MapError>;
}

/// Conversion from a native value into a field type.
///
/// Conversions only widen. A value that does not fit the declared type is
/// rejected rather than truncated.
pub trait FromValue: Sized {
    const KIND: &'static str;

    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for u32 {
    const KIND: &'static str = "u32";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::U32(v) => Some(*v),
            Value::U64(v) => u32::try_from(*v).ok(),
            Value::I32(v) => u32::try_from(*v).ok(),
            Value::I64(v) => u32::try_from(*v).ok(),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromValue for u64 {
    const KIND: &'static str = "u64";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::U32(v) => Some(u64::from(*v)),
            Value::U64(v) => Some(*v),
            Value::I32(v) => u64::try_from(*v).ok(),
            Value::I64(v) => u64::try_from(*v).ok(),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromValue for i64 {
    const KIND: &'static str = "i64";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::U32(v) => Some(i64::from(*v)),
            Value::U64(v) => i64::try_from(*v).ok(),
            Value::I32(v) => Some(i64::from(*v)),
            Value::I64(v) => Some(*v),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromValue for f64 {
    const KIND: &'static str = "f64";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::U32(v) => Some(f64::from(*v)),
            Value::I32(v) => Some(f64::from(*v)),
            Value::U64(v) => Some(*v as f64),
            Value::I64(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromValue for bool {
    const KIND: &'static str = "bool";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for String {
    const KIND: &'static str = "string";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

/// Reads one declared field from `row`.
///
/// Absent and null values are an error for required fields and the zero
/// value of `T` for optional ones.
pub fn field<T: FromValue + Default>(
    row: &RawRow,
    source: &'static str,
    required: bool,
) -> Result<T, MapError> {
    match row.get(source) {
        Some(value) if !value.is_null() => {
            T::from_value(value).ok_or_else(|| MapError::TypeMismatch {
                field: source,
                expected: T::KIND,
                found: describe(value),
            })
        }
        _ if required => Err(MapError::MissingField(source)),
        _ => Ok(T::default()),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(v) => format!("bool {}", v),
        Value::U32(v) => format!("u32 {}", v),
        Value::U64(v) => format!("u64 {}", v),
        Value::I32(v) => format!("i32 {}", v),
        Value::I64(v) => format!("i64 {}", v),
        Value::F64(v) => format!("f64 {}", v),
        Value::Str(v) => format!("string {:?}", v),
    }
}

/// Maps a whole result set. Fails as a whole if any row fails.
pub fn map_rows<T: FromRow>(rows: &[RawRow]) -> Result<Vec<T>, MapError> {
    rows.iter().map(T::from_row).collect()
}

/// Checks the declared counters of `T` against the counters a handle resolved.
///
/// The instance name field is always available on counter rows. Every
/// missing required counter is listed in the error.
pub fn validate_counters<T: FromRow>(resolved: &[String]) -> Result<(), MapError> {
    let missing: Vec<&'static str> = T::FIELDS
        .iter()
        .filter(|f| f.required && !f.source.eq_ignore_ascii_case(INSTANCE_FIELD))
        .filter(|f| !resolved.iter().any(|r| r.eq_ignore_ascii_case(f.source)))
        .map(|f| f.source)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(MapError::MissingFields {
            row: T::NAME,
            fields: missing,
        })
    }
}

/// Declares a typed row and derives its [`FromRow`] implementation.
///
/// Each field carries `#[source = "Column"]`, or
/// `#[source = "Column", optional]` when a missing value should read as the
/// zero value instead of failing.
#[macro_export]
macro_rules! counter_row {
    (@required) => {
        true
    };
    (@required optional) => {
        false
    };
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[doc = $doc:literal])*
                #[source = $src:literal $(, $opt:ident)?]
                $fvis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        $vis struct $name {
            $(
                $(#[doc = $doc])*
                $fvis $field: $ty,
            )*
        }

        impl $crate::mapper::FromRow for $name {
            const NAME: &'static str = stringify!($name);
            const FIELDS: &'static [$crate::mapper::Field] = &[
                $(
                    $crate::mapper::Field {
                        source: $src,
                        required: $crate::counter_row!(@required $($opt)?),
                    },
                )*
            ];

            fn from_row(
                row: &$crate::session::RawRow,
            ) -> ::std::result::Result<Self, $crate::mapper::MapError> {
                Ok(Self {
                    $(
                        $field: $crate::mapper::field::<$ty>(
                            row,
                            $src,
                            $crate::counter_row!(@required $($opt)?),
                        )?,
                    )*
                })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::counter_row! {
        struct TestRow {
            #[source = "Name"]
            name: String,
            #[source = "Frequency_PerfTime"]
            frequency: u32,
            #[source = "Total"]
            total: u64,
            /// Optional counter, absent on older runtimes.
            #[source = "Peak", optional]
            peak: f64,
        }
    }

    fn full_row() -> RawRow {
        RawRow::new()
            .with("Name", "w3wp")
            .with("Frequency_PerfTime", 10_000_000u32)
            .with("Total", u32::MAX)
            .with("Peak", 2.5)
    }

    #[test]
    fn maps_declared_fields() {
        let row = TestRow::from_row(&full_row()).unwrap();
        assert_eq!(row.name, "w3wp");
        assert_eq!(row.frequency, 10_000_000);
        assert_eq!(row.total, u64::from(u32::MAX));
        assert_eq!(row.peak, 2.5);
    }

    #[test]
    fn fields_list_matches_declaration() {
        let sources: Vec<&str> = TestRow::FIELDS.iter().map(|f| f.source).collect();
        assert_eq!(sources, vec!["Name", "Frequency_PerfTime", "Total", "Peak"]);
        assert!(!TestRow::FIELDS[3].required);
        assert_eq!(TestRow::NAME, "TestRow");
    }

    #[test]
    fn optional_field_defaults_to_zero() {
        let raw = RawRow::new()
            .with("Name", "w3wp")
            .with("Frequency_PerfTime", 1u32)
            .with("Total", 1u64);
        let row = TestRow::from_row(&raw).unwrap();
        assert_eq!(row.peak, 0.0);
    }

    #[test]
    fn missing_required_field_is_error() {
        let raw = RawRow::new().with("Name", "w3wp").with("Total", 1u64);
        assert_eq!(
            TestRow::from_row(&raw),
            Err(MapError::MissingField("Frequency_PerfTime"))
        );
    }

    #[test]
    fn null_required_field_is_error() {
        let raw = full_row().with("Total", Value::Null);
        assert_eq!(TestRow::from_row(&raw), Err(MapError::MissingField("Total")));
    }

    #[test]
    fn narrowing_that_loses_data_is_refused() {
        let raw = full_row().with("Frequency_PerfTime", u64::from(u32::MAX) + 1);
        assert!(matches!(
            TestRow::from_row(&raw),
            Err(MapError::TypeMismatch {
                field: "Frequency_PerfTime",
                expected: "u32",
                ..
            })
        ));
    }

    #[test]
    fn narrowing_that_fits_is_accepted() {
        let raw = full_row().with("Frequency_PerfTime", 42u64);
        assert_eq!(TestRow::from_row(&raw).unwrap().frequency, 42);
    }

    #[test]
    fn max_u32_widens_to_exact_f64() {
        assert_eq!(f64::from_value(&Value::U32(u32::MAX)), Some(4294967295.0));
        assert_eq!(u64::from_value(&Value::U32(u32::MAX)), Some(4294967295));
    }

    #[test]
    fn negative_values_never_become_unsigned() {
        assert_eq!(u32::from_value(&Value::I32(-1)), None);
        assert_eq!(u64::from_value(&Value::I64(-1)), None);
    }

    #[test]
    fn wmi_uint64_strings_are_parsed() {
        assert_eq!(
            u64::from_value(&Value::Str("18446744073709551615".into())),
            Some(u64::MAX)
        );
    }

    #[test]
    fn map_rows_fails_as_a_whole() {
        let rows = vec![full_row(), RawRow::new().with("Name", "broken")];
        assert!(map_rows::<TestRow>(&rows).is_err());
    }

    #[test]
    fn validate_counters_lists_every_missing_required_field() {
        let resolved = vec!["Frequency_PerfTime".to_string()];
        let err = validate_counters::<TestRow>(&resolved).unwrap_err();
        assert_eq!(
            err,
            MapError::MissingFields {
                row: "TestRow",
                fields: vec!["Total"],
            }
        );

        let resolved = vec!["frequency_perftime".to_string(), "TOTAL".to_string()];
        assert!(validate_counters::<TestRow>(&resolved).is_ok());
    }
}
