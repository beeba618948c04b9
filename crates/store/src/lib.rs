//! Domain types and persistence seams for the execution core.
//!
//! The real document store lives behind the traits in [`traits`]; the
//! in-memory implementation in [`memory`] backs tests and local
//! development. Persisted documents use camelCase field names and
//! millisecond timestamps, matching what the route collaborators read.

macro_rules! id_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(
            Clone,
            Debug,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}
pub(crate) use id_type;

pub mod accounts;
pub mod memory;
pub mod results;
pub mod slots;
pub mod tasks;
pub mod traits;
