pub mod event;
pub mod id;
mod model;
mod operation;
mod time;

pub use self::id::{EntityKind, FileId, FolderId, NoteId, OperationId, TEMPORARY_ID_PREFIX};
pub use self::model::{AttachmentRef, Folder, Note};
pub use self::operation::{NoteOperation, OperationKind, OperationStatus};
pub use self::time::Timestamp;

/// Define a string-backed identifier newtype.
///
/// All identifiers in the system are opaque strings on the wire; the
/// newtypes exist so that a note id cannot be passed where a folder id
/// is expected.
#[macro_export]
macro_rules! define_string_id {
    (
        $(#[$outer:meta])*
        struct $t:tt
    ) => {
        $(#[$outer])*
        #[derive(
            ::bincode::Encode,
            ::bincode::Decode,
            ::serde::Serialize,
            ::serde::Deserialize,
            Clone,
            Debug,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
        )]
        #[serde(transparent)]
        pub struct $t(String);

        impl $t {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl std::str::FromStr for $t {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}
