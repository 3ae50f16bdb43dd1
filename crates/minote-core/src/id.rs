//! Identifier newtypes.
//!
//! Entities created offline are born with a *temporary* id: the literal
//! prefix [`TEMPORARY_ID_PREFIX`] followed by a UUID. The server later
//! issues a canonical id and every reference is rewritten. Because every
//! reference in the system is a string, the prefix makes "is this id
//! temporary?" a local, lock-free check.

use crate::define_string_id;

/// Literal prefix of client-assigned identifiers.
pub const TEMPORARY_ID_PREFIX: &str = "local_";

/// Check whether a raw identifier string is a client-assigned temporary id.
pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMPORARY_ID_PREFIX)
}

/// Generate a fresh temporary identifier string.
pub fn generate_temporary_id() -> String {
    format!("{TEMPORARY_ID_PREFIX}{}", uuid::Uuid::new_v4())
}

macro_rules! impl_temporary_id {
    ($t:tt) => {
        impl $t {
            /// Mint a fresh client-assigned id for an entity created offline.
            pub fn generate_temporary() -> Self {
                Self::new(generate_temporary_id())
            }

            pub fn is_temporary(&self) -> bool {
                is_temporary_id(self.as_str())
            }
        }
    };
}

define_string_id!(
    /// Identifier of a note; either temporary or server-issued.
    struct NoteId
);
impl_temporary_id!(NoteId);

define_string_id!(
    /// Identifier of a folder; either temporary, server-issued, or one of
    /// the fixed system folder ids.
    struct FolderId
);
impl_temporary_id!(FolderId);

impl FolderId {
    /// The "all notes" system folder.
    pub const ALL: &str = "0";
    /// The password-protected system folder.
    pub const PRIVATE: &str = "2";
    /// The starred-notes system folder.
    pub const STARRED: &str = "starred";

    pub fn all() -> Self {
        Self::new(Self::ALL)
    }

    pub fn private() -> Self {
        Self::new(Self::PRIVATE)
    }

    pub fn starred() -> Self {
        Self::new(Self::STARRED)
    }

    /// System folders are never deleted or uploaded.
    pub fn is_system(&self) -> bool {
        matches!(self.as_str(), Self::ALL | Self::PRIVATE | Self::STARRED)
    }
}

define_string_id!(
    /// Identifier of an attachment blob.
    struct FileId
);
impl_temporary_id!(FileId);

define_string_id!(
    /// Identifier of a queued operation row.
    struct OperationId
);

impl OperationId {
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

/// The kind of entity an id mapping refers to.
#[derive(
    ::bincode::Encode,
    ::bincode::Decode,
    ::serde::Serialize,
    ::serde::Deserialize,
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
)]
pub enum EntityKind {
    Note,
    Folder,
    File,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_id_roundtrip() {
        let id = NoteId::generate_temporary();
        assert!(id.is_temporary());
        assert!(id.as_str().starts_with(TEMPORARY_ID_PREFIX));

        let server = NoteId::new("s1");
        assert!(!server.is_temporary());
    }

    #[test]
    fn temporary_ids_are_unique() {
        let a = NoteId::generate_temporary();
        let b = NoteId::generate_temporary();
        assert_ne!(a, b);
    }

    #[test]
    fn system_folders() {
        assert!(FolderId::all().is_system());
        assert!(FolderId::starred().is_system());
        assert!(FolderId::private().is_system());
        assert!(!FolderId::new("123").is_system());
        assert!(!FolderId::generate_temporary().is_system());
    }
}
