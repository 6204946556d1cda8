//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings.

use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance without validation.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Caller-supplied name of a logical environment, e.g. `dev-1`.
    WorkspaceId
);

string_newtype!(
    /// Handle for one asynchronous provisioning attempt: `prov-<workspace>-<8 hex>`.
    ProvisionId
);

impl WorkspaceId {
    /// Validate and wrap a caller-supplied workspace identifier.
    ///
    /// Workspace IDs become directory names and state keys, so they are
    /// restricted to `[a-zA-Z0-9_-]`, 1-64 characters.
    pub fn parse(s: &str) -> Result<Self, SchemaError> {
        validate_workspace_id(s)?;
        Ok(Self::new(s))
    }
}

impl ProvisionId {
    /// Generate a fresh provisioning ID for the given workspace.
    pub fn generate(workspace: &WorkspaceId) -> Self {
        let random = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("prov-{workspace}-{}", &random[..8]))
    }
}

pub fn validate_workspace_id(id: &str) -> Result<(), SchemaError> {
    if id.is_empty() || id.len() > 64 {
        return Err(SchemaError::InvalidWorkspaceId(
            "workspace id must be 1-64 characters".to_owned(),
        ));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(SchemaError::InvalidWorkspaceId(format!(
            "workspace id '{id}' must match [a-zA-Z0-9_-]"
        )));
    }
    Ok(())
}

/// Validate a template reference: a single path component under the templates directory.
pub fn validate_template_name(name: &str) -> Result<(), SchemaError> {
    if name.is_empty() {
        return Err(SchemaError::InvalidTemplate("template name must not be empty".to_owned()));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(SchemaError::InvalidTemplate(format!(
            "template '{name}' must be a plain name, not a path"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_serializes_as_plain_string() {
        let id = WorkspaceId::new("dev-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"dev-1\"");
        let back: WorkspaceId = serde_json::from_str("\"dev-1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn generated_ids_embed_workspace_and_suffix() {
        let ws = WorkspaceId::new("dev-1");
        let id = ProvisionId::generate(&ws);
        assert!(id.starts_with("prov-dev-1-"));
        let suffix = id.strip_prefix("prov-dev-1-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_ids_differ() {
        let ws = WorkspaceId::new("dev-1");
        assert_ne!(ProvisionId::generate(&ws), ProvisionId::generate(&ws));
    }

    #[test]
    fn workspace_id_validation() {
        assert!(WorkspaceId::parse("dev-1").is_ok());
        assert!(WorkspaceId::parse("team_a-staging").is_ok());
        assert!(WorkspaceId::parse(&"x".repeat(64)).is_ok());
        assert!(WorkspaceId::parse("").is_err());
        assert!(WorkspaceId::parse(&"x".repeat(65)).is_err());
        assert!(WorkspaceId::parse("../etc").is_err());
        assert!(WorkspaceId::parse("has space").is_err());
    }

    #[test]
    fn template_name_validation() {
        assert!(validate_template_name("web-service").is_ok());
        assert!(validate_template_name("").is_err());
        assert!(validate_template_name("..").is_err());
        assert!(validate_template_name("a/b").is_err());
    }
}
