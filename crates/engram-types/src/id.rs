//! Identifier newtypes.
//!
//! Two families: opaque ids supplied by callers (`VectorId`, `NodeId`) and
//! minted ids of the form `{prefix}_{epoch_ms}_{rand}` that are re-validated
//! by a type guard whenever they cross a trust boundary (`SourceId`,
//! `ProvenanceId`, `TrajectoryId`, `PatternId`, `EdgeId`).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("id must not be empty")]
    Empty,
    #[error("id `{value}` does not match `{prefix}_{{epoch_ms}}_{{rand}}`")]
    BadShape { prefix: &'static str, value: String },
}

/// Mint a `{prefix}_{epoch_ms}_{rand}` identifier.
#[must_use]
pub fn mint_tagged(prefix: &str, now_ms: u64) -> String {
    let salt: u32 = rand::random();
    format!("{prefix}_{now_ms}_{salt:08x}")
}

fn check_tagged(prefix: &'static str, value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty);
    }
    let rest = value.strip_prefix(prefix).and_then(|r| r.strip_prefix('_'));
    let valid = rest.is_some_and(|rest| {
        let mut parts = rest.splitn(2, '_');
        let ms_ok = parts
            .next()
            .is_some_and(|ms| !ms.is_empty() && ms.bytes().all(|b| b.is_ascii_digit()));
        let salt_ok = parts
            .next()
            .is_some_and(|salt| !salt.is_empty() && salt.bytes().all(|b| b.is_ascii_hexdigit()));
        ms_ok && salt_ok
    });
    if valid {
        Ok(())
    } else {
        Err(IdError::BadShape {
            prefix,
            value: value.to_string(),
        })
    }
}

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

macro_rules! tagged_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Mint a fresh id at `now_ms`.
            #[must_use]
            pub fn mint(now_ms: u64) -> Self {
                Self(mint_tagged($prefix, now_ms))
            }

            /// Type guard for ids re-entering from the wire or from disk.
            pub fn parse(value: &str) -> Result<Self, IdError> {
                check_tagged($prefix, value)?;
                Ok(Self(value.to_string()))
            }

            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// Caller-chosen vector identifier; content is opaque to the store.
    VectorId
);
opaque_id!(
    /// Caller-chosen graph node identifier.
    NodeId
);

tagged_id!(
    /// Hyperedge identifier, minted by the graph store.
    EdgeId,
    "edge"
);
tagged_id!(SourceId, "src");
tagged_id!(ProvenanceId, "prov");
tagged_id!(TrajectoryId, "traj");
tagged_id!(PatternId, "pat");
