//! Sortable, prefixed identifiers.
//!
//! Ids sort lexicographically in creation order within a process: the
//! timestamp segment is a millisecond clock shifted left with a monotonic
//! counter in the low bits, rendered as fixed-width hex.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

fn monotonic_stamp() -> u64 {
    let now = (chrono::Utc::now().timestamp_millis().max(0) as u64) << 16;
    let mut prev = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_STAMP.compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// Generate a new ascending id with the given prefix.
pub fn ascending(prefix: &str) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{:016x}{}", monotonic_stamp(), &random[..10])
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Allocate a fresh ascending id.
            pub fn new() -> Self {
                Self(ascending($prefix))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
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

define_id!(
    /// Identifier of a session.
    SessionId,
    "session"
);
define_id!(
    /// Identifier of a message within a session.
    MessageId,
    "message"
);
define_id!(
    /// Identifier of a part within a message.
    PartId,
    "part"
);
define_id!(
    /// Identifier of a pending permission request.
    PermissionRequestId,
    "permission"
);

/// Identity of a project: a version-control root commit or `global`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub const GLOBAL: &'static str = "global";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn global() -> Self {
        Self(Self::GLOBAL.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
