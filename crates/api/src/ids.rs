use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use uuid::Uuid;

use super::error::{ApiError, ApiResult, InvalidIdSnafu};

/// Server-assigned conversation session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Wraps a server-issued UUID.
    pub fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn parse(raw: &str) -> ApiResult<Self> {
        let parsed = Uuid::parse_str(raw.trim()).context(InvalidIdSnafu {
            stage: "parse-session-id",
            raw: raw.to_string(),
        })?;
        Ok(Self(parsed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<Uuid> for SessionId {
    fn from(value: Uuid) -> Self {
        Self::new(value)
    }
}

impl FromStr for SessionId {
    type Err = ApiError;

    fn from_str(raw: &str) -> ApiResult<Self> {
        Self::parse(raw)
    }
}

// Database-backed integer keys share one shape.
macro_rules! define_numeric_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Wraps a raw database key.
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self::new(value)
            }
        }
    };
}

define_numeric_id!(KnowledgeId);
define_numeric_id!(MessageId);
define_numeric_id!(UserId);
