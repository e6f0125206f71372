//! Chunk and keyframe identifiers.
//!
//! The remote server uses 0 (and sometimes -1) to mean "no chunk yet". Those values never
//! become an identifier: wire fields that may carry them are `Option<ChunkId>` /
//! `Option<KeyFrameId>` and go through [`optional`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Raw wire value that is not a valid (positive) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid segment identifier {0}: must be positive")]
pub struct InvalidId(pub i64);

macro_rules! segment_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "i64", into = "i64")]
        pub struct $name(u32);

        impl $name {
            pub const FIRST: $name = $name(1);

            /// Returns `None` for 0, negative or out-of-range values.
            pub fn new(raw: i64) -> Option<Self> {
                if raw > 0 && raw <= i64::from(u32::MAX) {
                    Some($name(raw as u32))
                } else {
                    None
                }
            }

            pub fn get(self) -> u32 {
                self.0
            }

            pub fn next(self) -> Self {
                $name(self.0.saturating_add(1))
            }

            pub fn prev(self) -> Option<Self> {
                Self::new(i64::from(self.0) - 1)
            }
        }

        impl TryFrom<i64> for $name {
            type Error = InvalidId;

            fn try_from(raw: i64) -> Result<Self, InvalidId> {
                Self::new(raw).ok_or(InvalidId(raw))
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> i64 {
                i64::from(id.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

segment_id!(
    /// Identifies a chunk (incremental game-state segment) in a game stream.
    ChunkId
);
segment_id!(
    /// Identifies a keyframe (full-state snapshot) in a game stream.
    KeyFrameId
);

/// Serde adapter mapping wire values `<= 0` to `None` and `None` back to `0`.
pub mod optional {
    use std::fmt::Display;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Copy + Into<i64>,
        S: Serializer,
    {
        serializer.serialize_i64(value.map_or(0, Into::into))
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: TryFrom<i64>,
        T::Error: Display,
        D: Deserializer<'de>,
    {
        let raw = i64::deserialize(deserializer)?;
        if raw <= 0 {
            return Ok(None);
        }
        T::try_from(raw).map(Some).map_err(de::Error::custom)
    }
}
