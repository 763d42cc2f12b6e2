/// Pooling and normalization selectors forwarded to the engine.
///
/// The engine owns the math; the bridge only validates the raw codes coming
/// from host bindings and passes them through unchanged.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// How per-token vectors are reduced to one vector per input text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingType {
    None,
    #[default]
    Mean,
    Cls,
    Last,
}

impl PoolingType {
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Mean => 1,
            Self::Cls => 2,
            Self::Last => 3,
        }
    }
}

impl TryFrom<u32> for PoolingType {
    type Error = BridgeError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::Mean),
            2 => Ok(Self::Cls),
            3 => Ok(Self::Last),
            other => Err(BridgeError::invalid(format!(
                "unknown pooling type {other} (expected 0..=3)"
            ))),
        }
    }
}

/// Post-pooling scaling rule applied per row by the engine.
///
/// Serialized as its raw integer code so config files match what the C
/// surface accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Normalization {
    None,
    MaxAbsInt16,
    Taxicab,
    #[default]
    Euclidean,
    /// General p-norm, `p > 2`.
    PNorm(i32),
}

impl Normalization {
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::None => -1,
            Self::MaxAbsInt16 => 0,
            Self::Taxicab => 1,
            Self::Euclidean => 2,
            Self::PNorm(p) => p,
        }
    }
}

impl TryFrom<i32> for Normalization {
    type Error = BridgeError;

    fn try_from(code: i32) -> Result<Self> {
        match code {
            -1 => Ok(Self::None),
            0 => Ok(Self::MaxAbsInt16),
            1 => Ok(Self::Taxicab),
            2 => Ok(Self::Euclidean),
            p if p > 2 => Ok(Self::PNorm(p)),
            other => Err(BridgeError::invalid(format!(
                "unknown normalization {other} (expected -1, 0, 1, 2 or a p-norm above 2)"
            ))),
        }
    }
}

impl From<Normalization> for i32 {
    fn from(norm: Normalization) -> Self {
        norm.code()
    }
}

impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::MaxAbsInt16 => write!(f, "max-abs-int16"),
            Self::Taxicab => write!(f, "taxicab"),
            Self::Euclidean => write!(f, "euclidean"),
            Self::PNorm(p) => write!(f, "p-norm({p})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pooling_codes() {
        for code in 0..=3u32 {
            let pooling = PoolingType::try_from(code).unwrap();
            assert_eq!(pooling.code(), code);
        }
        assert!(PoolingType::try_from(4).is_err());
    }

    #[test]
    fn test_normalization_codes() {
        assert_eq!(Normalization::try_from(-1).unwrap(), Normalization::None);
        assert_eq!(Normalization::try_from(2).unwrap(), Normalization::Euclidean);
        assert_eq!(Normalization::try_from(5).unwrap(), Normalization::PNorm(5));
        assert_eq!(Normalization::PNorm(5).code(), 5);
        assert!(Normalization::try_from(-2).is_err());
    }

    #[test]
    fn test_serde_uses_codes() {
        let json = serde_json::to_string(&Normalization::Taxicab).unwrap();
        assert_eq!(json, "1");
        let parsed: Normalization = serde_json::from_str("7").unwrap();
        assert_eq!(parsed, Normalization::PNorm(7));
        assert!(serde_json::from_str::<Normalization>("-5").is_err());

        let pooling: PoolingType = serde_json::from_str("\"cls\"").unwrap();
        assert_eq!(pooling, PoolingType::Cls);
    }
}
