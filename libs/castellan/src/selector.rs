use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use ethers::abi::Abi;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Four-byte function selector, the dispatch key of a diamond.
///
/// Ordered so that selector sets iterate lexically over the hex form,
/// which keeps reconciliation and cut plans reproducible.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Selector([u8; 4]);

impl Selector {
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl From<[u8; 4]> for Selector {
    fn from(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        if digits.len() != 8 {
            return Err(Error::Configuration(format!(
                "invalid selector {s:?}: expected 4 bytes of hex"
            )));
        }
        let mut bytes = [0u8; 4];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|e| Error::Configuration(format!("invalid selector {s:?}: {e}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The complete selector set a compiled contract implements.
pub fn abi_selectors(abi: &Abi) -> BTreeSet<Selector> {
    abi.functions()
        .map(|f| Selector(f.short_signature()))
        .collect()
}
