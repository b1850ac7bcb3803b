//! Object references and the persistable entity model.
//!
//! Every durable entity carries a type tag (`otype`), a UUID (`oid`), a
//! monotonic version, and a free-form metadata map. An [`ORef`] is the
//! universal address `otype:oid` used by the store, event scopes, and RPC
//! payloads.

mod meta;
mod types;
mod update;

pub use meta::{MetaMap, merge_meta};
pub use types::{
    Block, BlockDef, Client, FileDef, LayoutActionData, LayoutState, META_KEY_CMD_CWD,
    META_KEY_CONNECTION, META_KEY_CONTROLLER, META_KEY_FILE, META_KEY_URL, META_KEY_VIEW, Point,
    RuntimeOpts, StarObj, Tab, TermSize, UIContext, WinSize, Window, Workspace,
};
pub use update::{UpdateRecord, UpdateType};

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const OTYPE_CLIENT: &str = "client";
pub const OTYPE_WINDOW: &str = "window";
pub const OTYPE_WORKSPACE: &str = "workspace";
pub const OTYPE_TAB: &str = "tab";
pub const OTYPE_BLOCK: &str = "block";
pub const OTYPE_LAYOUT: &str = "layout";

/// The closed set of registered object types.
pub const ALL_OTYPES: &[&str] = &[
    OTYPE_CLIENT,
    OTYPE_WINDOW,
    OTYPE_WORKSPACE,
    OTYPE_TAB,
    OTYPE_BLOCK,
    OTYPE_LAYOUT,
];

static OTYPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z]+$").unwrap());

/// Object reference, serialized as the string `otype:oid`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ORef {
    pub otype: String,
    pub oid: String,
}

impl ORef {
    pub fn new(otype: impl Into<String>, oid: impl Into<String>) -> Self {
        Self {
            otype: otype.into(),
            oid: oid.into(),
        }
    }

    /// Either component being empty makes the reference invalid.
    pub fn is_empty(&self) -> bool {
        self.otype.is_empty() || self.oid.is_empty()
    }
}

impl fmt::Display for ORef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(f, "{}:{}", self.otype, self.oid)
    }
}

impl FromStr for ORef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.splitn(2, ':');
        let (otype, oid) = match (fields.next(), fields.next()) {
            (Some(t), Some(o)) => (t, o),
            _ => anyhow::bail!("invalid object reference: {s:?}"),
        };
        if !OTYPE_RE.is_match(otype) {
            anyhow::bail!("invalid object type: {otype:?}");
        }
        if !ALL_OTYPES.contains(&otype) {
            anyhow::bail!("unknown object type: {otype:?}");
        }
        uuid::Uuid::parse_str(oid).map_err(|_| anyhow::anyhow!("invalid object id: {oid:?}"))?;
        Ok(ORef::new(otype, oid))
    }
}

impl Serialize for ORef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ORef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(ORef::default());
        }
        s.parse().map_err(D::Error::custom)
    }
}

/// Parse an oref string, returning None instead of an error.
pub fn parse_oref_opt(s: &str) -> Option<ORef> {
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oref_roundtrip() {
        let oid = uuid::Uuid::new_v4().to_string();
        for otype in ALL_OTYPES {
            let oref = ORef::new(*otype, oid.clone());
            let parsed: ORef = oref.to_string().parse().unwrap();
            assert_eq!(parsed, oref);
        }
    }

    #[test]
    fn test_oref_rejects_bad_input() {
        assert!("".parse::<ORef>().is_err());
        assert!("block".parse::<ORef>().is_err());
        assert!("Block:6ba7b810-9dad-11d1-80b4-00c04fd430c8".parse::<ORef>().is_err());
        assert!("gadget:6ba7b810-9dad-11d1-80b4-00c04fd430c8".parse::<ORef>().is_err());
        assert!("block:not-a-uuid".parse::<ORef>().is_err());
    }

    #[test]
    fn test_oref_serde_string_form() {
        let oref = ORef::new(OTYPE_TAB, "6ba7b810-9dad-11d1-80b4-00c04fd430c8");
        let json = serde_json::to_string(&oref).unwrap();
        assert_eq!(json, "\"tab:6ba7b810-9dad-11d1-80b4-00c04fd430c8\"");
        let back: ORef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, oref);
    }

    #[test]
    fn test_empty_oref_serializes_to_empty_string() {
        let oref = ORef::default();
        assert_eq!(serde_json::to_string(&oref).unwrap(), "\"\"");
        let back: ORef = serde_json::from_str("\"\"").unwrap();
        assert!(back.is_empty());
    }
}
