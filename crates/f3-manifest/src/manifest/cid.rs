//! Content identifier of a power table
//!
//! Kept in its canonical text form. On the wire it is an IPLD link,
//! `{"/": "bafy..."}`, and an undefined identifier is `null`.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "CidLink", into = "CidLink")]
pub struct PowerTableCid(String);

#[derive(Serialize, Deserialize)]
struct CidLink {
    #[serde(rename = "/")]
    link: String,
}

impl From<CidLink> for PowerTableCid {
    fn from(value: CidLink) -> Self {
        Self(value.link)
    }
}

impl From<PowerTableCid> for CidLink {
    fn from(value: PowerTableCid) -> Self {
        Self { link: value.0 }
    }
}

impl PowerTableCid {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Multibase text is a non-empty run of ASCII alphanumerics.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty() && self.0.chars().all(|c| c.is_ascii_alphanumeric())
    }
}

impl fmt::Display for PowerTableCid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_wire_format() {
        let cid = PowerTableCid::new("bafy2bzaceab");
        assert_eq!(serde_json::to_string(&cid).unwrap(), r#"{"/":"bafy2bzaceab"}"#);

        let parsed: Option<PowerTableCid> = serde_json::from_str("null").unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_well_formed() {
        assert!(PowerTableCid::new("bafy2bzaceab").is_well_formed());
        assert!(!PowerTableCid::new("").is_well_formed());
        assert!(!PowerTableCid::new("bafy 2").is_well_formed());
    }
}
