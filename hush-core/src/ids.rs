//! Identity and content handles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel identity used when no wallet or account is connected.
pub const ANONYMOUS: &str = "anonymous";

/// The acting user: a wallet address, an account id, or [`ANONYMOUS`].
///
/// Opaque to this crate. It may change at any time while the app runs
/// (wallet connect, wallet switch, logout).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap a raw handle. Blank input collapses to the anonymous identity.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Self::anonymous()
        } else if trimmed.len() == raw.len() {
            Self(raw)
        } else {
            Self(trimmed.to_string())
        }
    }

    pub fn anonymous() -> Self {
        Self(ANONYMOUS.to_string())
    }

    /// Pick the acting identity the way the auth layer reports it:
    /// a connected wallet wins over an account id, otherwise anonymous.
    pub fn resolve(wallet: Option<&str>, account: Option<&str>) -> Self {
        wallet
            .filter(|w| !w.trim().is_empty())
            .or(account.filter(|a| !a.trim().is_empty()))
            .map(Self::new)
            .unwrap_or_else(Self::anonymous)
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Identity {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// Globally unique name of a confession or reply (a transaction id
/// upstream). Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for ContentId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_identity_is_anonymous() {
        assert!(Identity::new("").is_anonymous());
        assert!(Identity::new("   ").is_anonymous());
        assert_eq!(Identity::default(), Identity::anonymous());
    }

    #[test]
    fn test_identity_trims_whitespace() {
        let id = Identity::new("  0xabc ");
        assert_eq!(id.as_str(), "0xabc");
        assert!(!id.is_anonymous());
    }

    #[test]
    fn test_resolve_prefers_wallet() {
        let id = Identity::resolve(Some("0xwallet"), Some("acct-1"));
        assert_eq!(id.as_str(), "0xwallet");

        let id = Identity::resolve(None, Some("acct-1"));
        assert_eq!(id.as_str(), "acct-1");

        let id = Identity::resolve(Some(""), None);
        assert!(id.is_anonymous());
    }

    #[test]
    fn test_serde_is_transparent() {
        let json = serde_json::to_string(&ContentId::new("tx-1")).unwrap();
        assert_eq!(json, "\"tx-1\"");
        let back: Identity = serde_json::from_str("\"0xabc\"").unwrap();
        assert_eq!(back, Identity::new("0xabc"));
    }
}
