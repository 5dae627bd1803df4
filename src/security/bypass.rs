use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::{Choice, ConstantTimeEq};

/// Pre-shared bypass secrets, held only as SHA-256 digests.
///
/// A presented token is hashed and compared against every digest in constant
/// time, so neither the position of a match nor a shared prefix shows up in timing.
#[derive(Clone, Default, Deserialize)]
#[serde(from = "Vec<String>")]
pub struct BypassTokens {
    digests: Vec<[u8; 32]>,
}

impl BypassTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let digests = tokens
            .into_iter()
            .filter(|token| !token.as_ref().is_empty())
            .map(|token| digest(token.as_ref()))
            .collect();
        Self { digests }
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// True when `presented` equals one of the configured tokens. Empty never matches.
    pub fn matches(&self, presented: &str) -> bool {
        if presented.is_empty() {
            return false;
        }
        let presented = digest(presented);
        let found = self
            .digests
            .iter()
            .fold(Choice::from(0), |found, known| found | known[..].ct_eq(&presented[..]));
        found.into()
    }
}

impl From<Vec<String>> for BypassTokens {
    fn from(tokens: Vec<String>) -> Self {
        Self::new(tokens)
    }
}

impl fmt::Debug for BypassTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BypassTokens({} configured)", self.digests.len())
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_configured_token() {
        let tokens = BypassTokens::new(["ops-7f3a", "loadtest-19c2"]);
        assert!(tokens.matches("ops-7f3a"));
        assert!(tokens.matches("loadtest-19c2"));
        assert!(!tokens.matches("ops-7f3b"));
        assert!(!tokens.matches("ops-7f3a "));
    }

    #[test]
    fn test_empty_never_matches() {
        let tokens = BypassTokens::new(["", "secret"]);
        assert_eq!(tokens.len(), 1);
        assert!(!tokens.matches(""));
        assert!(!BypassTokens::default().matches("secret"));
    }

    #[test]
    fn test_debug_hides_tokens() {
        let tokens = BypassTokens::new(["hunter2"]);
        let rendered = format!("{:?}", tokens);
        assert!(!rendered.contains("hunter2"));
        assert_eq!(rendered, "BypassTokens(1 configured)");
    }

    #[test]
    fn test_deserialize_from_list() {
        let tokens: BypassTokens = serde_json::from_str(r#"["a1", "b2"]"#).unwrap();
        assert!(tokens.matches("b2"));
    }
}
