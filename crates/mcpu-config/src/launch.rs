use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How to start one child MCP server: the command/args/env triple.
///
/// The fingerprint is a stable content hash of the triple and keys the schema
/// cache: a cached tool list is only valid while the server would be launched
/// the same way.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Stable hex fingerprint of the launch triple.
    ///
    /// Env entries are hashed in sorted key order so the digest does not
    /// depend on `HashMap` iteration order.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.command.as_bytes());
        hasher.update([0u8]);
        for arg in &self.args {
            hasher.update(arg.as_bytes());
            hasher.update([0u8]);
        }
        let mut env: Vec<(&str, &str)> = self
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        env.sort_unstable();
        for (key, value) in env {
            hasher.update(key.as_bytes());
            hasher.update([1u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
        }
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = spec("npx", &["-y", "repomix", "--mcp"]);
        let b = spec("npx", &["-y", "repomix", "--mcp"]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_with_args() {
        let a = spec("npx", &["-y", "repomix"]);
        let b = spec("npx", &["-y", "repomix", "--mcp"]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_ignores_env_insertion_order() {
        let mut a = spec("srv", &[]);
        a.env.insert("A".into(), "1".into());
        a.env.insert("B".into(), "2".into());
        let mut b = spec("srv", &[]);
        b.env.insert("B".into(), "2".into());
        b.env.insert("A".into(), "1".into());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_separates_arg_boundaries() {
        // ["ab", "c"] and ["a", "bc"] must not collide.
        let a = spec("srv", &["ab", "c"]);
        let b = spec("srv", &["a", "bc"]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_deserialize_minimal_entry() {
        let parsed: LaunchSpec = serde_json::from_str(r#"{"command":"deno"}"#).unwrap();
        assert_eq!(parsed.command, "deno");
        assert!(parsed.args.is_empty());
        assert!(parsed.env.is_empty());
    }
}
