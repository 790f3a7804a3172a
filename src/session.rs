//! Session key parsing and validation.
//!
//! Every piece of per-session state in the daemon is keyed by a
//! `SessionKey`: the (user, agent, thread) triple that forms the unit of
//! ordering isolation. Centralizing build/parse here keeps the restricted
//! alphabet in one place and guarantees that a malformed value from a store
//! row can never become a routing key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Validated (user, agent, thread) triple, serialized as `user:agent:thread`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionKey {
    user_id: String,
    agent_id: String,
    thread_id: String,
}

/// True if `segment` is non-empty and uses only the restricted alphabet
/// (ASCII alphanumerics, `_`, `-`). The `:` separator, `@`, and `.` are
/// all rejected so the colon-joined form stays unambiguous.
fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl SessionKey {
    /// Build a key from its three segments, validating each one.
    pub fn new(
        user_id: impl Into<String>,
        agent_id: impl Into<String>,
        thread_id: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let user_id = user_id.into();
        let agent_id = agent_id.into();
        let thread_id = thread_id.into();

        for (name, segment) in [
            ("user_id", &user_id),
            ("agent_id", &agent_id),
            ("thread_id", &thread_id),
        ] {
            if !valid_segment(segment) {
                anyhow::bail!(
                    "invalid session key segment {}={:?}: must be non-empty [A-Za-z0-9_-]",
                    name,
                    segment
                );
            }
        }

        Ok(Self {
            user_id,
            agent_id,
            thread_id,
        })
    }

    /// Parse a colon-joined key. Exact inverse of `Display`: anything that
    /// is not exactly three valid segments (including legacy 4-segment
    /// values) is rejected.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 3 {
            anyhow::bail!(
                "invalid session key {:?}: expected 3 segments, got {}",
                raw,
                parts.len()
            );
        }
        Self::new(parts[0], parts[1], parts[2])
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.user_id, self.agent_id, self.thread_id)
    }
}

impl TryFrom<String> for SessionKey {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_parse_roundtrip() {
        let key = SessionKey::new("user_1", "agent-a", "thread9").unwrap();
        let parsed = SessionKey::parse(&key.to_string()).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.user_id(), "user_1");
        assert_eq!(parsed.agent_id(), "agent-a");
        assert_eq!(parsed.thread_id(), "thread9");
    }

    #[test]
    fn rejects_forbidden_characters() {
        assert!(SessionKey::new("user@example", "agent", "thread").is_err());
        assert!(SessionKey::new("user", "agent.v2", "thread").is_err());
        assert!(SessionKey::new("user", "agent", "thr:ead").is_err());
        assert!(SessionKey::new("user", "", "thread").is_err());
    }

    #[test]
    fn rejects_wrong_segment_count() {
        assert!(SessionKey::parse("user:agent").is_err());
        // Legacy 4-segment keys are invalid, never a routing key.
        assert!(SessionKey::parse("user:agent:thread:extra").is_err());
        assert!(SessionKey::parse("").is_err());
    }

    #[test]
    fn serde_uses_string_form() {
        let key = SessionKey::new("u1", "a1", "t1").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"u1:a1:t1\"");
        let back: SessionKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<SessionKey>("\"u1:a1:t1:x\"").is_err());
    }
}
