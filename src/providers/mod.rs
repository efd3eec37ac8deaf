//! Upstream identity providers.
//!
//! Both branches produce the same internal shape — a verified identity plus
//! optional group memberships — so `handlers::login` doesn't need to know
//! which provider authenticated the user.

pub mod github;
pub mod oidc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A group membership entry as it appears in the `isMemberOf` claim:
/// `{"name": ..., "id": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMembership {
    pub name: String,
    pub id: i64,
}

/// The identity resolved from an upstream provider after the authorization
/// code exchange completes.
#[derive(Debug, Clone)]
pub struct UpstreamIdentity {
    pub subject: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub uid: Option<String>,
    pub uid_number: Option<String>,
    pub groups: Vec<GroupMembership>,
}

impl UpstreamIdentity {
    pub fn groups_as_claim(&self) -> Option<Value> {
        if self.groups.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&self.groups).expect("groups serialize"))
        }
    }
}

/// GitHub team/org names can be long and contain characters that aren't
/// valid as bare group names elsewhere in the system (the `isMemberOf`
/// normalization). Names over 32 characters are truncated to a 25-character
/// prefix plus a `-` plus a 6-character digest suffix, so the result is
/// always at most 32 characters and still traceable back to its source.
pub fn normalize_group_name(name: &str) -> String {
    const MAX_LEN: usize = 32;
    const PREFIX_LEN: usize = 25;

    if name.chars().count() <= MAX_LEN {
        return name.to_string();
    }

    use base64::Engine as _;
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
    let suffix: String = encoded.chars().take(6).collect();

    let prefix: String = name.chars().take(PREFIX_LEN).collect();
    format!("{prefix}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_group_names_pass_through() {
        assert_eq!(normalize_group_name("org-a-team"), "org-a-team");
    }

    #[test]
    fn long_group_names_are_truncated_to_32_chars() {
        let long = "other-org-team-with-very-long-descriptive-team-name";
        let normalized = normalize_group_name(long);
        assert_eq!(normalized.chars().count(), 32);
        assert!(normalized.starts_with(&long[..25]));
    }

    #[test]
    fn truncation_is_deterministic() {
        let long = "a-team-name-that-is-definitely-longer-than-the-limit";
        assert_eq!(normalize_group_name(long), normalize_group_name(long));
    }
}
