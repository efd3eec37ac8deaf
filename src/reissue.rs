//! Reissue policy, grounded directly on
//! `_check_reissue_token`: decides whether an already-verified token should
//! be re-signed under this deployment's issuer before being handed to the
//! protected upstream, and if so, builds the actor chain recording where it
//! came from.

use serde_json::Value;

use crate::issuer::{Actor, ClaimSet};

/// Which of the two reissue branches applies, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReissueKind {
    /// The token came from an external issuer (fresh login): reissue it
    /// under our issuer with the default audience.
    IngressExchange,
    /// The token is already ours, issued for the default audience, but the
    /// caller asked for the internal audience: reissue with a fresh `jti`
    /// and an `act` claim recording the exchange.
    InternalAudienceExchange,
}

/// Decide which reissue branch applies. `requested_audience` is
/// the caller's `audience=` query parameter, if any. `has_ticket` reports
/// whether a legacy oauth2_proxy ticket cookie accompanied the request — the
/// ingress exchange's precondition, per `_check_reissue_token`: without one,
/// this fails closed rather than reissuing under a guessed `jti`.
pub fn classify(
    token_iss: &str,
    token_aud: &str,
    our_iss: &str,
    default_audience: &str,
    internal_audience: &str,
    requested_audience: Option<&str>,
    has_ticket: bool,
) -> Option<ReissueKind> {
    let from_this_issuer = token_iss == our_iss;
    let from_default_audience = token_aud == default_audience;
    let to_internal_audience = requested_audience == Some(internal_audience);

    if !from_this_issuer {
        if has_ticket { Some(ReissueKind::IngressExchange) } else { None }
    } else if from_default_audience && to_internal_audience {
        Some(ReissueKind::InternalAudienceExchange)
    } else {
        None
    }
}

/// Build the claim set for a reissued token, carrying over everything from
/// the original claims except `iss`/`aud`/`jti`/`act`, which are replaced.
/// `our_iss` is this deployment's own issuer — the reissued token is always
/// ours, never a copy of whatever `iss` the original carried.
pub fn build_reissued_claims(
    kind: ReissueKind,
    original: &Value,
    new_jti: String,
    our_iss: &str,
    default_audience: &str,
    internal_audience: &str,
    iat: i64,
    exp: i64,
) -> ClaimSet {
    let sub = original
        .get("sub")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let previous_iss = original
        .get("iss")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let previous_aud = original
        .get("aud")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let previous_jti = original.get("jti").and_then(Value::as_str).map(str::to_string);
    let scope = original
        .get("scope")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let aud = match kind {
        ReissueKind::IngressExchange => default_audience.to_string(),
        ReissueKind::InternalAudienceExchange => internal_audience.to_string(),
    };

    let act_nested = match kind {
        ReissueKind::IngressExchange => None,
        ReissueKind::InternalAudienceExchange => original.get("act").cloned(),
    };

    ClaimSet {
        sub,
        iss: our_iss.to_string(),
        aud,
        jti: new_jti,
        scope,
        iat,
        exp,
        email: original.get("email").and_then(Value::as_str).map(str::to_string),
        uid: original.get("uid").and_then(Value::as_str).map(str::to_string),
        uid_number: original
            .get("uidNumber")
            .and_then(Value::as_str)
            .map(str::to_string),
        name: original.get("name").and_then(Value::as_str).map(str::to_string),
        is_member_of: original.get("isMemberOf").cloned(),
        act: Some(Actor {
            iss: previous_iss,
            aud: previous_aud,
            jti: previous_jti,
        }),
        act_nested,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn external_issuer_with_ticket_triggers_ingress_exchange() {
        let kind = classify(
            "https://idp.example.com/",
            "whatever",
            "https://example.com/",
            "https://example.com/",
            "https://internal.example.com/",
            None,
            true,
        );
        assert_eq!(kind, Some(ReissueKind::IngressExchange));
    }

    #[test]
    fn external_issuer_without_ticket_fails_closed() {
        let kind = classify(
            "https://idp.example.com/",
            "whatever",
            "https://example.com/",
            "https://example.com/",
            "https://internal.example.com/",
            None,
            false,
        );
        assert_eq!(kind, None);
    }

    #[test]
    fn internal_audience_request_triggers_exchange() {
        let kind = classify(
            "https://example.com/",
            "https://example.com/",
            "https://example.com/",
            "https://example.com/",
            "https://internal.example.com/",
            Some("https://internal.example.com/"),
            false,
        );
        assert_eq!(kind, Some(ReissueKind::InternalAudienceExchange));
    }

    #[test]
    fn same_issuer_default_audience_no_request_is_noop() {
        let kind = classify(
            "https://example.com/",
            "https://example.com/",
            "https://example.com/",
            "https://example.com/",
            "https://internal.example.com/",
            None,
            false,
        );
        assert_eq!(kind, None);
    }
}
