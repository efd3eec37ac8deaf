//! Internal token issuance.
//!
//! Assembles a claim set from a caller-supplied payload and signs it with
//! the deployment's key. Grounded on the claim assembly in
//! `_check_reissue_token`/`new_token` (subject, scope, `jti`, optional
//! `act` actor-chain) and on `post_tokens_new` in the user-token issuance
//! path (claims built from `scope`, `jti`, optional email/username/uid).

use anyhow::Result;
use jsonwebtoken::Header;
use serde_json::{Map, Value, json};

use crate::signing::DynSigner;

/// The actor that a reissued token was exchanged on behalf of. Appended to
/// `act` as a chain when a token is reissued more than once.
#[derive(Debug, Clone)]
pub struct Actor {
    pub iss: String,
    pub aud: String,
    pub jti: Option<String>,
}

impl Actor {
    fn to_claim(&self, nested: Option<Value>) -> Value {
        let mut m = Map::new();
        m.insert("iss".into(), json!(self.iss));
        m.insert("aud".into(), json!(self.aud));
        if let Some(jti) = &self.jti {
            m.insert("jti".into(), json!(jti));
        }
        if let Some(act) = nested {
            m.insert("act".into(), act);
        }
        Value::Object(m)
    }
}

/// A fully-assembled claim set ready to sign.
#[derive(Debug, Clone)]
pub struct ClaimSet {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub jti: String,
    pub scope: String,
    pub iat: i64,
    pub exp: i64,
    pub email: Option<String>,
    pub uid: Option<String>,
    pub uid_number: Option<String>,
    pub name: Option<String>,
    pub is_member_of: Option<Value>,
    pub act: Option<Actor>,
    pub act_nested: Option<Value>,
}

impl ClaimSet {
    pub fn to_json(&self) -> Value {
        let mut m = Map::new();
        m.insert("sub".into(), json!(self.sub));
        m.insert("iss".into(), json!(self.iss));
        m.insert("aud".into(), json!(self.aud));
        m.insert("jti".into(), json!(self.jti));
        m.insert("scope".into(), json!(self.scope));
        m.insert("iat".into(), json!(self.iat));
        m.insert("exp".into(), json!(self.exp));
        if let Some(email) = &self.email {
            m.insert("email".into(), json!(email));
        }
        if let Some(uid) = &self.uid {
            m.insert("uid".into(), json!(uid));
        }
        if let Some(uid_number) = &self.uid_number {
            m.insert("uidNumber".into(), json!(uid_number));
        }
        if let Some(name) = &self.name {
            m.insert("name".into(), json!(name));
        }
        if let Some(groups) = &self.is_member_of {
            m.insert("isMemberOf".into(), groups.clone());
        }
        if let Some(act) = &self.act {
            m.insert("act".into(), act.to_claim(self.act_nested.clone()));
        }
        Value::Object(m)
    }
}

/// Sign `claims` with `signer`, returning the encoded compact JWT.
pub fn issue(signer: &DynSigner, claims: &ClaimSet) -> Result<String> {
    let header = Header::new(jsonwebtoken::Algorithm::RS256);
    let value = claims.to_json();
    signer.sign(header, &value)
}
