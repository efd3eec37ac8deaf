//! RSA keypair loading, JWT signing, and JWKS publication.

use anyhow::{Context, Result};
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_ENGINE;
use jsonwebtoken::{EncodingKey, Header};
use pem as pem_crate;
use sha2::{Digest, Sha256};
use simple_asn1::{ASN1Block, from_der};
use x509_parser::parse_x509_certificate;

#[derive(Clone)]
pub struct PemSigner {
    kid: String,
    encoding_key: EncodingKey,
    jwk: serde_json::Value,
}

/// A thing that can sign claim sets with the deployment's RSA key and
/// publish the corresponding public key as a JWKS document.
pub trait Signer: Send + Sync {
    fn kid(&self) -> &str;
    fn sign(&self, header: Header, claims: &serde_json::Value) -> Result<String>;
    fn jwks(&self) -> serde_json::Value;
}

impl PemSigner {
    pub fn from_pem(key_pem: &[u8], cert_pem: Option<&[u8]>) -> Result<Self> {
        let encoding_key =
            EncodingKey::from_rsa_pem(key_pem).context("failed to create encoding key from pem")?;

        let pem = pem_crate::parse(std::str::from_utf8(key_pem).context("key pem to str")?)
            .map_err(|e| anyhow::anyhow!("failed to parse key pem: {}", e))?;

        let der = pem.contents;
        let asn1 = from_der(&der).context("failed to parse private key DER ASN.1")?;

        fn extract_n_e(blocks: &[ASN1Block]) -> Option<(Vec<u8>, Vec<u8>)> {
            for b in blocks {
                if let ASN1Block::Sequence(_, inner) = b {
                    if inner.len() >= 3
                        && let (ASN1Block::Integer(_, n), ASN1Block::Integer(_, e)) =
                            (&inner[1], &inner[2])
                    {
                        let n_bytes = n.to_signed_bytes_be();
                        let e_bytes = e.to_signed_bytes_be();
                        return Some((n_bytes, e_bytes));
                    }
                    for elem in inner.iter() {
                        if let ASN1Block::OctetString(_, os) = elem
                            && let Ok(nested) = from_der(os)
                            && let Some((n, e)) = extract_n_e(&nested)
                        {
                            return Some((n, e));
                        }
                    }
                }
            }
            None
        }

        let (n_bytes, e_bytes) = extract_n_e(&asn1)
            .ok_or_else(|| anyhow::anyhow!("failed to extract n/e from private key ASN.1"))?;

        let n_b64 = BASE64_ENGINE.encode(&n_bytes);
        let e_b64 = BASE64_ENGINE.encode(&e_bytes);

        let kid = compute_kid(&n_bytes, &e_bytes);

        let jwk = serde_json::json!({
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": kid,
            "n": n_b64,
            "e": e_b64,
        });

        if let Some(cert_bytes) = cert_pem {
            let pem = pem_crate::parse(std::str::from_utf8(cert_bytes).context("cert pem to str")?)
                .map_err(|e| anyhow::anyhow!("failed to parse cert pem: {}", e))?;
            let der = pem.contents;

            let (_, cert) = parse_x509_certificate(&der)
                .map_err(|e| anyhow::anyhow!("failed to parse x509 certificate: {:?}", e))?;

            let subject_pki = &cert.tbs_certificate.subject_pki.subject_public_key.data;

            let subject_pki_asn = from_der(subject_pki)
                .map_err(|_| anyhow::anyhow!("failed to parse subject_pki DER"))?;
            let mut pub_n = None;
            let mut pub_e = None;
            if subject_pki_asn.len() == 1
                && let ASN1Block::Sequence(_, seq) = &subject_pki_asn[0]
                && seq.len() >= 2
                && let (ASN1Block::Integer(_, n), ASN1Block::Integer(_, e)) = (&seq[0], &seq[1])
            {
                pub_n = Some(n.to_signed_bytes_be());
                pub_e = Some(e.to_signed_bytes_be());
            }

            let pub_n = pub_n.ok_or_else(|| {
                anyhow::anyhow!("failed to extract public modulus from cert subject_pki")
            })?;
            let pub_e = pub_e.ok_or_else(|| {
                anyhow::anyhow!("failed to extract public exponent from cert subject_pki")
            })?;

            if pub_n != n_bytes || pub_e != e_bytes {
                return Err(anyhow::anyhow!(
                    "KeyCertMismatch: certificate public key does not match provided private key"
                ));
            }
        }

        Ok(PemSigner {
            kid,
            encoding_key,
            jwk,
        })
    }
}

fn compute_kid(n_bytes: &[u8], e_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(n_bytes);
    hasher.update(e_bytes);
    hex::encode(hasher.finalize())
}

impl Signer for PemSigner {
    fn kid(&self) -> &str {
        &self.kid
    }

    fn sign(&self, mut header: Header, claims: &serde_json::Value) -> Result<String> {
        header.kid = Some(self.kid.clone());
        let token = jsonwebtoken::encode(&header, claims, &self.encoding_key)
            .context("failed to encode jwt")?;
        Ok(token)
    }

    fn jwks(&self) -> serde_json::Value {
        serde_json::json!({ "keys": [self.jwk.clone()] })
    }
}

pub type DynSigner = Arc<dyn Signer>;

pub fn load_pem_signer_from_paths(key_path: &str, cert_path: Option<&str>) -> Result<DynSigner> {
    let key = std::fs::read(key_path).context("read private key")?;
    let cert = match cert_path {
        Some(p) => Some(std::fs::read(p).context("read cert")?),
        None => None,
    };
    let cert_ref = cert.as_deref();
    let signer = PemSigner::from_pem(&key, cert_ref).context("create pem signer")?;
    Ok(Arc::new(signer))
}

/// Generate a fresh 2048-bit RSA keypair, PEM-encoded, for the
/// `generate-key` CLI command. No certificate is produced; deployments that
/// need one supply it separately and the signer matches it against the key
/// at load time.
pub fn generate_keypair_pem() -> Result<String> {
    use rsa::RsaPrivateKey;
    use rsa::pkcs1::EncodeRsaPrivateKey;

    let mut rng = rand_core::OsRng;
    let private_key =
        RsaPrivateKey::new(&mut rng, 2048).context("failed to generate RSA keypair")?;
    let pem = private_key
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .context("failed to encode private key as PEM")?;
    Ok(pem.to_string())
}

/// Minimal OpenID discovery document.
pub fn discovery_document(
    issuer: &str,
    authorization_endpoint: &str,
    token_endpoint: &str,
    scopes_supported: &[String],
) -> serde_json::Value {
    serde_json::json!({
        "issuer": issuer,
        "jwks_uri": format!("{}/.well-known/jwks.json", issuer.trim_end_matches('/')),
        "authorization_endpoint": authorization_endpoint,
        "token_endpoint": token_endpoint,
        "response_types_supported": ["code"],
        "id_token_signing_alg_values_supported": ["RS256"],
        "scopes_supported": scopes_supported,
    })
}
