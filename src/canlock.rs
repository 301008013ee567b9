//! C8: Cancel-Lock / Cancel-Key generation and verification per RFC 8315.
//! Grounded on the original `canlock.c`'s admin/user branching and its
//! `"\n\t"`-folded multi-secret output; HMAC and digests come from
//! `openssl`, already part of the dependency stack for other crypto use.

use base64::encode as b64encode;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;

const FOLD: &str = "\n\t";

fn hmac(digest: MessageDigest, key: &[u8], data: &[u8]) -> Vec<u8> {
    let pkey = PKey::hmac(key).expect("hmac key construction cannot fail for arbitrary bytes");
    let mut signer = Signer::new(digest, &pkey).expect("digest is supported by openssl");
    signer.update(data).expect("update never fails for in-memory data");
    signer.sign_to_vec().expect("sign never fails once update succeeded")
}

fn hash(digest: MessageDigest, data: &[u8]) -> Vec<u8> {
    openssl::hash::hash(digest, data).expect("digest is supported by openssl").to_vec()
}

/// One `(sha1, sha256)` key or lock pair for a single secret.
struct Pair {
    sha1: String,
    sha256: String,
}

fn key_pair(secret: &str, data: &[u8]) -> Pair {
    Pair {
        sha1: b64encode(hmac(MessageDigest::sha1(), secret.as_bytes(), data)),
        sha256: b64encode(hmac(MessageDigest::sha256(), secret.as_bytes(), data)),
    }
}

fn lock_pair(key: &Pair) -> Pair {
    Pair {
        sha1: b64encode(hash(MessageDigest::sha1(), key.sha1.as_bytes())),
        sha256: b64encode(hash(MessageDigest::sha256(), key.sha256.as_bytes())),
    }
}

fn format_pair(p: &Pair) -> String {
    format!("sha1:{} sha256:{}", p.sha1, p.sha256)
}

fn hmac_data(message_id: &str, username: Option<&str>) -> Vec<u8> {
    match username {
        Some(user) => format!("{}{}", user, message_id).into_bytes(),
        None => message_id.as_bytes().to_vec(),
    }
}

/// Generates the Cancel-Key header body for every secret in `secrets`,
/// folded with `"\n\t"`. Returns the empty string if `secrets` is empty,
/// which the caller treats as the feature being disabled.
pub fn generate_key(secrets: &[String], message_id: &str, username: Option<&str>) -> String {
    if secrets.is_empty() {
        return String::new();
    }
    let data = hmac_data(message_id, username);
    secrets
        .iter()
        .map(|secret| format_pair(&key_pair(secret, &data)))
        .collect::<Vec<_>>()
        .join(FOLD)
}

/// Generates the Cancel-Lock header body for every secret in `secrets`.
pub fn generate_lock(secrets: &[String], message_id: &str, username: Option<&str>) -> String {
    if secrets.is_empty() {
        return String::new();
    }
    let data = hmac_data(message_id, username);
    secrets
        .iter()
        .map(|secret| format_pair(&lock_pair(&key_pair(secret, &data))))
        .collect::<Vec<_>>()
        .join(FOLD)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Sha1,
    Sha256,
}

struct Element {
    scheme: Scheme,
    value: String,
}

/// Splits a folded header body into its `scheme:value` elements, tolerant
/// of the folding whitespace (`"\n\t"` between pairs, `" "` within a pair).
fn parse_elements(body: &str) -> Vec<Element> {
    body.split_whitespace()
        .filter_map(|tok| {
            let mut parts = tok.splitn(2, ':');
            let scheme = parts.next()?;
            let value = parts.next()?;
            let scheme = match scheme {
                "sha1" => Scheme::Sha1,
                "sha256" => Scheme::Sha256,
                _ => return None,
            };
            Some(Element { scheme, value: value.to_string() })
        })
        .collect()
}

/// Verifies that applying the matching digest then base64 to any key
/// element yields any lock element of the same scheme. An empty key body
/// never verifies, even against a non-empty lock.
pub fn verify(key_header: &str, lock_header: &str) -> bool {
    if key_header.trim().is_empty() {
        return false;
    }
    let keys = parse_elements(key_header);
    let locks = parse_elements(lock_header);

    for key in &keys {
        let digest = match key.scheme {
            Scheme::Sha1 => MessageDigest::sha1(),
            Scheme::Sha256 => MessageDigest::sha256(),
        };
        let candidate = b64encode(hash(digest, key.value.as_bytes()));
        if locks.iter().any(|l| l.scheme == key.scheme && l.value == candidate) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSGID: &str = "<12345@mid.example>";
    const ADMIN_SECRET: &str = "ExampleSecret";
    const USER_SECRET: &str = "AnotherSecret";
    const USER: &str = "JaneDoe";

    #[test]
    fn rfc_vectors_admin_mode() {
        let secrets = vec![ADMIN_SECRET.to_string()];
        let lock = generate_lock(&secrets, MSGID, None);
        let key = generate_key(&secrets, MSGID, None);
        assert_eq!(
            lock,
            "sha1:JD+QmQh5LH6lLLToKLcDl+Aemg0= sha256:s/pmK/3grrz++29ce2/mQydzJuc7iqHn1nqcJiQTPMc="
        );
        assert_eq!(
            key,
            "sha1:8HzrY7F4N+5SXkGQah1mcyW+01g= sha256:qv1VXHYiCGjkX/N1nhfYKcAeUn8bCVhrWhoKuBSnpMA="
        );
    }

    #[test]
    fn verify_succeeds_for_matching_key_and_lock() {
        let secrets = vec![ADMIN_SECRET.to_string()];
        let lock = generate_lock(&secrets, MSGID, None);
        let key = generate_key(&secrets, MSGID, None);
        assert!(verify(&key, &lock));
    }

    #[test]
    fn verify_separates_admin_and_user_secrets() {
        let admin = vec![ADMIN_SECRET.to_string()];
        let user = vec![USER_SECRET.to_string()];

        let admin_lock = generate_lock(&admin, MSGID, None);
        let user_key = generate_key(&user, MSGID, Some(USER));

        assert!(!verify(&user_key, &admin_lock));
    }

    #[test]
    fn empty_secrets_disable_the_feature() {
        assert_eq!(generate_key(&[], MSGID, None), "");
        assert_eq!(generate_lock(&[], MSGID, None), "");
    }

    #[test]
    fn verify_rejects_empty_key_against_nonempty_lock() {
        let secrets = vec![ADMIN_SECRET.to_string()];
        let lock = generate_lock(&secrets, MSGID, None);
        assert!(!verify("", &lock));
    }

    #[test]
    fn multiple_secrets_are_folded_with_newline_tab() {
        let secrets = vec![ADMIN_SECRET.to_string(), USER_SECRET.to_string()];
        let key = generate_key(&secrets, MSGID, None);
        assert_eq!(key.matches("\n\t").count(), 1);
    }
}
