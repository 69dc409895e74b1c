//! Credential verifier tests

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use quarry_world::auth::{AuthError, CredentialVerifier};
    use quarry_world::store::{MemStore, SigningKey, Store};
    use quarry_world::types::ServerConfig;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio_test::block_on;

    const SECRET: &str = "test-signing-secret";

    fn now_secs() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    fn store_with_key() -> Arc<MemStore> {
        let store = Arc::new(MemStore::new());
        store.add_key(SigningKey {
            kid: Some("k1".into()),
            algorithm: "HS256".into(),
            secret: SECRET.into(),
        });
        store
    }

    fn verifier(store: Arc<MemStore>, allow_unsigned: bool) -> CredentialVerifier {
        let config = ServerConfig {
            allow_unsigned_tokens: allow_unsigned,
            ..Default::default()
        };
        CredentialVerifier::new(store as Arc<dyn Store>, &config)
    }

    fn opaque_token(user_id: &str, display_name: &str, issued_at: u64) -> String {
        let payload = json!({
            "user_id": user_id,
            "display_name": display_name,
            "issued_at": issued_at,
        });
        BASE64.encode(serde_json::to_vec(&payload).unwrap())
    }

    fn signed_token(claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn standard_claims(exp: u64) -> serde_json::Value {
        json!({
            "sub": "user-1",
            "iss": "quarry",
            "aud": "quarry-world",
            "exp": exp,
            "name": "Steve",
        })
    }

    // -----------------------------------------------------------------------
    // Opaque tokens
    // -----------------------------------------------------------------------

    #[test]
    fn opaque_token_is_admitted_where_enabled() {
        let verifier = verifier(store_with_key(), true);
        let token = opaque_token("guest-7", "Guest", now_secs());
        let identity = block_on(verifier.verify(&token)).unwrap();
        assert_eq!(identity.user_id, "guest-7");
        assert_eq!(identity.display_name.as_deref(), Some("Guest"));
    }

    #[test]
    fn opaque_token_is_rejected_where_disabled() {
        let verifier = verifier(store_with_key(), false);
        let token = opaque_token("guest-7", "Guest", now_secs());
        assert!(matches!(
            block_on(verifier.verify(&token)),
            Err(AuthError::Failed)
        ));
    }

    #[test]
    fn opaque_token_expires_after_a_day() {
        let verifier = verifier(store_with_key(), true);
        let token = opaque_token("guest-7", "Guest", now_secs() - 25 * 3600);
        assert!(matches!(
            block_on(verifier.verify(&token)),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn opaque_token_from_the_future_is_rejected() {
        let verifier = verifier(store_with_key(), true);
        let token = opaque_token("guest-7", "Guest", now_secs() + 600);
        assert!(matches!(
            block_on(verifier.verify(&token)),
            Err(AuthError::Failed)
        ));
    }

    // -----------------------------------------------------------------------
    // Signed tokens
    // -----------------------------------------------------------------------

    #[test]
    fn signed_token_with_valid_claims_is_admitted() {
        let verifier = verifier(store_with_key(), false);
        let token = signed_token(standard_claims(now_secs() + 3600));
        let identity = block_on(verifier.verify(&token)).unwrap();
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.display_name.as_deref(), Some("Steve"));
    }

    #[test]
    fn expired_signed_token_classifies_as_expired() {
        let verifier = verifier(store_with_key(), false);
        // Past the 30 s leeway.
        let token = signed_token(standard_claims(now_secs() - 120));
        assert!(matches!(
            block_on(verifier.verify(&token)),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn wrong_audience_is_rejected() {
        let verifier = verifier(store_with_key(), false);
        let mut claims = standard_claims(now_secs() + 3600);
        claims["aud"] = json!("another-service");
        let token = signed_token(claims);
        assert!(matches!(
            block_on(verifier.verify(&token)),
            Err(AuthError::Failed)
        ));
    }

    #[test]
    fn missing_subject_is_rejected() {
        let verifier = verifier(store_with_key(), false);
        let mut claims = standard_claims(now_secs() + 3600);
        claims.as_object_mut().unwrap().remove("sub");
        let token = signed_token(claims);
        assert!(matches!(
            block_on(verifier.verify(&token)),
            Err(AuthError::Failed)
        ));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let verifier = verifier(store_with_key(), false);
        let mut token = signed_token(standard_claims(now_secs() + 3600));
        token.pop();
        token.push('A');
        assert!(matches!(
            block_on(verifier.verify(&token)),
            Err(AuthError::Failed)
        ));
    }

    // -----------------------------------------------------------------------
    // Key rotation
    // -----------------------------------------------------------------------

    #[test]
    fn rotated_key_is_fetched_on_verification_failure() {
        let store = store_with_key();
        let verifier = verifier(store.clone(), false);

        // Warm the cache with the original key set.
        let token = signed_token(standard_claims(now_secs() + 3600));
        block_on(verifier.verify(&token)).unwrap();

        // Rotate: replace the published key, sign with the new secret.
        store.clear_keys();
        store.add_key(SigningKey {
            kid: Some("k2".into()),
            algorithm: "HS256".into(),
            secret: "rotated-secret".into(),
        });
        let rotated = encode(
            &Header::new(Algorithm::HS256),
            &standard_claims(now_secs() + 3600),
            &EncodingKey::from_secret(b"rotated-secret"),
        )
        .unwrap();

        // The cached set fails, triggering one refetch before success.
        let identity = block_on(verifier.verify(&rotated)).unwrap();
        assert_eq!(identity.user_id, "user-1");
    }
}
