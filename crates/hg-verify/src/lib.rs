//! HookGuard signature verification
//!
//! A strategy table maps each provider to a [`SchemeVerifier`]. Providers get
//! the verifier for their configured [`SignatureScheme`] unless one was
//! registered for them explicitly at startup.
//!
//! Verification is a pure function over the request, the current config
//! snapshot and the clock. Failures are logged and counted, nothing else.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use hg_common::{
    HookGuardError, InboundRequest, ProviderConfig, Result, SecurityViolation, SharedClock, SignatureScheme,
    VerificationResult,
};
use hg_config::ConfigStore;

pub mod event_id;
pub mod schemes;

pub use event_id::{derive_event_id, extract_event_id, lookup_path, resolve_event_id};
pub use schemes::{
    HmacSha256Hex, PrefixedHmacSha256Base64, SchemeVerifier, SignedRequest, SigningInput, TimestampedHmacSha256,
    UrlParamsHmacSha1,
};

pub struct SignatureVerifier {
    config: Arc<ConfigStore>,
    clock: SharedClock,
    by_scheme: HashMap<SignatureScheme, Arc<dyn SchemeVerifier>>,
    by_provider: HashMap<String, Arc<dyn SchemeVerifier>>,
}

impl SignatureVerifier {
    pub fn new(config: Arc<ConfigStore>, clock: SharedClock) -> Self {
        let mut by_scheme: HashMap<SignatureScheme, Arc<dyn SchemeVerifier>> = HashMap::new();
        by_scheme.insert(SignatureScheme::TimestampedHmacSha256, Arc::new(TimestampedHmacSha256));
        by_scheme.insert(SignatureScheme::UrlParamsHmacSha1, Arc::new(UrlParamsHmacSha1));
        by_scheme.insert(SignatureScheme::PrefixedHmacSha256Base64, Arc::new(PrefixedHmacSha256Base64));
        by_scheme.insert(SignatureScheme::HmacSha256Hex, Arc::new(HmacSha256Hex));

        Self {
            config,
            clock,
            by_scheme,
            by_provider: HashMap::new(),
        }
    }

    /// Use a custom verifier for one provider instead of its scheme default
    pub fn register(&mut self, provider_id: impl Into<String>, verifier: Arc<dyn SchemeVerifier>) {
        self.by_provider.insert(provider_id.into(), verifier);
    }

    pub fn scheme_for(&self, provider: &ProviderConfig) -> Option<Arc<dyn SchemeVerifier>> {
        self.by_provider
            .get(&provider.provider_id)
            .or_else(|| self.by_scheme.get(&provider.scheme))
            .cloned()
    }

    /// Verify a raw payload against a provider's secrets.
    ///
    /// Unknown providers are an error; a bad signature or stale timestamp is
    /// an `Ok` result with `valid == false`.
    pub fn verify(
        &self,
        provider_id: &str,
        raw_payload: &[u8],
        signature_header: Option<&str>,
        timestamp: Option<i64>,
        other_headers: Option<&HashMap<String, String>>,
    ) -> Result<VerificationResult> {
        let empty = HashMap::new();
        let headers = other_headers.unwrap_or(&empty);
        let snapshot = self.config.current();
        let provider = snapshot
            .provider(provider_id)
            .ok_or_else(|| HookGuardError::unconfigured_provider(provider_id))?;

        Ok(self.to_result(provider, raw_payload, self.check(provider, raw_payload, signature_header, timestamp, headers, None)))
    }

    /// Verify a request as received from the transport, reading the signature
    /// and timestamp from the provider's configured headers
    pub fn verify_request(&self, request: &InboundRequest) -> Result<VerificationResult> {
        let snapshot = self.config.current();
        let provider = snapshot
            .provider(&request.provider_id)
            .ok_or_else(|| HookGuardError::unconfigured_provider(&request.provider_id))?;

        let outcome = self.check_request(provider, request);
        Ok(self.to_result(provider, &request.raw_body, outcome))
    }

    /// Typed form of [`verify_request`](Self::verify_request) against a
    /// config snapshot the caller already holds
    pub fn authenticate(&self, provider: &ProviderConfig, request: &InboundRequest) -> Result<()> {
        self.check_request(provider, request).map_err(HookGuardError::from)
    }

    fn check_request(
        &self,
        provider: &ProviderConfig,
        request: &InboundRequest,
    ) -> std::result::Result<(), SecurityViolation> {
        let signature = request.header(&provider.signature_header);
        let timestamp = provider
            .timestamp_header
            .as_deref()
            .and_then(|name| request.header(name))
            .and_then(|raw| raw.trim().parse::<i64>().ok());

        self.check(
            provider,
            &request.raw_body,
            signature,
            timestamp,
            &request.headers,
            request.request_url.as_deref(),
        )
    }

    fn check(
        &self,
        provider: &ProviderConfig,
        raw_payload: &[u8],
        signature: Option<&str>,
        timestamp: Option<i64>,
        headers: &HashMap<String, String>,
        request_url: Option<&str>,
    ) -> std::result::Result<(), SecurityViolation> {
        let result = self.check_inner(provider, raw_payload, signature, timestamp, headers, request_url);

        if let Err(violation) = &result {
            metrics::counter!("hookguard_signature_failures_total", "provider" => provider.provider_id.clone())
                .increment(1);
            warn!(
                provider_id = %provider.provider_id,
                reason = %violation,
                "Webhook signature rejected"
            );
        }
        result
    }

    fn check_inner(
        &self,
        provider: &ProviderConfig,
        raw_payload: &[u8],
        signature: Option<&str>,
        timestamp: Option<i64>,
        headers: &HashMap<String, String>,
        request_url: Option<&str>,
    ) -> std::result::Result<(), SecurityViolation> {
        let signature = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(SecurityViolation::MissingSignature)?;

        let scheme = self
            .scheme_for(provider)
            .ok_or_else(|| SecurityViolation::InvalidSignature("no verifier for scheme".to_string()))?;

        // The tolerance window bounds validity regardless of signature correctness
        let timestamp = timestamp.or_else(|| scheme.embedded_timestamp(signature));
        if let Some(tolerance) = provider.timestamp_tolerance_secs {
            match timestamp {
                Some(ts) => {
                    let skew = self.clock.now().timestamp() - ts;
                    if skew.unsigned_abs() > tolerance {
                        return Err(SecurityViolation::StaleTimestamp {
                            skew_secs: skew,
                            tolerance_secs: tolerance,
                        });
                    }
                }
                None if provider.scheme == SignatureScheme::TimestampedHmacSha256 => {
                    return Err(SecurityViolation::InvalidSignature("missing timestamp".to_string()));
                }
                None => {}
            }
        }

        let request = SignedRequest {
            payload: raw_payload,
            signature,
            headers,
            request_url,
        };

        let mut last_reason = String::from("no secrets configured");
        for (index, secret) in provider.secrets.iter().enumerate() {
            match scheme.verify(&request, secret.as_bytes()) {
                Ok(()) => {
                    debug!(
                        provider_id = %provider.provider_id,
                        scheme = scheme.name(),
                        secret_index = index,
                        "Webhook signature verified"
                    );
                    return Ok(());
                }
                Err(reason) => last_reason = reason,
            }
        }

        Err(SecurityViolation::InvalidSignature(last_reason))
    }

    fn to_result(
        &self,
        provider: &ProviderConfig,
        raw_payload: &[u8],
        outcome: std::result::Result<(), SecurityViolation>,
    ) -> VerificationResult {
        match outcome {
            Ok(()) => {
                let parsed = serde_json::from_slice::<serde_json::Value>(raw_payload).ok();
                VerificationResult::valid(Some(resolve_event_id(
                    &provider.provider_id,
                    raw_payload,
                    parsed.as_ref(),
                    &provider.event_id_field,
                )))
            }
            Err(violation) => VerificationResult::invalid(violation.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hg_common::{ErrorKind, ManualClock};
    use hg_config::GuardConfig;

    const T0: i64 = 1_700_000_000;

    fn verifier_with(providers: Vec<ProviderConfig>) -> (Arc<ManualClock>, SignatureVerifier) {
        let mut config = GuardConfig::default();
        for provider in providers {
            config = config.with_provider(provider);
        }
        let store = Arc::new(ConfigStore::new(config).unwrap());
        let clock = Arc::new(ManualClock::at_unix(T0));
        (clock.clone(), SignatureVerifier::new(store, clock))
    }

    fn alpha() -> ProviderConfig {
        ProviderConfig::new("alpha", SignatureScheme::TimestampedHmacSha256, "k").with_tolerance(300)
    }

    fn sign_alpha(payload: &[u8], at: i64) -> String {
        TimestampedHmacSha256.sign(&SigningInput::payload(payload).at(at), b"k").unwrap()
    }

    #[test]
    fn test_tolerance_window() {
        let (clock, verifier) = verifier_with(vec![alpha()]);
        let payload = br#"{"id":"evt_1"}"#;
        let signature = sign_alpha(payload, T0);

        clock.set(chrono::DateTime::from_timestamp(T0 + 301, 0).unwrap());
        let stale = verifier.verify("alpha", payload, Some(&signature), None, None).unwrap();
        assert!(!stale.valid);
        assert!(stale.reason.unwrap().contains("timestamp outside tolerance"));

        clock.set(chrono::DateTime::from_timestamp(T0 + 100, 0).unwrap());
        let fresh = verifier.verify("alpha", payload, Some(&signature), None, None).unwrap();
        assert!(fresh.valid);
        assert_eq!(fresh.extracted_event_id.as_deref(), Some("evt_1"));
        assert!(!fresh.is_replay);
    }

    #[test]
    fn test_future_timestamp_also_rejected() {
        let (_, verifier) = verifier_with(vec![alpha()]);
        let payload = b"{}";
        let signature = sign_alpha(payload, T0 + 400);
        let result = verifier.verify("alpha", payload, Some(&signature), None, None).unwrap();
        assert!(!result.valid);
    }

    #[test]
    fn test_stale_check_runs_before_signature() {
        let (clock, verifier) = verifier_with(vec![alpha()]);
        clock.advance_secs(1000);
        let forged = format!("t={},v1={}", T0, "ab".repeat(32));
        let result = verifier.verify("alpha", b"{}", Some(&forged), None, None).unwrap();
        assert!(result.reason.unwrap().contains("timestamp"));
    }

    #[test]
    fn test_any_mutated_byte_is_rejected() {
        let (_, verifier) = verifier_with(vec![alpha()]);
        let payload = br#"{"id":"evt_1","amount":1200}"#.to_vec();
        let signature = sign_alpha(&payload, T0);
        assert!(verifier.verify("alpha", &payload, Some(&signature), None, None).unwrap().valid);

        for i in 0..payload.len() {
            let mut tampered = payload.clone();
            tampered[i] ^= 0x01;
            let result = verifier.verify("alpha", &tampered, Some(&signature), None, None).unwrap();
            assert!(!result.valid, "payload byte {} flip accepted", i);
        }

        let digest_start = signature.find("v1=").unwrap() + 3;
        for i in digest_start..signature.len() {
            let mut tampered = signature.clone().into_bytes();
            tampered[i] = if tampered[i] == b'0' { b'1' } else { b'0' };
            let tampered = String::from_utf8(tampered).unwrap();
            let result = verifier.verify("alpha", &payload, Some(&tampered), None, None).unwrap();
            assert!(!result.valid, "signature byte {} change accepted", i);
        }
    }

    #[test]
    fn test_unknown_provider_is_permanent_failure() {
        let (_, verifier) = verifier_with(vec![alpha()]);
        let err = verifier.verify("ghost", b"{}", Some("x"), None, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermanentValidationFailure);
    }

    #[test]
    fn test_missing_signature() {
        let (_, verifier) = verifier_with(vec![alpha()]);
        let result = verifier.verify("alpha", b"{}", None, None, None).unwrap();
        assert_eq!(result.reason.as_deref(), Some("missing signature header"));
        let blank = verifier.verify("alpha", b"{}", Some("  "), None, None).unwrap();
        assert!(!blank.valid);
    }

    #[test]
    fn test_rotated_secrets_all_accepted() {
        let mut provider = ProviderConfig::new("mailer", SignatureScheme::HmacSha256Hex, "new-secret");
        provider.secrets.push("old-secret".to_string());
        let (_, verifier) = verifier_with(vec![provider]);

        let payload = br#"{"id":"m1"}"#;
        for secret in ["new-secret", "old-secret"] {
            let signature = HmacSha256Hex.sign(&SigningInput::payload(payload), secret.as_bytes()).unwrap();
            assert!(verifier.verify("mailer", payload, Some(&signature), None, None).unwrap().valid);
        }
        let retired = HmacSha256Hex.sign(&SigningInput::payload(payload), b"retired").unwrap();
        assert!(!verifier.verify("mailer", payload, Some(&retired), None, None).unwrap().valid);
    }

    #[test]
    fn test_verify_request_reads_configured_headers() {
        let mut provider = ProviderConfig::new("fleet", SignatureScheme::HmacSha256Hex, "k").with_tolerance(60);
        provider.signature_header = "x-fleet-signature".to_string();
        provider.timestamp_header = Some("x-fleet-timestamp".to_string());
        let (_, verifier) = verifier_with(vec![provider]);

        let payload = br#"{"vehicle":"v9"}"#;
        let signature = HmacSha256Hex.sign(&SigningInput::payload(payload), b"k").unwrap();

        let request = InboundRequest::new("fleet", payload.to_vec())
            .with_header("X-Fleet-Signature", signature.clone())
            .with_header("X-Fleet-Timestamp", T0.to_string());
        let result = verifier.verify_request(&request).unwrap();
        assert!(result.valid);
        assert!(result.extracted_event_id.unwrap().starts_with("derived_"));

        let stale = InboundRequest::new("fleet", payload.to_vec())
            .with_header("X-Fleet-Signature", signature)
            .with_header("X-Fleet-Timestamp", (T0 - 61).to_string());
        assert!(!verifier.verify_request(&stale).unwrap().valid);
    }

    #[test]
    fn test_registered_verifier_overrides_scheme() {
        struct AcceptAll;
        impl SchemeVerifier for AcceptAll {
            fn name(&self) -> &'static str {
                "accept_all"
            }
            fn verify(&self, _: &SignedRequest<'_>, _: &[u8]) -> std::result::Result<(), String> {
                Ok(())
            }
            fn sign(&self, _: &SigningInput<'_>, _: &[u8]) -> std::result::Result<String, String> {
                Ok("any".to_string())
            }
        }

        let (_, mut verifier) = verifier_with(vec![ProviderConfig::new(
            "sandbox",
            SignatureScheme::HmacSha256Hex,
            "k",
        )]);
        assert!(!verifier.verify("sandbox", b"{}", Some("bogus"), None, None).unwrap().valid);
        verifier.register("sandbox", Arc::new(AcceptAll));
        assert!(verifier.verify("sandbox", b"{}", Some("bogus"), None, None).unwrap().valid);
    }

    #[test]
    fn test_authenticate_returns_typed_violation() {
        let (clock, verifier) = verifier_with(vec![alpha()]);
        let payload = b"{}";
        let request = InboundRequest::new("alpha", payload.to_vec()).with_header("x-signature", sign_alpha(payload, T0));
        clock.advance_secs(301);

        let snapshot = verifier.config.current();
        let err = verifier.authenticate(snapshot.provider("alpha").unwrap(), &request).unwrap_err();
        assert!(matches!(
            err,
            HookGuardError::SecurityViolation(SecurityViolation::StaleTimestamp { skew_secs: 301, tolerance_secs: 300 })
        ));
    }
}
