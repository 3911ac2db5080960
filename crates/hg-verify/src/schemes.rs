//! Signing schemes
//!
//! Each scheme knows how to check a signature header against one secret and
//! how to produce one. All digest comparisons go through [`constant_time_eq`].

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

/// Everything a scheme may need from the inbound request
#[derive(Debug, Clone, Copy)]
pub struct SignedRequest<'a> {
    pub payload: &'a [u8],
    pub signature: &'a str,
    pub headers: &'a HashMap<String, String>,
    pub request_url: Option<&'a str>,
}

/// Inputs for producing a signature
#[derive(Debug, Clone, Copy)]
pub struct SigningInput<'a> {
    pub payload: &'a [u8],
    pub timestamp: Option<i64>,
    pub request_url: Option<&'a str>,
    pub content_type: Option<&'a str>,
}

impl<'a> SigningInput<'a> {
    pub fn payload(payload: &'a [u8]) -> Self {
        Self {
            payload,
            timestamp: None,
            request_url: None,
            content_type: None,
        }
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn for_url(mut self, url: &'a str) -> Self {
        self.request_url = Some(url);
        self
    }

    pub fn form_encoded(mut self) -> Self {
        self.content_type = Some(FORM_CONTENT_TYPE);
        self
    }
}

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// A provider signing strategy
pub trait SchemeVerifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Timestamp carried inside the signature header itself, if the scheme has one
    fn embedded_timestamp(&self, _signature: &str) -> Option<i64> {
        None
    }

    /// Check the request against one secret. `Err` carries the mismatch reason.
    fn verify(&self, request: &SignedRequest<'_>, secret: &[u8]) -> Result<(), String>;

    fn sign(&self, input: &SigningInput<'_>, secret: &[u8]) -> Result<String, String>;
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

fn hmac_sha256(secret: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, String> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| "invalid secret key".to_string())?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hmac_sha1(secret: &[u8], data: &[u8]) -> Result<Vec<u8>, String> {
    let mut mac = HmacSha1::new_from_slice(secret).map_err(|_| "invalid secret key".to_string())?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

// ============================================================================
// Timestamp-bound HMAC-SHA256 ("t=...,v1=...")
// ============================================================================

/// Header `t=<unix>,v1=<hex>[,v1=<hex>]`, digest over `"{t}.{payload}"`
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampedHmacSha256;

impl TimestampedHmacSha256 {
    fn parse(signature: &str) -> (Option<i64>, Vec<&str>) {
        let mut timestamp = None;
        let mut digests = Vec::new();
        for part in signature.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => digests.push(value),
                _ => {}
            }
        }
        (timestamp, digests)
    }
}

impl SchemeVerifier for TimestampedHmacSha256 {
    fn name(&self) -> &'static str {
        "timestamped_hmac_sha256"
    }

    fn embedded_timestamp(&self, signature: &str) -> Option<i64> {
        Self::parse(signature).0
    }

    fn verify(&self, request: &SignedRequest<'_>, secret: &[u8]) -> Result<(), String> {
        let (timestamp, digests) = Self::parse(request.signature);
        let timestamp = timestamp.ok_or_else(|| "signature header has no t= component".to_string())?;
        if digests.is_empty() {
            return Err("signature header has no v1= component".to_string());
        }

        let prefix = format!("{}.", timestamp);
        let expected = hmac_sha256(secret, &[prefix.as_bytes(), request.payload])?;

        let matched = digests.iter().any(|digest| {
            hex::decode(digest)
                .map(|provided| constant_time_eq(&provided, &expected))
                .unwrap_or(false)
        });

        if matched {
            Ok(())
        } else {
            Err("signature mismatch".to_string())
        }
    }

    fn sign(&self, input: &SigningInput<'_>, secret: &[u8]) -> Result<String, String> {
        let timestamp = input.timestamp.ok_or_else(|| "timestamp required".to_string())?;
        let prefix = format!("{}.", timestamp);
        let digest = hmac_sha256(secret, &[prefix.as_bytes(), input.payload])?;
        Ok(format!("t={},v1={}", timestamp, hex::encode(digest)))
    }
}

// ============================================================================
// URL + sorted parameters HMAC-SHA1
// ============================================================================

/// Base64 HMAC-SHA1 over the full request URL followed by every form
/// parameter as `key + value`, sorted by key
#[derive(Debug, Default, Clone, Copy)]
pub struct UrlParamsHmacSha1;

impl UrlParamsHmacSha1 {
    fn canonical_string(url: &str, payload: &[u8], content_type: Option<&str>) -> Result<String, String> {
        let mut canonical = url.to_string();

        let is_form = content_type
            .map(|ct| ct.to_ascii_lowercase().starts_with(FORM_CONTENT_TYPE))
            .unwrap_or(false);
        if !is_form || payload.is_empty() {
            return Ok(canonical);
        }

        let body = std::str::from_utf8(payload).map_err(|_| "form body is not UTF-8".to_string())?;
        let mut params = Vec::new();
        for pair in body.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            params.push((form_decode(key)?, form_decode(value)?));
        }
        params.sort();

        for (key, value) in params {
            canonical.push_str(&key);
            canonical.push_str(&value);
        }
        Ok(canonical)
    }
}

fn form_decode(raw: &str) -> Result<String, String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| format!("invalid percent-encoding in '{}'", raw))
}

impl SchemeVerifier for UrlParamsHmacSha1 {
    fn name(&self) -> &'static str {
        "url_params_hmac_sha1"
    }

    fn verify(&self, request: &SignedRequest<'_>, secret: &[u8]) -> Result<(), String> {
        let url = request
            .request_url
            .ok_or_else(|| "request URL required for this scheme".to_string())?;
        let content_type = request.headers.get("content-type").map(String::as_str);
        let canonical = Self::canonical_string(url, request.payload, content_type)?;

        let expected = hmac_sha1(secret, canonical.as_bytes())?;
        let provided = BASE64
            .decode(request.signature.trim())
            .map_err(|_| "signature is not valid base64".to_string())?;

        if constant_time_eq(&provided, &expected) {
            Ok(())
        } else {
            Err("signature mismatch".to_string())
        }
    }

    fn sign(&self, input: &SigningInput<'_>, secret: &[u8]) -> Result<String, String> {
        let url = input.request_url.ok_or_else(|| "request URL required".to_string())?;
        let canonical = Self::canonical_string(url, input.payload, input.content_type)?;
        Ok(BASE64.encode(hmac_sha1(secret, canonical.as_bytes())?))
    }
}

// ============================================================================
// Algorithm-prefixed base64 HMAC-SHA256 ("sha256=<base64>")
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct PrefixedHmacSha256Base64;

impl SchemeVerifier for PrefixedHmacSha256Base64 {
    fn name(&self) -> &'static str {
        "prefixed_hmac_sha256_base64"
    }

    fn verify(&self, request: &SignedRequest<'_>, secret: &[u8]) -> Result<(), String> {
        let (algorithm, digest) = request
            .signature
            .trim()
            .split_once('=')
            .ok_or_else(|| "expected '<algorithm>=<digest>'".to_string())?;
        if !algorithm.eq_ignore_ascii_case("sha256") && !algorithm.eq_ignore_ascii_case("hmac-sha256") {
            return Err(format!("unsupported digest algorithm '{}'", algorithm));
        }

        let provided = BASE64
            .decode(digest)
            .map_err(|_| "digest is not valid base64".to_string())?;
        let expected = hmac_sha256(secret, &[request.payload])?;

        if constant_time_eq(&provided, &expected) {
            Ok(())
        } else {
            Err("signature mismatch".to_string())
        }
    }

    fn sign(&self, input: &SigningInput<'_>, secret: &[u8]) -> Result<String, String> {
        Ok(format!("sha256={}", BASE64.encode(hmac_sha256(secret, &[input.payload])?)))
    }
}

// ============================================================================
// Raw hex HMAC-SHA256
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct HmacSha256Hex;

impl SchemeVerifier for HmacSha256Hex {
    fn name(&self) -> &'static str {
        "hmac_sha256_hex"
    }

    fn verify(&self, request: &SignedRequest<'_>, secret: &[u8]) -> Result<(), String> {
        let signature = request.signature.trim();
        let digest = signature.strip_prefix("sha256=").unwrap_or(signature);
        let provided = hex::decode(digest).map_err(|_| "signature is not valid hex".to_string())?;
        let expected = hmac_sha256(secret, &[request.payload])?;

        if constant_time_eq(&provided, &expected) {
            Ok(())
        } else {
            Err("signature mismatch".to_string())
        }
    }

    fn sign(&self, input: &SigningInput<'_>, secret: &[u8]) -> Result<String, String> {
        Ok(hex::encode(hmac_sha256(secret, &[input.payload])?))
    }
}
