// service/signature.rs
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Signatures older or newer than this many seconds are rejected outright,
/// even when the hash itself is correct.
pub const FRESHNESS_WINDOW_SECS: i64 = 300;

/// Verify an inbound webhook signature.
///
/// The signature header carries `ts=<unix>,v1=<hex>`. The hash is an
/// HMAC-SHA256 over the canonical manifest
/// `id:<subject_id>;request-id:<request_id>;ts:<ts>;` keyed with the shared
/// webhook secret. Every failure mode returns `false`; this function performs
/// no I/O and never panics.
pub fn verify_webhook_signature(
    signature_header: &str,
    request_id: &str,
    subject_id: &str,
    secret: &str,
) -> bool {
    verify_webhook_signature_at(
        signature_header,
        request_id,
        subject_id,
        secret,
        chrono::Utc::now().timestamp(),
    )
}

/// Same as [`verify_webhook_signature`], with the clock injected.
pub fn verify_webhook_signature_at(
    signature_header: &str,
    request_id: &str,
    subject_id: &str,
    secret: &str,
    now_ts: i64,
) -> bool {
    if signature_header.is_empty() || request_id.is_empty() || subject_id.is_empty() {
        return false;
    }

    let Some((ts, supplied_hash)) = parse_signature_header(signature_header) else {
        return false;
    };

    // Reject both stale and future timestamps.
    if (now_ts - ts).abs() > FRESHNESS_WINDOW_SECS {
        return false;
    }

    let manifest = format!("id:{};request-id:{};ts:{};", subject_id, request_id, ts);

    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(manifest.as_bytes());

    let expected_hex = hex::encode(mac.finalize().into_bytes());

    // Constant-time comparison to prevent timing attacks.
    ConstantTimeEq::ct_eq(supplied_hash.as_bytes(), expected_hex.as_bytes()).into()
}

fn parse_signature_header(header: &str) -> Option<(i64, &str)> {
    let mut ts = None;
    let mut hash = None;

    for part in header.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        match key {
            "ts" => ts = Some(value.parse::<i64>().ok()?),
            "v1" => hash = Some(value),
            _ => return None,
        }
    }

    Some((ts?, hash?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    const SECRET: &str = "whsec_test_secret";
    const REQUEST_ID: &str = "req-abc-123";
    const SUBJECT: &str = "pay-42";

    fn sign(subject_id: &str, request_id: &str, ts: i64, secret: &str) -> String {
        let manifest = format!("id:{};request-id:{};ts:{};", subject_id, request_id, ts);
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(manifest.as_bytes());
        format!("ts={},v1={}", ts, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_a_valid_signature() {
        let now = 1_700_000_000;
        let header = sign(SUBJECT, REQUEST_ID, now, SECRET);
        assert!(verify_webhook_signature_at(
            &header, REQUEST_ID, SUBJECT, SECRET, now
        ));
    }

    #[test]
    fn verification_is_deterministic() {
        let now = 1_700_000_000;
        let header = sign(SUBJECT, REQUEST_ID, now, SECRET);
        for _ in 0..5 {
            assert!(verify_webhook_signature_at(
                &header, REQUEST_ID, SUBJECT, SECRET, now
            ));
        }
    }

    #[test]
    fn rejects_a_tampered_hash() {
        let now = 1_700_000_000;
        let header = sign(SUBJECT, REQUEST_ID, now, SECRET);
        let last = header.chars().last().unwrap();
        let flipped = if last == '0' { '1' } else { '0' };
        let mut tampered = header[..header.len() - 1].to_string();
        tampered.push(flipped);
        assert!(!verify_webhook_signature_at(
            &tampered, REQUEST_ID, SUBJECT, SECRET, now
        ));
    }

    #[test]
    fn rejects_mutated_manifest_fields() {
        let now = 1_700_000_000;
        let header = sign(SUBJECT, REQUEST_ID, now, SECRET);
        assert!(!verify_webhook_signature_at(
            &header, "req-abc-124", SUBJECT, SECRET, now
        ));
        assert!(!verify_webhook_signature_at(
            &header, REQUEST_ID, "pay-43", SECRET, now
        ));
        assert!(!verify_webhook_signature_at(
            &header, REQUEST_ID, SUBJECT, "other_secret", now
        ));
    }

    #[test]
    fn rejects_stale_and_future_timestamps() {
        let now = 1_700_000_000;

        let stale = sign(SUBJECT, REQUEST_ID, now - FRESHNESS_WINDOW_SECS - 1, SECRET);
        assert!(!verify_webhook_signature_at(
            &stale, REQUEST_ID, SUBJECT, SECRET, now
        ));

        let future = sign(SUBJECT, REQUEST_ID, now + FRESHNESS_WINDOW_SECS + 1, SECRET);
        assert!(!verify_webhook_signature_at(
            &future, REQUEST_ID, SUBJECT, SECRET, now
        ));

        // Boundary: exactly at the edge of the window is still accepted.
        let edge = sign(SUBJECT, REQUEST_ID, now - FRESHNESS_WINDOW_SECS, SECRET);
        assert!(verify_webhook_signature_at(
            &edge, REQUEST_ID, SUBJECT, SECRET, now
        ));
    }

    #[test]
    fn rejects_malformed_headers() {
        let now = 1_700_000_000;
        for header in [
            "",
            "v1=deadbeef",
            "ts=1700000000",
            "ts=abc,v1=deadbeef",
            "ts=1700000000;v1=deadbeef",
            "ts=1700000000,v2=deadbeef",
            "garbage",
        ] {
            assert!(
                !verify_webhook_signature_at(header, REQUEST_ID, SUBJECT, SECRET, now),
                "header {:?} should be rejected",
                header
            );
        }
    }

    #[test]
    fn rejects_missing_inputs() {
        let now = 1_700_000_000;
        let header = sign(SUBJECT, REQUEST_ID, now, SECRET);
        assert!(!verify_webhook_signature_at(&header, "", SUBJECT, SECRET, now));
        assert!(!verify_webhook_signature_at(&header, REQUEST_ID, "", SECRET, now));
        assert!(!verify_webhook_signature_at("", REQUEST_ID, SUBJECT, SECRET, now));
    }
}
