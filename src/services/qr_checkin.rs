use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use qrcode::render::svg;
use qrcode::QrCode;
use ring::hmac;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tokens issued slightly in the future are tolerated up to this skew
const CLOCK_SKEW_SECS: i64 = 30;

#[derive(thiserror::Error, Debug)]
pub enum QrTokenError {
    #[error("token is malformed")]
    Malformed,

    #[error("token signature does not match")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("token issued in the future")]
    NotYetValid,

    #[error("token does not belong to this facility")]
    WrongFacility,

    #[error("JSON serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("QR code generation failed: {0}")]
    Render(#[from] qrcode::types::QrError),
}

/// Body of a facility check-in QR code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrCheckinPayload {
    pub facility_id: Uuid,
    /// Unix seconds
    pub issued_at: i64,
}

/// Issues and verifies the signed tokens a facility displays for QR check-in.
///
/// Token format: `base64url(json payload) "." hex(HMAC-SHA256(encoded payload))`
#[derive(Clone)]
pub struct QrSigner {
    key: hmac::Key,
    ttl: Duration,
}

impl std::fmt::Debug for QrSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QrSigner").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl QrSigner {
    pub fn new(signing_key: &[u8], ttl: Duration) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, signing_key),
            ttl,
        }
    }

    pub fn issue(&self, facility_id: Uuid, now: DateTime<Utc>) -> Result<String, QrTokenError> {
        let payload = QrCheckinPayload {
            facility_id,
            issued_at: now.timestamp(),
        };
        let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?);
        let tag = hmac::sign(&self.key, encoded.as_bytes());

        Ok(format!("{}.{}", encoded, hex::encode(tag.as_ref())))
    }

    /// Checks signature and freshness, returning the facility the token was issued for
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<QrCheckinPayload, QrTokenError> {
        let (encoded, signature) = token.trim().split_once('.').ok_or(QrTokenError::Malformed)?;
        let signature = hex::decode(signature).map_err(|_| QrTokenError::Malformed)?;

        hmac::verify(&self.key, encoded.as_bytes(), &signature)
            .map_err(|_| QrTokenError::BadSignature)?;

        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| QrTokenError::Malformed)?;
        let payload: QrCheckinPayload = serde_json::from_slice(&raw)?;

        let age = now.timestamp() - payload.issued_at;
        if age < -CLOCK_SKEW_SECS {
            return Err(QrTokenError::NotYetValid);
        }
        if age > self.ttl.num_seconds() {
            return Err(QrTokenError::Expired);
        }

        Ok(payload)
    }
}

/// Renders a token as an SVG QR code
pub fn render_svg(token: &str) -> Result<String, QrTokenError> {
    let code = QrCode::new(token.as_bytes())?;
    let svg = code.render::<svg::Color>().min_dimensions(200, 200).build();

    Ok(svg)
}
