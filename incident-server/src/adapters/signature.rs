use super::AdapterError;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over the raw body, hex encoded in a provider header.
#[derive(Clone, Debug)]
pub struct SignatureCheck {
    header: &'static str,
    /// Scheme tag such as `v1=`; when set, the header may carry several
    /// comma-separated signatures and any one of them may match.
    scheme: Option<&'static str>,
    secret: Option<String>,
}

impl SignatureCheck {
    pub fn new(header: &'static str, secret: Option<String>) -> Self {
        Self {
            header,
            scheme: None,
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn with_scheme(mut self, scheme: &'static str) -> Self {
        self.scheme = Some(scheme);
        self
    }

    pub fn header(&self) -> &'static str {
        self.header
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    pub fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), AdapterError> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let value = headers
            .get(self.header)
            .and_then(|v| v.to_str().ok())
            .ok_or(AdapterError::MissingSignature(self.header))?;

        let candidates: Vec<&str> = match self.scheme {
            Some(scheme) => value
                .split(',')
                .filter_map(|part| part.trim().strip_prefix(scheme))
                .collect(),
            None => vec![value.trim()],
        };

        for candidate in candidates {
            let Ok(expected) = hex::decode(candidate) else {
                continue;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
                return Err(AdapterError::InvalidSignature);
            };
            mac.update(body);
            if mac.verify_slice(&expected).is_ok() {
                return Ok(());
            }
        }
        Err(AdapterError::InvalidSignature)
    }
}

/// Hex HMAC-SHA256 of `body`; what a provider puts in its signature header.
pub fn sign_hex(secret: &str, body: &[u8]) -> String {
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(body);
            hex::encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    }
}
