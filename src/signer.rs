//! SigV4 request signing
//!
//! Produces the header set for a signed HTTP request: canonical headers,
//! canonical request, string-to-sign, derived signing key, and the final
//! Authorization header. Used for the cloud log service calls.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::AgentError;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const DEFAULT_CONTENT_TYPE: &str = "application/x-amz-json-1.1";

/// Short-lived cloud credentials obtained from the provisioning service
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret: String,
    pub session_token: Option<String>,
    pub region: String,
    pub expires: Option<DateTime<Utc>>,
}

/// One request to be signed
#[derive(Debug, Clone)]
pub struct SignRequest<'a> {
    pub region: &'a str,
    pub service: &'a str,
    /// X-Amz-Target header value (service operation)
    pub target: Option<&'a str>,
    pub method: &'a str,
    /// Absolute path starting with '/'
    pub path: &'a str,
    /// Canonical query string ("" when none)
    pub query: &'a str,
    pub body: &'a [u8],
    pub content_type: Option<&'a str>,
    /// Override for the Host header; defaults to <service>.<region>.amazonaws.com
    pub host: Option<&'a str>,
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Derive the signing key: HMAC chain over date, region, service, terminator.
fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> [u8; 32] {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Sign a request at the current time.
pub fn sign(
    req: &SignRequest<'_>,
    creds: &Credentials,
) -> Result<Vec<(String, String)>, AgentError> {
    sign_at(req, creds, Utc::now())
}

/// Sign a request at an explicit time. The timestamp parameter keeps the
/// canonical construction deterministic for tests.
pub fn sign_at(
    req: &SignRequest<'_>,
    creds: &Credentials,
    now: DateTime<Utc>,
) -> Result<Vec<(String, String)>, AgentError> {
    if req.region.is_empty() || req.service.is_empty() {
        return Err(AgentError::BadArgs("signer needs region and service".into()));
    }
    if creds.access_key.is_empty() || creds.secret.is_empty() {
        return Err(AgentError::BadState("cloud access keys not defined".into()));
    }

    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let http_date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();

    let content_type = req.content_type.unwrap_or(DEFAULT_CONTENT_TYPE);
    let default_host = format!("{}.{}.amazonaws.com", req.service, req.region);
    let host = req.host.unwrap_or(default_host.as_str());
    let payload_hash = sha256_hex(req.body);

    // Canonical headers: lowercase, sorted, newline terminated
    let mut canonical_headers = format!(
        "content-type:{}\nhost:{}\nx-amz-date:{}\n",
        content_type, host, amz_date
    );
    let mut signed_headers = String::from("content-type;host;x-amz-date");
    if let Some(token) = &creds.session_token {
        canonical_headers.push_str(&format!("x-amz-security-token:{}\n", token));
        signed_headers.push_str(";x-amz-security-token");
    }
    if let Some(target) = req.target {
        canonical_headers.push_str(&format!("x-amz-target:{}\n", target));
        signed_headers.push_str(";x-amz-target");
    }

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        req.method, req.path, req.query, canonical_headers, signed_headers, payload_hash
    );

    let scope = format!("{}/{}/{}/aws4_request", date, req.region, req.service);
    let to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let key = signing_key(&creds.secret, &date, req.region, req.service);
    let signature = hex::encode(hmac_sha256(&key, to_sign.as_bytes()));

    let authorization = format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM, creds.access_key, scope, signed_headers, signature
    );

    let mut headers = vec![
        ("Authorization".to_string(), authorization),
        ("Date".to_string(), http_date),
        ("X-Amz-Content-sha256".to_string(), payload_hash),
        ("X-Amz-Date".to_string(), amz_date),
    ];
    if let Some(token) = &creds.session_token {
        headers.push(("X-Amz-Security-Token".to_string(), token.clone()));
    }
    if let Some(target) = req.target {
        headers.push(("X-Amz-Target".to_string(), target.to_string()));
    }
    headers.push(("Content-Type".to_string(), content_type.to_string()));
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_creds() -> Credentials {
        Credentials {
            access_key: "AKIDEXAMPLE".to_string(),
            secret: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: None,
            region: "us-east-1".to_string(),
            expires: None,
        }
    }

    /// The documented GET-ListUsers reference vector.
    #[test]
    fn test_reference_signature() {
        let req = SignRequest {
            region: "us-east-1",
            service: "iam",
            target: None,
            method: "GET",
            path: "/",
            query: "Action=ListUsers&Version=2010-05-08",
            body: b"",
            content_type: Some("application/x-www-form-urlencoded; charset=utf-8"),
            host: Some("iam.amazonaws.com"),
        };
        let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();
        let headers = sign_at(&req, &test_creds(), now).unwrap();

        let auth = &headers
            .iter()
            .find(|(k, _)| k == "Authorization")
            .unwrap()
            .1;
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/iam/aws4_request"
        ));
        assert!(auth.contains("SignedHeaders=content-type;host;x-amz-date"));
        assert!(auth.ends_with(
            "Signature=5d672d79c15b13162d9279b0855cfba6789a8edb4c82c400e06b5924a6f2b5d7"
        ));
    }

    #[test]
    fn test_session_token_is_signed_and_passed_through() {
        let mut creds = test_creds();
        creds.session_token = Some("SESSIONTOKEN".to_string());
        let req = SignRequest {
            region: "us-east-1",
            service: "logs",
            target: Some("Logs_20140328.PutLogEvents"),
            method: "POST",
            path: "/",
            query: "",
            body: b"{}",
            content_type: None,
            host: None,
        };
        let headers = sign_at(&req, &creds, Utc::now()).unwrap();
        let auth = &headers.iter().find(|(k, _)| k == "Authorization").unwrap().1;
        assert!(auth.contains("x-amz-security-token"));
        assert!(auth.contains("x-amz-target"));
        assert!(headers.iter().any(|(k, v)| k == "X-Amz-Security-Token" && v == "SESSIONTOKEN"));
        assert!(headers
            .iter()
            .any(|(k, v)| k == "X-Amz-Target" && v == "Logs_20140328.PutLogEvents"));
    }

    #[test]
    fn test_missing_keys_rejected() {
        let creds = Credentials {
            access_key: String::new(),
            secret: String::new(),
            session_token: None,
            region: "us-east-1".to_string(),
            expires: None,
        };
        let req = SignRequest {
            region: "us-east-1",
            service: "logs",
            target: None,
            method: "POST",
            path: "/",
            query: "",
            body: b"",
            content_type: None,
            host: None,
        };
        assert!(sign_at(&req, &creds, Utc::now()).is_err());
    }
}
