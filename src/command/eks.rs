use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::Mac;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::command::Error;
use crate::secret::Secret;

pub const PROVIDER: &str = "eks";

const TOKEN_PREFIX: &str = "k8s-aws-v1.";
const CLUSTER_ID_HEADER: &str = "x-k8s-aws-id";
const DEFAULT_REGION: &str = "us-east-1";
const SERVICE: &str = "sts";
const PRESIGN_EXPIRY_SECONDS: i64 = 60;
// The API server rejects the presigned URL after 15 minutes.
const TOKEN_LIFETIME_MINUTES: i64 = 14;

type HmacSha256 = hmac::Hmac<Sha256>;

/// Static AWS credentials, read from the standard `AWS_*` environment variables.
#[derive(Debug)]
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: Secret<String>,
    session_token: Option<String>,
    region: String,
}

impl AwsCredentials {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, Error> {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.is_empty());

        let access_key_id = non_empty("AWS_ACCESS_KEY_ID").ok_or_else(|| {
            Error::InvalidArgument("AWS_ACCESS_KEY_ID must be set".to_string())
        })?;
        let secret_access_key = non_empty("AWS_SECRET_ACCESS_KEY").ok_or_else(|| {
            Error::InvalidArgument("AWS_SECRET_ACCESS_KEY must be set".to_string())
        })?;
        let region = non_empty("AWS_REGION")
            .or_else(|| non_empty("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        Ok(Self {
            access_key_id,
            secret_access_key: Secret::new(secret_access_key),
            session_token: non_empty("AWS_SESSION_TOKEN"),
            region,
        })
    }
}

/// Bearer token for an EKS cluster: a presigned STS `GetCallerIdentity` URL
/// bound to the cluster name through the `x-k8s-aws-id` signed header.
pub fn cluster_token(
    cluster: &str,
    credentials: &AwsCredentials,
    now: DateTime<Utc>,
) -> Result<String, Error> {
    let url = presign_caller_identity(cluster, credentials, now)?;
    Ok(format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(url)))
}

/// `ExecCredential` document printed for kubectl's exec credential plugin.
pub fn exec_credential(token: &str, now: DateTime<Utc>) -> Result<String, Error> {
    let expiration = now + Duration::minutes(TOKEN_LIFETIME_MINUTES);
    let credential = json!({
        "kind": "ExecCredential",
        "apiVersion": "client.authentication.k8s.io/v1beta1",
        "spec": {},
        "status": {
            "expirationTimestamp": expiration.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            "token": token,
        },
    });
    Ok(serde_json::to_string(&credential)?)
}

fn presign_caller_identity(
    cluster: &str,
    credentials: &AwsCredentials,
    now: DateTime<Utc>,
) -> Result<String, Error> {
    let host = format!("sts.{}.amazonaws.com", credentials.region);
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{date}/{}/{SERVICE}/aws4_request", credentials.region);
    let signed_headers = format!("host;{CLUSTER_ID_HEADER}");

    let mut query = vec![
        ("Action", "GetCallerIdentity".to_string()),
        ("Version", "2011-06-15".to_string()),
        ("X-Amz-Algorithm", "AWS4-HMAC-SHA256".to_string()),
        (
            "X-Amz-Credential",
            format!("{}/{scope}", credentials.access_key_id),
        ),
        ("X-Amz-Date", amz_date.clone()),
        ("X-Amz-Expires", PRESIGN_EXPIRY_SECONDS.to_string()),
        ("X-Amz-SignedHeaders", signed_headers.clone()),
    ];
    if let Some(token) = &credentials.session_token {
        query.push(("X-Amz-Security-Token", token.clone()));
    }
    query.sort_by(|a, b| a.0.cmp(b.0));

    let canonical_query = query
        .iter()
        .map(|(name, value)| format!("{}={}", uri_encode(name), uri_encode(value)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "GET\n/\n{canonical_query}\nhost:{host}\n{CLUSTER_ID_HEADER}:{cluster}\n\n{signed_headers}\n{}",
        hex::encode(Sha256::digest(b""))
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(
        credentials.secret_access_key.expose(),
        &date,
        &credentials.region,
        SERVICE,
    )?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    Ok(format!(
        "https://{host}/?{canonical_query}&X-Amz-Signature={signature}"
    ))
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>, Error> {
    let date_key = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let region_key = hmac_sha256(&date_key, region.as_bytes())?;
    let service_key = hmac_sha256(&region_key, service.as_bytes())?;
    hmac_sha256(&service_key, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::InvalidArgument(format!("Invalid signing key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Percent-encodes everything outside the RFC 3986 unreserved set.
fn uri_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(char::from(byte));
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::TimeZone;

    use super::*;

    fn credentials(session_token: Option<&str>) -> AwsCredentials {
        let mut env = HashMap::from([
            ("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE"),
            ("AWS_SECRET_ACCESS_KEY", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY"),
            ("AWS_REGION", "eu-west-1"),
        ]);
        if let Some(token) = session_token {
            env.insert("AWS_SESSION_TOKEN", token);
        }
        AwsCredentials::from_lookup(|name| env.get(name).map(ToString::to_string)).unwrap()
    }

    fn decode(token: &str) -> String {
        let encoded = token.strip_prefix(TOKEN_PREFIX).unwrap();
        String::from_utf8(URL_SAFE_NO_PAD.decode(encoded).unwrap()).unwrap()
    }

    #[test]
    fn test_signing_key_derivation() {
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        )
        .unwrap();
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("AKID/20240101/eu-west-1/sts"), "AKID%2F20240101%2Feu-west-1%2Fsts");
        assert_eq!(uri_encode("a+b=c~d"), "a%2Bb%3Dc~d");
    }

    #[test]
    fn test_cluster_token() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let token = cluster_token("prod", &credentials(None), now).unwrap();

        assert!(token.starts_with("k8s-aws-v1."));
        let url = decode(&token);
        assert!(url.starts_with("https://sts.eu-west-1.amazonaws.com/?Action=GetCallerIdentity&Version=2011-06-15&"));
        assert!(url.contains("X-Amz-Credential=AKIDEXAMPLE%2F20240102%2Feu-west-1%2Fsts%2Faws4_request"));
        assert!(url.contains("X-Amz-Date=20240102T030405Z"));
        assert!(url.contains("X-Amz-Expires=60"));
        assert!(url.contains("X-Amz-SignedHeaders=host%3Bx-k8s-aws-id"));
        assert!(!url.contains("X-Amz-Security-Token"));

        let signature = url.rsplit_once("X-Amz-Signature=").unwrap().1;
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));

        // Same inputs sign the same way; the cluster name is part of the signature.
        assert_eq!(token, cluster_token("prod", &credentials(None), now).unwrap());
        assert_ne!(token, cluster_token("staging", &credentials(None), now).unwrap());
    }

    #[test]
    fn test_cluster_token_with_session_token() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let url = decode(&cluster_token("prod", &credentials(Some("session/token")), now).unwrap());
        assert!(url.contains("X-Amz-Security-Token=session%2Ftoken"));
    }

    #[test]
    fn test_credentials_from_lookup() {
        let result = AwsCredentials::from_lookup(|_| None);
        assert!(matches!(result, Err(Error::InvalidArgument(msg)) if msg == "AWS_ACCESS_KEY_ID must be set"));

        let env = HashMap::from([
            ("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
            ("AWS_DEFAULT_REGION", "ap-south-1"),
        ]);
        let credentials =
            AwsCredentials::from_lookup(|name| env.get(name).map(ToString::to_string)).unwrap();
        assert_eq!(credentials.region, "ap-south-1");
        assert!(format!("{credentials:?}").contains("[REDACTED]"));
    }

    #[test]
    fn test_exec_credential() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let document: serde_json::Value =
            serde_json::from_str(&exec_credential("k8s-aws-v1.abc", now).unwrap()).unwrap();

        assert_eq!(document["kind"], "ExecCredential");
        assert_eq!(document["status"]["token"], "k8s-aws-v1.abc");
        assert_eq!(document["status"]["expirationTimestamp"], "2024-01-02T03:18:05Z");
    }
}
