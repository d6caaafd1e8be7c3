//! S3 artifact mirror
//!
//! Uploads release artifacts with AWS Signature V4 presigned PUT URLs; no
//! SDK, just the signing arithmetic and one HTTP call per object.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::S3Configuration;
use crate::service::ApiError;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const REQUEST_SCOPE: &str = "aws4_request";
const URL_EXPIRY_SECONDS: u64 = 86400;

type HmacSha256 = Hmac<Sha256>;

/// Destination for mirrored artifacts.
#[async_trait]
pub trait BlobUploader: Send + Sync {
    /// Publicly reachable URL of an uploaded object.
    fn object_url(&self, path: &str) -> String;

    /// Store one object.
    async fn upload(&self, path: &str, content: Vec<u8>) -> Result<(), ApiError>;
}

/// S3 client bound to one bucket
pub struct S3Client {
    http: Client,
    access_key: String,
    secret_key: String,
    bucket: String,
    region: String,
    storage_class: String,
}

impl S3Client {
    pub fn new(config: &S3Configuration, timeout_secs: u64) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(ApiError::Request)?;

        Ok(Self {
            http,
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            storage_class: config.storage_class.clone(),
        })
    }

    fn host(&self) -> String {
        format!("{}.s3.amazonaws.com", self.bucket)
    }

    /// Build the presigned PUT URL for one object.
    fn presigned_put_url(&self, path: &str, payload_hash: &str, amz_date: &str) -> String {
        let host = self.host();
        let uri = format!("/{}", aws_quote(path, true));
        let date = &amz_date[..8];
        let credential = format!(
            "{}/{}/{}/{}/{}",
            self.access_key, date, self.region, SERVICE, REQUEST_SCOPE
        );

        let mut params = vec![
            ("X-Amz-Algorithm".to_string(), ALGORITHM.to_string()),
            ("X-Amz-Credential".to_string(), credential),
            ("X-Amz-Date".to_string(), amz_date.to_string()),
            ("X-Amz-Expires".to_string(), URL_EXPIRY_SECONDS.to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        params.sort();

        let canonical_query = params
            .iter()
            .map(|(key, value)| format!("{}={}", aws_quote(key, false), aws_quote(value, false)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "PUT\n{}\n{}\nhost:{}\n\nhost\n{}",
            uri, canonical_query, host, payload_hash
        );

        let scope = format!("{}/{}/{}/{}", date, self.region, SERVICE, REQUEST_SCOPE);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let k_date = hmac_sha256(
            format!("AWS4{}", self.secret_key).as_bytes(),
            date.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
        let k_signing = hmac_sha256(&k_service, REQUEST_SCOPE.as_bytes());
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

        format!(
            "https://{}{}?{}&X-Amz-Signature={}",
            host, uri, canonical_query, signature
        )
    }
}

#[async_trait]
impl BlobUploader for S3Client {
    fn object_url(&self, path: &str) -> String {
        format!("https://s3.amazonaws.com/{}/{}", self.bucket, path)
    }

    async fn upload(&self, path: &str, content: Vec<u8>) -> Result<(), ApiError> {
        let payload_hash = hex::encode(Sha256::digest(&content));
        let amz_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let url = self.presigned_put_url(path, &payload_hash, &amz_date);

        debug!("uploading {} bytes to s3://{}/{}", content.len(), self.bucket, path);

        let content_type = mime_guess::from_path(path).first_or_octet_stream();
        let response = self
            .http
            .put(&url)
            .header("Content-Type", content_type.as_ref())
            .header("X-Amz-Content-Sha256", payload_hash)
            .header("X-Amz-Storage-Class", &self.storage_class)
            .body(content)
            .send()
            .await
            .map_err(ApiError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Percent-encode for AWS canonical requests: unreserved characters pass
/// through, optionally `/` as well (for URI paths).
fn aws_quote(input: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if keep_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> S3Client {
        let config = S3Configuration {
            access_key: "AKIDEXAMPLE".into(),
            secret_key: "secret".into(),
            bucket: "builds".into(),
            region: "us-east-1".into(),
            storage_class: "STANDARD".into(),
            ..Default::default()
        };
        S3Client::new(&config, 600).unwrap()
    }

    #[test]
    fn test_aws_quote() {
        assert_eq!(aws_quote("a b+c", false), "a%20b%2Bc");
        assert_eq!(aws_quote("path/to/file.gz", true), "path/to/file.gz");
        assert_eq!(aws_quote("path/to/file.gz", false), "path%2Fto%2Ffile.gz");
        assert_eq!(aws_quote("ok-._~", false), "ok-._~");
    }

    #[test]
    fn test_object_url() {
        assert_eq!(
            client().object_url("nightly/dev20230815/os-board.gz"),
            "https://s3.amazonaws.com/builds/nightly/dev20230815/os-board.gz"
        );
    }

    #[test]
    fn test_presigned_url_shape() {
        let payload_hash = hex::encode(Sha256::digest(b"content"));
        let url = client().presigned_put_url("nightly/os-board.gz", &payload_hash, "20230815T103000Z");

        assert!(url.starts_with("https://builds.s3.amazonaws.com/nightly/os-board.gz?"));
        assert!(url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(url.contains(
            "X-Amz-Credential=AKIDEXAMPLE%2F20230815%2Fus-east-1%2Fs3%2Faws4_request"
        ));
        assert!(url.contains("X-Amz-Date=20230815T103000Z"));
        assert!(url.contains("X-Amz-SignedHeaders=host"));

        let signature = url.rsplit("X-Amz-Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_presigned_url_deterministic() {
        let payload_hash = hex::encode(Sha256::digest(b"content"));
        let a = client().presigned_put_url("k", &payload_hash, "20230815T103000Z");
        let b = client().presigned_put_url("k", &payload_hash, "20230815T103000Z");
        assert_eq!(a, b);

        let c = client().presigned_put_url("k", &payload_hash, "20230815T103001Z");
        assert_ne!(a, c);
    }
}
