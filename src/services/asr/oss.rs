//! OSS staging client
//!
//! The transcription service fetches its input over HTTP, so the audio is
//! staged in an OSS bucket: HEAD to check, PUT with a public-read ACL,
//! DELETE to clean up. Requests carry the header-based OSS signature
//! (HMAC-SHA1 over the canonical request, per the bucket API).

use crate::services::classify_http_status;
use crate::{Error, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::path::Path;

type HmacSha1 = Hmac<Sha1>;

const STEP: &str = "run_asr";
const ACL_HEADER: &str = "x-oss-object-acl";
const PUBLIC_READ: &str = "public-read";
const CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Clone)]
pub struct OssStorage {
    http: reqwest::Client,
    bucket: String,
    region: String,
    access_key_id: String,
    access_key_secret: String,
}

impl OssStorage {
    pub fn new(
        bucket: impl Into<String>,
        region: impl Into<String>,
        access_key_id: impl Into<String>,
        access_key_secret: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            bucket: bucket.into(),
            region: region.into(),
            access_key_id: access_key_id.into(),
            access_key_secret: access_key_secret.into(),
        }
    }

    fn host(&self) -> String {
        format!("{}.oss-{}.aliyuncs.com", self.bucket, self.region)
    }

    /// Public URL the transcription service downloads from.
    pub fn public_url(&self, key: &str) -> String {
        format!("https://{}/{}", self.host(), key)
    }

    fn http_date() -> String {
        chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string()
    }

    fn sign(&self, string_to_sign: &str) -> Result<String> {
        let mut mac = HmacSha1::new_from_slice(self.access_key_secret.as_bytes())
            .map_err(|e| Error::Infrastructure(format!("Invalid OSS secret: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn authorization(
        &self,
        verb: &str,
        content_type: &str,
        date: &str,
        canonical_headers: &str,
        key: &str,
    ) -> Result<String> {
        let string_to_sign = format!(
            "{verb}\n\n{content_type}\n{date}\n{canonical_headers}/{}/{key}",
            self.bucket
        );
        Ok(format!(
            "OSS {}:{}",
            self.access_key_id,
            self.sign(&string_to_sign)?
        ))
    }

    /// Whether the object already exists.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let date = Self::http_date();
        let auth = self.authorization("HEAD", "", &date, "", key)?;

        let response = self
            .http
            .head(self.public_url(key))
            .header("Date", &date)
            .header("Authorization", auth)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => Err(classify_http_status(STEP, status, "HEAD object failed")),
        }
    }

    /// Upload a local file as a public-read object.
    pub async fn upload(&self, key: &str, path: &Path) -> Result<()> {
        let body = tokio::fs::read(path).await?;
        let date = Self::http_date();
        let canonical_headers = format!("{ACL_HEADER}:{PUBLIC_READ}\n");
        let auth = self.authorization("PUT", CONTENT_TYPE, &date, &canonical_headers, key)?;

        let response = self
            .http
            .put(self.public_url(key))
            .header("Date", &date)
            .header("Content-Type", CONTENT_TYPE)
            .header(ACL_HEADER, PUBLIC_READ)
            .header("Authorization", auth)
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_http_status(STEP, status, &detail));
        }
        Ok(())
    }

    /// Upload the file unless the object is already present.
    pub async fn ensure_uploaded(&self, key: &str, path: &Path) -> Result<()> {
        if self.exists(key).await? {
            tracing::debug!(key, "Staging object already present");
            return Ok(());
        }
        tracing::info!(key, "Uploading audio to staging bucket");
        self.upload(key, path).await
    }

    /// Delete the staging object; called on both success and failure.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let date = Self::http_date();
        let auth = self.authorization("DELETE", "", &date, "", key)?;

        let response = self
            .http
            .delete(self.public_url(key))
            .header("Date", &date)
            .header("Authorization", auth)
            .send()
            .await?;

        // Deleting an already-absent object is fine.
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_http_status(STEP, status, &detail));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_the_bucket_url() {
        let storage = OssStorage::new("stage", "ap-northeast-1", "id", "secret");
        assert_eq!(
            storage.public_url("asr-staging/a.opus"),
            "https://stage.oss-ap-northeast-1.aliyuncs.com/asr-staging/a.opus"
        );
    }

    #[test]
    fn signature_is_deterministic_for_a_fixed_input() {
        let storage = OssStorage::new("stage", "ap-northeast-1", "id", "secret");
        let a = storage.sign("PUT\n\n\nDate\n/stage/key").unwrap();
        let b = storage.sign("PUT\n\n\nDate\n/stage/key").unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }
}
