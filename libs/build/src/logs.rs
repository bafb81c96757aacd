use portal_operator::error::{Error, Result};

use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use tracing::info;

/// Build-log archive on any S3-compatible endpoint (MinIO in the default
/// installation). Objects are write-once per build.
pub struct BuildLogStore {
    client: Client,
    bucket: String,
}

impl BuildLogStore {
    pub fn new(endpoint_url: &str, access_key: &str, secret_key: &str, bucket: &str) -> Self {
        let credentials = Credentials::new(access_key, secret_key, None, None, "portal-static");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(endpoint_url)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(config),
            bucket: bucket.to_string(),
        }
    }

    /// Called once at startup.
    pub async fn ensure_bucket(&self) -> Result<()> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                Error::ObjectStore(format!("failed to create bucket {}: {e}", self.bucket))
            })?;
        info!(msg = "created build log bucket", bucket = %self.bucket);
        Ok(())
    }

    pub async fn upload_log(&self, object_key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key)
            .content_type("text/plain")
            .body(ByteStream::from(content.as_bytes().to_vec()))
            .send()
            .await
            .map_err(|e| Error::ObjectStore(format!("failed to upload {object_key}: {e}")))?;
        Ok(())
    }

    pub async fn fetch_log(&self, object_key: &str) -> Result<String> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|e| Error::ObjectStore(format!("failed to fetch {object_key}: {e}")))?;
        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| Error::ObjectStore(format!("failed to read {object_key}: {e}")))?
            .into_bytes();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Archive key for one build's logs.
#[inline]
pub fn log_object_key(build_id: i64, job_name: &str) -> String {
    format!("builds/{build_id}/{job_name}.log")
}

#[cfg(test)]
mod tests {
    use super::log_object_key;

    #[test]
    fn test_log_object_key_layout() {
        assert_eq!(
            log_object_key(42, "build-42-ab12cd"),
            "builds/42/build-42-ab12cd.log"
        );
    }
}
