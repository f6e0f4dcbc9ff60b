use crate::config::S3Settings;
use crate::domain::model::{ObjectSummary, StoredObject};
use crate::domain::ports::{ObjectStore, StoreFactory};
use crate::utils::error::{Result, RozError};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::BucketCannedAcl;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn s3_error<E, R>(err: SdkError<E, R>) -> RozError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let code = err.code().unwrap_or("Unknown").to_string();
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
    RozError::s3(code, message)
}

#[derive(Debug, Clone)]
pub struct S3Store {
    client: S3Client,
}

impl S3Store {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }

    /// Client from settings: explicit key pair if configured, otherwise the
    /// shared-credentials chain (optionally a named profile).
    pub async fn connect(settings: &S3Settings) -> Result<Self> {
        if let (Some(id), Some(secret)) = (&settings.access_key_id, &settings.secret_access_key) {
            return Ok(Self::with_keys(&settings.endpoint_url, &settings.region, id, secret));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .endpoint_url(&settings.endpoint_url);
        if let Some(profile) = &settings.profile {
            loader = loader.profile_name(profile);
        }
        let shared = loader.load().await;

        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();

        tracing::debug!(endpoint = %settings.endpoint_url, "🪣 S3 client ready (credential chain)");
        Ok(Self::new(S3Client::from_conf(config)))
    }

    pub fn with_keys(endpoint_url: &str, region: &str, access_key_id: &str, secret_access_key: &str) -> Self {
        let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "roz");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .endpoint_url(endpoint_url)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self::new(S3Client::from_conf(config))
    }
}

fn to_chrono(value: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    value
        .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos()))
        .unwrap_or_default()
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_objects(&self, bucket: &str) -> Result<Vec<ObjectSummary>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .fetch_owner(true)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(s3_error)?;

            for obj in resp.contents() {
                let owner = obj.owner();
                objects.push(ObjectSummary {
                    bucket: bucket.to_string(),
                    key: obj.key().unwrap_or_default().to_string(),
                    etag: obj.e_tag().unwrap_or_default().to_string(),
                    size: obj.size().unwrap_or_default(),
                    last_modified: to_chrono(obj.last_modified()),
                    owner_id: owner.and_then(|o| o.id()).unwrap_or_default().to_string(),
                    owner_display_name: owner
                        .and_then(|o| o.display_name())
                        .unwrap_or_default()
                        .to_string(),
                });
            }

            match resp.next_continuation_token() {
                Some(token) if resp.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(s3_error)?;

        let etag = resp.e_tag().unwrap_or_default().to_string();
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| RozError::s3("ReadError", format!("failed to read s3://{}/{}: {}", bucket, key, e)))?;

        Ok(StoredObject {
            body: data.into_bytes().to_vec(),
            etag,
        })
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(s3_error)?;
        Ok(())
    }

    async fn upload_file(&self, path: &Path, bucket: &str, key: &str) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| RozError::processing(format!("cannot read {}: {}", path.display(), e)))?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(s3_error)?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(s3_error)?;
        Ok(())
    }

    async fn head_bucket(&self, bucket: &str) -> Result<()> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = s3_error(e);
                // HEAD responses have no body, a missing bucket only shows up as 404
                if err.is_s3_code("NotFound") {
                    Err(RozError::s3("NoSuchBucket", format!("bucket {} does not exist", bucket)))
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.client
            .create_bucket()
            .bucket(bucket)
            .acl(BucketCannedAcl::Private)
            .send()
            .await
            .map_err(s3_error)?;
        Ok(())
    }

    async fn get_bucket_policy(&self, bucket: &str) -> Result<String> {
        let resp = self
            .client
            .get_bucket_policy()
            .bucket(bucket)
            .send()
            .await
            .map_err(s3_error)?;
        Ok(resp.policy().unwrap_or_default().to_string())
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> Result<()> {
        self.client
            .put_bucket_policy()
            .bucket(bucket)
            .policy(policy)
            .send()
            .await
            .map_err(s3_error)?;
        Ok(())
    }

    async fn delete_bucket_policy(&self, bucket: &str) -> Result<()> {
        self.client
            .delete_bucket_policy()
            .bucket(bucket)
            .send()
            .await
            .map_err(s3_error)?;
        Ok(())
    }

    async fn presign_get(&self, bucket: &str, key: &str, expires_in: Duration) -> Result<String> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| RozError::config(format!("invalid presign expiry: {}", e)))?;
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(s3_error)?;
        Ok(request.uri().to_string())
    }
}

/// Builds per-credential clients against one endpoint.
#[derive(Debug, Clone)]
pub struct S3StoreFactory {
    endpoint_url: String,
    region: String,
}

impl S3StoreFactory {
    pub fn new(settings: &S3Settings) -> Self {
        Self {
            endpoint_url: settings.endpoint_url.clone(),
            region: settings.region.clone(),
        }
    }
}

impl StoreFactory for S3StoreFactory {
    fn store_for(&self, access_key_id: &str, secret_access_key: &str) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(S3Store::with_keys(
            &self.endpoint_url,
            &self.region,
            access_key_id,
            secret_access_key,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_chrono() {
        let dt = aws_sdk_s3::primitives::DateTime::from_secs(1_696_919_975);
        assert_eq!(to_chrono(Some(&dt)).timestamp(), 1_696_919_975);
        assert_eq!(to_chrono(None).timestamp(), 0);
    }
}
