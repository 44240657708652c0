// collection-backup/src/cloud/s3.rs
use super::{CloudStorage, OBJECT_PREFIX, create_file, flush, write_chunk};
use crate::config::CloudProvider;
use crate::errors::CloudError;
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::config::http::HttpResponse;
use s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use s3::primitives::ByteStream;
use std::path::Path;
use tracing::{debug, info};
use url::Url;

const R2_REGION: &str = "auto";
const R2_DEFAULT_BUCKET: &str = "collection-backups";

const AUTH_ERROR_CODES: &[&str] = &[
    "AccessDenied",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "InvalidToken",
];

/// S3 and S3-compatible object storage. R2 is S3 with an account-scoped
/// endpoint and the `auto` region.
#[derive(Clone)]
pub struct S3Storage {
    provider: CloudProvider,
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    access_key_id: String,
    secret_access_key: String,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("provider", &self.provider)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .finish_non_exhaustive()
    }
}

impl S3Storage {
    pub fn aws(bucket: &str, region: &str, access_key_id: &str, secret_access_key: &str) -> Self {
        Self {
            provider: CloudProvider::S3,
            bucket: bucket.to_string(),
            region: region.to_string(),
            endpoint_url: None,
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
        }
    }

    pub fn r2(
        account_id: &str,
        bucket: Option<&str>,
        access_key_id: &str,
        secret_access_key: &str,
    ) -> Self {
        Self {
            provider: CloudProvider::R2,
            bucket: bucket
                .filter(|b| !b.trim().is_empty())
                .unwrap_or(R2_DEFAULT_BUCKET)
                .to_string(),
            region: R2_REGION.to_string(),
            endpoint_url: Some(format!("https://{account_id}.r2.cloudflarestorage.com")),
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn client(&self) -> s3::Client {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &self.access_key_id,
                &self.secret_access_key,
                None,
                None,
                "Static",
            ));
        if let Some(endpoint) = &self.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        s3::Client::new(&sdk_config)
    }

    fn scheme(&self) -> &'static str {
        match self.provider {
            CloudProvider::R2 => "r2",
            _ => "s3",
        }
    }

    fn object_url(&self, key: &str) -> Result<Url, CloudError> {
        let raw = format!("{}://{}/{}", self.scheme(), self.bucket, key);
        Url::parse(&raw).map_err(|e| CloudError::Configuration(format!("invalid object URL {raw}: {e}")))
    }
}

/// Splits `s3://bucket/key` (or `r2://…`) into bucket and key.
pub fn parse_object_uri(uri: &Url) -> Result<(String, String), CloudError> {
    if !matches!(uri.scheme(), "s3" | "r2") {
        return Err(CloudError::Configuration(format!(
            "object URI must start with s3:// or r2://, got {uri}"
        )));
    }
    let bucket = uri
        .host_str()
        .filter(|b| !b.is_empty())
        .ok_or_else(|| CloudError::Configuration(format!("object URI {uri} is missing a bucket")))?
        .to_string();
    let key = percent_encoding::percent_decode_str(uri.path().trim_start_matches('/'))
        .decode_utf8_lossy()
        .into_owned();
    if key.is_empty() {
        return Err(CloudError::Configuration(format!(
            "object URI {uri} is missing a key"
        )));
    }
    Ok((bucket, key))
}

fn is_auth_failure(code: Option<&str>, status: Option<u16>) -> bool {
    matches!(status, Some(401 | 403)) || code.is_some_and(|c| AUTH_ERROR_CODES.contains(&c))
}

/// Transport covers network and credential failures; anything else the
/// service answered with is a provider rejection.
fn classify<E>(action: &str, err: SdkError<E, HttpResponse>) -> CloudError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let detail = format!("{action}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::ConstructionFailure(_) => CloudError::Configuration(detail),
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => CloudError::Transport(detail),
        _ => {
            let status = err.raw_response().map(|r| r.status().as_u16());
            if is_auth_failure(err.code(), status) {
                CloudError::Transport(detail)
            } else {
                CloudError::Provider(detail)
            }
        }
    }
}

#[async_trait]
impl CloudStorage for S3Storage {
    fn provider(&self) -> CloudProvider {
        self.provider
    }

    async fn upload(&self, local: &Path, filename: &str) -> Result<Url, CloudError> {
        let key = format!("{OBJECT_PREFIX}/{filename}");
        debug!(bucket = %self.bucket, %key, "Attempting to upload {}", local.display());

        let body = ByteStream::from_path(local).await.map_err(|e| {
            CloudError::LocalFile(format!("cannot stream {}: {e}", local.display()))
        })?;

        self.client()
            .await
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .content_type("application/sql")
            .send()
            .await
            .map_err(|e| classify(&format!("upload to {}/{key}", self.bucket), e))?;

        self.object_url(&key)
    }

    async fn test_connection(&self) -> Result<String, CloudError> {
        self.client()
            .await
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| classify(&format!("head bucket {}", self.bucket), e))?;
        Ok(format!(
            "Connected to {} bucket '{}'",
            self.provider, self.bucket
        ))
    }

    async fn download(&self, remote: &Url, dest: &Path) -> Result<u64, CloudError> {
        let (bucket, key) = parse_object_uri(remote)?;
        info!("Attempting to download {remote} to {}", dest.display());

        let mut object = self
            .client()
            .await
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| classify(&format!("get object {bucket}/{key}"), e))?;

        let mut file = create_file(dest).await?;
        let mut total = 0u64;
        while let Some(chunk) = object
            .body
            .try_next()
            .await
            .map_err(|e| CloudError::Transport(format!("reading {bucket}/{key}: {e}")))?
        {
            write_chunk(&mut file, dest, &chunk).await?;
            total += chunk.len() as u64;
        }
        flush(&mut file, dest).await?;

        info!("✅ Downloaded {total} bytes from {remote}");
        Ok(total)
    }

    async fn delete(&self, remote: &Url) -> Result<(), CloudError> {
        let (bucket, key) = parse_object_uri(remote)?;
        self.client()
            .await
            .delete_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| classify(&format!("delete object {bucket}/{key}"), e))?;
        Ok(())
    }
}
