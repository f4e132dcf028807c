use anyhow::{bail, Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::path::Path;
use tokio::time::{timeout_at, Instant};
use tracing::debug;
use url::Url;

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// Client for media uploads to Cloud Storage buckets.
pub struct StorageClient {
    client: Client,
    endpoint: Url,
    access_token: Option<String>,
}

impl StorageClient {
    pub fn new(access_token: Option<String>) -> Self {
        let endpoint = Url::parse(DEFAULT_ENDPOINT).expect("default endpoint is a valid URL");
        Self::with_endpoint(endpoint, access_token)
    }

    pub fn with_endpoint(endpoint: Url, access_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            access_token,
        }
    }

    /// Uploads a local file to `bucket`, named after the file's final path
    /// component. An existing object of the same name is overwritten.
    /// Returns the `gs://` URI of the new object.
    pub async fn upload(
        &self,
        image_file: &Path,
        bucket: &str,
        deadline: Instant,
    ) -> Result<String> {
        let data = tokio::fs::read(image_file)
            .await
            .with_context(|| format!("failed to read image file {}", image_file.display()))?;
        let object = object_name(image_file)?;
        let content_type = mime_guess::from_path(image_file).first_or_octet_stream();

        let url = self
            .endpoint
            .join(&format!("upload/storage/v1/b/{bucket}/o"))
            .with_context(|| format!("failed to build upload URL for bucket {bucket}"))?;
        debug!(%url, %object, size = data.len(), "uploading image");

        let mut request = self
            .client
            .post(url)
            .query(&[("uploadType", "media"), ("name", object.as_str())])
            .header(CONTENT_TYPE, content_type.as_ref())
            .body(data);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = timeout_at(deadline, request.send())
            .await
            .with_context(|| {
                format!(
                    "timed out uploading {} to bucket {bucket}",
                    image_file.display()
                )
            })?
            .with_context(|| {
                format!(
                    "failed to upload {} to bucket {bucket}",
                    image_file.display()
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = timeout_at(deadline, response.text())
                .await
                .context("timed out reading upload response")?
                .unwrap_or_default();
            bail!("upload to bucket {bucket} failed with status {status}: {body}");
        }

        Ok(format!("gs://{bucket}/{object}"))
    }
}

fn object_name(image_file: &Path) -> Result<String> {
    image_file
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .with_context(|| {
            format!(
                "image file path {} has no usable file name",
                image_file.display()
            )
        })
}
