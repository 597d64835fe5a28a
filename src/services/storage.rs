use std::path::Path;

use anyhow::Context;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;

use crate::core::config::Settings;

/// S3-backed page image store. Disabled when no credentials are configured.
#[derive(Debug, Clone)]
pub(crate) struct StorageService {
    client: Client,
    bucket: String,
}

impl StorageService {
    pub(crate) async fn from_settings(settings: &Settings) -> anyhow::Result<Option<Self>> {
        if settings.s3().access_key.is_empty() || settings.s3().secret_key.is_empty() {
            return Ok(None);
        }

        let creds = Credentials::new(
            settings.s3().access_key.clone(),
            settings.s3().secret_key.clone(),
            None,
            None,
            "supermarks-static",
        );

        let config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(settings.s3().endpoint.clone())
            .region(aws_config::Region::new(settings.s3().region.clone()))
            .credentials_provider(creds)
            .load()
            .await;

        let client = Client::new(&config);

        Ok(Some(Self { client, bucket: settings.s3().bucket.clone() }))
    }

    pub(crate) fn bucket(&self) -> &str {
        &self.bucket
    }

    pub(crate) async fn download_bytes(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("failed to fetch s3://{}/{key}", self.bucket))?;

        let body = object
            .body
            .collect()
            .await
            .with_context(|| format!("failed to read s3://{}/{key}", self.bucket))?;

        Ok(body.into_bytes().to_vec())
    }
}

/// MIME type sent to the vision model; anything that is not PNG is sent as JPEG.
pub(crate) fn image_mime_type(key: &str) -> &'static str {
    let extension = Path::new(key)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("png") => "image/png",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::{image_mime_type, StorageService};
    use crate::core::config::Settings;
    use crate::test_support;

    #[test]
    fn mime_type_follows_extension() {
        assert_eq!(image_mime_type("exams/1/key/page_0001.png"), "image/png");
        assert_eq!(image_mime_type("exams/1/key/page_0001.PNG"), "image/png");
        assert_eq!(image_mime_type("exams/1/key/page_0001.jpg"), "image/jpeg");
        assert_eq!(image_mime_type("exams/1/key/page_0001.webp"), "image/jpeg");
        assert_eq!(image_mime_type("no-extension"), "image/jpeg");
    }

    #[tokio::test]
    async fn storage_is_disabled_without_credentials() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();

        let settings = Settings::load().expect("settings");
        let storage = StorageService::from_settings(&settings).await.expect("storage");
        assert!(storage.is_none());
    }

    #[tokio::test]
    async fn storage_uses_configured_bucket() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        test_support::set_test_storage_env();

        let settings = Settings::load().expect("settings");
        let storage = StorageService::from_settings(&settings)
            .await
            .expect("storage")
            .expect("storage enabled");
        test_support::clear_test_storage_env();

        assert_eq!(storage.bucket(), "supermarks-test");
    }
}
