// kvrestore/src/restore/s3_download.rs
use anyhow::{Context, Result};
use aws_sdk_s3 as s3;
use s3::config::Region;

use crate::config::SpacesConfig;

/// Parses an S3 URI (s3://bucket/key) into bucket and key.
pub fn parse_s3_uri(s3_uri: &str) -> Result<(String, String)> {
    let uri = url::Url::parse(s3_uri)
        .with_context(|| format!("Invalid S3 URI format: {}", s3_uri))?;
    if uri.scheme() != "s3" {
        return Err(anyhow::anyhow!("S3 URI must start with s3://"));
    }
    let bucket = uri.host_str().context("S3 URI missing bucket name")?.to_string();
    let key = uri.path().trim_start_matches('/').to_string();
    if key.is_empty() {
        return Err(anyhow::anyhow!("S3 URI missing key (object path)"));
    }
    Ok((bucket, key))
}

/// Reads a whole object from an S3-compatible object storage service into memory.
pub async fn download_object_bytes(spaces_config: &SpacesConfig, s3_uri: &str) -> Result<Vec<u8>> {
    let (bucket, key) = parse_s3_uri(s3_uri)?;
    tracing::info!(bucket = %bucket, key = %key, "downloading object");

    let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
        .endpoint_url(&spaces_config.endpoint_url)
        .region(Region::new(spaces_config.region.clone()))
        .credentials_provider(s3::config::Credentials::new(
            &spaces_config.access_key_id,
            &spaces_config.secret_access_key,
            None, // session_token
            None, // expiry
            "Static",
        ))
        .load()
        .await;

    let client = s3::Client::new(&sdk_config);
    let object = client
        .get_object()
        .bucket(&bucket)
        .key(&key)
        .send()
        .await
        .with_context(|| format!("Failed to get object s3://{}/{}", bucket, key))?;

    let bytes = object
        .body
        .collect()
        .await
        .with_context(|| format!("Failed to read body of s3://{}/{}", bucket, key))?
        .into_bytes();

    tracing::info!(bytes = bytes.len(), bucket = %bucket, key = %key, "downloaded object");
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_uri() -> anyhow::Result<()> {
        let (bucket, key) = parse_s3_uri("s3://snapshots/daily/2026-10-01/backupmeta")?;
        assert_eq!(bucket, "snapshots");
        assert_eq!(key, "daily/2026-10-01/backupmeta");
        Ok(())
    }

    #[test]
    fn test_parse_s3_uri_rejects_bad_input() {
        assert!(parse_s3_uri("https://snapshots/backupmeta").is_err());
        assert!(parse_s3_uri("s3://snapshots").is_err());
        assert!(parse_s3_uri("not a uri").is_err());
    }
}
