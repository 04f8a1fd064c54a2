use anyhow::{anyhow, Error};
/// Helper functions and structures for dealing with minio.
use aws_sdk_s3 as s3;
use aws_sdk_s3::primitives::ByteStream;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use bytes::Bytes;
use tracing::info;
use url::Url;

#[derive(Debug, Clone)]
pub struct BucketKey {
    pub bucket: String,
    pub key: String,
}

/// Splits an `s3://bucket/key` path into its bucket and key. The key may
/// be empty when the path names a bare bucket.
pub fn path_to_bucket_key(path: &str) -> Result<BucketKey, Error> {
    let s3_url = Url::parse(path).map_err(|e| anyhow!("could not parse path `{path}`: {e}"))?;

    if s3_url.scheme() != "s3" {
        return Err(anyhow!("protocol of path is not S3"));
    }

    let bucket = s3_url
        .domain()
        .ok_or_else(|| anyhow!("path `{path}` names no bucket"))?;

    let key = s3_url.path().trim_start_matches('/').trim_end_matches('/');

    Ok(BucketKey {
        bucket: bucket.to_string(),
        key: key.to_string(),
    })
}

/// Builds the URL form of a bucket and key.
pub fn object_url(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}

#[derive(Clone)]
pub struct ClientConfig {
    /// id
    pub access_key_id: String,

    /// password
    pub secret_access_key: String,

    /// object store region
    pub region: String,

    /// minio url
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct Client {
    pub client: s3::Client,
}

impl Client {
    pub fn from_conf(cfg: ClientConfig) -> Self {
        let cred = s3::config::Credentials::new(
            cfg.access_key_id,
            cfg.secret_access_key,
            None,
            None,
            "some provider",
        );
        let region = s3::config::Region::new(cfg.region);
        let conf_builder = s3::config::Builder::new()
            .credentials_provider(cred)
            .region(region)
            .endpoint_url(cfg.url)
            .behavior_version_latest();
        let conf = conf_builder.build();

        Self {
            client: s3::Client::from_conf(conf),
        }
    }

    /// Creates the bucket if it does not exist yet.
    pub async fn ensure_bucket(&self, bucket: &str) -> Result<(), Error> {
        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => {
                info!("created bucket `{bucket}`");
                Ok(())
            }
            Err(err) => {
                let service_err = err.into_service_error();
                match service_err.code() {
                    Some("BucketAlreadyOwnedByYou") | Some("BucketAlreadyExists") => Ok(()),
                    _ => Err(anyhow!("could not ensure bucket `{bucket}`: {service_err}")),
                }
            }
        }
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, Error> {
        let data = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await?
            .body
            .collect()
            .await?
            .into_bytes();
        Ok(data)
    }

    /// Fetches `len` bytes of the object starting at `offset`.
    pub async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, Error> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        // HTTP byte ranges are inclusive on both ends
        let range = format!("bytes={}-{}", offset, offset + len - 1);
        let data = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(range)
            .send()
            .await?
            .body
            .collect()
            .await?
            .into_bytes();
        Ok(data)
    }

    /// Size of the object in bytes, without fetching its body.
    pub async fn object_size(&self, bucket: &str, key: &str) -> Result<u64, Error> {
        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await?;
        let length = head.content_length().unwrap_or_default();
        u64::try_from(length).map_err(|_| anyhow!("object `{key}` reported a negative size"))
    }

    pub async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), Error> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_splits_into_bucket_and_key() {
        let parsed = path_to_bucket_key("s3://data/jobs/input.txt").unwrap();
        assert_eq!(parsed.bucket, "data");
        assert_eq!(parsed.key, "jobs/input.txt");
    }

    #[test]
    fn test_bare_bucket_has_empty_key() {
        let parsed = path_to_bucket_key("s3://data").unwrap();
        assert_eq!(parsed.bucket, "data");
        assert_eq!(parsed.key, "");
    }

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let parsed = path_to_bucket_key("s3://data/prefix/").unwrap();
        assert_eq!(parsed.key, "prefix");
    }

    #[test]
    fn test_non_s3_scheme_is_rejected() {
        assert!(path_to_bucket_key("http://data/key").is_err());
        assert!(path_to_bucket_key("not a url").is_err());
    }

    #[test]
    fn test_object_url_round_trips() {
        let url = object_url("data", "jobs/1/out");
        let parsed = path_to_bucket_key(&url).unwrap();
        assert_eq!(parsed.bucket, "data");
        assert_eq!(parsed.key, "jobs/1/out");
    }
}
