//! 🪣 S3 store: output files as objects, `s3://{bucket}/{prefix/}{table}/{file}`.
//!
//! Small files go up in one `PutObject`. Big ones stream as multipart parts,
//! `part_size_bytes` at a time, so a 250 MB export never sits in RAM all at
//! once. The multipart upload is only created once the first full part is
//! ready. Nobody wants to pay for three API calls to store a header line.
//!
//! 🧠 Knowledge graph:
//! - `S3StoreConfig`: bucket, prefix, region, endpoint (MinIO, wiremock), path style, part size
//! - `S3Store`: `HeadBucket` on prepare, hands out `S3Upload`s
//! - `S3Upload`: buffer → (lazy) `CreateMultipartUpload` → `UploadPart`* →
//!   `CompleteMultipartUpload`, or a single `PutObject` when it never got big.
//!   `abort` calls `AbortMultipartUpload` so no orphan parts linger on the bill.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::backends::{Destination, DestinationBackend, ObjectStore};
use crate::common::FileKey;

// -- 📏 S3 refuses multipart parts smaller than this (except the last one)
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct S3StoreConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default = "default_s3_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default = "default_part_size_bytes")]
    pub part_size_bytes: usize,
}

impl S3StoreConfig {
    /// 🪣 Just a bucket, everything else defaulted. What `--bucket` builds.
    pub fn for_bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: None,
            region: default_s3_region(),
            endpoint_url: None,
            force_path_style: false,
            part_size_bytes: default_part_size_bytes(),
        }
    }
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_part_size_bytes() -> usize {
    8 * 1024 * 1024
}

/// 🪣 A bucket (plus optional prefix) that output files land in.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: Option<String>,
    part_size: usize,
}

impl S3Store {
    pub async fn new(config: &S3StoreConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));
        if let Some(endpoint_url) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();
        Ok(Self::from_client(
            aws_sdk_s3::Client::from_conf(s3_config),
            config,
        ))
    }

    pub fn from_client(client: aws_sdk_s3::Client, config: &S3StoreConfig) -> Self {
        // -- 🧹 "backups/", "/backups", "backups" all mean the same thing to a human
        let prefix = config
            .prefix
            .as_deref()
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self {
            client,
            bucket: config.bucket.clone(),
            prefix,
            part_size: config.part_size_bytes.max(MIN_PART_SIZE),
        }
    }

    fn object_key(&self, key: &FileKey) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{}", key.relative_path()),
            None => key.relative_path(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn prepare(&self, _table: &str) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .with_context(|| {
                format!(
                    "💀 HEAD request failed for s3://{}. The bucket ghosted us. \
                     Check: bucket name, region, and credentials.",
                    self.bucket
                )
            })?;
        Ok(())
    }

    async fn create(&self, key: &FileKey) -> Result<DestinationBackend> {
        Ok(DestinationBackend::S3(S3Upload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: self.object_key(key),
            part_size: self.part_size,
            buffer: Vec::new(),
            upload_id: None,
            parts: Vec::new(),
        }))
    }

    fn describe(&self, key: &FileKey) -> String {
        format!("s3://{}/{}", self.bucket, self.object_key(key))
    }
}

/// 📤 One object on its way up.
#[derive(Debug)]
pub struct S3Upload {
    client: aws_sdk_s3::Client,
    bucket: String,
    key: String,
    part_size: usize,
    buffer: Vec<u8>,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
}

impl S3Upload {
    async fn upload_id(&mut self) -> Result<String> {
        if let Some(upload_id) = &self.upload_id {
            return Ok(upload_id.clone());
        }
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .with_context(|| format!("💀 Could not start multipart upload for s3://{}/{}", self.bucket, self.key))?;
        let upload_id = created
            .upload_id()
            .with_context(|| format!("💀 S3 started an upload for {} but forgot to say which one", self.key))?
            .to_string();
        debug!("🪣 started multipart upload {upload_id} for {}", self.key);
        self.upload_id = Some(upload_id.clone());
        Ok(upload_id)
    }

    async fn upload_part(&mut self, part: Vec<u8>) -> Result<()> {
        let upload_id = self.upload_id().await?;
        let part_number = i32::try_from(self.parts.len() + 1).context("💀 too many parts")?;
        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(part))
            .send()
            .await
            .with_context(|| format!("💀 Part {part_number} of {} did not make it", self.key))?;
        self.parts.push(
            CompletedPart::builder()
                .set_e_tag(uploaded.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }
}

#[async_trait]
impl Destination for S3Upload {
    async fn write_chunk(&mut self, chunk: Vec<u8>) -> Result<()> {
        self.buffer.extend_from_slice(&chunk);
        while self.buffer.len() >= self.part_size {
            let rest = self.buffer.split_off(self.part_size);
            let part = std::mem::replace(&mut self.buffer, rest);
            self.upload_part(part).await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let Some(upload_id) = self.upload_id.clone() else {
            // -- 📦 never got big enough for multipart. one PUT and done.
            let body = std::mem::take(&mut self.buffer);
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(ByteStream::from(body))
                .send()
                .await
                .with_context(|| format!("💀 PutObject failed for s3://{}/{}", self.bucket, self.key))?;
            return Ok(());
        };

        if !self.buffer.is_empty() {
            let last = std::mem::take(&mut self.buffer);
            self.upload_part(last).await?;
        }
        let parts = std::mem::take(&mut self.parts);
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("💀 Could not complete upload of s3://{}/{}", self.bucket, self.key))?;
        self.upload_id = None;
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.buffer.clear();
        self.parts.clear();
        let Some(upload_id) = self.upload_id.take() else {
            // -- ✅ nothing went up, nothing to take down
            return Ok(());
        };
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&upload_id)
            .send()
            .await
            .map_err(|err| {
                warn!("⚠️ could not abort multipart upload {upload_id} for {}", self.key);
                err
            })
            .with_context(|| format!("💀 AbortMultipartUpload failed for s3://{}/{}", self.bucket, self.key))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::{Credentials, Region};
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(prefix: Option<&str>) -> S3StoreConfig {
        S3StoreConfig {
            bucket: "exports".into(),
            prefix: prefix.map(str::to_string),
            region: default_s3_region(),
            endpoint_url: None,
            force_path_style: true,
            part_size_bytes: default_part_size_bytes(),
        }
    }

    fn store_for(server: &MockServer, prefix: Option<&str>) -> S3Store {
        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(server.uri())
            .credentials_provider(Credentials::new("test", "test", None, None, "test"))
            .force_path_style(true)
            .build();
        S3Store::from_client(aws_sdk_s3::Client::from_conf(s3_config), &config(prefix))
    }

    #[tokio::test]
    async fn the_one_where_prefixes_get_their_slashes_straightened() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        let store = store_for(&server, Some("/nightly/"));
        let key = FileKey::new("orders", 2, 5, true);

        assert_eq!(
            store.describe(&key),
            "s3://exports/nightly/orders/orders-2-5.csv.gz"
        );
        assert_eq!(store_for(&server, Some("")).object_key(&key), "orders/orders-2-5.csv.gz");
        assert_eq!(store.part_size, default_part_size_bytes());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_small_file_goes_up_in_one_put() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/exports/nightly/orders/orders-0-0.csv"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"abc\""))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server, Some("nightly"));
        store.prepare("orders").await?;
        let mut upload = store.create(&FileKey::new("orders", 0, 0, false)).await?;
        upload.write_chunk(b"id,name\n1,Rachel\n".to_vec()).await?;
        upload.finish().await?;

        let requests = server.received_requests().await.unwrap_or_default();
        let put = requests
            .iter()
            .find(|r| r.method.as_str() == "PUT")
            .ok_or_else(|| anyhow::anyhow!("💀 no PUT reached the mock"))?;
        assert!(String::from_utf8_lossy(&put.body).contains("1,Rachel"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_aborting_a_small_file_costs_nothing() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        let store = store_for(&server, None);
        let mut upload = store.create(&FileKey::new("orders", 0, 0, false)).await?;
        upload.write_chunk(b"nope".to_vec()).await?;
        upload.abort().await?;

        assert!(server.received_requests().await.unwrap_or_default().is_empty());
        Ok(())
    }

    const KEY_PATH: &str = "/exports/orders/orders-0-0.csv";

    async fn mount_multipart(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path(KEY_PATH))
            .and(query_param_is_missing("uploadId"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<InitiateMultipartUploadResult><Bucket>exports</Bucket>\
                 <Key>orders/orders-0-0.csv</Key><UploadId>up-1</UploadId>\
                 </InitiateMultipartUploadResult>",
            ))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path(KEY_PATH))
            .and(query_param("uploadId", "up-1"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"part\""))
            .mount(server)
            .await;
    }

    /// 🔍 (method, query) of every request, in arrival order.
    async fn calls(server: &MockServer) -> Vec<(String, String)> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|r| (r.method.as_str().to_string(), r.url.query().unwrap_or_default().to_string()))
            .collect()
    }

    #[tokio::test]
    async fn the_one_where_a_big_file_goes_up_in_parts() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        mount_multipart(&server).await;
        Mock::given(method("POST"))
            .and(path(KEY_PATH))
            .and(query_param("uploadId", "up-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<CompleteMultipartUploadResult><Bucket>exports</Bucket>\
                 <Key>orders/orders-0-0.csv</Key><ETag>\"whole\"</ETag>\
                 </CompleteMultipartUploadResult>",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server, None);
        let mut upload = store.create(&FileKey::new("orders", 0, 0, false)).await?;
        // -- 9 MiB in 1 MiB chunks: one full 8 MiB part, then a 1 MiB tail on finish
        for _ in 0..9 {
            upload.write_chunk(vec![b'x'; 1024 * 1024]).await?;
        }
        upload.finish().await?;

        let calls = calls(&server).await;
        let shape: Vec<(&str, bool)> = calls
            .iter()
            .map(|(m, q)| (m.as_str(), q.contains("uploadId=up-1")))
            .collect();
        assert_eq!(
            shape,
            vec![("POST", false), ("PUT", true), ("PUT", true), ("POST", true)]
        );
        assert!(calls[0].1.contains("uploads"));
        assert!(calls[1].1.contains("partNumber=1"));
        assert!(calls[2].1.contains("partNumber=2"));

        let requests = server.received_requests().await.unwrap_or_default();
        assert_eq!(requests[1].body.len(), 8 * 1024 * 1024);
        assert_eq!(requests[2].body.len(), 1024 * 1024);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_abort_takes_the_parts_back_down() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        mount_multipart(&server).await;
        Mock::given(method("DELETE"))
            .and(path(KEY_PATH))
            .and(query_param("uploadId", "up-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server, None);
        let mut upload = store.create(&FileKey::new("orders", 0, 0, false)).await?;
        upload.write_chunk(vec![b'x'; 8 * 1024 * 1024 + 10]).await?;
        upload.abort().await?;

        let methods: Vec<String> = calls(&server).await.into_iter().map(|(m, _)| m).collect();
        assert_eq!(methods, vec!["POST", "PUT", "DELETE"]);
        Ok(())
    }
}
