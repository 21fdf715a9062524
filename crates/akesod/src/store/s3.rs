//! [`ObjectStore`] backed by an S3-compatible bucket.
//!
//! - The ETag is the [`VersionToken`]; conditional writes use `If-Match` /
//!   `If-None-Match`.
//! - Metadata-only updates are a self-copy with `MetadataDirective=REPLACE`.
//! - Customer keys map to SSE-C, provider keys to SSE-KMS.
//! - S3 event notifications cannot carry custom attributes, so change
//!   notifications are not configurable here and akeso rotation is refused
//!   before it starts.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::http::HttpResponse,
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
    types::{MetadataDirective, ServerSideEncryption as S3Sse},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{debug, info};

use super::{
    ListPage, Metadata, NotificationConfig, ObjectAttrs, ObjectStore, Precondition,
    ProtectedObject, ServerSideEncryption, StoreError, VersionToken,
};
use crate::keys::KeyBytes;

const SSE_C_ALGORITHM: &str = "AES256";
const LIST_PAGE_SIZE: i32 = 1000;

/// SSE-C request headers for one customer key.
struct CustomerKeyHeaders {
    key: String,
    key_md5: String,
}

impl CustomerKeyHeaders {
    fn new(key: &KeyBytes) -> Self {
        Self {
            key: key.to_base64(),
            key_md5: STANDARD.encode(md5::compute(key.as_bytes()).0),
        }
    }

    fn from_sse(sse: &ServerSideEncryption) -> Option<Self> {
        match sse {
            ServerSideEncryption::CustomerKey(k) => Some(Self::new(k)),
            _ => None,
        }
    }
}

/// S3 client bound to one bucket.
#[derive(Clone)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    /// Initialise the S3 client from the standard AWS configuration chain.
    ///
    /// When `endpoint_url` is set (MinIO, LocalStack), requests go there with
    /// path-style addressing.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket name is empty.
    pub async fn init(bucket: &str, endpoint_url: Option<&str>) -> Result<Self> {
        anyhow::ensure!(!bucket.trim().is_empty(), "bucket must not be empty");

        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&config);
        if let Some(url) = endpoint_url {
            builder = builder.endpoint_url(url).force_path_style(true);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());

        info!(bucket = %bucket, endpoint = ?endpoint_url, "S3 store initialised");
        Ok(Self {
            client,
            bucket: bucket.to_owned(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn copy_source(&self, name: &str) -> String {
        format!("{}/{}", self.bucket, encode_key(name))
    }
}

/// Percent-encode an object key for use in `x-amz-copy-source`.
fn encode_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn to_s3_metadata(metadata: Metadata) -> HashMap<String, String> {
    metadata.into_iter().collect()
}

fn from_s3_metadata(metadata: Option<&HashMap<String, String>>) -> Metadata {
    metadata
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

fn version_from_etag(name: &str, etag: Option<&str>) -> Result<VersionToken, StoreError> {
    etag.map(|e| VersionToken(e.to_owned()))
        .ok_or_else(|| StoreError::Backend(format!("response for {name} carried no ETag")))
}

/// Map an SDK failure onto [`StoreError`] by HTTP status.
fn classify<E>(err: SdkError<E, HttpResponse>, name: &str, customer_key: bool) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    match status {
        Some(404) => StoreError::NotFound(name.to_owned()),
        Some(409) | Some(412) => StoreError::PreconditionFailed(name.to_owned()),
        Some(400) | Some(403) if customer_key => StoreError::KeyMismatch(name.to_owned()),
        _ => StoreError::Backend(format!("{name}: {}", DisplayErrorContext(&err))),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn head(
        &self,
        name: &str,
        sse: &ServerSideEncryption,
    ) -> Result<ObjectAttrs, StoreError> {
        let ssec = CustomerKeyHeaders::from_sse(sse);
        let mut req = self.client.head_object().bucket(&self.bucket).key(name);
        if let Some(h) = &ssec {
            req = req
                .sse_customer_algorithm(SSE_C_ALGORITHM)
                .sse_customer_key(&h.key)
                .sse_customer_key_md5(&h.key_md5);
        }
        let out = req
            .send()
            .await
            .map_err(|e| classify(e, name, ssec.is_some()))?;

        Ok(ObjectAttrs {
            metadata: from_s3_metadata(out.metadata()),
            version: version_from_etag(name, out.e_tag())?,
            provider_key: out.ssekms_key_id().map(str::to_owned),
        })
    }

    async fn get(
        &self,
        name: &str,
        sse: &ServerSideEncryption,
    ) -> Result<ProtectedObject, StoreError> {
        let ssec = CustomerKeyHeaders::from_sse(sse);
        let mut req = self.client.get_object().bucket(&self.bucket).key(name);
        if let Some(h) = &ssec {
            req = req
                .sse_customer_algorithm(SSE_C_ALGORITHM)
                .sse_customer_key(&h.key)
                .sse_customer_key_md5(&h.key_md5);
        }
        let out = req
            .send()
            .await
            .map_err(|e| classify(e, name, ssec.is_some()))?;

        let metadata = from_s3_metadata(out.metadata());
        let version = version_from_etag(name, out.e_tag())?;
        let provider_key = out.ssekms_key_id().map(str::to_owned);
        let payload = out
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Backend(format!("failed to read body of {name}: {e}")))?
            .into_bytes()
            .to_vec();

        Ok(ProtectedObject {
            payload,
            metadata,
            version,
            provider_key,
        })
    }

    async fn put(
        &self,
        name: &str,
        payload: Vec<u8>,
        metadata: Metadata,
        sse: &ServerSideEncryption,
        precondition: &Precondition,
    ) -> Result<VersionToken, StoreError> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(name)
            .body(ByteStream::from(payload))
            .set_metadata(Some(to_s3_metadata(metadata)));

        let ssec = CustomerKeyHeaders::from_sse(sse);
        match sse {
            ServerSideEncryption::None => {}
            ServerSideEncryption::CustomerKey(_) => {
                if let Some(h) = &ssec {
                    req = req
                        .sse_customer_algorithm(SSE_C_ALGORITHM)
                        .sse_customer_key(&h.key)
                        .sse_customer_key_md5(&h.key_md5);
                }
            }
            ServerSideEncryption::ProviderKey(id) => {
                req = req
                    .server_side_encryption(S3Sse::AwsKms)
                    .ssekms_key_id(id);
            }
        }

        req = match precondition {
            Precondition::None => req,
            Precondition::DoesNotExist => req.if_none_match("*"),
            Precondition::VersionMatches(v) => req.if_match(&v.0),
        };

        let out = req.send().await.map_err(|e| classify(e, name, false))?;
        debug!(object = %name, "S3 put complete");
        version_from_etag(name, out.e_tag())
    }

    async fn update_metadata(
        &self,
        name: &str,
        metadata: Metadata,
        expected: &VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let out = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .key(name)
            .copy_source(self.copy_source(name))
            .copy_source_if_match(&expected.0)
            .metadata_directive(MetadataDirective::Replace)
            .set_metadata(Some(to_s3_metadata(metadata)))
            .send()
            .await
            .map_err(|e| classify(e, name, false))?;

        version_from_etag(name, out.copy_object_result().and_then(|r| r.e_tag()))
    }

    async fn rewrite_key(
        &self,
        name: &str,
        from: &ServerSideEncryption,
        to: &ServerSideEncryption,
        expected: &VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let mut req = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .key(name)
            .copy_source(self.copy_source(name))
            .copy_source_if_match(&expected.0)
            .metadata_directive(MetadataDirective::Copy);

        let from_ssec = CustomerKeyHeaders::from_sse(from);
        if let Some(h) = &from_ssec {
            req = req
                .copy_source_sse_customer_algorithm(SSE_C_ALGORITHM)
                .copy_source_sse_customer_key(&h.key)
                .copy_source_sse_customer_key_md5(&h.key_md5);
        }
        match to {
            ServerSideEncryption::None => {}
            ServerSideEncryption::CustomerKey(k) => {
                let h = CustomerKeyHeaders::new(k);
                req = req
                    .sse_customer_algorithm(SSE_C_ALGORITHM)
                    .sse_customer_key(h.key)
                    .sse_customer_key_md5(h.key_md5);
            }
            ServerSideEncryption::ProviderKey(id) => {
                req = req
                    .server_side_encryption(S3Sse::AwsKms)
                    .ssekms_key_id(id);
            }
        }

        let out = req
            .send()
            .await
            .map_err(|e| classify(e, name, from_ssec.is_some()))?;
        version_from_etag(name, out.copy_object_result().and_then(|r| r.e_tag()))
    }

    async fn list_page(
        &self,
        prefix: &str,
        page_token: Option<String>,
    ) -> Result<ListPage, StoreError> {
        let out = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(LIST_PAGE_SIZE)
            .set_continuation_token(page_token)
            .send()
            .await
            .map_err(|e| classify(e, prefix, false))?;

        let names = out
            .contents()
            .iter()
            .filter_map(|o| o.key().map(str::to_owned))
            .collect();
        Ok(ListPage {
            names,
            next_page_token: out.next_continuation_token().map(str::to_owned),
        })
    }

    async fn configure_change_notification(
        &self,
        config: &NotificationConfig,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unsupported(format!(
            "S3 notifications cannot carry custom attributes (topic {})",
            config.topic
        )))
    }

    fn notifications_carry_attributes(&self) -> bool {
        false
    }
}
