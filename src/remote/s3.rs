//! Backblaze B2 through its S3-compatible API.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration, Permission};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error};

use super::{
    BucketAccess, BucketAttributes, ConnectOptions, Connector, ListedObject, ObjectAttributes,
    ObjectPage, ObjectVersion, RemoteClient, RemoteError, RemoteResult, VersionMarker, VersionPage,
};

pub const DEFAULT_REGION: &str = "us-west-004";

const ALL_USERS_GROUP: &str = "http://acs.amazonaws.com/groups/global/AllUsers";

/// Default S3-compatible endpoint for a B2 region.
pub fn default_endpoint(region: &str) -> String {
    format!("https://s3.{region}.backblazeb2.com")
}

/// Builds [`S3Remote`] sessions. No network traffic happens until the first
/// request.
#[derive(Debug, Default, Clone, Copy)]
pub struct S3Connector;

#[async_trait]
impl Connector for S3Connector {
    async fn connect(&self, options: &ConnectOptions) -> RemoteResult<Arc<dyn RemoteClient>> {
        Ok(Arc::new(S3Remote::new(options)))
    }
}

pub struct S3Remote {
    client: S3Client,
    region: String,
    endpoint: String,
}

impl S3Remote {
    pub fn new(options: &ConnectOptions) -> Self {
        let region = options
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let endpoint = options
            .endpoint
            .clone()
            .unwrap_or_else(|| default_endpoint(&region));
        let endpoint = endpoint.trim_end_matches('/').to_string();

        let creds = Credentials::new(
            options.account_id.clone(),
            options.application_key.clone(),
            None,
            None,
            "b2cs",
        );
        let config = aws_sdk_s3::Config::builder()
            .endpoint_url(endpoint.clone())
            .region(Region::new(region.clone()))
            .credentials_provider(creds)
            .force_path_style(true)
            .behavior_version(BehaviorVersion::latest())
            .build();

        Self {
            client: S3Client::from_conf(config),
            region,
            endpoint,
        }
    }
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    matches!(err, SdkError::ServiceError(e) if e.raw().status().as_u16() == 404)
}

fn service_error<E: std::error::Error + 'static>(what: &str, err: SdkError<E>) -> RemoteError {
    error!("S3 {} failed: {:?}", what, err);
    RemoteError::Service(format!(
        "S3 {what} failed: {}",
        aws_sdk_s3::error::DisplayErrorContext(&err)
    ))
}

fn map_error<E: std::error::Error + 'static>(
    what: &str,
    subject: &str,
    err: SdkError<E>,
) -> RemoteError {
    if is_not_found(&err) {
        RemoteError::NotFound(subject.to_string())
    } else {
        service_error(what, err)
    }
}

#[async_trait]
impl RemoteClient for S3Remote {
    async fn open_bucket(&self, bucket: &str) -> RemoteResult<()> {
        debug!("Opening bucket: {}", bucket);
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| map_error("HEAD bucket", bucket, e))?;
        Ok(())
    }

    async fn create_bucket(&self, bucket: &str) -> RemoteResult<()> {
        debug!("Creating bucket: {} in {}", bucket, self.region);
        let mut request = self.client.create_bucket().bucket(bucket);
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(|e| service_error("CREATE bucket", e))?;
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> RemoteResult<()> {
        debug!("Deleting bucket: {}", bucket);
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| map_error("DELETE bucket", bucket, e))?;
        Ok(())
    }

    async fn bucket_attributes(&self, bucket: &str) -> RemoteResult<BucketAttributes> {
        let output = self
            .client
            .get_bucket_acl()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| map_error("GET bucket ACL", bucket, e))?;

        let public = output.grants.unwrap_or_default().iter().any(|grant| {
            let everyone = grant
                .grantee
                .as_ref()
                .and_then(|g| g.uri.as_deref())
                .is_some_and(|uri| uri == ALL_USERS_GROUP);
            let readable = matches!(
                grant.permission,
                Some(Permission::Read) | Some(Permission::FullControl)
            );
            everyone && readable
        });

        Ok(BucketAttributes {
            access: if public {
                BucketAccess::Public
            } else {
                BucketAccess::Private
            },
        })
    }

    fn public_url(&self, bucket: &str) -> String {
        format!("{}/{}/", self.endpoint, bucket)
    }

    async fn get_object(&self, bucket: &str, name: &str) -> RemoteResult<Bytes> {
        debug!("Getting object: {}", name);
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| map_error("GET", name, e))?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| RemoteError::Service(format!("failed to read S3 object body: {e}")))?
            .into_bytes();
        Ok(data)
    }

    async fn put_object(&self, bucket: &str, name: &str, data: Bytes) -> RemoteResult<()> {
        debug!("Putting object: {} ({} bytes)", name, data.len());
        self.client
            .put_object()
            .bucket(bucket)
            .key(name)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| service_error("PUT", e))?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, name: &str) -> RemoteResult<()> {
        debug!("Deleting object: {}", name);
        // S3 deletes are idempotent, so existence has to be checked first.
        self.object_attributes(bucket, name).await?;
        self.client
            .delete_object()
            .bucket(bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| map_error("DELETE", name, e))?;
        Ok(())
    }

    async fn object_attributes(&self, bucket: &str, name: &str) -> RemoteResult<ObjectAttributes> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| map_error("HEAD", name, e))?;
        let size = output
            .content_length
            .and_then(|len| u64::try_from(len).ok())
            .unwrap_or(0);
        Ok(ObjectAttributes { size })
    }

    async fn list_page(
        &self,
        bucket: &str,
        page_size: usize,
        continuation: Option<&str>,
    ) -> RemoteResult<ObjectPage> {
        debug!("Listing page of {} objects from {}", page_size, bucket);
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .max_keys(i32::try_from(page_size).unwrap_or(i32::MAX));
        if let Some(token) = continuation {
            request = request.continuation_token(token);
        }

        let output = request
            .send()
            .await
            .map_err(|e| map_error("LIST", bucket, e))?;

        let objects = output
            .contents
            .unwrap_or_default()
            .into_iter()
            .filter_map(|obj| {
                let size = obj.size.and_then(|s| u64::try_from(s).ok());
                obj.key.map(|name| ListedObject { name, size })
            })
            .collect();

        let next = if output.is_truncated.unwrap_or(false) {
            output.next_continuation_token
        } else {
            None
        };

        Ok(ObjectPage { objects, next })
    }

    async fn list_versions_page(
        &self,
        bucket: &str,
        page_size: usize,
        marker: Option<&VersionMarker>,
    ) -> RemoteResult<VersionPage> {
        debug!("Listing page of {} versions from {}", page_size, bucket);
        let mut request = self
            .client
            .list_object_versions()
            .bucket(bucket)
            .max_keys(i32::try_from(page_size).unwrap_or(i32::MAX));
        if let Some(marker) = marker {
            request = request
                .key_marker(&marker.name)
                .version_id_marker(&marker.version_id);
        }

        let output = request
            .send()
            .await
            .map_err(|e| map_error("LIST versions", bucket, e))?;

        let stored = output
            .versions
            .unwrap_or_default()
            .into_iter()
            .map(|v| (v.key, v.version_id));
        let hidden = output
            .delete_markers
            .unwrap_or_default()
            .into_iter()
            .map(|m| (m.key, m.version_id));
        let versions = stored
            .chain(hidden)
            .filter_map(|(key, version_id)| {
                Some(ObjectVersion {
                    name: key?,
                    version_id: version_id?,
                })
            })
            .collect();

        let next = if output.is_truncated.unwrap_or(false) {
            output
                .next_key_marker
                .zip(output.next_version_id_marker)
                .map(|(name, version_id)| VersionMarker { name, version_id })
        } else {
            None
        };

        Ok(VersionPage { versions, next })
    }

    async fn delete_object_version(
        &self,
        bucket: &str,
        name: &str,
        version_id: &str,
    ) -> RemoteResult<()> {
        debug!("Deleting object version: {} ({})", name, version_id);
        self.client
            .delete_object()
            .bucket(bucket)
            .key(name)
            .version_id(version_id)
            .send()
            .await
            .map_err(|e| map_error("DELETE version", name, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoint() {
        assert_eq!(
            default_endpoint("us-west-004"),
            "https://s3.us-west-004.backblazeb2.com"
        );
    }

    #[test]
    fn test_public_url_uses_endpoint() {
        let remote = S3Remote::new(&ConnectOptions {
            account_id: "acct".into(),
            application_key: "key".into(),
            region: Some("eu-central-003".into()),
            endpoint: Some("https://example.test/".into()),
        });
        assert_eq!(remote.public_url("bucket"), "https://example.test/bucket/");
    }
}
