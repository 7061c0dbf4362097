//! AWS S3 gateway.
//!
//! Drives the native S3 multipart protocol for one upstream bucket.
//! Credentials are resolved via the standard AWS credential chain
//! (env vars, `~/.aws/credentials`, IAM role, etc.) unless explicit
//! keys are configured.

use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info};

use super::backend::{GatewayError, ObjectGateway};

/// S3 error codes that indicate a retryable condition.
const TRANSIENT_CODES: &[&str] = &[
    "SlowDown",
    "RequestTimeout",
    "InternalError",
    "ServiceUnavailable",
    "Throttling",
    "ThrottlingException",
];

/// Gateway that forwards multipart operations to AWS S3.
pub struct AwsGateway {
    /// AWS S3 SDK client.
    client: Client,
    /// The upstream S3 bucket name.
    bucket: String,
}

impl AwsGateway {
    /// Create a new AWS gateway.
    ///
    /// Loads AWS credentials from the default credential chain and
    /// initializes the S3 client for the specified region. An explicit
    /// key pair, custom endpoint (MinIO, LocalStack), and path-style
    /// addressing are supported for non-AWS deployments.
    pub async fn new(
        bucket: String,
        region: String,
        endpoint_url: Option<String>,
        use_path_style: bool,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region));

        if let Some(ref endpoint) = endpoint_url {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        if let (Some(ref ak), Some(ref sk)) = (&access_key_id, &secret_access_key) {
            let creds =
                aws_sdk_s3::config::Credentials::new(ak, sk, None, None, "chunkflow-config");
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;

        let s3_config_builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(use_path_style);

        let client = Client::from_conf(s3_config_builder.build());

        info!("AWS gateway initialized: bucket={}", bucket);

        Ok(Self { client, bucket })
    }

    /// Classify an AWS SDK error as transient or fatal.
    fn classify<E, R>(context: &str, err: SdkError<E, R>) -> GatewayError
    where
        E: ProvideErrorMetadata + std::error::Error,
        R: std::fmt::Debug,
    {
        match &err {
            SdkError::TimeoutError(_) => GatewayError::Transient {
                message: format!("{context}: request timed out"),
            },
            SdkError::DispatchFailure(_) => GatewayError::Transient {
                message: format!("{context}: failed to dispatch request"),
            },
            SdkError::ResponseError(_) => GatewayError::Transient {
                message: format!("{context}: unparseable response from backend"),
            },
            SdkError::ServiceError(ctx) => {
                let code = ctx.err().code().unwrap_or("Unknown");
                let message = ctx.err().message().unwrap_or("no message");
                if TRANSIENT_CODES.contains(&code) {
                    GatewayError::Transient {
                        message: format!("{context}: {code}: {message}"),
                    }
                } else {
                    GatewayError::Fatal {
                        message: format!("{context}: {code}: {message}"),
                    }
                }
            }
            _ => GatewayError::Fatal {
                message: format!("{context}: {err}"),
            },
        }
    }
}

impl ObjectGateway for AwsGateway {
    fn begin_multipart(
        &self,
        object_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<String, GatewayError>> + Send + '_>> {
        let object_key = object_key.to_string();
        Box::pin(async move {
            debug!(
                "AWS create_multipart_upload: bucket={} key={}",
                self.bucket, object_key
            );

            let resp = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(&object_key)
                .send()
                .await
                .map_err(|e| Self::classify("create_multipart_upload", e))?;

            resp.upload_id()
                .map(|s| s.to_string())
                .ok_or_else(|| GatewayError::Fatal {
                    message: "create_multipart_upload: no upload ID in response".to_string(),
                })
        })
    }

    fn upload_part(
        &self,
        object_key: &str,
        multipart_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<String, GatewayError>> + Send + '_>> {
        let object_key = object_key.to_string();
        let multipart_id = multipart_id.to_string();
        Box::pin(async move {
            debug!(
                "AWS upload_part: bucket={} key={} part={} bytes={}",
                self.bucket,
                object_key,
                part_number,
                data.len()
            );

            let resp = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(&object_key)
                .upload_id(&multipart_id)
                .part_number(part_number as i32)
                .body(aws_sdk_s3::primitives::ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Self::classify("upload_part", e))?;

            resp.e_tag()
                .map(|s| s.to_string())
                .ok_or_else(|| GatewayError::Fatal {
                    message: "upload_part: no ETag in response".to_string(),
                })
        })
    }

    fn complete_multipart(
        &self,
        object_key: &str,
        multipart_id: &str,
        parts: &[(u32, String)],
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + '_>> {
        let object_key = object_key.to_string();
        let multipart_id = multipart_id.to_string();
        let parts = parts.to_vec();
        Box::pin(async move {
            debug!(
                "AWS complete_multipart_upload: bucket={} key={} parts={}",
                self.bucket,
                object_key,
                parts.len()
            );

            let completed_parts: Vec<CompletedPart> = parts
                .iter()
                .map(|(number, etag)| {
                    CompletedPart::builder()
                        .part_number(*number as i32)
                        .e_tag(etag)
                        .build()
                })
                .collect();

            let completed_upload = CompletedMultipartUpload::builder()
                .set_parts(Some(completed_parts))
                .build();

            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&object_key)
                .upload_id(&multipart_id)
                .multipart_upload(completed_upload)
                .send()
                .await
                .map_err(|e| Self::classify("complete_multipart_upload", e))?;

            Ok(())
        })
    }

    fn abort_multipart(
        &self,
        object_key: &str,
        multipart_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + '_>> {
        let object_key = object_key.to_string();
        let multipart_id = multipart_id.to_string();
        Box::pin(async move {
            debug!(
                "AWS abort_multipart_upload: bucket={} key={} upload={}",
                self.bucket, object_key, multipart_id
            );

            self.client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&object_key)
                .upload_id(&multipart_id)
                .send()
                .await
                .map_err(|e| Self::classify("abort_multipart_upload", e))?;

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_code_table() {
        assert!(TRANSIENT_CODES.contains(&"SlowDown"));
        assert!(TRANSIENT_CODES.contains(&"RequestTimeout"));
        assert!(!TRANSIENT_CODES.contains(&"NoSuchUpload"));
        assert!(!TRANSIENT_CODES.contains(&"AccessDenied"));
    }
}
