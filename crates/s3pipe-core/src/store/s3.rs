//! S3-compatible object store over plain HTTP
//!
//! Requests are signed with SigV4 (`UNSIGNED-PAYLOAD`) and sent with reqwest.
//! Only the handful of calls the transfer engine needs are implemented.

use super::sign::{sign_request, Credentials, UNSIGNED_PAYLOAD};
use super::{ByteRange, ObjectMeta, ObjectStore, PartId, UploadHandle};
use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{Client, Method, Response, StatusCode};
use s3pipe_types::ObjectRef;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Connection settings for an S3-compatible endpoint
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Custom endpoint such as `http://localhost:9000`; AWS when `None`
    pub endpoint: Option<String>,
    pub region: String,
    /// Address buckets as `/<bucket>/<key>` instead of `<bucket>.<host>`
    pub path_style: bool,
    pub credentials: Credentials,
}

/// [`ObjectStore`] backed by an S3-compatible HTTP API
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    config: S3Config,
}

impl S3Store {
    pub fn new(config: S3Config) -> Result<Self, StoreError> {
        let client = Client::builder()
            .user_agent(concat!("s3pipe/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { client, config })
    }

    /// Dotted bucket names break virtual-host TLS, so they always use path style
    fn use_path_style(&self, bucket: &str) -> bool {
        self.config.path_style || bucket.contains('.')
    }

    fn object_url(&self, object: &ObjectRef) -> Result<Url, StoreError> {
        let key = encode_key(&object.key);
        let bucket = &object.bucket;
        let path_style = self.use_path_style(bucket);

        let raw = match &self.config.endpoint {
            Some(endpoint) if path_style => {
                format!("{}/{}/{}", endpoint.trim_end_matches('/'), bucket, key)
            }
            Some(endpoint) => {
                let base = Url::parse(endpoint)
                    .map_err(|e| StoreError::InvalidRequest(format!("{}: {}", endpoint, e)))?;
                let host = base.host_str().unwrap_or_default();
                match base.port() {
                    Some(port) => format!("{}://{}.{}:{}/{}", base.scheme(), bucket, host, port, key),
                    None => format!("{}://{}.{}/{}", base.scheme(), bucket, host, key),
                }
            }
            None if path_style => format!(
                "https://s3.{}.amazonaws.com/{}/{}",
                self.config.region, bucket, key
            ),
            None => format!("https://{}.s3.{}.amazonaws.com/{}", bucket, self.config.region, key),
        };

        Url::parse(&raw).map_err(|e| StoreError::InvalidRequest(format!("{}: {}", raw, e)))
    }

    async fn send(
        &self,
        method: Method,
        object: &ObjectRef,
        query: &[(&str, &str)],
        headers: &[(String, String)],
        body: Option<Bytes>,
    ) -> Result<Response, StoreError> {
        let mut url = self.object_url(object)?;
        if !query.is_empty() {
            let query = query
                .iter()
                .map(|(k, v)| {
                    if v.is_empty() {
                        urlencoding::encode(k).into_owned()
                    } else {
                        format!("{}={}", urlencoding::encode(k), urlencoding::encode(v))
                    }
                })
                .collect::<Vec<_>>()
                .join("&");
            url.set_query(Some(&query));
        }

        let signed = sign_request(
            &self.config.credentials,
            &self.config.region,
            method.as_str(),
            &url,
            headers,
            UNSIGNED_PAYLOAD,
            Utc::now(),
        );

        debug!("{} {}", method, url);
        let mut request = self.client.request(method, url);
        for (name, value) in headers.iter().chain(signed.iter()) {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        Ok(request.send().await?)
    }
}

/// Percent-encode every path segment of a key, keeping `/` as separator
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Extract the text of the first `<tag>` element
fn xml_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    xml.split(&open)
        .nth(1)
        .and_then(|rest| rest.split(&close).next())
        .map(|s| s.to_string())
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn error_from_body(status: StatusCode, body: &str) -> StoreError {
    let code = xml_tag(body, "Code");
    let message = xml_tag(body, "Message");
    let message = match (code, message) {
        (Some(code), Some(message)) => format!("{}: {}", code, message),
        (Some(code), None) => code,
        (None, Some(message)) => message,
        (None, None) => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
    };
    StoreError::ServerError {
        status: status.as_u16(),
        message,
    }
}

/// Turn a non-success response into a [`StoreError`]
async fn check(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_from_body(status, &body))
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn initiate_upload(
        &self,
        object: &ObjectRef,
        headers: &[(String, String)],
    ) -> Result<UploadHandle, StoreError> {
        let response = self
            .send(Method::POST, object, &[("uploads", "")], headers, None)
            .await?;
        let body = check(response).await?.text().await?;

        let upload_id = xml_tag(&body, "UploadId")
            .ok_or_else(|| StoreError::Protocol("missing UploadId in response".to_string()))?;

        Ok(UploadHandle {
            object: object.clone(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        handle: &UploadHandle,
        sequence: u64,
        data: Bytes,
    ) -> Result<PartId, StoreError> {
        let part_number = (sequence + 1).to_string();
        let response = self
            .send(
                Method::PUT,
                &handle.object,
                &[
                    ("partNumber", part_number.as_str()),
                    ("uploadId", handle.upload_id.as_str()),
                ],
                &[],
                Some(data),
            )
            .await?;
        let response = check(response).await?;

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| StoreError::Protocol(format!("no ETag for part {}", part_number)))?;

        Ok(PartId { sequence, etag })
    }

    async fn complete_upload(
        &self,
        handle: &UploadHandle,
        parts: &[PartId],
    ) -> Result<(), StoreError> {
        let mut xml = String::from("<CompleteMultipartUpload>");
        for part in parts {
            xml.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                part.sequence + 1,
                xml_escape(&part.etag)
            ));
        }
        xml.push_str("</CompleteMultipartUpload>");

        let response = self
            .send(
                Method::POST,
                &handle.object,
                &[("uploadId", handle.upload_id.as_str())],
                &[("content-type".to_string(), "application/xml".to_string())],
                Some(Bytes::from(xml)),
            )
            .await?;
        let body = check(response).await?.text().await?;

        // S3 can report a failed completion inside a 200 response
        if body.contains("<Error>") {
            return Err(error_from_body(StatusCode::INTERNAL_SERVER_ERROR, &body));
        }
        Ok(())
    }

    async fn abort_upload(&self, handle: &UploadHandle) -> Result<(), StoreError> {
        let response = self
            .send(
                Method::DELETE,
                &handle.object,
                &[("uploadId", handle.upload_id.as_str())],
                &[],
                None,
            )
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn get_object_range(
        &self,
        object: &ObjectRef,
        range: ByteRange,
    ) -> Result<Bytes, StoreError> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }
        let header = format!("bytes={}-{}", range.start, range.end - 1);
        let response = self
            .send(
                Method::GET,
                object,
                &[],
                &[("range".to_string(), header)],
                None,
            )
            .await?;
        let data = check(response).await?.bytes().await?;

        if data.len() as u64 != range.len() {
            return Err(StoreError::Protocol(format!(
                "range {}-{} returned {} bytes",
                range.start,
                range.end,
                data.len()
            )));
        }
        Ok(data)
    }

    async fn head_object(&self, object: &ObjectRef) -> Result<ObjectMeta, StoreError> {
        let response = self.send(Method::HEAD, object, &[], &[], None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
            });
        }
        let response = check(response).await?;
        let headers = response.headers();

        let size = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| StoreError::Protocol("HEAD without Content-Length".to_string()))?;
        let etag = headers
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        Ok(ObjectMeta {
            size,
            etag,
            content_type,
        })
    }

    async fn put_object(&self, object: &ObjectRef, data: Bytes) -> Result<(), StoreError> {
        let response = self
            .send(Method::PUT, object, &[], &[], Some(data))
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn get_object(&self, object: &ObjectRef) -> Result<Option<Bytes>, StoreError> {
        let response = self.send(Method::GET, object, &[], &[], None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let data = check(response).await?.bytes().await?;
        Ok(Some(data))
    }
}
