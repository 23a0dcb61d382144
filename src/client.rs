//!
//! Remote storage client
//! ---------------------
//! reqwest-based mirror of the storage operations against a remote blobsync
//! server. The JSON envelope is translated back into the local error
//! taxonomy, so callers (the reconciler above all) cannot tell a remote store
//! from a local one. Downloads rebuild `FileMetadata` from response headers
//! since the body is the raw file.

use reqwest::header;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::server::DIGEST_PREFIX;
use crate::types::{format_http_date, parse_http_date, ApiResponse, FileMetadata};

const API_PREFIX: &str = "/v1";

pub struct RestClient {
    base: Url,
    auth: Option<(String, String)>,
    http: reqwest::Client,
}

impl RestClient {
    pub fn new(cfg: &RemoteConfig) -> Result<Self> {
        let base = Url::parse(&cfg.url)
            .map_err(|e| Error::network(format!("invalid remote url '{}': {e}", cfg.url)))?;

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::network(format!("build http client: {e}")))?;

        let auth = cfg
            .username
            .clone()
            .map(|user| (user, cfg.password.clone().unwrap_or_default()));

        Ok(Self { base, auth, http })
    }

    pub fn remote_url(&self) -> &Url {
        &self.base
    }

    fn prepare(
        &self,
        method: Method,
        op_path: &str,
        params: &[(&str, &str)],
    ) -> reqwest::RequestBuilder {
        let mut url = self.base.clone();
        url.set_path(&format!(
            "{}{API_PREFIX}{op_path}",
            self.base.path().trim_end_matches('/')
        ));
        for (key, val) in params {
            url.query_pairs_mut().append_pair(key, val);
        }

        let mut req = self.http.request(method, url);
        if let Some((user, pass)) = &self.auth {
            req = req.basic_auth(user, Some(pass));
        }
        req
    }

    async fn exec(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        req.send()
            .await
            .map_err(|e| Error::network(format!("api request: {e}")))
    }

    /// Fail fast on an unreachable or misconfigured remote (including TLS
    /// trust failures) before a sync run starts.
    pub async fn ping(&self) -> Result<()> {
        let resp = self.exec(self.prepare(Method::GET, "/gen_204", &[])).await?;
        if resp.status() != StatusCode::NO_CONTENT {
            return Err(Error::network(format!(
                "remote unavailable: http status {}",
                resp.status()
            )));
        }
        Ok(())
    }

    pub async fn put(
        &self,
        meta: &FileMetadata,
        content: Vec<u8>,
        overwrite: bool,
    ) -> Result<FileMetadata> {
        let mut params = vec![("name", meta.name.as_str())];
        if overwrite {
            params.push(("overwrite", "true"));
        }

        let mut req = self
            .prepare(Method::PUT, "/upload", &params)
            .header(header::LAST_MODIFIED, format_http_date(&meta.modified));
        if !meta.sha256.is_empty() {
            req = req.header(header::ETAG, format!("{DIGEST_PREFIX}{}", meta.sha256));
        }

        unwrap_json(self.exec(req.body(content)).await?).await
    }

    /// Download a whole file; identity comes back in the response headers.
    pub async fn download(&self, name: &str) -> Result<(FileMetadata, Vec<u8>)> {
        let resp = self
            .exec(self.prepare(Method::GET, "/download", &[("name", name)]))
            .await?;

        if resp.status() != StatusCode::OK {
            // a well-formed error rides in the envelope; anything else is a
            // transport-level failure
            unwrap_json::<serde_json::Value>(resp).await?;
            return Err(Error::network("non-json response for a blob error"));
        }

        let mut meta = FileMetadata {
            name: name.to_string(),
            size: 0,
            modified: chrono::Utc::now(),
            sha256: String::new(),
        };

        if let Some(val) = header_str(&resp, header::CONTENT_LENGTH).and_then(|v| v.parse().ok()) {
            meta.size = val;
        }
        if let Some(val) = header_str(&resp, header::LAST_MODIFIED).and_then(|v| parse_http_date(&v))
        {
            meta.modified = val;
        }
        if let Some(val) =
            header_str(&resp, header::ETAG).and_then(|v| v.strip_prefix(DIGEST_PREFIX).map(String::from))
        {
            meta.sha256 = val;
        }
        if let Some(val) = header_str(&resp, header::CONTENT_DISPOSITION)
            .and_then(|v| v.trim().strip_prefix("attachment; filename=").map(String::from))
            .and_then(|v| urlencoding::decode(&v).ok().map(|d| d.into_owned()))
        {
            meta.name = val;
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::network(format!("read download body: {e}")))?;
        Ok((meta, body.to_vec()))
    }

    pub async fn stat(&self, name: &str) -> Result<FileMetadata> {
        unwrap_json(
            self.exec(self.prepare(Method::GET, "/stat", &[("name", name)]))
                .await?,
        )
        .await
    }

    pub async fn rename(
        &self,
        name: &str,
        new_name: &str,
        overwrite: bool,
    ) -> Result<FileMetadata> {
        let mut params = vec![("name", name), ("new_name", new_name)];
        if overwrite {
            params.push(("overwrite", "true"));
        }
        unwrap_json(self.exec(self.prepare(Method::POST, "/move", &params)).await?).await
    }

    pub async fn delete(&self, name: &str) -> Result<FileMetadata> {
        unwrap_json(
            self.exec(self.prepare(Method::DELETE, "/delete", &[("name", name)]))
                .await?,
        )
        .await
    }

    pub async fn list(
        &self,
        prefix: &str,
        recursive: bool,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<FileMetadata>> {
        let offset_val = offset.to_string();
        let limit_val = limit.to_string();
        let mut params = vec![("prefix", prefix)];
        if recursive {
            params.push(("recursive", "true"));
        }
        if offset > 0 {
            params.push(("offset", offset_val.as_str()));
        }
        if limit > 0 {
            params.push(("limit", limit_val.as_str()));
        }
        unwrap_json(self.exec(self.prepare(Method::GET, "/list", &params)).await?).await
    }
}

fn header_str(resp: &reqwest::Response, name: header::HeaderName) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Decode the `{data, error}` envelope, rebuilding the error taxonomy from
/// the HTTP status + message. Non-JSON bodies are transport failures.
async fn unwrap_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();

    let is_json = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("json"))
        .unwrap_or(false);
    if !is_json {
        return Err(Error::network(format!(
            "non-json response (status code: {status})"
        )));
    }

    let body: ApiResponse<T> = resp
        .json()
        .await
        .map_err(|e| Error::network(format!("decode response json: {e}")))?;

    if let Some(err) = body.error {
        return Err(Error::from_status(status.as_u16(), err.message));
    }

    body.data
        .ok_or_else(|| Error::network("empty response envelope"))
}
