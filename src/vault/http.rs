//! Vault HTTP client
//!
//! Blocking client for the Vault HTTP API. One instance is shared by all
//! worker threads; `reqwest::blocking::Client` pools connections
//! internally.
//!
//! Endpoints used:
//! - `LIST /v1/<path>` for directory listings (`data.keys`)
//! - `GET/PUT/DELETE /v1/<path>` for leaf values
//! - `GET /v1/sys/policy`, `PUT/DELETE /v1/sys/policy/<name>` for policies
//! - `GET /v1/sys/internal/ui/mounts/<path>` to find a path's mount and
//!   its KV version

use crate::config::VaultAddr;
use crate::error::{VaultError, VaultResult};
use crate::path;
use crate::vault::{ListEntry, MountProtocol, SecretData, VaultStore};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::trace;

/// Header carrying the client token
const TOKEN_HEADER: &str = "X-Vault-Token";

/// Envelope of every Vault response that carries data
#[derive(Debug, Deserialize)]
struct DataResponse<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ListData {
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PolicyList {
    #[serde(default)]
    policies: Vec<String>,
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MountData {
    #[serde(default)]
    path: String,
    #[serde(default)]
    options: Option<MountOptions>,
}

#[derive(Debug, Deserialize)]
struct MountOptions {
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

/// Blocking Vault API client
pub struct HttpVault {
    address: VaultAddr,
    client: Client,
}

impl HttpVault {
    /// Create a client for `address` authenticated with `token`
    pub fn new(address: VaultAddr, token: &str, timeout: Duration) -> VaultResult<Self> {
        let mut headers = HeaderMap::new();
        let mut token_value =
            HeaderValue::from_str(token).map_err(|e| VaultError::InvalidAddress {
                address: address.to_string(),
                reason: format!("token is not a valid header value: {e}"),
            })?;
        token_value.set_sensitive(true);
        headers.insert(TOKEN_HEADER, token_value);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| VaultError::InvalidAddress {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self { address, client })
    }

    fn request(&self, method: Method, api_path: &str) -> RequestBuilder {
        let url = format!("{}/v1/{}", self.address.base_url(), path::sanitize(api_path));
        trace!(method = %method, url = %url, "Vault request");
        self.client.request(method, url)
    }

    fn send(&self, builder: RequestBuilder, method: &'static str, api_path: &str) -> VaultResult<Response> {
        builder.send().map_err(|e| VaultError::Http {
            path: api_path.to_string(),
            reason: format!("{method} request failed: {e}"),
        })
    }

    /// Turn a non-success response into a `VaultError::Status`
    fn check(response: Response, method: &'static str, api_path: &str) -> VaultResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .json::<ErrorBody>()
            .ok()
            .map(|body| body.errors.join("; "))
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());

        Err(VaultError::Status {
            method,
            path: api_path.to_string(),
            status: status.as_u16(),
            message,
        })
    }

    /// GET-like call whose 404 means "nothing here"
    fn fetch<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        label: &'static str,
        api_path: &str,
    ) -> VaultResult<Option<T>> {
        let response = self.send(self.request(method, api_path), label, api_path)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response, label, api_path)?;
        let body: DataResponse<T> = response.json().map_err(|e| VaultError::Decode {
            path: api_path.to_string(),
            reason: e.to_string(),
        })?;
        Ok(body.data)
    }

    fn mutate(&self, builder: RequestBuilder, label: &'static str, api_path: &str) -> VaultResult<()> {
        let response = self.send(builder, label, api_path)?;
        Self::check(response, label, api_path).map(|_| ())
    }
}

impl VaultStore for HttpVault {
    fn list(&self, api_path: &str) -> VaultResult<Vec<ListEntry>> {
        let list = Method::from_bytes(b"LIST").map_err(|e| VaultError::Decode {
            path: api_path.to_string(),
            reason: e.to_string(),
        })?;
        let data: Option<ListData> = self.fetch(list, "LIST", api_path)?;
        Ok(data
            .map(|d| d.keys.into_iter().map(ListEntry::new).collect())
            .unwrap_or_default())
    }

    fn read(&self, api_path: &str) -> VaultResult<Option<SecretData>> {
        let data: Option<Value> = self.fetch(Method::GET, "GET", api_path)?;
        Ok(data.and_then(SecretData::from_value))
    }

    fn write(&self, api_path: &str, data: &SecretData) -> VaultResult<()> {
        let builder = self.request(Method::PUT, api_path).json(data);
        self.mutate(builder, "PUT", api_path)
    }

    fn delete(&self, api_path: &str) -> VaultResult<()> {
        let builder = self.request(Method::DELETE, api_path);
        self.mutate(builder, "DELETE", api_path)
    }

    fn list_policies(&self) -> VaultResult<Vec<String>> {
        let api_path = "sys/policy";
        let response = self.send(self.request(Method::GET, api_path), "GET", api_path)?;
        let response = Self::check(response, "GET", api_path)?;

        // older servers answer at the top level, newer ones under `data`
        let body: Value = response.json().map_err(|e| VaultError::Decode {
            path: api_path.to_string(),
            reason: e.to_string(),
        })?;
        let list = body.get("data").filter(|d| d.is_object()).cloned().unwrap_or(body);
        let list: PolicyList = serde_json::from_value(list).map_err(|e| VaultError::Decode {
            path: api_path.to_string(),
            reason: e.to_string(),
        })?;

        Ok(if list.policies.is_empty() { list.keys } else { list.policies })
    }

    fn put_policy(&self, name: &str, rules: &str) -> VaultResult<()> {
        let api_path = format!("sys/policy/{name}");
        let builder = self
            .request(Method::PUT, &api_path)
            .json(&serde_json::json!({ "policy": rules }));
        self.mutate(builder, "PUT", &api_path)
    }

    fn delete_policy(&self, name: &str) -> VaultResult<()> {
        let api_path = format!("sys/policy/{name}");
        let builder = self.request(Method::DELETE, &api_path);
        self.mutate(builder, "DELETE", &api_path)
    }

    fn lookup_mount(&self, api_path: &str) -> VaultResult<(String, MountProtocol)> {
        let mounts_path = format!("sys/internal/ui/mounts/{}", path::sanitize(api_path));
        let response = self.send(self.request(Method::GET, &mounts_path), "GET", &mounts_path)?;
        let response = Self::check(response, "GET", &mounts_path)?;
        let body: DataResponse<MountData> = response.json().map_err(|e| VaultError::Decode {
            path: mounts_path.clone(),
            reason: e.to_string(),
        })?;

        // no mount description means a generic v1 backend at the first segment
        let Some(mount) = body.data.filter(|m| !m.path.is_empty()) else {
            let sanitized = path::sanitize(api_path);
            return Ok((format!("{}/", path::mount_of(&sanitized)), MountProtocol::V1));
        };

        let version = mount.options.and_then(|o| o.version);
        Ok((mount.path, MountProtocol::from_version(version.as_deref())))
    }
}
