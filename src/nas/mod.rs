//! NAS file retrieval over the FileStation web API
//!
//! The NAS exposes a CGI-style API: every call is a GET against
//! `/webapi/<CGI_PATH>` with `api`, `version` and `method` query parameters.
//! The available endpoints and their versions are discovered through the
//! info API first, then a session id from the auth API authorizes the
//! actual file operations.

pub mod upload;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::config::NasConfig;
use crate::error::{AppError, Result};

const API_INFO: &str = "SYNO.API.Info";
const API_AUTH: &str = "SYNO.API.Auth";
const API_DOWNLOAD: &str = "SYNO.FileStation.Download";

/// API catalogue returned by the info endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiInfo {
    #[serde(default)]
    pub data: HashMap<String, ApiDetail>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiDetail {
    #[serde(rename = "maxVersion", default)]
    pub max_version: u32,
    #[serde(rename = "minVersion", default)]
    pub min_version: u32,
    #[serde(default)]
    pub path: String,
    #[serde(rename = "requestFormat", default)]
    pub request_format: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    data: AuthData,
}

#[derive(Debug, Default, Deserialize)]
struct AuthData {
    #[serde(default)]
    sid: String,
}

/// FileStation API client
pub struct FileStation {
    http: reqwest::Client,
    config: NasConfig,
}

impl FileStation {
    pub fn new(config: NasConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Query the API catalogue for the endpoints this client uses.
    pub async fn api_info(&self) -> Result<ApiInfo> {
        let request = RequestElem {
            host: self.host(),
            api_name: API_INFO,
            version: 1,
            path: "query.cgi",
            method: "query",
            params: vec![("query".to_string(), format!("{},{}", API_AUTH, API_DOWNLOAD))],
            sid: None,
        };

        let response = self.get_ok(construct_url(&request)?).await?;
        Ok(response.json::<ApiInfo>().await?)
    }

    /// Log in to a FileStation session; returns the session id.
    pub async fn login(&self, info: &ApiInfo) -> Result<String> {
        let api = lookup(info, API_AUTH)?;
        let request = RequestElem {
            host: self.host(),
            api_name: API_AUTH,
            version: api.max_version,
            path: &api.path,
            method: "login",
            params: vec![
                ("account".to_string(), self.config.account.clone()),
                ("passwd".to_string(), self.config.password.clone()),
                ("session".to_string(), "FileStation".to_string()),
                ("format".to_string(), "sid".to_string()),
            ],
            sid: None,
        };

        let response = self.get_ok(construct_url(&request)?).await?;
        let auth: AuthResponse = response.json().await?;
        debug!("logged in to {}", self.host());
        Ok(auth.data.sid)
    }

    /// End the FileStation session.
    pub async fn logout(&self, info: &ApiInfo, sid: &str) -> Result<()> {
        let api = lookup(info, API_AUTH)?;
        let request = RequestElem {
            host: self.host(),
            api_name: API_AUTH,
            version: api.max_version,
            path: &api.path,
            method: "logout",
            params: vec![("session".to_string(), "FileStation".to_string())],
            sid: Some(sid),
        };

        self.get_ok(construct_url(&request)?).await?;
        Ok(())
    }

    /// Download the given remote paths into the configured store directory
    /// under a fresh name. Multiple paths arrive as one archive.
    pub async fn download(&self, info: &ApiInfo, files: &[String], sid: &str) -> Result<PathBuf> {
        let api = lookup(info, API_DOWNLOAD)?;
        let path_list = files
            .iter()
            .map(|f| format!("\"{}\"", f))
            .collect::<Vec<_>>()
            .join(",");
        let request = RequestElem {
            host: self.host(),
            api_name: API_DOWNLOAD,
            version: api.max_version,
            path: &api.path,
            method: "download",
            params: vec![
                ("path".to_string(), format!("[{}]", path_list)),
                ("mode".to_string(), "download".to_string()),
            ],
            sid: Some(sid),
        };

        let response = self.get_ok(construct_url(&request)?).await?;

        let path = Path::new(&self.config.store_path).join(Uuid::new_v4().to_string());
        let mut file = tokio::fs::File::create(&path).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;

        info!("file saved in {}", path.display());
        Ok(path)
    }

    fn host(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    async fn get_ok(&self, url: Url) -> Result<reqwest::Response> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::Nas(format!(
                "http request failed, status code = {}",
                response.status().as_u16()
            )));
        }
        Ok(response)
    }
}

fn lookup<'a>(info: &'a ApiInfo, name: &str) -> Result<&'a ApiDetail> {
    info.data
        .get(name)
        .ok_or_else(|| AppError::Nas(format!("unsupported api name {}", name)))
}

struct RequestElem<'a> {
    host: String,
    api_name: &'a str,
    version: u32,
    path: &'a str,
    method: &'a str,
    params: Vec<(String, String)>,
    sid: Option<&'a str>,
}

/// Build a FileStation request of the documented shape:
///
/// `GET /webapi/<CGI_PATH>?api=<API_NAME>&version=<VERSION>&method=<METHOD>[&<PARAMS>][&_sid=<SID>]`
fn construct_url(elem: &RequestElem<'_>) -> Result<Url> {
    let mut url = Url::parse(&format!("http://{}/webapi/{}", elem.host, elem.path))
        .map_err(|e| AppError::Nas(format!("invalid api url: {}", e)))?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("api", elem.api_name);
        query.append_pair("version", &elem.version.to_string());
        query.append_pair("method", elem.method);
        for (name, value) in &elem.params {
            query.append_pair(name, value);
        }
        if let Some(sid) = elem.sid {
            query.append_pair("_sid", sid);
        }
    }

    Ok(url)
}
