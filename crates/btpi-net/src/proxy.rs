//! Same-origin proxy for remote XML/JSON APIs.

use btpi_core::ResponseFormat;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::xml::xml_to_json;

/// Base URLs used to absolutize relative `api` values, one per response format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProxyBases {
    #[serde(default)]
    pub host_xmlep: Option<String>,
    #[serde(default)]
    pub host_pulse: Option<String>,
}

impl ProxyBases {
    pub fn base_for(&self, format: ResponseFormat) -> Option<&str> {
        let base = match format {
            ResponseFormat::Xml => self.host_xmlep.as_deref(),
            ResponseFormat::Json => self.host_pulse.as_deref(),
        };
        base.filter(|b| !b.trim().is_empty())
    }

    fn setting_name(format: ResponseFormat) -> &'static str {
        match format {
            ResponseFormat::Xml => "wms_proxy.host_xmlep",
            ResponseFormat::Json => "wms_proxy.host_pulse",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Unknown or invalid URL protocol ({0})")]
    InvalidProtocol(String),
    #[error("Invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Error parsing XML {0}")]
    XmlParse(String),
    #[error("Proxy request failed ({code}). Check log for details.")]
    Request {
        code: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ProxyError {
    fn request(source: reqwest::Error) -> Self {
        let code = if let Some(status) = source.status() {
            status.as_u16().to_string()
        } else if source.is_timeout() {
            "timeout".to_string()
        } else if source.is_connect() {
            "connect".to_string()
        } else if source.is_decode() || source.is_body() {
            "body".to_string()
        } else {
            "request".to_string()
        };
        Self::Request { code, source }
    }
}

fn is_absolute(api: &str) -> bool {
    api.starts_with("http://") || api.starts_with("https://")
}

/// Prefixes a relative `api` value with the configured base for `format`.
/// Leaves it alone when no base is configured.
pub fn absolute_api(api: &str, format: ResponseFormat, bases: &ProxyBases) -> String {
    if is_absolute(api) {
        return api.to_string();
    }
    info!(api, "partial URL value passed; attempting to prefix with configured value");
    match bases.base_for(format) {
        Some(base) => {
            let full = format!("{base}{api}");
            info!(url = %full, "full url");
            full
        }
        None => {
            warn!(
                setting = ProxyBases::setting_name(format),
                "no endpoint configured; unable to prefix relative path"
            );
            api.to_string()
        }
    }
}

/// Upper-cases a stock code and escapes only the first `_` and the first `#`.
pub fn stock_code_value(raw: &str) -> String {
    raw.to_uppercase().replacen('_', "%20", 1).replacen('#', "%23", 1)
}

/// Rebuilds the parameter block from every pair except `api`, keeping values literal.
pub fn rebuild_params(params: &[(String, String)]) -> String {
    params
        .iter()
        .filter(|(key, _)| !key.eq_ignore_ascii_case("api"))
        .map(|(key, value)| {
            if key.eq_ignore_ascii_case("stock_code") {
                format!("{key}={}", stock_code_value(value))
            } else {
                format!("{key}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Assembles the upstream URL, or `None` when the request carried no `api`.
pub fn build_url(
    params: &[(String, String)],
    format: ResponseFormat,
    bases: &ProxyBases,
) -> Result<Option<Url>, ProxyError> {
    let Some((_, api)) = params.iter().find(|(key, _)| key == "api") else {
        return Ok(None);
    };

    let api = absolute_api(api, format, bases);
    let query = rebuild_params(params);
    let full = if query.is_empty() {
        api.clone()
    } else if api.contains('?') {
        format!("{api}&{query}")
    } else {
        format!("{api}?{query}")
    };

    let url = match Url::parse(&full) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            return Err(ProxyError::InvalidProtocol("none".to_string()))
        }
        Err(source) => return Err(ProxyError::InvalidUrl { url: full, source }),
    };
    if !url.origin().is_tuple() {
        return Err(ProxyError::InvalidProtocol(format!("{}:", url.scheme())));
    }
    Ok(Some(url))
}

#[derive(Debug, Clone)]
pub struct ProxyTranslator {
    client: reqwest::Client,
    bases: ProxyBases,
}

impl ProxyTranslator {
    pub fn new(client: reqwest::Client, bases: ProxyBases) -> Self {
        Self { client, bases }
    }

    pub fn bases(&self) -> &ProxyBases {
        &self.bases
    }

    /// Forwards one proxied GET and normalizes the body to JSON.
    ///
    /// `Ok(None)` means the request had no `api` parameter.
    pub async fn fetch(
        &self,
        params: &[(String, String)],
        format: ResponseFormat,
    ) -> Result<Option<Value>, ProxyError> {
        let Some(url) = build_url(params, format, &self.bases)? else {
            return Ok(None);
        };
        info!(%format, url = %url, "proxy fetching api");

        let body = self
            .client
            .get(url.clone())
            // Some legacy endpoints reject anything that is not an AJAX request.
            .header("X-Requested-With", "XMLHttpRequest")
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|err| {
                error!(url = %url, error = %err, "proxy request failed");
                ProxyError::request(err)
            })?
            .text()
            .await
            .map_err(|err| {
                error!(url = %url, error = %err, "reading proxy response failed");
                ProxyError::request(err)
            })?;

        let value = match format {
            ResponseFormat::Xml => xml_to_json(&body).map_err(ProxyError::XmlParse)?,
            ResponseFormat::Json => {
                serde_json::from_str(&body).unwrap_or_else(|_| Value::String(body))
            }
        };
        Ok(Some(value))
    }
}
