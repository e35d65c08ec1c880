//! REST provider for the container platform API
//!
//! - create: `PUT {endpoint}/{type}/{name}` (upsert)
//! - update: `PATCH {endpoint}{provider_id}`
//! - delete: `DELETE {endpoint}{provider_id}`, 404 means already gone

use anyhow::{Result, bail};
use declarative::{
    Properties, Provider, ProviderError, ProviderOutput, ResolvedResource, ResourceType,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const USER_AGENT: &str = concat!("converge/", env!("CARGO_PKG_VERSION"));

/// Body sent on create and update
#[derive(Serialize)]
struct ResourceRequest<'a> {
    #[serde(rename = "type")]
    resource_type: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<&'a str>,
    properties: &'a Properties,
}

/// Body returned on create and update; both fields optional
#[derive(Debug, Default, Deserialize)]
struct ResourceResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    outputs: Properties,
}

pub struct HttpProvider {
    agent: ureq::Agent,
    endpoint: String,
    token: Option<String>,
}

impl fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProvider")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

impl HttpProvider {
    pub fn new(endpoint: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            bail!("Provider endpoint must be an http(s) URL: {endpoint}");
        }

        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Ok(Self {
            agent: ureq::Agent::new_with_config(config),
            endpoint,
            token,
        })
    }

    fn resource_url(&self, resource_type: ResourceType, name: &str) -> String {
        format!("{}/{}/{}", self.endpoint, resource_type, name)
    }

    fn id_url(&self, provider_id: &str) -> String {
        if provider_id.starts_with('/') {
            format!("{}{}", self.endpoint, provider_id)
        } else {
            format!("{}/{}", self.endpoint, provider_id)
        }
    }

    fn authorize<B>(&self, request: ureq::RequestBuilder<B>) -> ureq::RequestBuilder<B> {
        let request = request
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/json");
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    fn send(
        &self,
        method: &str,
        request: ureq::RequestBuilder<ureq::typestate::WithBody>,
        resource: &ResolvedResource,
    ) -> Result<ProviderOutput, ProviderError> {
        let body = ResourceRequest {
            resource_type: resource.resource_type.as_str(),
            name: &resource.name,
            parent: resource.parent_provider_id.as_deref(),
            properties: &resource.properties,
        };

        let mut response = self
            .authorize(request)
            .send_json(&body)
            .map_err(|e| classify_error(method, &resource.id, e))?;

        let text = response
            .body_mut()
            .read_to_string()
            .map_err(|e| classify_error(method, &resource.id, e))?;
        let parsed = parse_response(&text).map_err(|e| {
            ProviderError::Permanent(format!("{method} {}: invalid response: {e}", resource.id))
        })?;

        Ok(ProviderOutput {
            provider_id: parsed.id.unwrap_or_else(|| {
                format!("/{}/{}", resource.resource_type, resource.name)
            }),
            outputs: parsed.outputs,
        })
    }
}

impl Provider for HttpProvider {
    fn create(&self, resource: &ResolvedResource) -> Result<ProviderOutput, ProviderError> {
        let url = self.resource_url(resource.resource_type, &resource.name);
        log::debug!("PUT {url}");
        self.send("PUT", self.agent.put(&url), resource)
    }

    fn update(
        &self,
        resource: &ResolvedResource,
        provider_id: &str,
    ) -> Result<ProviderOutput, ProviderError> {
        let url = self.id_url(provider_id);
        log::debug!("PATCH {url}");
        self.send("PATCH", self.agent.patch(&url), resource)
    }

    fn delete(&self, resource_type: ResourceType, provider_id: &str) -> Result<(), ProviderError> {
        let url = self.id_url(provider_id);
        log::debug!("DELETE {url} ({resource_type})");
        match self.authorize(self.agent.delete(&url)).call() {
            Ok(_) => Ok(()),
            Err(ureq::Error::StatusCode(404)) => {
                log::debug!("{provider_id} already deleted");
                Ok(())
            }
            Err(e) => Err(classify_error("DELETE", provider_id, e)),
        }
    }
}

fn parse_response(text: &str) -> Result<ResourceResponse, serde_json::Error> {
    if text.trim().is_empty() {
        return Ok(ResourceResponse::default());
    }
    serde_json::from_str(text)
}

/// Map an HTTP status to a retryable or permanent error
pub fn classify_status(context: &str, code: u16) -> ProviderError {
    let message = format!("{context}: HTTP {code}");
    match code {
        408 | 429 | 500..=599 => ProviderError::Transient(message),
        _ => ProviderError::Permanent(message),
    }
}

fn classify_error(method: &str, subject: &str, error: ureq::Error) -> ProviderError {
    let context = format!("{method} {subject}");
    match error {
        ureq::Error::StatusCode(code) => classify_status(&context, code),
        ureq::Error::Timeout(_)
        | ureq::Error::Io(_)
        | ureq::Error::ConnectionFailed
        | ureq::Error::HostNotFound => ProviderError::Transient(format!("{context}: {error}")),
        other => ProviderError::Permanent(format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> HttpProvider {
        HttpProvider::new(
            "https://platform.example.com/api/",
            Some("t0ken".into()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status("PUT x", 429).is_retryable());
        assert!(classify_status("PUT x", 408).is_retryable());
        assert!(classify_status("PUT x", 503).is_retryable());
        assert!(!classify_status("PUT x", 400).is_retryable());
        assert!(!classify_status("PUT x", 409).is_retryable());
        assert_eq!(
            classify_status("PUT container_app.db", 403),
            ProviderError::Permanent("PUT container_app.db: HTTP 403".into())
        );
    }

    #[test]
    fn test_transport_errors_are_transient() {
        assert!(classify_error("PUT", "x", ureq::Error::ConnectionFailed).is_retryable());
        assert!(classify_error("PUT", "x", ureq::Error::HostNotFound).is_retryable());
        assert!(!classify_error("PUT", "x", ureq::Error::StatusCode(422)).is_retryable());
    }

    #[test]
    fn test_urls() {
        let provider = provider();
        assert_eq!(
            provider.resource_url(ResourceType::ContainerApp, "dns-server"),
            "https://platform.example.com/api/container_app/dns-server"
        );
        assert_eq!(
            provider.id_url("/container_app/dns-server"),
            "https://platform.example.com/api/container_app/dns-server"
        );
        assert_eq!(
            provider.id_url("apps/123"),
            "https://platform.example.com/api/apps/123"
        );
    }

    #[test]
    fn test_rejects_non_http_endpoint() {
        assert!(HttpProvider::new("ftp://example.com", None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_debug_hides_token() {
        let debug = format!("{:?}", provider());
        assert!(!debug.contains("t0ken"));
    }

    #[test]
    fn test_parse_response() {
        let empty = parse_response("  ").unwrap();
        assert!(empty.id.is_none());
        assert!(empty.outputs.is_empty());

        let parsed =
            parse_response(r#"{"id": "/apps/42", "outputs": {"fqdn": "db.internal"}}"#).unwrap();
        assert_eq!(parsed.id.as_deref(), Some("/apps/42"));
        assert_eq!(parsed.outputs["fqdn"], "db.internal");

        assert!(parse_response("not json").is_err());
    }

    #[test]
    fn test_request_body_shape() {
        let mut properties = Properties::new();
        properties.insert("image".into(), "redis:7".into());
        let body = ResourceRequest {
            resource_type: "container_app",
            name: "cache",
            parent: None,
            properties: &properties,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "container_app");
        assert_eq!(json["properties"]["image"], "redis:7");
        assert!(json.get("parent").is_none());
    }
}
