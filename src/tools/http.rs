//! External-call tool: outbound HTTP with pluggable authentication.

use crate::config::HttpToolConfig;
use crate::error::{AgentError, Result};
use crate::tools::registry::{
    Capability, ParamSpec, ParamType, ToolDescriptor, ToolHandler, ToolInput, ToolOutput,
};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Hosts refused when internal-host blocking is on.
const BLOCKED_HOSTS: [&str; 4] = ["localhost", "127.0.0.1", "0.0.0.0", "::1"];

/// Parsed authentication argument.
#[derive(Debug, PartialEq)]
pub enum AuthSpec {
    Bearer(String),
    Basic {
        username: String,
        password: Option<String>,
    },
    ApiKeyHeader {
        name: String,
        value: String,
    },
    ApiKeyQuery {
        name: String,
        value: String,
    },
}

impl AuthSpec {
    /// Parse the `auth` argument object.
    pub fn parse(auth: &Value) -> Result<Self> {
        let kind = auth
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase();

        let str_field = |name: &str| -> Result<String> {
            auth.get(name)
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| {
                    AgentError::InvalidInput(format!("auth field '{name}' is required"))
                })
        };

        match kind.as_str() {
            "bearer" => Ok(Self::Bearer(str_field("token")?)),
            "basic" => Ok(Self::Basic {
                username: str_field("username")?,
                password: auth
                    .get("password")
                    .and_then(Value::as_str)
                    .map(String::from),
            }),
            "api_key" => {
                let name = auth
                    .get("key_name")
                    .and_then(Value::as_str)
                    .unwrap_or("X-API-Key")
                    .to_string();
                let value = str_field("key_value")?;
                match auth.get("location").and_then(Value::as_str) {
                    Some("query") => Ok(Self::ApiKeyQuery { name, value }),
                    _ => Ok(Self::ApiKeyHeader { name, value }),
                }
            }
            other => Err(AgentError::InvalidInput(format!(
                "unsupported auth type: '{other}'"
            ))),
        }
    }
}

/// Validate scheme and host before making the call.
pub fn validate_url(url: &str, block_internal: bool) -> Result<reqwest::Url> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| AgentError::InvalidInput(format!("invalid url '{url}': {e}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AgentError::InvalidInput(format!(
            "unsupported url scheme: '{}'",
            parsed.scheme()
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AgentError::InvalidInput("url has no host".into()))?;

    if block_internal && BLOCKED_HOSTS.contains(&host.to_lowercase().as_str()) {
        warn!("Refused request to internal host: {}", host);
        return Err(AgentError::InvalidInput(format!(
            "requests to internal host '{host}' are not allowed"
        )));
    }

    Ok(parsed)
}

/// Makes HTTP(S) calls to external endpoints.
pub struct HttpCallTool {
    client: reqwest::Client,
    config: HttpToolConfig,
}

impl HttpCallTool {
    pub fn new(config: HttpToolConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn method_from(args: &Value) -> Result<Method> {
        let name = args
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_ascii_uppercase();
        name.parse::<Method>()
            .map_err(|_| AgentError::InvalidInput(format!("invalid HTTP method: '{name}'")))
    }
}

#[async_trait]
impl ToolHandler for HttpCallTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "http_call".into(),
            capability: Capability::ExternalCall,
            description: "Call an external HTTP(S) endpoint with optional \
                          authentication and JSON or form body."
                .into(),
            input_schema: vec![
                ParamSpec::required("url", ParamType::String, "Endpoint URL"),
                ParamSpec::optional("method", ParamType::String, "HTTP method, default GET"),
                ParamSpec::optional("headers", ParamType::Object, "Request headers"),
                ParamSpec::optional("query", ParamType::Object, "Query string parameters"),
                ParamSpec::optional("json", ParamType::Object, "JSON request body"),
                ParamSpec::optional("form", ParamType::Object, "Form-encoded request body"),
                ParamSpec::optional(
                    "auth",
                    ParamType::Object,
                    "Authentication: bearer, basic or api_key",
                ),
                ParamSpec::optional("timeout_ms", ParamType::Integer, "Per-call timeout"),
            ],
        }
    }

    async fn prepare(&self, text: &str) -> Result<Value> {
        // First URL-looking token in the text becomes the endpoint.
        let url = text
            .split_whitespace()
            .find(|token| token.starts_with("http://") || token.starts_with("https://"))
            .map(|token| token.trim_end_matches([',', '.', ';', ')']))
            .ok_or_else(|| {
                AgentError::InvalidInput("no endpoint URL found in the request".into())
            })?;
        Ok(json!({ "url": url }))
    }

    #[instrument(skip(self, input), fields(tool = "http_call"))]
    async fn invoke(&self, input: ToolInput) -> Result<ToolOutput> {
        let url = input
            .str_arg("url")
            .ok_or_else(|| AgentError::InvalidInput("parameter 'url' is required".into()))?;
        let url = validate_url(url, self.config.block_internal_hosts)?;
        let method = Self::method_from(&input.args)?;

        let timeout = input
            .args
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(self.config.request_timeout);

        debug!("HTTP {} {}", method, url);

        let mut request = self.client.request(method, url).timeout(timeout);

        if let Some(headers) = input.args.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }

        if let Some(query) = input.args.get("query").and_then(Value::as_object) {
            let pairs: Vec<(String, String)> = query
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect();
            request = request.query(&pairs);
        }

        if let Some(auth) = input.args.get("auth").filter(|v| !v.is_null()) {
            request = match AuthSpec::parse(auth)? {
                AuthSpec::Bearer(token) => request.bearer_auth(token),
                AuthSpec::Basic { username, password } => request.basic_auth(username, password),
                AuthSpec::ApiKeyHeader { name, value } => request.header(name, value),
                AuthSpec::ApiKeyQuery { name, value } => request.query(&[(name, value)]),
            };
        }

        if let Some(body) = input.args.get("json").filter(|v| !v.is_null()) {
            request = request.json(body);
        } else if let Some(form) = input.args.get("form").and_then(Value::as_object) {
            let pairs: Vec<(String, String)> = form
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect();
            request = request.form(&pairs);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::NetworkTimeout(timeout.as_millis() as u64)
            } else {
                AgentError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AgentError::Http(e.to_string()))?;

        let body = match serde_json::from_str::<Value>(&text) {
            Ok(parsed) => parsed,
            Err(_) => Value::String(text),
        };

        Ok(ToolOutput::Scalar(json!({
            "status": status.as_u16(),
            "ok": status.is_success(),
            "body": body,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://api.example.com/v1", true).is_ok());
        assert!(validate_url("http://api.example.com", true).is_ok());

        assert!(validate_url("ftp://example.com", true).is_err());
        assert!(validate_url("not a url", true).is_err());
        assert!(validate_url("https://localhost:8080/x", true).is_err());
        assert!(validate_url("http://127.0.0.1/", true).is_err());

        // Blocking is policy, not a hard rule.
        assert!(validate_url("http://localhost:8080/x", false).is_ok());
    }

    #[test]
    fn test_auth_parse_bearer() {
        let auth = AuthSpec::parse(&json!({"type": "bearer", "token": "t0k"})).unwrap();
        assert_eq!(auth, AuthSpec::Bearer("t0k".into()));

        assert!(AuthSpec::parse(&json!({"type": "bearer"})).is_err());
    }

    #[test]
    fn test_auth_parse_basic() {
        let auth =
            AuthSpec::parse(&json!({"type": "basic", "username": "u", "password": "p"})).unwrap();
        assert_eq!(
            auth,
            AuthSpec::Basic {
                username: "u".into(),
                password: Some("p".into())
            }
        );
    }

    #[test]
    fn test_auth_parse_api_key() {
        let auth = AuthSpec::parse(&json!({"type": "api_key", "key_value": "k"})).unwrap();
        assert_eq!(
            auth,
            AuthSpec::ApiKeyHeader {
                name: "X-API-Key".into(),
                value: "k".into()
            }
        );

        let auth = AuthSpec::parse(
            &json!({"type": "api_key", "key_name": "key", "key_value": "k", "location": "query"}),
        )
        .unwrap();
        assert_eq!(
            auth,
            AuthSpec::ApiKeyQuery {
                name: "key".into(),
                value: "k".into()
            }
        );
    }

    #[test]
    fn test_auth_parse_rejects_unknown_type() {
        assert!(AuthSpec::parse(&json!({"type": "digest"})).is_err());
        assert!(AuthSpec::parse(&json!({})).is_err());
    }

    #[tokio::test]
    async fn test_prepare_extracts_url() {
        let tool = HttpCallTool::new(HttpToolConfig::default());

        let args = tool
            .prepare("call https://api.example.com/users, then summarize")
            .await
            .unwrap();
        assert_eq!(args["url"], "https://api.example.com/users");

        let err = tool.prepare("call the weather api").await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_invoke_rejects_bad_method() {
        let tool = HttpCallTool::new(HttpToolConfig::default());
        let err = tool
            .invoke(ToolInput::new(
                json!({"url": "https://api.example.com", "method": "GE T"}),
                "",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
    }
}
