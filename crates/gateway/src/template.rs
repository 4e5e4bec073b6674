//! Request templating and the HTTP tool execution pipeline.
//!
//! Templates see `Args`, `Request.Headers` / `Request.Query` /
//! `Request.Cookies`, `Config` (the per-request rendered server-config map)
//! and, for response templates, `Response.Data`. Helper functions: `env`,
//! plus the `fromJSON` / `toJSON` / `add` filters. Compiled templates are
//! cached by content hash.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use config::model::{ArgPosition, ServerConfig, ToolConfig};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use shared::error::CommonError;
use tracing::{debug, trace};

use mcp::protocol::CallToolResult;

use crate::response::HandlerChain;

const TEMPLATE_NAME: &str = "inline";

/// Per-request template variables from the inbound HTTP request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestContext {
    #[serde(rename = "Headers")]
    pub headers: BTreeMap<String, String>,
    #[serde(rename = "Query")]
    pub query: BTreeMap<String, String>,
    #[serde(rename = "Cookies")]
    pub cookies: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseContext {
    #[serde(rename = "Data")]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderContext {
    #[serde(rename = "Args")]
    pub args: serde_json::Map<String, serde_json::Value>,
    #[serde(rename = "Request")]
    pub request: RequestContext,
    #[serde(rename = "Config")]
    pub config: BTreeMap<String, String>,
    #[serde(rename = "Response", skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseContext>,
}

fn env_function(
    args: &HashMap<String, tera::Value>,
) -> Result<tera::Value, tera::Error> {
    let name = args
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| tera::Error::msg("env requires a `name` argument"))?;
    let default = args.get("default").and_then(|v| v.as_str()).unwrap_or("");
    Ok(tera::Value::String(
        std::env::var(name).unwrap_or_else(|_| default.to_string()),
    ))
}

fn from_json_filter(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> Result<tera::Value, tera::Error> {
    let raw = value
        .as_str()
        .ok_or_else(|| tera::Error::msg("fromJSON expects a string"))?;
    serde_json::from_str(raw).map_err(|e| tera::Error::msg(format!("fromJSON: {e}")))
}

fn to_json_filter(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> Result<tera::Value, tera::Error> {
    let encoded =
        serde_json::to_string(value).map_err(|e| tera::Error::msg(format!("toJSON: {e}")))?;
    Ok(tera::Value::String(encoded))
}

fn add_filter(
    value: &tera::Value,
    args: &HashMap<String, tera::Value>,
) -> Result<tera::Value, tera::Error> {
    let base = value
        .as_f64()
        .ok_or_else(|| tera::Error::msg("add expects a number"))?;
    let n = args.get("n").and_then(|v| v.as_f64()).unwrap_or(1.0);
    let sum = base + n;
    if sum.fract() == 0.0 {
        Ok(tera::Value::from(sum as i64))
    } else {
        Ok(tera::Value::from(sum))
    }
}

/// Compiles templates on first use and caches the instances by content hash.
#[derive(Default)]
pub struct TemplateEngine {
    cache: RwLock<HashMap<String, Arc<tera::Tera>>>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn compiled(&self, source: &str) -> Result<Arc<tera::Tera>, CommonError> {
        let key = hex::encode(Sha256::digest(source.as_bytes()));
        if let Some(compiled) = self.cache.read().get(&key) {
            return Ok(compiled.clone());
        }

        let mut tera = tera::Tera::default();
        tera.register_function("env", env_function);
        tera.register_filter("fromJSON", from_json_filter);
        tera.register_filter("toJSON", to_json_filter);
        tera.register_filter("add", add_filter);
        tera.add_raw_template(TEMPLATE_NAME, source)
            .map_err(|e| CommonError::Validation {
                msg: format!("template does not compile: {e}"),
                source: Some(e.into()),
            })?;

        let compiled = Arc::new(tera);
        self.cache.write().insert(key, compiled.clone());
        trace!(size = self.cache.read().len(), "compiled template cached");
        Ok(compiled)
    }

    pub fn render(&self, source: &str, ctx: &RenderContext) -> Result<String, CommonError> {
        if source.is_empty() {
            return Ok(String::new());
        }
        let compiled = self.compiled(source)?;
        let context = tera::Context::from_serialize(ctx).map_err(|e| CommonError::Validation {
            msg: format!("template context: {e}"),
            source: Some(e.into()),
        })?;
        compiled
            .render(TEMPLATE_NAME, &context)
            .map_err(|e| CommonError::Validation {
                msg: format!("template render failed: {e}"),
                source: Some(e.into()),
            })
    }
}

/// Argument normalization ahead of rendering: arrays are JSON-encoded into
/// strings, whole-valued floats become integers, absent args fall back to
/// their configured defaults.
pub fn preprocess_args(
    tool: &ToolConfig,
    mut args: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    for value in args.values_mut() {
        match value {
            serde_json::Value::Array(_) => {
                let encoded = serde_json::to_string(value).unwrap_or_default();
                *value = serde_json::Value::String(encoded);
            }
            serde_json::Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    if n.as_i64().is_none() && f.fract() == 0.0 {
                        *value = serde_json::Value::from(f as i64);
                    }
                }
            }
            _ => {}
        }
    }

    for arg in &tool.args {
        if !args.contains_key(&arg.name) && !arg.default.is_empty() {
            args.insert(
                arg.name.clone(),
                serde_json::Value::String(arg.default.clone()),
            );
        }
    }

    args
}

fn value_as_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Executes HTTP-dispatched tools through the template pipeline.
pub struct HttpToolExecutor {
    engine: TemplateEngine,
    client: reqwest::Client,
    handlers: HandlerChain,
    default_timeout: Duration,
    /// Inbound header names copied verbatim onto the outgoing request.
    forward_headers: Vec<String>,
}

impl HttpToolExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            engine: TemplateEngine::new(),
            client: reqwest::Client::new(),
            handlers: HandlerChain::default(),
            default_timeout,
            forward_headers: Vec::new(),
        }
    }

    pub fn with_forward_headers(mut self, forward_headers: Vec<String>) -> Self {
        self.forward_headers = forward_headers;
        self
    }

    pub fn engine(&self) -> &TemplateEngine {
        &self.engine
    }

    pub async fn execute(
        &self,
        tool: &ToolConfig,
        server: Option<&ServerConfig>,
        request: RequestContext,
        args: serde_json::Map<String, serde_json::Value>,
    ) -> Result<CallToolResult, CommonError> {
        let args = preprocess_args(tool, args);

        let mut ctx = RenderContext {
            args,
            request,
            config: BTreeMap::new(),
            response: None,
        };

        // Server-config values are themselves templates, rendered once per
        // request before anything else sees them
        if let Some(server) = server {
            let mut rendered = BTreeMap::new();
            for (key, template) in &server.config {
                rendered.insert(key.clone(), self.engine.render(template, &ctx)?);
            }
            ctx.config = rendered;
        }

        let mut endpoint = self.engine.render(&tool.endpoint, &ctx)?;

        let mut body_object = serde_json::Map::new();
        let mut raw_body: Option<String> = None;
        if !tool.request_body.is_empty() {
            let rendered = self.engine.render(&tool.request_body, &ctx)?;
            match serde_json::from_str::<serde_json::Value>(&rendered) {
                Ok(serde_json::Value::Object(map)) => body_object = map,
                _ => raw_body = Some(rendered),
            }
        }

        let mut query: Vec<(String, String)> = Vec::new();
        let mut header_values: Vec<(String, String)> = Vec::new();
        for arg in &tool.args {
            let Some(value) = ctx.args.get(&arg.name) else {
                if arg.required {
                    return Err(CommonError::invalid_request(format!(
                        "missing required argument: {}",
                        arg.name
                    )));
                }
                continue;
            };
            match arg.position {
                ArgPosition::Header => {
                    header_values.push((arg.name.clone(), value_as_string(value)));
                }
                ArgPosition::Query => {
                    query.push((arg.name.clone(), value_as_string(value)));
                }
                ArgPosition::Path => {
                    endpoint =
                        endpoint.replace(&format!("{{{}}}", arg.name), &value_as_string(value));
                }
                ArgPosition::Body => {
                    body_object.insert(arg.name.clone(), value.clone());
                }
            }
        }

        let method: reqwest::Method = tool
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| CommonError::validation(format!("invalid method: {}", tool.method)))?;

        let timeout = tool
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut outgoing = self.client.request(method, &endpoint).timeout(timeout);
        if !query.is_empty() {
            outgoing = outgoing.query(&query);
        }
        for name in &self.forward_headers {
            let inbound = ctx
                .request
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name));
            if let Some((_, value)) = inbound {
                outgoing = outgoing.header(name.as_str(), value.as_str());
            }
        }
        for (key, template) in &tool.headers {
            outgoing = outgoing.header(key.as_str(), self.engine.render(template, &ctx)?);
        }
        for (key, value) in header_values {
            outgoing = outgoing.header(key.as_str(), value.as_str());
        }
        if let Some(raw) = raw_body {
            outgoing = outgoing.body(raw);
        } else if !body_object.is_empty() {
            outgoing = outgoing.json(&body_object);
        }

        debug!(tool = %tool.name, %endpoint, "executing http tool");
        let response = outgoing.send().await.map_err(|e| {
            if e.is_timeout() {
                CommonError::Timeout {
                    msg: format!("tool {} timed out", tool.name),
                    source: Some(e.into()),
                }
            } else {
                e.into()
            }
        })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Ok(CallToolResult::error(format!(
                "backend returned {}: {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }

        // A response template only applies to JSON-compatible payloads;
        // everything else goes to the content-type handler chain untouched
        if !tool.response_body.is_empty() && is_json_compatible(&content_type) {
            if let Ok(data) = serde_json::from_slice::<serde_json::Value>(&body) {
                ctx.response = Some(ResponseContext { data });
                let rendered = self.engine.render(&tool.response_body, &ctx)?;
                return Ok(CallToolResult::text(rendered));
            }
        }

        Ok(CallToolResult {
            content: vec![self.handlers.handle(&content_type, &body)],
            is_error: false,
        })
    }
}

fn is_json_compatible(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence == "text/json" || essence.ends_with("+json")
}

#[cfg(test)]
mod tests {
    use config::model::ArgConfig;

    use super::*;

    fn ctx_with_args(pairs: &[(&str, serde_json::Value)]) -> RenderContext {
        let mut args = serde_json::Map::new();
        for (k, v) in pairs {
            args.insert(k.to_string(), v.clone());
        }
        RenderContext {
            args,
            ..Default::default()
        }
    }

    #[test]
    fn renders_args_and_request_variables() {
        let engine = TemplateEngine::new();
        let mut ctx = ctx_with_args(&[("msg", serde_json::json!("hi"))]);
        ctx.request
            .headers
            .insert("X-Trace".into(), "abc".into());

        let out = engine
            .render(
                "http://backend/echo?msg={{ Args.msg }}&trace={{ Request.Headers['X-Trace'] }}",
                &ctx,
            )
            .unwrap();
        assert_eq!(out, "http://backend/echo?msg=hi&trace=abc");
    }

    #[test]
    fn renders_response_data() {
        let engine = TemplateEngine::new();
        let mut ctx = RenderContext::default();
        ctx.response = Some(ResponseContext {
            data: serde_json::json!({"msg": "hi"}),
        });
        let out = engine
            .render("echoed: {{ Response.Data.msg }}", &ctx)
            .unwrap();
        assert_eq!(out, "echoed: hi");
    }

    #[test]
    fn helper_functions() {
        let engine = TemplateEngine::new();
        // Safety: test-only env mutation
        unsafe { std::env::set_var("TEMPLATE_TEST_TOKEN", "secret") };

        let ctx = ctx_with_args(&[
            ("raw", serde_json::json!("{\"a\": 2}")),
            ("n", serde_json::json!(41)),
        ]);
        assert_eq!(
            engine
                .render("{{ env(name='TEMPLATE_TEST_TOKEN') }}", &ctx)
                .unwrap(),
            "secret"
        );
        assert_eq!(
            engine
                .render("{{ env(name='TEMPLATE_TEST_MISSING', default='d') }}", &ctx)
                .unwrap(),
            "d"
        );
        assert_eq!(
            engine
                .render("{{ Args.raw | fromJSON | toJSON }}", &ctx)
                .unwrap(),
            "{\"a\":2}"
        );
        assert_eq!(engine.render("{{ Args.n | add(n=1) }}", &ctx).unwrap(), "42");
    }

    #[test]
    fn invalid_template_is_a_validation_error() {
        let engine = TemplateEngine::new();
        let err = engine
            .render("{{ unclosed", &RenderContext::default())
            .unwrap_err();
        assert!(matches!(err, CommonError::Validation { .. }));
    }

    #[test]
    fn arg_preprocessing() {
        let tool = ToolConfig {
            name: "t".into(),
            args: vec![ArgConfig {
                name: "page".into(),
                default: "1".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut args = serde_json::Map::new();
        args.insert("tags".into(), serde_json::json!(["a", "b"]));
        args.insert("count".into(), serde_json::json!(3.0));
        args.insert("ratio".into(), serde_json::json!(0.5));

        let processed = preprocess_args(&tool, args);
        assert_eq!(processed["tags"], serde_json::json!("[\"a\",\"b\"]"));
        assert_eq!(processed["count"], serde_json::json!(3));
        assert_eq!(processed["ratio"], serde_json::json!(0.5));
        // Default injected for the absent configured arg
        assert_eq!(processed["page"], serde_json::json!("1"));
    }

    #[test]
    fn json_compatibility_check() {
        assert!(is_json_compatible("application/json"));
        assert!(is_json_compatible("application/json; charset=utf-8"));
        assert!(is_json_compatible("application/hal+json"));
        assert!(!is_json_compatible("text/plain"));
        assert!(!is_json_compatible("image/png"));
    }
}
