use super::{GenerateRequest, GenerateResponse, InferenceBackend};
use async_trait::async_trait;
use fleet_core::config::BackendConfig;
use fleet_core::{BackendId, FleetError, FleetResult};
use std::time::Duration;

/// HTTP inference backend.
///
/// Speaks the minimal listing/generation protocol: `GET /models` returns the
/// served model names, `POST /generate` returns `{text, model_used}`. Both
/// calls carry their own timeout from [`BackendConfig`].
pub struct HttpBackend {
    id: BackendId,
    base_url: String,
    request_timeout: Duration,
    list_timeout: Duration,
    http: reqwest::Client,
}

impl HttpBackend {
    /// Client for the model server at `config.base_url`.
    pub fn new(id: BackendId, config: &BackendConfig) -> Self {
        Self {
            id,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout(),
            list_timeout: config.list_timeout(),
            http: reqwest::Client::new(),
        }
    }

    fn map_transport_error(&self, err: reqwest::Error, timeout: Duration) -> FleetError {
        if err.is_timeout() {
            FleetError::Timeout {
                backend: self.id,
                after: timeout,
            }
        } else {
            FleetError::Backend {
                backend: self.id,
                message: err.to_string(),
            }
        }
    }

    async fn read_json(
        &self,
        resp: reqwest::Response,
        timeout: Duration,
    ) -> FleetResult<serde_json::Value> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FleetError::Backend {
                backend: self.id,
                message: format!("HTTP {status}: {}", truncate(&body, 200)),
            });
        }
        resp.json()
            .await
            .map_err(|e| self.map_transport_error(e, timeout))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Extracts model names from the listing shapes seen in the wild:
/// `["a"]`, `{"models": ["a"]}`, `{"models": [{"name": "a"}]}` and
/// `{"data": [{"id": "a"}]}`.
pub(crate) fn parse_model_list(body: &serde_json::Value) -> Option<Vec<String>> {
    let items = match body {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => map
            .get("models")
            .or_else(|| map.get("data"))
            .and_then(|v| v.as_array())?,
        _ => return None,
    };
    let names = items
        .iter()
        .filter_map(|item| match item {
            serde_json::Value::String(name) => Some(name.clone()),
            serde_json::Value::Object(obj) => ["name", "model", "id"]
                .iter()
                .find_map(|key| obj.get(*key).and_then(|v| v.as_str()))
                .map(str::to_string),
            _ => None,
        })
        .collect();
    Some(names)
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    async fn list_models(&self) -> FleetResult<Vec<String>> {
        let url = format!("{}/models", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(self.list_timeout)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e, self.list_timeout))?;
        let body = self.read_json(resp, self.list_timeout).await?;
        parse_model_list(&body).ok_or_else(|| FleetError::Backend {
            backend: self.id,
            message: format!("unrecognized model listing: {}", truncate(&body.to_string(), 200)),
        })
    }

    async fn generate(&self, request: &GenerateRequest) -> FleetResult<GenerateResponse> {
        let url = format!("{}/generate", self.base_url);
        let mut body = serde_json::json!({
            "model": request.model,
            "prompt": request.prompt,
            "stream": false,
        });
        if let Some(system) = &request.system {
            body["system"] = serde_json::json!(system);
        }
        if !request.images.is_empty() {
            body["images"] = serde_json::json!(request.images);
        }

        let resp = self
            .http
            .post(&url)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e, self.request_timeout))?;
        let resp_body = self.read_json(resp, self.request_timeout).await?;

        let text = resp_body
            .get("text")
            .or_else(|| resp_body.get("response"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| FleetError::Backend {
                backend: self.id,
                message: "response has no 'text' field".into(),
            })?;
        let model_used = resp_body
            .get("model_used")
            .or_else(|| resp_body.get("model"))
            .and_then(|v| v.as_str())
            .unwrap_or(&request.model);

        Ok(GenerateResponse {
            text: text.to_string(),
            model_used: model_used.to_string(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_plain_array() {
        let names = parse_model_list(&json!(["qwen2.5:3b", "phi3.5:3.8b"])).unwrap();
        assert_eq!(names, vec!["qwen2.5:3b", "phi3.5:3.8b"]);
    }

    #[test]
    fn test_parse_ollama_shape() {
        let body = json!({"models": [{"name": "qwq:32b", "size": 1}, {"model": "llava:7b"}]});
        assert_eq!(parse_model_list(&body).unwrap(), vec!["qwq:32b", "llava:7b"]);
    }

    #[test]
    fn test_parse_openai_shape() {
        let body = json!({"object": "list", "data": [{"id": "deepseek-r1:14b"}]});
        assert_eq!(parse_model_list(&body).unwrap(), vec!["deepseek-r1:14b"]);
    }

    #[test]
    fn test_parse_rejects_scalar() {
        assert!(parse_model_list(&json!("nope")).is_none());
        assert!(parse_model_list(&json!({"other": []})).is_none());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
