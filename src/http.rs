//! HTTP execution of request plans.

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{AriError, AriResult};
use crate::request::RequestPlan;

/// Stateless executor for bound requests. Connection reuse is handled by
/// the underlying pool.
pub(crate) struct HttpInvoker {
    client: Client,
    username: String,
    password: String,
}

impl HttpInvoker {
    pub fn new(username: &str, password: &str) -> AriResult<Self> {
        let client = Client::builder().build().map_err(AriError::from)?;
        Ok(Self {
            client,
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// Execute a plan with Basic authentication.
    ///
    /// Returns the status and decoded JSON body on 2xx (an empty body
    /// decodes to `Null`). A ≥400 status becomes
    /// [`AriError::ServerError`]; a network failure becomes
    /// [`AriError::TransportError`].
    pub async fn invoke(&self, plan: &RequestPlan) -> AriResult<(u16, Value)> {
        let method = Method::from_bytes(plan.method.as_bytes())
            .map_err(|_| AriError::transport(format!("invalid http method: {}", plan.method)))?;

        let mut request = self
            .client
            .request(method, plan.url.clone())
            .basic_auth(&self.username, Some(&self.password));
        if !plan.query.is_empty() {
            request = request.query(&plan.query);
        }
        for (name, value) in &plan.headers {
            request = request.header(name, value);
        }
        if !plan.form.is_empty() {
            request = request.form(&plan.form);
        }
        if let Some(body) = &plan.body {
            request = request.json(body);
        }

        debug!("{} {}", plan.method, plan.url);
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            let value = if text.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text).map_err(|e| {
                    AriError::transport(format!("malformed response body: {}", e))
                })?
            };
            return Ok((status.as_u16(), value));
        }

        Err(AriError::ServerError {
            status: status.as_u16(),
            message: server_message(status, &text),
        })
    }

    /// Fetch a URL and decode the JSON body. Used by the schema loader.
    pub async fn get_json(&self, url: &Url) -> AriResult<Value> {
        let response = self
            .client
            .get(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(AriError::ServerError {
                status: status.as_u16(),
                message: server_message(status, &text),
            });
        }
        Ok(serde_json::from_str(&text)?)
    }
}

impl std::fmt::Debug for HttpInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpInvoker")
            .field("username", &self.username)
            .finish()
    }
}

/// The server's JSON `message` field when present, else the HTTP reason.
fn server_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_from_json_body() {
        let msg = server_message(
            StatusCode::NOT_FOUND,
            r#"{"message": "Channel not found"}"#,
        );
        assert_eq!(msg, "Channel not found");
    }

    #[test]
    fn test_server_message_falls_back_to_reason() {
        assert_eq!(
            server_message(StatusCode::NOT_FOUND, "not json"),
            "Not Found"
        );
        assert_eq!(
            server_message(StatusCode::BAD_REQUEST, r#"{"error": "other shape"}"#),
            "Bad Request"
        );
    }

    #[test]
    fn test_debug_hides_password() {
        let invoker = HttpInvoker::new("asterisk", "secret").unwrap();
        let debug = format!("{:?}", invoker);
        assert!(!debug.contains("secret"));
    }
}
