//! Thin WebDriver-protocol client.
//!
//! The browser probe only needs four verbs — navigate, add cookie, run
//! a script, quit — so this speaks the W3C wire protocol directly over
//! JSON rather than pulling in a full automation framework.

use crate::config::Cookie;
use crate::error::{Error, Result};
use crate::probe::browser::BrowserDriver;

use serde_json::{json, Value};
use std::time::Duration;

pub struct WebDriverClient {
    client: reqwest::Client,
    base: String,
}

impl WebDriverClient {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::ProbeTransport(format!("could not build WebDriver client: {}", e)))?;

        Ok(Self {
            client,
            base: server_url.trim_end_matches('/').to_string(),
        })
    }

    /// Open a browser session on the remote automation service.
    pub async fn new_session(&self) -> Result<WebDriverSession> {
        let body = json!({
            "capabilities": {
                "alwaysMatch": { "browserName": "chrome" }
            }
        });

        let value = post_json(&self.client, &format!("{}/session", self.base), &body).await?;

        let session_id = value["value"]["sessionId"]
            .as_str()
            .or_else(|| value["sessionId"].as_str())
            .ok_or_else(|| {
                Error::ProbeTransport("WebDriver session response carried no sessionId".to_string())
            })?;

        Ok(WebDriverSession {
            client: self.client.clone(),
            base: format!("{}/session/{}", self.base, session_id),
        })
    }
}

/// One live browser session.
pub struct WebDriverSession {
    client: reqwest::Client,
    base: String,
}

impl BrowserDriver for WebDriverSession {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        post_json(
            &self.client,
            &format!("{}/url", self.base),
            &json!({ "url": url }),
        )
        .await?;
        Ok(())
    }

    async fn add_cookie(&mut self, cookie: &Cookie) -> Result<()> {
        let mut payload = json!({
            "name": cookie.name,
            "value": cookie.value,
            "secure": cookie.secure,
        });
        if !cookie.domain.is_empty() {
            payload["domain"] = json!(cookie.domain);
        }
        if !cookie.path.is_empty() {
            payload["path"] = json!(cookie.path);
        }
        if let Some(expiry) = cookie.expiry {
            payload["expiry"] = json!(expiry);
        }

        post_json(
            &self.client,
            &format!("{}/cookie", self.base),
            &json!({ "cookie": payload }),
        )
        .await?;
        Ok(())
    }

    async fn timing_value(&mut self, field: &str) -> Result<f64> {
        let body = json!({
            "script": format!("return window.performance.timing.{}", field),
            "args": [],
        });

        let value = post_json(
            &self.client,
            &format!("{}/execute/sync", self.base),
            &body,
        )
        .await?;

        match value["value"].as_f64() {
            Some(v) => Ok(v),
            None => {
                // Browsers return null for fields they never populated.
                tracing::warn!("could not fetch timing for {}", field);
                Ok(0.0)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let resp = self
            .client
            .delete(&self.base)
            .send()
            .await
            .map_err(|e| Error::ProbeTransport(format!("could not close browser session: {}", e)))?;

        if !resp.status().is_success() {
            return Err(Error::ProbeTransport(format!(
                "browser session close returned status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

async fn post_json(client: &reqwest::Client, url: &str, body: &Value) -> Result<Value> {
    let resp = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| Error::ProbeTransport(format!("WebDriver request failed: {}", e)))?;

    let status = resp.status();
    let value: Value = resp
        .json()
        .await
        .map_err(|e| Error::ProbeTransport(format!("invalid WebDriver response: {}", e)))?;

    if !status.is_success() {
        return Err(Error::ProbeTransport(format!(
            "WebDriver request returned status {}: {}",
            status, value["value"]["message"].as_str().unwrap_or("unknown error")
        )));
    }

    Ok(value)
}
