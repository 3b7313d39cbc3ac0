//! Signed, retrying HTTP client for the rule-management platform's REST API.
//!
//! One method per verb/resource pair (spec §4.1, §6): rulesets, rules, and
//! rule tags, each parameterized only by identifiers and opaque JSON. GET
//! responses are normalized by stripping server-only fields so the same
//! JSON shape round-trips through the matching POST/PUT — that's what lets
//! the filesystem mirror and the ledger treat payloads as pass-through.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::{Map, Value};

use rulesync_auth::{Credentials, SignableRequest, sign};
use rulesync_retry::{RetryConfig, rate_limit_delay};
use rulesync_types::Reporter;

const RATE_LIMIT_HEADER: &str = "x-rate-limit-reset";

/// A signed, retrying client bound to one organization.
pub struct TransportClient {
    http: Client,
    base_url: String,
    creds: Credentials,
    org_id: String,
    retry: RetryConfig,
}

impl TransportClient {
    pub fn new(base_url: impl Into<String>, creds: Credentials, org_id: impl Into<String>) -> Result<Self> {
        Self::with_retry(base_url, creds, org_id, RetryConfig::default())
    }

    pub fn with_retry(
        base_url: impl Into<String>,
        creds: Credentials,
        org_id: impl Into<String>,
        retry: RetryConfig,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("rulesync/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            creds,
            org_id: org_id.into(),
            retry,
        })
    }

    // ---- GET ----

    pub fn get_rulesets(&self, reporter: &mut dyn Reporter) -> Result<Value> {
        self.request("GET", "/v2/rulesets", None, reporter)
    }

    pub fn get_ruleset(&self, ruleset_id: &str, reporter: &mut dyn Reporter) -> Result<Value> {
        let mut resp = self.request("GET", &format!("/v2/rulesets/{ruleset_id}"), None, reporter)?;
        strip_fields(&mut resp, &["updatedAt", "createdAt"]);
        rename_field(&mut resp, "rules", "ruleIds");
        Ok(resp)
    }

    pub fn get_ruleset_rules(&self, ruleset_id: &str, reporter: &mut dyn Reporter) -> Result<Value> {
        let mut resp = self.request("GET", &format!("/v2/rulesets/{ruleset_id}/rules"), None, reporter)?;
        if let Some(rules) = resp.get_mut("rules").and_then(Value::as_array_mut) {
            for rule in rules.iter_mut() {
                strip_fields(rule, &["rulesetId", "updatedAt", "createdAt"]);
            }
        }
        Ok(resp)
    }

    pub fn get_rule(&self, ruleset_id: &str, rule_id: &str, reporter: &mut dyn Reporter) -> Result<Value> {
        let mut resp = self.request(
            "GET",
            &format!("/v2/rulesets/{ruleset_id}/rules/{rule_id}"),
            None,
            reporter,
        )?;
        strip_fields(&mut resp, &["id", "rulesetId", "updatedAt", "createdAt"]);
        Ok(resp)
    }

    pub fn get_rule_tags(&self, rule_id: &str, reporter: &mut dyn Reporter) -> Result<Value> {
        let mut resp = self.request("GET", &format!("/v2/rules/{rule_id}/tags"), None, reporter)?;
        strip_fields(&mut resp, &["errors"]);
        Ok(resp)
    }

    // ---- PUT ----

    pub fn put_ruleset(&self, ruleset_id: &str, data: &Value, reporter: &mut dyn Reporter) -> Result<Value> {
        let mut resp = self.request("PUT", &format!("/v2/rulesets/{ruleset_id}"), Some(data), reporter)?;
        strip_fields(&mut resp, &["createdAt", "updatedAt"]);
        Ok(resp)
    }

    pub fn put_rule(&self, ruleset_id: &str, rule_id: &str, data: &Value, reporter: &mut dyn Reporter) -> Result<Value> {
        let mut resp = self.request(
            "PUT",
            &format!("/v2/rulesets/{ruleset_id}/rules/{rule_id}"),
            Some(data),
            reporter,
        )?;
        strip_fields(&mut resp, &["createdAt", "updatedAt", "rulesetId"]);
        Ok(resp)
    }

    // ---- POST ----

    /// Create a ruleset; returns the normalized response including the
    /// platform-assigned id under `id`.
    pub fn post_ruleset(&self, data: &Value, reporter: &mut dyn Reporter) -> Result<Value> {
        let mut resp = self.request("POST", "/v2/rulesets", Some(data), reporter)?;
        strip_fields(&mut resp, &["createdAt", "updatedAt"]);
        Ok(resp)
    }

    /// Create a rule under `ruleset_id`; returns the normalized response
    /// including the platform-assigned id under `id`.
    pub fn post_rule(&self, ruleset_id: &str, data: &Value, reporter: &mut dyn Reporter) -> Result<Value> {
        let mut resp = self.request(
            "POST",
            &format!("/v2/rulesets/{ruleset_id}/rules"),
            Some(data),
            reporter,
        )?;
        strip_fields(&mut resp, &["createdAt", "updatedAt", "rulesetId"]);
        Ok(resp)
    }

    pub fn post_tags(&self, rule_id: &str, data: &Value, reporter: &mut dyn Reporter) -> Result<Value> {
        let mut resp = self.request("POST", &format!("/v2/rules/{rule_id}/tags"), Some(data), reporter)?;
        strip_fields(&mut resp, &["errors"]);
        Ok(resp)
    }

    // ---- DELETE ----

    pub fn delete_rule(&self, ruleset_id: &str, rule_id: &str, reporter: &mut dyn Reporter) -> Result<Value> {
        self.request(
            "DELETE",
            &format!("/v2/rulesets/{ruleset_id}/rules/{rule_id}"),
            None,
            reporter,
        )
    }

    pub fn delete_ruleset(&self, ruleset_id: &str, reporter: &mut dyn Reporter) -> Result<Value> {
        self.request("DELETE", &format!("/v2/rulesets/{ruleset_id}"), None, reporter)
    }

    /// Signed request with retry: network/parse failures back off by a
    /// constant delay, rate-limit responses sleep for exactly what the
    /// server told us to. All other non-2xx statuses are non-retryable.
    /// Reports one `info` line per attempt (outcome) and one `warn` line
    /// whenever an attempt is followed by a retry (reason + backoff chosen).
    fn request(&self, method: &str, path: &str, body: Option<&Value>, reporter: &mut dyn Reporter) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let body_bytes = match body {
            Some(v) => serde_json::to_vec(v).context("failed to serialize request body")?,
            None => Vec::new(),
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_once(method, &url, path, &body_bytes) {
                Ok(value) => {
                    reporter.info(&format!("{method} {path}: ok (attempt {attempt})"));
                    return Ok(value);
                }
                Err(Attempt::RateLimited(reset_ms)) => {
                    let delay = rate_limit_delay(reset_ms);
                    reporter.info(&format!("{method} {path}: rate-limited (attempt {attempt})"));
                    reporter.warn(&format!("{method} {path}: retrying after rate limit, sleeping {delay:?}"));
                    thread::sleep(delay);
                    continue;
                }
                Err(Attempt::Retryable(err)) => {
                    reporter.info(&format!("{method} {path}: failed (attempt {attempt}): {err}"));
                    if !self.retry.should_retry(attempt) {
                        return Err(err.context(format!(
                            "{method} {path} failed after {attempt} attempt(s)"
                        )));
                    }
                    let delay = self.retry.delay(attempt);
                    reporter.warn(&format!("{method} {path}: retrying after {err}, sleeping {delay:?}"));
                    thread::sleep(delay);
                    continue;
                }
                Err(Attempt::Fatal(err)) => {
                    reporter.info(&format!("{method} {path}: fatal error (attempt {attempt}): {err}"));
                    return Err(err);
                }
            }
        }
    }

    fn try_once(
        &self,
        method: &str,
        url: &str,
        path: &str,
        body: &[u8],
    ) -> Result<Value, Attempt> {
        let content_type = "application/json";
        let header = sign(
            &self.creds,
            &SignableRequest {
                method,
                host: host_of(url),
                port: port_of(url),
                path_and_query: path,
                content_type,
                body,
                org_id: &self.org_id,
            },
        )
        .map_err(Attempt::Fatal)?;

        let mut req = self
            .http
            .request(
                method.parse().map_err(|e| Attempt::Fatal(anyhow::anyhow!("{e}")))?,
                url,
            )
            .header("Authorization", header)
            .header("Content-Type", content_type);
        if !body.is_empty() {
            req = req.body(body.to_vec());
        }

        let resp = req.send().map_err(|e| {
            Attempt::Retryable(anyhow::Error::new(e).context("network request failed"))
        })?;
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let reset_ms = resp
                .headers()
                .get(RATE_LIMIT_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(1000);
            return Err(Attempt::RateLimited(reset_ms));
        }
        if !status.is_success() {
            return Err(Attempt::Fatal(anyhow::anyhow!(
                "{method} {url} returned non-2xx status {status}"
            )));
        }

        let bytes = resp
            .bytes()
            .map_err(|e| Attempt::Retryable(anyhow::Error::new(e).context("failed to read response body")))?;
        if bytes.is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| Attempt::Retryable(anyhow::Error::new(e).context("failed to parse response JSON")))
    }
}

enum Attempt {
    RateLimited(u64),
    Retryable(anyhow::Error),
    Fatal(anyhow::Error),
}

fn strip_fields(value: &mut Value, fields: &[&str]) {
    if let Some(obj) = value.as_object_mut() {
        for field in fields {
            obj.remove(*field);
        }
    }
}

fn rename_field(value: &mut Value, from: &str, to: &str) {
    if let Some(obj) = value.as_object_mut()
        && let Some(v) = obj.remove(from)
    {
        obj.insert(to.to_string(), v);
    }
}

fn host_of(url: &str) -> &str {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    host_port.split(':').next().unwrap_or(host_port)
}

fn port_of(url: &str) -> u16 {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    host_port
        .split(':')
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(if url.starts_with("https") { 443 } else { 80 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn creds() -> Credentials {
        Credentials {
            user_id: "u".to_string(),
            api_key: "k".to_string(),
        }
    }

    #[test]
    fn get_ruleset_renames_rules_to_rule_ids_and_strips_timestamps() {
        let mut resp = json!({
            "id": "R1",
            "name": "rs-A",
            "rules": ["X1", "X2"],
            "createdAt": "2024-01-01",
            "updatedAt": "2024-01-02",
        });
        strip_fields(&mut resp, &["updatedAt", "createdAt"]);
        rename_field(&mut resp, "rules", "ruleIds");
        assert_eq!(resp["ruleIds"], json!(["X1", "X2"]));
        assert!(resp.get("rules").is_none());
        assert!(resp.get("createdAt").is_none());
    }

    #[test]
    fn host_and_port_parse_from_https_url() {
        assert_eq!(host_of("https://api.example.com/v2/rulesets"), "api.example.com");
        assert_eq!(port_of("https://api.example.com/v2/rulesets"), 443);
    }

    #[test]
    fn host_and_port_parse_with_explicit_port() {
        assert_eq!(host_of("http://localhost:8080/v2/rulesets"), "localhost");
        assert_eq!(port_of("http://localhost:8080/v2/rulesets"), 8080);
    }

    #[test]
    fn client_construction_succeeds() {
        let client = TransportClient::new("https://api.example.com", creds(), "org-1");
        assert!(client.is_ok());
    }

    struct RecordingReporter {
        info: Vec<String>,
        warn: Vec<String>,
    }

    impl Reporter for RecordingReporter {
        fn info(&mut self, msg: &str) {
            self.info.push(msg.to_string());
        }
        fn warn(&mut self, msg: &str) {
            self.warn.push(msg.to_string());
        }
        fn error(&mut self, _msg: &str) {}
    }

    #[test]
    fn successful_request_reports_one_info_line_and_no_warnings() {
        use std::thread;
        use tiny_http::{Response, Server};

        let server = Server::http("127.0.0.1:0").expect("server");
        let addr = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            let req = server.recv().expect("recv");
            let _ = req.respond(Response::from_string(json!({"rulesets": []}).to_string()));
        });

        let client = TransportClient::new(addr, creds(), "org-1").unwrap();
        let mut reporter = RecordingReporter { info: Vec::new(), warn: Vec::new() };
        client.get_rulesets(&mut reporter).unwrap();
        handle.join().unwrap();

        assert_eq!(reporter.info.len(), 1);
        assert!(reporter.info[0].contains("GET /v2/rulesets: ok"));
        assert!(reporter.warn.is_empty());
    }

    #[test]
    fn rate_limited_response_reports_a_warning_before_retry_succeeds() {
        use std::thread;
        use tiny_http::{Header, Response, Server};

        let server = Server::http("127.0.0.1:0").expect("server");
        let addr = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            let first = server.recv().expect("recv first");
            let header = Header::from_bytes(&b"x-rate-limit-reset"[..], &b"1"[..]).unwrap();
            let _ = first.respond(Response::empty(429).with_header(header));

            let second = server.recv().expect("recv second");
            let _ = second.respond(Response::from_string(json!({"rulesets": []}).to_string()));
        });

        let client = TransportClient::new(addr, creds(), "org-1").unwrap();
        let mut reporter = RecordingReporter { info: Vec::new(), warn: Vec::new() };
        client.get_rulesets(&mut reporter).unwrap();
        handle.join().unwrap();

        assert_eq!(reporter.info.len(), 2);
        assert!(reporter.info[0].contains("rate-limited"));
        assert!(reporter.info[1].contains("ok"));
        assert_eq!(reporter.warn.len(), 1);
        assert!(reporter.warn[0].contains("retrying after rate limit"));
    }
}
