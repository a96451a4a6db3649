//! HTTP endpoint probes.

#![allow(missing_docs)]

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::redirect::Policy;

use crate::core::errors::{LzrError, Result};
use crate::health::engine::AttemptOutcome;
use crate::health::probe::{HttpMethod, HttpProbe};

const MAX_REDIRECTS: usize = 5;
const MAX_BODY_EXCERPT: usize = 200;

/// Build a client bounded by `timeout` for the whole request.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .redirect(Policy::limited(MAX_REDIRECTS))
        .user_agent(concat!("lazarus/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| LzrError::Runtime {
            details: format!("http client init failed: {e}"),
        })
}

/// One attempt of an HTTP probe. The client and connection are dropped on
/// return.
#[must_use]
pub fn run_attempt(probe: &HttpProbe, timeout: Duration) -> AttemptOutcome {
    let client = match build_client(timeout) {
        Ok(client) => client,
        Err(e) => return AttemptOutcome::failed(e.to_string()),
    };
    let request = match probe.method {
        HttpMethod::Get => client.get(&probe.url),
        HttpMethod::Head => client.head(&probe.url),
    };
    let response = match request.send() {
        Ok(response) => response,
        Err(e) if e.is_timeout() => {
            return AttemptOutcome::timeout(format!(
                "no response from {} within {}s",
                probe.url,
                timeout.as_secs_f64()
            ));
        }
        Err(e) => return AttemptOutcome::failed(format!("request to {} failed: {e}", probe.url)),
    };

    let status = response.status().as_u16();
    if status != probe.expected_status {
        return AttemptOutcome::failed(format!(
            "status {status}, expected {}",
            probe.expected_status
        ));
    }
    let Some(needle) = probe.body_contains.as_deref() else {
        return AttemptOutcome::passed(format!("status {status}"));
    };
    match response.text() {
        Ok(body) if body.contains(needle) => {
            AttemptOutcome::passed(format!("status {status}, body contains {needle:?}"))
        }
        Ok(body) => AttemptOutcome::failed(format!(
            "status {status}, body missing {needle:?}: {}",
            excerpt(&body)
        )),
        Err(e) if e.is_timeout() => AttemptOutcome::timeout(format!(
            "body of {} not received within {}s",
            probe.url,
            timeout.as_secs_f64()
        )),
        Err(e) => AttemptOutcome::failed(format!("reading body failed: {e}")),
    }
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX_BODY_EXCERPT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::probe::ProbeStatus;
    use std::thread;

    fn serve_once(status: u16, body: &'static str) -> String {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let response = tiny_http::Response::from_string(body).with_status_code(status);
                let _ = request.respond(response);
            }
        });
        format!("http://{addr}/healthz")
    }

    fn probe(url: String, expected_status: u16, body_contains: Option<&str>) -> HttpProbe {
        HttpProbe {
            url,
            method: HttpMethod::Get,
            expected_status,
            body_contains: body_contains.map(String::from),
        }
    }

    #[test]
    fn matching_status_and_body_passes() {
        let url = serve_once(200, "{\"status\":\"ok\"}");
        let outcome = run_attempt(&probe(url, 200, Some("ok")), Duration::from_secs(5));
        assert_eq!(outcome.status, ProbeStatus::Passed, "{}", outcome.detail);
    }

    #[test]
    fn wrong_status_fails() {
        let url = serve_once(503, "unavailable");
        let outcome = run_attempt(&probe(url, 200, None), Duration::from_secs(5));
        assert_eq!(outcome.status, ProbeStatus::Failed);
        assert!(outcome.detail.contains("503"));
    }

    #[test]
    fn missing_body_substring_fails() {
        let url = serve_once(200, "degraded");
        let outcome = run_attempt(&probe(url, 200, Some("healthy")), Duration::from_secs(5));
        assert_eq!(outcome.status, ProbeStatus::Failed);
        assert!(outcome.detail.contains("degraded"));
    }

    #[test]
    fn excerpt_truncates_long_bodies() {
        let long = "x".repeat(500);
        assert_eq!(excerpt(&long).len(), MAX_BODY_EXCERPT + 3);
        assert_eq!(excerpt("  short  "), "short");
    }
}
