//! Probe implementations against real local endpoints, databases and
//! processes.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use common::epoch;
use lazarus::core::cancel::CancelToken;
use lazarus::core::clock::ManualClock;
use lazarus::health::custom::CommandProbeRunner;
use lazarus::health::secrets::MemorySecretSource;
use lazarus::health::verdict::verdict;
use lazarus::health::{
    HealthCheckEngine, HealthCheckSpec, HealthReport, ProbeDefaults, ProbeStatus, StandardExecutor, Verdict,
};

fn defaults() -> ProbeDefaults {
    ProbeDefaults {
        overall_timeout: Duration::from_secs(15),
        probe_timeout: Duration::from_secs(3),
        attempts: 1,
        retry_delay: Duration::ZERO,
    }
}

fn run(spec: serde_json::Value, secrets: MemorySecretSource) -> (HealthReport, Verdict) {
    let spec: HealthCheckSpec = serde_json::from_value(spec).expect("valid health spec");
    let plan = spec.plan(&defaults()).expect("plan");
    let clock = Arc::new(ManualClock::new(epoch()));
    let executor = StandardExecutor::new(Arc::new(secrets), Arc::new(CommandProbeRunner), clock.clone());
    let engine = HealthCheckEngine::new(Arc::new(executor), clock, 4);
    let report = engine.run(&plan.probes, plan.overall_timeout, &CancelToken::new());
    let overall = verdict(&plan.enabled, &report.results);
    (report, overall)
}

fn status_of(report: &HealthReport, name: &str) -> ProbeStatus {
    report
        .results
        .iter()
        .find(|r| r.name == name)
        .unwrap_or_else(|| panic!("no result for {name}"))
        .status
}

/// Serves `count` requests with `status` and `body`.
fn serve(count: usize, status: u16, body: &'static str) -> (String, thread::JoinHandle<()>) {
    let server = tiny_http::Server::http("127.0.0.1:0").expect("bind test server");
    let port = server.server_addr().to_ip().expect("ip listener").port();
    let handle = thread::spawn(move || {
        for _ in 0..count {
            let Ok(request) = server.recv() else { return };
            let _ = request.respond(tiny_http::Response::from_string(body).with_status_code(status));
        }
    });
    (format!("http://127.0.0.1:{port}"), handle)
}

/// Accepts one request and never answers it.
fn serve_nothing() -> String {
    let server = tiny_http::Server::http("127.0.0.1:0").expect("bind test server");
    let port = server.server_addr().to_ip().expect("ip listener").port();
    thread::spawn(move || {
        if let Ok(request) = server.recv() {
            thread::sleep(Duration::from_secs(20));
            drop(request);
        }
    });
    format!("http://127.0.0.1:{port}")
}

// ──────────────────── http ────────────────────

#[test]
fn http_status_and_body_are_checked() {
    let (base, server) = serve(2, 200, "{\"status\":\"ok\"}");
    let (report, overall) = run(
        json!({
            "http": {
                "endpoints": [
                    { "name": "health", "url": format!("{base}/healthz"), "expectedBody": { "contains": "ok" } },
                    { "name": "strict", "url": format!("{base}/ready"), "expectedBody": { "contains": "ready" } }
                ]
            }
        }),
        MemorySecretSource::new(),
    );
    server.join().expect("server thread");
    assert_eq!(status_of(&report, "health"), ProbeStatus::Passed);
    assert_eq!(status_of(&report, "strict"), ProbeStatus::Failed);
    assert_eq!(overall, Verdict::Failed);
}

#[test]
fn unexpected_status_fails() {
    let (base, server) = serve(1, 503, "down");
    let (report, _) = run(
        json!({ "http": { "endpoints": [ { "name": "api", "url": format!("{base}/") } ] } }),
        MemorySecretSource::new(),
    );
    server.join().expect("server thread");
    let result = &report.results[0];
    assert_eq!(result.status, ProbeStatus::Failed);
    assert!(result.detail.contains("503"), "{}", result.detail);
}

#[test]
fn unresponsive_endpoint_times_out_without_blocking_its_sibling() {
    let silent = serve_nothing();
    let (base, server) = serve(1, 200, "fine");
    let started = Instant::now();
    let (report, overall) = run(
        json!({
            "http": {
                "endpoints": [
                    { "name": "silent", "url": format!("{silent}/"), "timeoutSeconds": 1 },
                    { "name": "fine", "url": format!("{base}/") }
                ]
            }
        }),
        MemorySecretSource::new(),
    );
    server.join().expect("server thread");
    assert!(started.elapsed() < Duration::from_secs(6), "took {:?}", started.elapsed());
    assert_eq!(status_of(&report, "silent"), ProbeStatus::Timeout);
    assert_eq!(status_of(&report, "fine"), ProbeStatus::Passed);
    assert_eq!(overall, Verdict::Failed);
}

// ──────────────────── database ────────────────────

fn seeded_database() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let conn = rusqlite::Connection::open(dir.path().join("shop.db")).expect("open sqlite");
    conn.execute_batch(
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, total REAL, created_at INTEGER);",
    )
    .expect("create table");
    let newest = epoch().timestamp() - 120;
    for (id, total) in [(1, 10.0), (2, 25.5), (3, 7.25)] {
        conn.execute(
            "INSERT INTO orders (id, total, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, total, newest - 3600 * (3 - id)],
        )
        .expect("insert row");
    }
    dir
}

#[test]
fn sqlite_queries_cover_range_columns_and_recency() {
    let dir = seeded_database();
    let secrets = MemorySecretSource::new();
    secrets.insert(
        "shop-db",
        "url",
        &format!("sqlite:{}", dir.path().join("shop.db").display()),
    );
    let (report, overall) = run(
        json!({
            "database": {
                "connection": { "secretRef": { "name": "shop-db", "key": "url" } },
                "queries": [
                    { "name": "order-count", "sql": "SELECT COUNT(*) FROM orders", "expectedRange": { "min": 1, "max": 10 } },
                    { "name": "order-shape", "sql": "SELECT id, total, created_at FROM orders LIMIT 1", "expectedColumns": ["id", "total"] },
                    { "name": "freshness", "sql": "SELECT MAX(created_at) FROM orders", "maxAgeSeconds": 600 }
                ]
            }
        }),
        secrets,
    );
    assert_eq!(overall, Verdict::Passed, "{:#?}", report.results);
    let freshness = report
        .results
        .iter()
        .find(|r| r.name == "freshness")
        .expect("freshness result");
    let age = freshness.observed_age_seconds.expect("age observed");
    assert!((age - 120.0).abs() < 1.0, "age {age}");
}

#[test]
fn stale_data_and_out_of_range_counts_fail() {
    let dir = seeded_database();
    let (report, overall) = run(
        json!({
            "database": {
                "type": "sqlite",
                "connection": { "value": dir.path().join("shop.db").display().to_string() },
                "queries": [
                    { "name": "too-few", "sql": "SELECT COUNT(*) FROM orders", "expectedRange": { "min": 100 } },
                    { "name": "stale", "sql": "SELECT MAX(created_at) FROM orders", "maxAgeSeconds": 60 }
                ]
            }
        }),
        MemorySecretSource::new(),
    );
    assert_eq!(overall, Verdict::Failed);
    assert_eq!(status_of(&report, "too-few"), ProbeStatus::Failed);
    assert_eq!(status_of(&report, "stale"), ProbeStatus::Failed);
}

#[test]
fn missing_secret_fails_the_probe() {
    let (report, _) = run(
        json!({
            "database": {
                "connection": { "secretRef": { "name": "nowhere", "key": "url" } },
                "queries": [ { "name": "count", "sql": "SELECT 1", "expectedRange": { "min": 1 } } ]
            }
        }),
        MemorySecretSource::new(),
    );
    assert_eq!(report.results[0].status, ProbeStatus::Failed);
    assert!(report.results[0].detail.contains("nowhere"), "{}", report.results[0].detail);
}

// ──────────────────── custom ────────────────────

#[cfg(unix)]
#[test]
fn custom_probes_use_the_exit_code() {
    let (report, overall) = run(
        json!({
            "custom": {
                "probes": [
                    { "name": "ok", "command": ["sh", "-c", "exit 0"] },
                    { "name": "broken", "command": ["sh", "-c", "echo replication lag; exit 3"] },
                    { "name": "env", "command": ["sh", "-c", "test \"$TARGET\" = shop"], "env": { "TARGET": "shop" } }
                ]
            }
        }),
        MemorySecretSource::new(),
    );
    assert_eq!(status_of(&report, "ok"), ProbeStatus::Passed);
    assert_eq!(status_of(&report, "env"), ProbeStatus::Passed);
    let broken = report.results.iter().find(|r| r.name == "broken").expect("broken");
    assert_eq!(broken.status, ProbeStatus::Failed);
    assert!(broken.detail.contains("replication lag"), "{}", broken.detail);
    assert_eq!(overall, Verdict::Failed);
}

#[cfg(unix)]
#[test]
fn custom_probe_is_killed_at_its_timeout() {
    let started = Instant::now();
    let (report, _) = run(
        json!({
            "custom": {
                "timeoutSeconds": 1,
                "probes": [ { "name": "sleeper", "command": ["sleep", "30"] } ]
            }
        }),
        MemorySecretSource::new(),
    );
    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(report.results[0].status, ProbeStatus::Timeout);
}
