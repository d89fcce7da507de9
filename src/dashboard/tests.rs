//! HTTP tests against the real router on an ephemeral port, backed by a
//! supervisor with an in-memory port probe.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{COOKIE, LOCATION, SET_COOKIE};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use tokio::net::TcpListener;

use super::routes::ControlState;
use super::security::{CSRF_HEADER, RATE_MAX_HITS, SESSION_COOKIE};
use super::server::serve_control_api;
use crate::config::model::SupervisorConfig;
use crate::orchestrator::ports::fake::FakePorts;
use crate::orchestrator::reclaim::recording::RecordingTerminator;
use crate::orchestrator::testutil::{fake_supervisor, test_config};
use crate::orchestrator::Supervisor;

const PASSWORD: &str = "hunter2";

struct Harness {
    base: String,
    client: Client,
    supervisor: Supervisor,
    ports: Arc<FakePorts>,
    term: Arc<RecordingTerminator>,
}

impl Harness {
    async fn start(mut config: SupervisorConfig) -> Self {
        config.login_password = PASSWORD.to_string();
        let (supervisor, ports, term) = fake_supervisor(config);
        let state = ControlState::new(supervisor.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let cancel = supervisor.shutdown_token().clone();
        tokio::spawn(serve_control_api(listener, state, cancel));

        let client = Client::builder().redirect(Policy::none()).build().unwrap();
        Self {
            base: format!("http://{addr}"),
            client,
            supervisor,
            ports,
            term,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Log in and return `(cookie header value, csrf token)`.
    async fn login(&self) -> (String, String) {
        let resp = self
            .client
            .post(self.url("/login"))
            .form(&[("password", PASSWORD)])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        let set_cookie = resp.headers()[SET_COOKIE].to_str().unwrap().to_string();
        let cookie = set_cookie.split(';').next().unwrap().to_string();
        assert!(cookie.starts_with(SESSION_COOKIE));
        let csrf = resp.headers()[CSRF_HEADER].to_str().unwrap().to_string();
        (cookie, csrf)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.supervisor.shutdown_token().cancel();
    }
}

#[tokio::test]
async fn login_sets_session_and_redirects() {
    let h = Harness::start(test_config()).await;

    let bad = h
        .client
        .post(h.url("/login"))
        .form(&[("password", "nope")])
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::UNAUTHORIZED);
    assert!(bad.headers().get(SET_COOKIE).is_none());

    let resp = h
        .client
        .post(h.url("/login?next=/status"))
        .form(&[("password", PASSWORD)])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(resp.headers()[LOCATION], "/status");
    let set_cookie = resp.headers()[SET_COOKIE].to_str().unwrap();
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("SameSite=Strict"));
}

#[tokio::test]
async fn protected_routes_redirect_without_session() {
    let h = Harness::start(test_config()).await;
    let resp = h.client.get(h.url("/status")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(resp.headers()[LOCATION], "/login?next=/status");
}

#[tokio::test]
async fn status_and_netinfo_report_foreign_listeners() {
    let h = Harness::start(test_config()).await;
    h.ports.occupy(8189, 0);
    let (cookie, _) = h.login().await;

    let status: serde_json::Value = h
        .client
        .get(h.url("/status"))
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["comfy"], false);
    assert_eq!(status["mini"], false);
    assert_eq!(status["gallery"], true);
    assert_eq!(status["mode_hidden"], false);
    let processes = status["processes"].as_array().unwrap();
    assert_eq!(processes.len(), 3);
    assert!(processes.iter().all(|p| p["pid"].is_null()));

    let net: serde_json::Value = h
        .client
        .get(h.url("/netinfo"))
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(net["control_port"], 5000);
    assert_eq!(net["gallery_port"], 8189);
    assert_eq!(net["gallery_running"], true);
    assert!(net["comfy_port"].is_null());
    assert!(net["lan_ip"].is_string());
}

#[tokio::test]
async fn csrf_rejection_leaves_processes_alone() {
    let h = Harness::start(test_config()).await;
    h.ports.occupy(3000, 4242);
    let (cookie, csrf) = h.login().await;

    let missing = h
        .client
        .post(h.url("/stop"))
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::FORBIDDEN);

    let wrong = h
        .client
        .post(h.url("/stop"))
        .header(COOKIE, &cookie)
        .header(CSRF_HEADER, "0".repeat(64))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::FORBIDDEN);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.term.killed().is_empty());

    let ok = h
        .client
        .post(h.url("/stop"))
        .header(COOKIE, &cookie)
        .header(CSRF_HEADER, &csrf)
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    assert_eq!(ok.text().await.unwrap(), "success");

    for _ in 0..50 {
        if !h.term.killed().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.term.killed(), vec![4242]);
}

#[tokio::test]
async fn csrf_token_accepted_from_form_field() {
    let h = Harness::start(test_config()).await;
    let (cookie, csrf) = h.login().await;

    let resp = h
        .client
        .post(h.url("/checkpw"))
        .header(COOKIE, &cookie)
        .form(&[("csrf_token", csrf.as_str()), ("password", "x")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "no");
}

#[tokio::test]
async fn folder_actions_need_their_own_password() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("outputs");
    let mut config = test_config();
    config.delete_password = "wipe".into();
    config.delete_path = Some(target.clone());
    let h = Harness::start(config).await;
    let (cookie, csrf) = h.login().await;

    let post = |path: &'static str, pw: &'static str| {
        h.client
            .post(h.url(path))
            .header(COOKIE, &cookie)
            .header(CSRF_HEADER, &csrf)
            .form(&[("password", pw)])
            .send()
    };

    assert_eq!(post("/checkpw", "wipe").await.unwrap().text().await.unwrap(), "ok");
    assert_eq!(post("/recreate", "bad").await.unwrap().text().await.unwrap(), "error");
    assert!(!target.exists());
    assert_eq!(post("/recreate", "wipe").await.unwrap().text().await.unwrap(), "success");
    assert!(target.is_dir());
    assert_eq!(post("/delete", "wipe").await.unwrap().text().await.unwrap(), "success");
    assert!(!target.exists());
}

#[tokio::test]
async fn thirty_first_post_is_rate_limited() {
    let h = Harness::start(test_config()).await;

    for i in 0..RATE_MAX_HITS {
        let resp = h.client.post(h.url("/activity")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "request {i}");
    }
    let resp = h.client.post(h.url("/activity")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().contains_key("retry-after"));

    // GETs are not counted.
    let resp = h.client.get(h.url("/login")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn idle_session_is_sent_back_to_login() {
    let mut config = test_config();
    config.session_idle_timeout = Duration::from_millis(150);
    let h = Harness::start(config).await;
    let (cookie, _) = h.login().await;

    let ping = h
        .client
        .post(h.url("/activity"))
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(ping.text().await.unwrap(), "ok");

    tokio::time::sleep(Duration::from_millis(300)).await;

    let resp = h
        .client
        .get(h.url("/status"))
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(resp.headers()[LOCATION], "/login");

    let again = h
        .client
        .get(h.url("/status"))
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(again.headers()[LOCATION], "/login?next=/status");
}

#[tokio::test]
async fn activity_keeps_session_alive() {
    let mut config = test_config();
    config.session_idle_timeout = Duration::from_millis(250);
    let h = Harness::start(config).await;
    let (cookie, _) = h.login().await;

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let resp = h
            .client
            .get(h.url("/status"))
            .header(COOKIE, &cookie)
            .header("x-activity", "1")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn csrf_endpoint_returns_process_token() {
    let h = Harness::start(test_config()).await;
    let (cookie, csrf) = h.login().await;
    let body: serde_json::Value = h
        .client
        .get(h.url("/csrf"))
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["csrf_token"], csrf.as_str());
}

#[tokio::test]
async fn ensure_acknowledges_immediately() {
    let h = Harness::start(test_config()).await;
    h.ports.occupy(8188, 0);
    let (cookie, csrf) = h.login().await;
    let resp = h
        .client
        .post(h.url("/ensure_comfy"))
        .header(COOKIE, &cookie)
        .header(CSRF_HEADER, &csrf)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "success");
}

#[cfg(unix)]
#[tokio::test]
async fn ensure_reports_fail_when_launcher_cannot_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = dir.path().join("comfy.sh");
    std::fs::write(&launcher, "#!/bin/sh\nexec sleep 30\n").unwrap();
    let mut config = test_config();
    config.comfy.launcher = Some(launcher);
    config.comfy.force_free_port = false;
    let h = Harness::start(config).await;
    let (cookie, csrf) = h.login().await;

    let resp = h
        .client
        .post(h.url("/ensure_comfy"))
        .header(COOKIE, &cookie)
        .header(CSRF_HEADER, &csrf)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.text().await.unwrap(), "fail");
    assert!(!h.supervisor.table().is_alive(crate::config::model::Role::Comfy));
}

#[cfg(unix)]
#[tokio::test]
async fn ensure_spawns_before_answering() {
    use crate::config::model::Role;
    use crate::orchestrator::testutil::write_script;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.comfy.launcher = Some(write_script(dir.path(), "comfy.sh", "exec sleep 30"));
    config.comfy.force_free_port = false;
    let h = Harness::start(config).await;
    let (cookie, csrf) = h.login().await;

    let resp = h
        .client
        .post(h.url("/ensure_comfy"))
        .header(COOKIE, &cookie)
        .header(CSRF_HEADER, &csrf)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "success");
    let pid = h.supervisor.table().pid(Role::Comfy).unwrap();

    h.supervisor.table().clear(Role::Comfy);
    let _ = crate::platform::kill_tree(pid);
}
