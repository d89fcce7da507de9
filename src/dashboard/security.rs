//! Request guards for the control API: CSRF token, per-client POST rate
//! limit, idle-session expiry and the login requirement.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, FromRequest, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Form;
use rand::RngCore;
use tracing::{debug, info, warn};

use super::routes::ControlState;

pub const SESSION_COOKIE: &str = "pocketrig_session";
pub const CSRF_HEADER: &str = "x-csrf-token";
pub const CSRF_FIELD: &str = "csrf_token";
const ACTIVITY_HEADER: &str = "x-activity";

pub const RATE_WINDOW: Duration = Duration::from_secs(10);
pub const RATE_MAX_HITS: usize = 30;

/// Largest form body buffered while looking for a CSRF field.
const MAX_FORM_BYTES: usize = 64 * 1024;

/// Mutating routes that do not need a CSRF token.
const CSRF_EXEMPT: [&str; 2] = ["/login", "/activity"];

/// GET routes that count as user activity.
const ACTIVITY_PATHS: [&str; 4] = ["/", "/mini", "/comfyui", "/activity"];

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Compare without short-circuiting on the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

/// 32 random bytes from the OS, hex encoded.
pub fn random_token() -> String {
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn cookie_get(headers: &HeaderMap, name: &str) -> Option<String> {
    let v = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in v.split(';') {
        if let Some((k, val)) = part.trim().split_once('=') {
            if k.trim() == name {
                return Some(val.trim().to_string());
            }
        }
    }
    None
}

/// Sliding-window hit counter keyed by client address.
pub struct RateLimiter {
    window: Duration,
    max_hits: usize,
    hits: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_hits: usize) -> Self {
        Self {
            window,
            max_hits,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hit at `now`. False when the client is over the limit; a
    /// rejected hit is not recorded. Clients with no hit left in the window
    /// are forgotten.
    pub fn check(&self, client: IpAddr, now: Instant) -> bool {
        let mut hits = lock(&self.hits);
        hits.retain(|_, q| {
            while q
                .front()
                .is_some_and(|&t| now.saturating_duration_since(t) >= self.window)
            {
                q.pop_front();
            }
            !q.is_empty()
        });
        let q = hits.entry(client).or_default();
        if q.len() >= self.max_hits {
            return false;
        }
        q.push_back(now);
        true
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        lock(&self.hits).len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionEntry {
    pub authenticated: bool,
    pub last_seen: Instant,
}

/// Server-side sessions keyed by the session cookie value.
pub struct SessionStore {
    idle_timeout: Duration,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open an authenticated session, dropping any that have gone idle.
    pub fn create(&self, now: Instant) -> String {
        let id = random_token();
        let mut sessions = lock(&self.sessions);
        sessions.retain(|_, s| now.saturating_duration_since(s.last_seen) <= self.idle_timeout);
        sessions.insert(
            id.clone(),
            SessionEntry {
                authenticated: true,
                last_seen: now,
            },
        );
        id
    }

    pub fn is_authenticated(&self, id: &str) -> bool {
        lock(&self.sessions)
            .get(id)
            .is_some_and(|s| s.authenticated)
    }

    pub fn touch(&self, id: &str, now: Instant) {
        if let Some(s) = lock(&self.sessions).get_mut(id) {
            s.last_seen = now;
        }
    }

    /// Drop the session if it has been idle too long. True if it was dropped.
    pub fn expire_if_idle(&self, id: &str, now: Instant) -> bool {
        let mut sessions = lock(&self.sessions);
        let expired = sessions.get(id).is_some_and(|s| {
            s.authenticated && now.saturating_duration_since(s.last_seen) > self.idle_timeout
        });
        if expired {
            sessions.remove(id);
        }
        expired
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock(&self.sessions).len()
    }
}

/// Everything the guards share for the life of the process.
pub struct SecurityGate {
    csrf_token: String,
    pub rate: RateLimiter,
    pub sessions: SessionStore,
}

impl SecurityGate {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            csrf_token: random_token(),
            rate: RateLimiter::new(RATE_WINDOW, RATE_MAX_HITS),
            sessions: SessionStore::new(idle_timeout),
        }
    }

    pub fn csrf_token(&self) -> &str {
        &self.csrf_token
    }

    pub fn csrf_matches(&self, candidate: &str) -> bool {
        constant_time_eq(candidate.as_bytes(), self.csrf_token.as_bytes())
    }

    /// Session id from the request, if it names an authenticated session.
    pub fn session_of(&self, headers: &HeaderMap) -> Option<String> {
        cookie_get(headers, SESSION_COOKIE).filter(|id| self.sessions.is_authenticated(id))
    }
}

fn is_mutating(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

/// Reject mutating requests that lack the process CSRF token, before any
/// handler runs. The token is read from the header or the form body.
pub async fn csrf_guard(State(state): State<ControlState>, req: Request, next: Next) -> Response {
    if !is_mutating(req.method()) || CSRF_EXEMPT.contains(&req.uri().path()) {
        return next.run(req).await;
    }

    let header_token = req
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string());

    let (token, req) = match header_token {
        Some(t) => (Some(t), req),
        None if is_form(req.headers()) => {
            let (parts, body) = req.into_parts();
            let Ok(bytes) = axum::body::to_bytes(body, MAX_FORM_BYTES).await else {
                return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
            };
            let probe = axum::http::Request::builder()
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(bytes.clone()));
            let token = match probe {
                Ok(probe) => Form::<HashMap<String, String>>::from_request(probe, &())
                    .await
                    .ok()
                    .and_then(|Form(mut fields)| fields.remove(CSRF_FIELD)),
                Err(_) => None,
            };
            (token, Request::from_parts(parts, Body::from(bytes)))
        }
        None => (None, req),
    };

    match token {
        Some(t) if state.gate.csrf_matches(&t) => next.run(req).await,
        _ => {
            warn!(path = %req.uri().path(), "rejected request with missing or invalid CSRF token");
            (StatusCode::FORBIDDEN, "CSRF token missing or invalid").into_response()
        }
    }
}

fn client_ip(req: &Request) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Bound POST volume per client address.
pub async fn rate_limit(State(state): State<ControlState>, req: Request, next: Next) -> Response {
    if req.method() != Method::POST {
        return next.run(req).await;
    }
    let ip = client_ip(&req);
    if !state.gate.rate.check(ip, Instant::now()) {
        warn!(client = %ip, "rate limit exceeded");
        let mut resp = (StatusCode::TOO_MANY_REQUESTS, "Too many requests, retry later")
            .into_response();
        resp.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from(RATE_WINDOW.as_secs()),
        );
        return resp;
    }
    next.run(req).await
}

fn is_activity(req: &Request) -> bool {
    req.method() == Method::POST
        || ACTIVITY_PATHS.contains(&req.uri().path())
        || req
            .headers()
            .get(ACTIVITY_HEADER)
            .is_some_and(|v| v.as_bytes() == b"1")
}

/// Expire idle sessions and refresh the ones showing activity.
pub async fn idle_guard(State(state): State<ControlState>, req: Request, next: Next) -> Response {
    if req.uri().path() == "/login" {
        return next.run(req).await;
    }
    if let Some(id) = cookie_get(req.headers(), SESSION_COOKIE) {
        let now = Instant::now();
        if state.gate.sessions.expire_if_idle(&id, now) {
            info!("session expired after inactivity");
            return Redirect::to("/login").into_response();
        }
        if is_activity(&req) {
            state.gate.sessions.touch(&id, now);
        }
    }
    next.run(req).await
}

/// Redirect unauthenticated requests to the login page.
pub async fn require_login(State(state): State<ControlState>, req: Request, next: Next) -> Response {
    if state.gate.session_of(req.headers()).is_some() {
        return next.run(req).await;
    }
    debug!(path = %req.uri().path(), "unauthenticated request");
    let target = format!("/login?next={}", req.uri().path());
    Redirect::to(&target).into_response()
}
