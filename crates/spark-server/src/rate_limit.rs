//! Token-bucket budgets for the HTTP routes and for socket commands.
//!
//! HTTP requests spend from a bucket per client address. A socket command
//! spends from two buckets: the sender's own budget within the chat, and a
//! budget the whole chat shares, so the two participants together cannot
//! exceed what one chat is allowed.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
    /// Tokens regained per second.
    pub refill_per_sec: f64,
    /// Bucket size: the largest burst.
    pub burst: f64,
}

impl Budget {
    /// Per client address on the HTTP routes.
    pub const HTTP: Budget = Budget {
        refill_per_sec: 10.0,
        burst: 30.0,
    };

    /// One participant's commands within one chat.
    pub const PARTICIPANT: Budget = Budget {
        refill_per_sec: 20.0,
        burst: 40.0,
    };

    /// Both participants of one chat together.
    pub const CHAT: Budget = Budget {
        refill_per_sec: 30.0,
        burst: 60.0,
    };

    fn wait_for_token(&self, tokens: f64) -> Duration {
        if self.refill_per_sec <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64((1.0 - tokens).max(0.0) / self.refill_per_sec)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn full(budget: &Budget, now: Instant) -> Self {
        Self {
            tokens: budget.burst,
            refilled_at: now,
        }
    }

    /// Spend one token, or report how long until one is available.
    fn take(&mut self, budget: &Budget, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * budget.refill_per_sec).min(budget.burst);
        self.refilled_at = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(budget.wait_for_token(self.tokens))
        }
    }
}

/// One budget, one bucket per key.
#[derive(Clone)]
pub struct Limiter<K> {
    budget: Budget,
    buckets: Arc<Mutex<HashMap<K, Bucket>>>,
}

impl<K: Hash + Eq> Limiter<K> {
    pub fn new(budget: Budget) -> Self {
        Self {
            budget,
            buckets: Arc::default(),
        }
    }

    /// Spend one token for `key`. `Err` carries the wait until the next one.
    pub async fn acquire(&self, key: K) -> Result<(), Duration> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(key)
            .or_insert_with(|| Bucket::full(&self.budget, now))
            .take(&self.budget, now)
    }

    /// Drop buckets untouched for `idle`. Returns how many went.
    pub async fn evict_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_duration_since(b.refilled_at) < idle);
        before - buckets.len()
    }
}

impl Default for Limiter<IpAddr> {
    fn default() -> Self {
        Self::new(Budget::HTTP)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Participant,
    Chat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Limited { scope: Scope, retry_after: Duration },
}

impl Verdict {
    /// Text of the error frame sent back for a refused command.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            Verdict::Allowed => None,
            Verdict::Limited {
                scope: Scope::Participant,
                ..
            } => Some("rate limit exceeded"),
            Verdict::Limited {
                scope: Scope::Chat, ..
            } => Some("chat rate limit exceeded"),
        }
    }
}

/// Command budgets keyed by `(chat_id, user_id)` and by `chat_id`.
#[derive(Clone)]
pub struct CommandLimiter {
    participants: Limiter<(String, String)>,
    chats: Limiter<String>,
}

impl Default for CommandLimiter {
    fn default() -> Self {
        Self::new(Budget::PARTICIPANT, Budget::CHAT)
    }
}

impl CommandLimiter {
    pub fn new(participant: Budget, chat: Budget) -> Self {
        Self {
            participants: Limiter::new(participant),
            chats: Limiter::new(chat),
        }
    }

    /// The sender's own budget is checked first; a refused sender spends
    /// nothing from the chat's.
    pub async fn admit(&self, chat_id: &str, user_id: &str) -> Verdict {
        let own = (chat_id.to_string(), user_id.to_string());
        if let Err(retry_after) = self.participants.acquire(own).await {
            return Verdict::Limited {
                scope: Scope::Participant,
                retry_after,
            };
        }
        if let Err(retry_after) = self.chats.acquire(chat_id.to_string()).await {
            return Verdict::Limited {
                scope: Scope::Chat,
                retry_after,
            };
        }
        Verdict::Allowed
    }

    pub async fn evict_idle(&self, idle: Duration) -> usize {
        self.participants.evict_idle(idle).await + self.chats.evict_idle(idle).await
    }
}

/// Refuse requests from addresses over their HTTP budget with 429 and a
/// `Retry-After` hint. Requests with no known address pass.
pub async fn limit_by_client(
    State(limiter): State<Limiter<IpAddr>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(ip) = client_ip(&req) else {
        debug!(path = %req.uri().path(), "No client address, skipping rate limit");
        return next.run(req).await;
    };

    match limiter.acquire(ip).await {
        Ok(()) => next.run(req).await,
        Err(retry_after) => {
            let secs = retry_after.as_secs_f64().ceil().clamp(1.0, 3600.0) as u64;
            warn!(ip = %ip, path = %req.uri().path(), retry_after_secs = secs, "HTTP rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, secs.to_string())],
            )
                .into_response()
        }
    }
}

/// The peer address when known, else the proxy headers.
fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .or_else(|| forwarded_ip(req.headers()))
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let parse = |raw: &str| raw.trim().parse::<IpAddr>().ok();

    value("x-forwarded-for")
        .and_then(|list| list.split(',').next())
        .and_then(parse)
        .or_else(|| value("x-real-ip").and_then(parse))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware, routing::get, Router};
    use tower::ServiceExt;

    const TIGHT: Budget = Budget {
        refill_per_sec: 2.0,
        burst: 2.0,
    };

    fn limited(scope: Scope) -> impl Fn(&Verdict) -> bool {
        move |v: &Verdict| matches!(v, Verdict::Limited { scope: s, .. } if *s == scope)
    }

    #[tokio::test(start_paused = true)]
    async fn test_participant_budget_refills() {
        let limiter = CommandLimiter::new(TIGHT, Budget::CHAT);
        assert_eq!(limiter.admit("c1", "he").await, Verdict::Allowed);
        assert_eq!(limiter.admit("c1", "he").await, Verdict::Allowed);

        let refused = limiter.admit("c1", "he").await;
        assert_eq!(
            refused,
            Verdict::Limited {
                scope: Scope::Participant,
                retry_after: Duration::from_millis(500),
            }
        );
        assert_eq!(refused.message(), Some("rate limit exceeded"));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(limiter.admit("c1", "he").await, Verdict::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_budget_is_shared_by_both_participants() {
        let chat = Budget {
            refill_per_sec: 0.0,
            burst: 3.0,
        };
        let limiter = CommandLimiter::new(TIGHT, chat);

        assert_eq!(limiter.admit("c1", "she").await, Verdict::Allowed);
        assert_eq!(limiter.admit("c1", "she").await, Verdict::Allowed);
        assert_eq!(limiter.admit("c1", "he").await, Verdict::Allowed);

        let refused = limiter.admit("c1", "he").await;
        assert!(limited(Scope::Chat)(&refused));
        assert_eq!(refused.message(), Some("chat rate limit exceeded"));

        // Another chat of the same user has its own budgets.
        assert_eq!(limiter.admit("c2", "he").await, Verdict::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_sender_does_not_spend_chat_budget() {
        let chat = Budget {
            refill_per_sec: 0.0,
            burst: 3.0,
        };
        let limiter = CommandLimiter::new(TIGHT, chat);
        for _ in 0..2 {
            limiter.admit("c1", "she").await;
        }
        for _ in 0..5 {
            assert!(limited(Scope::Participant)(&limiter.admit("c1", "she").await));
        }

        // One chat token is left for the other participant.
        assert_eq!(limiter.admit("c1", "he").await, Verdict::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_buckets() {
        let limiter = CommandLimiter::default();
        limiter.admit("c1", "he").await;
        tokio::time::advance(Duration::from_secs(60)).await;
        limiter.admit("c2", "she").await;

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.evict_idle(Duration::from_secs(90)).await, 2);
        assert_eq!(limiter.evict_idle(Duration::from_secs(90)).await, 0);
        assert_eq!(limiter.evict_idle(Duration::ZERO).await, 2);
    }

    #[test]
    fn test_client_ip_sources() {
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .header("x-real-ip", "198.51.100.2")
            .body(())
            .unwrap();
        assert_eq!(client_ip(&req), "203.0.113.7".parse().ok());

        let req = Request::builder()
            .header("x-forwarded-for", "unknown")
            .header("x-real-ip", " 198.51.100.2 ")
            .body(())
            .unwrap();
        assert_eq!(client_ip(&req), "198.51.100.2".parse().ok());

        let mut req = Request::builder()
            .header("x-forwarded-for", "203.0.113.7")
            .body(())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4000))));
        assert_eq!(client_ip(&req), "192.0.2.1".parse().ok());

        assert!(client_ip(&Request::new(())).is_none());
    }

    #[tokio::test]
    async fn test_middleware_answers_429_with_retry_after() {
        let limiter = Limiter::new(Budget {
            refill_per_sec: 0.0,
            burst: 1.0,
        });
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(limiter, limit_by_client));
        let request = || {
            Request::get("/health")
                .header("x-forwarded-for", "203.0.113.7")
                .body(Body::empty())
                .unwrap()
        };

        let resp = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "3600");

        // No address, no limit.
        let anonymous = Request::get("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(anonymous).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
