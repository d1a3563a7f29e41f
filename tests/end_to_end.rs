//! Full request path: router -> throttle layer -> chain -> rules -> store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::{routing::get, Router};
use http::{Method, StatusCode};
use tower::ServiceExt;

use turnstile::throttle::{
    Classifier, Clock, ManualClock, MemoryEventStore, ShardedEventStore,
    ThrottleChain, ThrottleRule, WindowRule,
};
use turnstile::web::ThrottleLayer;

fn request(method: Method, uri: &str) -> Request {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn app(chain: Arc<ThrottleChain>, hits: Arc<AtomicUsize>) -> Router {
    Router::new()
        .fallback(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                "downstream"
            }
        })
        .layer(ThrottleLayer::new(chain))
}

#[tokio::test]
async fn test_hundred_per_minute_recovers_after_window() {
    let clock = ManualClock::default();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = Arc::new(MemoryEventStore::with_clock(shared.clone()));
    let rule = WindowRule::builder("ip", Duration::from_secs(60), 100, store.clone())
        .clock(shared)
        .build()
        .unwrap();
    let rules: Vec<Arc<dyn ThrottleRule>> = vec![Arc::new(rule)];
    let chain = Arc::new(ThrottleChain::new(
        rules,
        StatusCode::TOO_MANY_REQUESTS,
        "rate limited",
    ));
    let hits = Arc::new(AtomicUsize::new(0));
    let app = app(chain.clone(), hits.clone());

    // 100 requests spread over less than a minute.
    for _ in 0..100 {
        let response = app.clone().oneshot(request(Method::GET, "/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        clock.advance(Duration::from_millis(500));
    }
    assert_eq!(store.log_len("ip"), 100);

    // Recorded count is 100, not above the threshold: request 101 is admitted
    // and recorded, request 102 sees 101 and is rejected.
    let response = app.clone().oneshot(request(Method::GET, "/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(request(Method::GET, "/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"rate limited");
    assert_eq!(hits.load(Ordering::SeqCst), 101);

    // Once the whole burst has aged out the key is admitted again.
    clock.advance(Duration::from_secs(61));
    let response = app.oneshot(request(Method::GET, "/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 102);

    chain.shutdown().await;
}

#[tokio::test]
async fn test_rules_apply_only_to_classified_routes() {
    let store = Arc::new(ShardedEventStore::new());
    let login = WindowRule::new(
        "login",
        Duration::from_secs(300),
        1,
        Classifier::all_of(vec![
            Classifier::methods(vec![Method::POST]),
            Classifier::path_prefix("/login"),
        ]),
        store.clone(),
    )
    .unwrap();
    let global = WindowRule::new("global", Duration::from_secs(60), 1000, Classifier::always(), store.clone())
        .unwrap();
    let rules: Vec<Arc<dyn ThrottleRule>> = vec![Arc::new(login), Arc::new(global)];
    let chain = Arc::new(ThrottleChain::new(rules, StatusCode::TOO_MANY_REQUESTS, ""));
    let hits = Arc::new(AtomicUsize::new(0));
    let app = app(chain.clone(), hits.clone());

    for _ in 0..2 {
        let response = app.clone().oneshot(request(Method::POST, "/login")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.clone().oneshot(request(Method::POST, "/login")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // Reads are not classified by the login rule, even though its key is hot.
    let response = app.clone().oneshot(request(Method::GET, "/login")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The rejected request never reached the global rule.
    assert_eq!(store.log_len("global"), 3);
    // The login rule records every request that passes it, classified or not.
    assert_eq!(store.log_len("login"), 3);

    chain.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_are_all_recorded() {
    let store = Arc::new(MemoryEventStore::new());
    let rule = WindowRule::new("ip", Duration::from_secs(60), 10_000, Classifier::always(), store.clone())
        .unwrap();
    let rules: Vec<Arc<dyn ThrottleRule>> = vec![Arc::new(rule)];
    let chain = Arc::new(ThrottleChain::new(rules, StatusCode::TOO_MANY_REQUESTS, ""));
    let hits = Arc::new(AtomicUsize::new(0));
    let app = app(chain.clone(), hits.clone());

    let mut handles = Vec::new();
    for _ in 0..16 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..25 {
                let response = app.clone().oneshot(request(Method::GET, "/")).await.unwrap();
                assert_eq!(response.status(), StatusCode::OK);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(store.log_len("ip"), 400);
    assert_eq!(hits.load(Ordering::SeqCst), 400);

    chain.shutdown().await;
}
