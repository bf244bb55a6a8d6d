//! Retry and model failover as seen from a full divination.

use std::sync::atomic::{AtomicU32, Ordering};

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use yijing_engine::{DivinationOutcome, DivinationRequest};

use crate::common::{
    FALLBACK, Fixture, HEAVEN, PRIMARY, chunk, finish, gateway, model_path, mount, sse, user,
};

fn request() -> DivinationRequest {
    DivinationRequest::new(user(), HEAVEN.to_vec(), "Will the harvest be good?")
}

#[tokio::test]
async fn two_overloads_are_retried_on_the_primary_model() {
    let server = MockServer::start().await;
    let attempt = AtomicU32::new(0);
    let body = [chunk("見龍在田"), finish(90, 4)].concat();
    let responder = move |_: &wiremock::Request| {
        if attempt.fetch_add(1, Ordering::SeqCst) < 2 {
            ResponseTemplate::new(503).set_body_string("overloaded")
        } else {
            sse(body.clone())
        }
    };
    Mock::given(method("POST"))
        .and(path(model_path(PRIMARY)))
        .respond_with(responder)
        .expect(3)
        .mount(&server)
        .await;
    mount(&server, FALLBACK, sse(chunk("unused")), 0).await;

    let fixture = Fixture::new(1);
    let orch = fixture.orchestrator(gateway(&server.uri(), &[FALLBACK]));

    let collected = orch.handle(request()).await.unwrap().collect().await.unwrap();
    assert_eq!(collected.text, "見龍在田");
    assert_eq!(collected.report().unwrap().model, PRIMARY);
    assert_eq!(fixture.silver(), 0);
}

#[tokio::test]
async fn rejected_key_fails_over_to_the_next_model() {
    let server = MockServer::start().await;
    mount(
        &server,
        PRIMARY,
        ResponseTemplate::new(401).set_body_string("API key not valid"),
        1,
    )
    .await;
    mount(&server, FALLBACK, sse([chunk("亢龍有悔"), finish(80, 4)].concat()), 1).await;

    let fixture = Fixture::new(1);
    let orch = fixture.orchestrator(gateway(&server.uri(), &[FALLBACK]));

    let collected = orch.handle(request()).await.unwrap().collect().await.unwrap();
    assert_eq!(collected.text, "亢龍有悔");
    assert_eq!(collected.report().unwrap().model, FALLBACK);
    assert!(matches!(collected.outcome, DivinationOutcome::Completed { .. }));
    assert_eq!(fixture.silver(), 0);
}

#[tokio::test]
async fn every_model_failing_refunds_and_reports_each() {
    let server = MockServer::start().await;
    mount(
        &server,
        PRIMARY,
        ResponseTemplate::new(403).set_body_string("permission denied"),
        1,
    )
    .await;
    mount(
        &server,
        FALLBACK,
        ResponseTemplate::new(500).set_body_string("internal"),
        3,
    )
    .await;

    let fixture = Fixture::new(1);
    let orch = fixture.orchestrator(gateway(&server.uri(), &[FALLBACK]));

    let err = orch.handle(request()).await.unwrap().collect().await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("permission denied"), "{message}");
    assert!(message.contains("internal"), "{message}");
    assert_eq!(fixture.silver(), 1);
    assert!(fixture.readings().is_empty());
}
