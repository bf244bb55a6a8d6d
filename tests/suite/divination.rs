//! Ledger reconciliation across a real gateway: who pays for what arrived.

use wiremock::MockServer;
use yijing_engine::{
    DivinationOutcome, DivinationRequest, FailureReason, ReplyEvent, TOKEN_USAGE_MARKER,
};

use crate::common::{
    Fixture, HEAVEN, PRIMARY, chunk, dead_endpoint, drain, finish, gateway, mount, sse,
    stream_error, text_of, user,
};

fn request() -> DivinationRequest {
    DivinationRequest::new(user(), HEAVEN.to_vec(), "Should I take the new post?")
        .with_user_name("Tester")
}

#[tokio::test]
async fn streamed_reading_is_charged_once_and_archived() {
    let server = MockServer::start().await;
    let body = [chunk("潛龍"), chunk("勿用，"), chunk("宜待時。"), finish(210, 12)].concat();
    mount(&server, PRIMARY, sse(body), 1).await;

    let fixture = Fixture::new(2);
    let orch = fixture.orchestrator(gateway(&server.uri(), &[]));

    let mut stream = orch.handle(request()).await.unwrap();
    assert_eq!(stream.context().display_name(), "乾");
    assert_eq!(stream.context().line_texts()[0].text, "潛龍勿用");

    let events = drain(&mut stream).await;
    assert_eq!(text_of(&events), "潛龍勿用，宜待時。");
    let Some(ReplyEvent::Usage(report)) = events.last() else {
        panic!("expected trailing usage, got {events:?}");
    };
    assert_eq!(report.model, PRIMARY);
    let usage = report.usage.clone().unwrap();
    assert_eq!(usage.prompt_tokens, 210);
    assert_eq!(usage.total_tokens, 222);
    assert!(events.last().unwrap().render().starts_with(TOKEN_USAGE_MARKER));

    let outcome = stream.finish().await.unwrap();
    assert!(matches!(outcome, DivinationOutcome::Completed { reading_id: Some(_), .. }));

    assert_eq!(fixture.silver(), 1);
    let saved = fixture.readings();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].content, "潛龍勿用，宜待時。");
    assert_eq!(saved[0].summary.question, "Should I take the new post?");
    let account = fixture.db.load_account(&user()).unwrap().unwrap();
    assert_eq!(account.request_count, 1);

    // The prompt carried the resolved hexagram and the caller's name.
    let requests = server.received_requests().await.unwrap();
    let sent: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    let prompt = sent["contents"][0]["parts"][0]["text"].as_str().unwrap();
    assert!(prompt.contains("111111"), "{prompt}");
    assert!(prompt.contains("潛龍勿用"), "{prompt}");
    assert!(prompt.contains("Tester"), "{prompt}");
}

#[tokio::test]
async fn connection_error_before_any_text_leaves_wallet_untouched() {
    let fixture = Fixture::new(3);
    let orch = fixture.orchestrator(gateway(&dead_endpoint(), &[]));

    let mut stream = orch.handle(request()).await.unwrap();
    let events = drain(&mut stream).await;
    assert_eq!(events.len(), 1, "{events:?}");
    assert!(matches!(&events[0], ReplyEvent::Failed(FailureReason::Upstream(_))));
    assert!(events[0].render().starts_with("\n[llm_unavailable]"));

    let outcome = stream.finish().await.unwrap();
    assert!(matches!(outcome, DivinationOutcome::Failed { refunded: true, .. }));
    assert_eq!(fixture.silver(), 3);
    assert!(fixture.readings().is_empty());
}

#[tokio::test]
async fn stream_error_before_any_text_is_refunded() {
    let server = MockServer::start().await;
    mount(&server, PRIMARY, sse(stream_error("model overloaded")), 1).await;

    let fixture = Fixture::new(1);
    let orch = fixture.orchestrator(gateway(&server.uri(), &[]));

    let err = orch.handle(request()).await.unwrap().collect().await.unwrap_err();
    assert_eq!(err.status_code(), 503);
    assert!(err.to_string().contains("model overloaded"), "{err}");
    assert_eq!(fixture.silver(), 1);
    assert!(fixture.readings().is_empty());
}

#[tokio::test]
async fn stream_error_after_text_keeps_charge_and_partial_reading() {
    let server = MockServer::start().await;
    let body = [
        chunk("飛龍"),
        chunk("在天，"),
        chunk("利見大人"),
        stream_error("connection reset"),
    ]
    .concat();
    mount(&server, PRIMARY, sse(body), 1).await;

    let fixture = Fixture::new(2);
    let orch = fixture.orchestrator(gateway(&server.uri(), &[]));

    let mut stream = orch.handle(request()).await.unwrap();
    let events = drain(&mut stream).await;
    assert_eq!(events.len(), 4, "{events:?}");
    assert_eq!(text_of(&events), "飛龍在天，利見大人");
    assert!(matches!(&events[3], ReplyEvent::Failed(FailureReason::Upstream(_))));

    let outcome = stream.finish().await.unwrap();
    assert!(matches!(outcome, DivinationOutcome::Partial { reading_id: Some(_), .. }));
    assert_eq!(fixture.silver(), 1);
    let saved = fixture.readings();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].content, "飛龍在天，利見大人");
}

#[tokio::test]
async fn empty_stream_is_refunded_with_marker() {
    let server = MockServer::start().await;
    mount(&server, PRIMARY, sse(finish(40, 0)), 1).await;

    let fixture = Fixture::new(1);
    let orch = fixture.orchestrator(gateway(&server.uri(), &[]));

    let mut stream = orch.handle(request()).await.unwrap();
    let events = drain(&mut stream).await;
    assert_eq!(events, vec![ReplyEvent::Failed(FailureReason::EmptyResponse)]);
    assert_eq!(events[0].render(), "\n[empty_response]");

    stream.finish().await.unwrap();
    assert_eq!(fixture.silver(), 1);
    assert!(fixture.readings().is_empty());
}

#[tokio::test]
async fn empty_wallet_never_reaches_the_gateway() {
    let server = MockServer::start().await;
    mount(&server, PRIMARY, sse(chunk("unused")), 0).await;

    let fixture = Fixture::new(0);
    let orch = fixture.orchestrator(gateway(&server.uri(), &[]));

    let err = orch.handle(request()).await.unwrap_err();
    assert_eq!(err.status_code(), 402);
}
