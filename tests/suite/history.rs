//! Subscriber readings: quota accounting, retention, pinning and purge.

use chrono::{Duration, Utc};
use wiremock::{MockServer, ResponseTemplate};
use yijing_engine::DivinationRequest;
use yijing_store::{AccountPlan, OfflineUpload};
use yijing_types::quota_day;

use crate::common::{Fixture, HEAVEN, PRIMARY, chunk, finish, gateway, mount, sse, user};

fn subscriber() -> Fixture {
    let fixture = Fixture::new(0);
    fixture
        .db
        .set_subscription(&user(), AccountPlan::Subscriber, Some(Utc::now() + Duration::days(10)))
        .unwrap();
    fixture
}

#[tokio::test]
async fn subscriber_readings_expire_unless_pinned() {
    let server = MockServer::start().await;
    mount(&server, PRIMARY, sse([chunk("元亨利貞"), finish(50, 4)].concat()), 2).await;

    let fixture = subscriber();
    let orch = fixture.orchestrator(gateway(&server.uri(), &[]));

    let first = orch
        .handle(DivinationRequest::new(user(), HEAVEN.to_vec(), "first"))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    let second = orch
        .handle(DivinationRequest::new(user(), HEAVEN.to_vec(), "second"))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(fixture.db.quota_used(&user(), quota_day(Utc::now())).unwrap(), 2);

    let first_id = first.outcome.reading_id().unwrap();
    let second_id = second.outcome.reading_id().unwrap();

    let listed = fixture.db.list_readings(&user(), 10, 0, false).unwrap();
    assert_eq!(listed.len(), 2);
    for reading in &listed {
        let expires = reading.expires_at.unwrap();
        assert_eq!((expires - reading.created_at).num_days(), 30);
    }

    assert!(fixture.db.set_pin(&user(), first_id, true).unwrap());
    let listed = fixture.db.list_readings(&user(), 10, 0, false).unwrap();
    assert_eq!(listed[0].id, first_id);
    assert!(listed[0].is_pinned);
    assert_eq!(listed[0].expires_at, None);

    let purged = fixture.db.purge_expired(Utc::now() + Duration::days(31)).unwrap();
    assert_eq!(purged, 1);
    assert!(fixture.db.reading_detail(&user(), second_id).unwrap().is_none());
    let kept = fixture.db.reading_detail(&user(), first_id).unwrap().unwrap();
    assert_eq!(kept.content, "元亨利貞");
    assert_eq!(kept.summary.question, "first");
}

#[tokio::test]
async fn subscriber_quota_is_spent_even_when_generation_fails() {
    let server = MockServer::start().await;
    mount(&server, PRIMARY, ResponseTemplate::new(503), 3).await;

    let fixture = subscriber();
    let orch = fixture.orchestrator(gateway(&server.uri(), &[]));

    let err = orch
        .handle(DivinationRequest::new(user(), HEAVEN.to_vec(), "q"))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 503);
    assert_eq!(fixture.db.quota_used(&user(), quota_day(Utc::now())).unwrap(), 1);
    assert!(fixture.readings().is_empty());
}

#[test]
fn offline_readings_join_the_subscriber_archive_with_retention() {
    let fixture = subscriber();
    let upload: OfflineUpload = serde_json::from_value(serde_json::json!({
        "records": [
            {"question": "從前的問題", "hexagram_code": "111111", "changing_lines": [1], "result_text": "潛龍勿用"},
            {"question": "壞的", "hexagram_code": "2", "result_text": "skip me"}
        ]
    }))
    .unwrap();

    let saved = fixture.db.import_readings(&user(), &upload.into_records()).unwrap();
    assert_eq!(saved.len(), 1);

    let readings = fixture.readings();
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].summary.id, saved[0]);
    assert_eq!(readings[0].content, "潛龍勿用");
    assert!(readings[0].summary.expires_at.is_some());
}
