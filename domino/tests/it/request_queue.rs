use crate::helper::{eventually, recv_with_timeout, to_domino_error, Call, RecordingDriver};
use crate::started_messenger;
use domino::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Requests arriving to `queue`, the test replies to them.
async fn incoming_requests(messenger: &Messenger, queue: &str) -> mpsc::UnboundedReceiver<Delivery> {
    let (tx, rx) = mpsc::unbounded_channel();

    messenger.create_queue(queue).await.unwrap();
    messenger
        .listen(queue, move |delivery| {
            let _ = tx.send(delivery);
        })
        .await
        .unwrap();

    rx
}

/// Spawn a server which echoes back every request arriving to `queue`.
async fn echo_server(driver: Arc<RecordingDriver>, queue: &str) {
    let server = Messenger::new(driver, MessengerConfig::default());
    let mut requests = incoming_requests(&server, queue).await;

    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            server.reply(&request, &request.json().unwrap()).await.unwrap();
            server.ack(&request).await.unwrap();
        }
    });
}

#[tokio::test]
async fn request_is_resolved_by_its_reply() {
    let (messenger, driver) = started_messenger().await;
    let requests = messenger.request_queue();

    echo_server(driver.clone(), "svc.echo").await;
    requests.start().await.unwrap();

    let reply = requests.request(&json!({"a": 1}), "svc.echo").await.unwrap();

    assert_eq!(reply.json().unwrap(), json!({"a": 1}));
    assert_eq!(reply.queue, requests.queue().unwrap());
    assert!(reply.properties.correlation_id.is_some());
    assert_eq!(requests.pending(), 0);
}

#[tokio::test]
async fn request_before_start_is_premature() {
    let (messenger, driver) = started_messenger().await;
    let requests = messenger.request_queue();

    let err = to_domino_error(requests.request(&json!(1), "svc.none").await);

    assert_eq!(err.kind, ErrorKind::PrematureUse);
    assert!(!driver.calls().iter().any(|c| matches!(c, Call::Send(_))));
}

#[tokio::test]
async fn request_carries_reply_to_and_correlation_id() {
    let (messenger, _) = started_messenger().await;
    let requests = messenger.request_queue();
    let mut incoming = incoming_requests(&messenger, "svc.inspect").await;

    requests.start().await.unwrap();

    let pending = requests.send_request(&json!("ping"), "svc.inspect", None).await.unwrap();
    let request = recv_with_timeout(&mut incoming).await.unwrap();

    assert_eq!(request.properties.reply_to, requests.queue());
    assert_eq!(request.properties.correlation_id.as_deref(), Some(pending.correlation_id()));
    assert_eq!(request.json().unwrap(), json!("ping"));
    assert_eq!(requests.pending(), 1);

    messenger.reply(&request, &json!("pong")).await.unwrap();

    let reply = pending.await.unwrap();

    assert_eq!(reply.json().unwrap(), json!("pong"));
    assert_eq!(reply.properties.correlation_id, request.properties.correlation_id);
}

#[tokio::test]
async fn concurrent_requests_get_their_own_replies() {
    let (messenger, _) = started_messenger().await;
    let requests = messenger.request_queue();
    let mut incoming = incoming_requests(&messenger, "svc.slow").await;

    requests.start().await.unwrap();

    let mut pendings = vec![];
    for i in 0..3 {
        pendings.push(requests.send_request(&json!(i), "svc.slow", None).await.unwrap());
    }

    let mut received = vec![];
    for _ in 0..3 {
        received.push(recv_with_timeout(&mut incoming).await.unwrap());
    }

    // answer in reverse order
    for request in received.iter().rev() {
        let n = request.json().unwrap().as_i64().unwrap();

        messenger.reply(request, &json!(n * 10)).await.unwrap();
    }

    let replies = futures::future::join_all(pendings).await;
    let values: Vec<_> = replies.into_iter().map(|r| r.unwrap().json().unwrap()).collect();

    assert_eq!(values, vec![json!(0), json!(10), json!(20)]);
    assert_eq!(requests.pending(), 0);
}

#[tokio::test]
async fn duplicated_reply_is_acked_and_dropped() {
    let (messenger, driver) = started_messenger().await;
    let requests = messenger.request_queue();
    let mut incoming = incoming_requests(&messenger, "svc.twice").await;

    requests.start().await.unwrap();

    let pending = requests.send_request(&json!(1), "svc.twice", None).await.unwrap();
    let request = recv_with_timeout(&mut incoming).await.unwrap();

    messenger.reply(&request, &json!("first")).await.unwrap();
    messenger.reply(&request, &json!("second")).await.unwrap();

    assert_eq!(pending.await.unwrap().json().unwrap(), json!("first"));

    let reply_queue = requests.queue().unwrap();

    assert!(eventually(|| driver.ack_count() == 2).await);
    assert_eq!(driver.broker.unacked(&reply_queue).await.unwrap(), 0);
}

#[tokio::test]
async fn stray_reply_is_acked() {
    let (messenger, driver) = started_messenger().await;
    let requests = messenger.request_queue();

    requests.start().await.unwrap();

    let reply_queue = requests.queue().unwrap();
    let properties = MessageProperties::default().correlation_id("nobody-asked");

    driver.broker.send(&reply_queue, &json!("lost"), properties).await.unwrap();

    assert!(eventually(|| driver.ack_count() == 1).await);
    assert_eq!(requests.pending(), 0);
}

#[tokio::test]
async fn undecodable_reply_fails_the_request() {
    let (messenger, driver) = started_messenger().await;
    let requests = messenger.request_queue();
    let mut incoming = incoming_requests(&messenger, "svc.garbage").await;

    requests.start().await.unwrap();

    let pending = requests.send_request(&json!(1), "svc.garbage", None).await.unwrap();
    let request = recv_with_timeout(&mut incoming).await.unwrap();

    let properties = MessageProperties::default().correlation_id(pending.correlation_id());
    driver.inject(&requests.queue().unwrap(), 5000, "<xml/>", properties);

    let err = to_domino_error(pending.await);

    assert_eq!(err.kind, ErrorKind::DecodeFailure);
    assert!(eventually(|| driver.acks(5000) == 1).await);

    // a later proper reply finds nobody waiting
    messenger.reply(&request, &json!("late")).await.unwrap();
    assert!(eventually(|| driver.ack_count() == 2).await);
}

#[tokio::test]
async fn request_times_out_and_clears_its_slot() {
    let (messenger, _) = started_messenger().await;
    let requests = messenger.request_queue();
    let _incoming = incoming_requests(&messenger, "svc.mute").await;

    requests.start().await.unwrap();

    let err = to_domino_error(
        requests
            .request_timeout(&json!(1), "svc.mute", Duration::from_millis(50))
            .await,
    );

    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(requests.pending(), 0);
}

#[tokio::test]
async fn dropped_pending_reply_is_forgotten() {
    let (messenger, _) = started_messenger().await;
    let requests = messenger.request_queue();
    let mut incoming = incoming_requests(&messenger, "svc.drop").await;

    requests.start().await.unwrap();

    let pending = requests.send_request(&json!(1), "svc.drop", None).await.unwrap();
    assert_eq!(requests.pending(), 1);

    drop(pending);
    assert_eq!(requests.pending(), 0);

    // the reply of the forgotten request is still consumed
    let request = recv_with_timeout(&mut incoming).await.unwrap();
    messenger.reply(&request, &json!("nobody")).await.unwrap();
}

#[tokio::test]
async fn failed_send_leaves_nothing_pending() {
    let (messenger, _) = started_messenger().await;
    let requests = messenger.request_queue();

    requests.start().await.unwrap();

    let err = to_domino_error(requests.request(&json!(1), "svc.missing").await);

    assert_eq!(err.kind, ErrorKind::PreconditionFailed);
    assert_eq!(requests.pending(), 0);
}
