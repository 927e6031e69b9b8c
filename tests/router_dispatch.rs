//! Tests for routing-table dispatch and the correlation-first path.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use serial_test::serial;
use uplink::codec::{EnvelopeCodec, ReceiptMeta};
use uplink::correlation::CorrelationEntry;
use uplink::envelope::{Body, ContentType, Envelope, epoch_now};
use uplink::error::Error;
use uplink::router::{Handler, RouteOutcome, Router};

fn request(gateway_routing: Option<&str>) -> Envelope {
    let codec = EnvelopeCodec::new("gw_1");
    let builder = codec.request(
        "events",
        "server.control",
        "gateway.control",
        Body::empty(),
    );
    let builder = match gateway_routing {
        Some(key) => builder.gateway_routing(key),
        None => builder,
    };
    builder
        .request_type("device_command")
        .build()
        .expect("valid request")
}

fn receipt() -> ReceiptMeta {
    ReceiptMeta {
        received_at: Instant::now(),
        received_at_epoch: epoch_now(),
        content_type: ContentType::Bincode,
        sent_at: epoch_now(),
        created_at: epoch_now(),
        payload_size: 0,
        round_trip: None,
    }
}

fn recording_handler(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Handler {
    let log = Arc::clone(log);
    Arc::new(move |_envelope, _receipt| {
        let log = Arc::clone(&log);
        Box::pin(async move {
            log.lock().expect("log lock").push(tag);
            Ok(())
        })
    })
}

#[tokio::test]
async fn handlers_for_a_key_run_in_registration_order() {
    let router = Router::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    router.register_route("control", recording_handler(&log, "first"));
    router.register_route("control", recording_handler(&log, "second"));
    assert_eq!(router.handler_count("control"), 2);

    let outcome = router
        .route(request(Some("control")), None, receipt())
        .await
        .expect("dispatch");
    assert_eq!(outcome, RouteOutcome::Routed(2));
    assert_eq!(*log.lock().expect("log lock"), ["first", "second"]);
}

#[tokio::test]
async fn correlation_callback_wins_over_the_table() {
    let router = Router::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    router.register_route("control", recording_handler(&log, "table"));

    let entry = CorrelationEntry::new(
        "abcdef0123456789",
        "server.control",
        Some(recording_handler(&log, "callback")),
    );
    let outcome = router
        .route(request(Some("control")), Some(entry), receipt())
        .await
        .expect("dispatch");
    assert_eq!(outcome, RouteOutcome::Correlated);
    assert_eq!(*log.lock().expect("log lock"), ["callback"]);
}

#[tokio::test]
async fn correlation_entry_without_callback_falls_through_to_the_table() {
    let router = Router::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    router.register_route("control", recording_handler(&log, "table"));

    let entry = CorrelationEntry::new("abcdef0123456789", "server.control", None);
    let outcome = router
        .route(request(Some("control")), Some(entry), receipt())
        .await
        .expect("dispatch");
    assert_eq!(outcome, RouteOutcome::Routed(1));
    assert_eq!(*log.lock().expect("log lock"), ["table"]);
}

#[tokio::test]
async fn unroutable_messages_are_dropped_without_error() {
    let router = Router::new();

    let no_header = router
        .route(request(None), None, receipt())
        .await
        .expect("dispatch");
    assert_eq!(no_header, RouteOutcome::Dropped);

    let no_route = router
        .route(request(Some("nobody-home")), None, receipt())
        .await
        .expect("dispatch");
    assert_eq!(no_route, RouteOutcome::Dropped);
}

#[tokio::test]
async fn handler_failure_stops_the_chain_and_propagates() {
    #[derive(Debug, thiserror::Error)]
    #[error("handler rejected the message")]
    struct Rejected;

    let router = Router::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    router.register_route(
        "control",
        Arc::new(|_envelope, _receipt| Box::pin(async { Err(Error::handler(Rejected)) })),
    );
    router.register_route("control", recording_handler(&log, "after"));

    let error = router
        .route(request(Some("control")), None, receipt())
        .await
        .expect_err("propagates");
    assert!(matches!(error, Error::Handler(_)));
    assert!(
        log.lock().expect("log lock").is_empty(),
        "later handlers do not run after a failure"
    );
}

#[tokio::test]
#[serial(routing_logs)]
async fn unroutable_drop_is_visible_through_the_log_bridge() {
    let mut logger = logtest::Logger::start();
    let router = Router::new();
    let _ = router
        .route(request(Some("nobody-home")), None, receipt())
        .await
        .expect("dispatch");

    let mut found = false;
    while let Some(record) = logger.pop() {
        if record.args().to_string().contains("unroutable") {
            found = true;
            break;
        }
    }
    assert!(found, "unroutable drop emits a warning");
}
