//! Tests for envelope construction, finalization and inbound validation.

use rstest::rstest;
use uplink::codec::{COMPRESSION_THRESHOLD, EnvelopeCodec};
use uplink::envelope::{
    Body,
    ContentType,
    DataType,
    DeliveryProps,
    Envelope,
    InboundDelivery,
    MessageType,
    PROTOCOL_VERSION,
    TransportHeaderValues,
    epoch_now,
};
use uplink::error::ProtocolError;

/// Re-frame a finalized outbound envelope as the raw delivery its receiver
/// would see.
fn as_delivery(envelope: &Envelope) -> InboundDelivery {
    let finalized = envelope.finalized().expect("finalized envelope");
    InboundDelivery {
        routing_key: envelope.routing_key.clone(),
        props: DeliveryProps {
            content_type: Some(finalized.content_type.as_str().to_owned()),
            correlation_id: Some(envelope.headers.correlation_id.clone()),
            headers: TransportHeaderValues {
                version: Some(i64::from(envelope.transport.version)),
                route: Some(envelope.transport.route.clone()),
                body_signature: Some(envelope.transport.body_signature.clone()),
                sent_at: Some(epoch_now()),
            },
        },
        body: finalized.payload.to_vec(),
    }
}

fn sample_request(codec: &EnvelopeCodec, body: Body) -> Envelope {
    let mut envelope = codec
        .request("ysrv.e.gw_config", "gateway.configs", "server.configs", body)
        .request_type("get_config")
        .gateway_routing("config")
        .build()
        .expect("valid request");
    codec.finalize(&mut envelope).expect("finalize");
    envelope
}

#[test]
fn response_carries_the_request_correlation_id() {
    let gateway = EnvelopeCodec::new("gw_1");
    let server = EnvelopeCodec::new("srv_1");

    let request = sample_request(&gateway, Body::empty());
    let mut response = server
        .response_to(
            "ysrv.e.gw_config",
            "server.configs",
            "gateway.configs",
            Body::Text("payload".into()),
            &request.headers,
        )
        .response_type("get_config")
        .build()
        .expect("valid response");
    server.finalize(&mut response).expect("finalize");

    let (parsed, _receipt) = gateway
        .parse_inbound(&as_delivery(&response))
        .expect("parse");
    assert_eq!(parsed.headers.message_type, MessageType::Response);
    assert_eq!(
        parsed.headers.reply_correlation_id.as_deref(),
        Some(request.headers.correlation_id.as_str())
    );
    assert_ne!(
        parsed.headers.correlation_id, request.headers.correlation_id,
        "responses get their own correlation id"
    );
}

#[test]
fn no_reply_requests_produce_uncorrelated_responses() {
    let gateway = EnvelopeCodec::new("gw_1");
    let server = EnvelopeCodec::new("srv_1");

    let request = gateway
        .request("events", "gateway.events", "server.events", Body::empty())
        .request_type("notify")
        .no_reply()
        .build()
        .expect("valid request");
    assert!(request.headers.correlation_id.starts_with("xx"));
    assert!(!request.expects_reply());

    let response = server
        .response_to(
            "events",
            "server.events",
            "gateway.events",
            Body::empty(),
            &request.headers,
        )
        .response_type("notify")
        .build()
        .expect("valid response");
    assert!(response.headers.reply_correlation_id.is_none());
}

#[test]
fn finalize_is_idempotent() {
    let codec = EnvelopeCodec::new("gw_1");
    let mut envelope = codec
        .request(
            "events",
            "gateway.events",
            "server.events",
            Body::Text("x".repeat(2_000)),
        )
        .build()
        .expect("valid request");
    codec.finalize(&mut envelope).expect("first finalize");
    let first = envelope.finalized().expect("payload").clone();
    codec.finalize(&mut envelope).expect("second finalize");
    let second = envelope.finalized().expect("payload").clone();
    assert_eq!(first, second, "no double compression, no duplicate headers");
}

#[rstest]
#[case::small(64, ContentType::Bincode)]
#[case::large(4 * COMPRESSION_THRESHOLD, ContentType::BincodeZstd)]
fn compression_kicks_in_above_the_threshold(
    #[case] body_size: usize,
    #[case] expected: ContentType,
) {
    let codec = EnvelopeCodec::new("gw_1");
    let envelope = sample_request(&codec, Body::Text("z".repeat(body_size)));
    let finalized = envelope.finalized().expect("payload");
    assert_eq!(finalized.content_type, expected);
    if expected.is_compressed() {
        assert!(
            finalized.payload.len() < finalized.uncompressed_size,
            "repetitive payload must shrink"
        );
        assert!(finalized.compression_percent < 100.0);
    }

    // Whatever the encoding, the receiver sees the original body.
    let (parsed, receipt) = codec.parse_inbound(&as_delivery(&envelope)).expect("parse");
    assert_eq!(parsed.body, Body::Text("z".repeat(body_size)));
    assert_eq!(receipt.content_type, expected);
    assert_eq!(parsed.headers.data_type, DataType::Text);
}

#[test]
fn parsed_envelope_preserves_headers_and_source_identity() {
    let codec = EnvelopeCodec::new("gw_1");
    let envelope = sample_request(&codec, Body::Object(vec![1, 2, 3]));
    let (parsed, _receipt) = codec.parse_inbound(&as_delivery(&envelope)).expect("parse");

    assert_eq!(parsed.headers.source, "gateway.configs:gw_1");
    assert_eq!(parsed.headers.destination, "server.configs");
    assert_eq!(parsed.headers.protocol_version, PROTOCOL_VERSION);
    assert_eq!(parsed.headers.gateway_routing.as_deref(), Some("config"));
    assert_eq!(parsed.headers.request_type.as_deref(), Some("get_config"));
    assert_eq!(parsed.headers.data_type, DataType::Object);
    assert_eq!(parsed.transport.route, vec!["gw.uplink:gw_1".to_owned()]);
}

#[test]
fn newer_protocol_versions_are_rejected_as_upgrade_required() {
    let codec = EnvelopeCodec::new("gw_1");
    let envelope = sample_request(&codec, Body::empty());
    let mut delivery = as_delivery(&envelope);
    delivery.props.headers.version = Some(i64::from(PROTOCOL_VERSION) + 5);

    let error = codec.parse_inbound(&delivery).expect_err("must reject");
    assert!(error.is_upgrade_required());
    match error {
        ProtocolError::UpgradeRequired {
            advertised,
            supported,
        } => {
            assert_eq!(advertised, PROTOCOL_VERSION + 5);
            assert_eq!(supported, PROTOCOL_VERSION);
        }
        other => panic!("expected UpgradeRequired, got {other:?}"),
    }
}

#[rstest]
#[case::version("yombo_version")]
#[case::route("route")]
#[case::signature("body_signature")]
#[case::sent_at("msg_sent_at")]
fn missing_transport_headers_are_named(#[case] header: &str) {
    let codec = EnvelopeCodec::new("gw_1");
    let envelope = sample_request(&codec, Body::empty());
    let mut delivery = as_delivery(&envelope);
    match header {
        "yombo_version" => delivery.props.headers.version = None,
        "route" => delivery.props.headers.route = None,
        "body_signature" => delivery.props.headers.body_signature = None,
        "msg_sent_at" => delivery.props.headers.sent_at = None,
        other => panic!("unknown header {other}"),
    }

    let error = codec.parse_inbound(&delivery).expect_err("must reject");
    assert!(!error.is_upgrade_required());
    match error {
        ProtocolError::MissingTransportHeader(name) => assert_eq!(name, header),
        other => panic!("expected MissingTransportHeader, got {other:?}"),
    }
}

#[test]
fn unknown_content_types_are_rejected() {
    let codec = EnvelopeCodec::new("gw_1");
    let envelope = sample_request(&codec, Body::empty());
    let mut delivery = as_delivery(&envelope);
    delivery.props.content_type = Some("pickle".to_owned());

    let error = codec.parse_inbound(&delivery).expect_err("must reject");
    assert!(matches!(
        error,
        ProtocolError::UnsupportedContentType(tag) if tag == "pickle"
    ));
}

#[test]
fn missing_content_type_is_rejected() {
    let codec = EnvelopeCodec::new("gw_1");
    let envelope = sample_request(&codec, Body::empty());
    let mut delivery = as_delivery(&envelope);
    delivery.props.content_type = None;

    let error = codec.parse_inbound(&delivery).expect_err("must reject");
    assert!(matches!(
        error,
        ProtocolError::MissingTransportHeader("content_type")
    ));
}

#[test]
fn builders_reject_empty_addressing() {
    let codec = EnvelopeCodec::new("gw_1");
    assert!(matches!(
        codec
            .request("", "gateway.x", "server.x", Body::empty())
            .build(),
        Err(ProtocolError::MissingExchange)
    ));
    assert!(matches!(
        codec.request("events", "", "server.x", Body::empty()).build(),
        Err(ProtocolError::MissingSource)
    ));
    assert!(matches!(
        codec.request("events", "gateway.x", "", Body::empty()).build(),
        Err(ProtocolError::MissingDestination)
    ));
}

#[test]
fn objects_bodies_tag_their_data_type() {
    let codec = EnvelopeCodec::new("gw_1");
    let envelope = sample_request(&codec, Body::Objects(vec![vec![1], vec![2, 3]]));
    let (parsed, _receipt) = codec.parse_inbound(&as_delivery(&envelope)).expect("parse");
    assert_eq!(parsed.headers.data_type, DataType::Objects);
    assert_eq!(parsed.body, Body::Objects(vec![vec![1], vec![2, 3]]));
}
