use bridge_decode::{DataRule, DecodeError, Decoder, TopicRule, VALUE_FIELD};
use domain::{DEVICE_ID_TAG, RawMessage};
use std::collections::BTreeMap;

fn decoder() -> Decoder {
    Decoder::new(
        vec![
            TopicRule::data(
                "/sensor/dht/data",
                DataRule {
                    fields: vec!["temperature".to_string(), "humidity".to_string()],
                    required: vec!["temperature".to_string(), "humidity".to_string()],
                    ..Default::default()
                },
            ),
            TopicRule::data(
                "/sensor/+/data",
                DataRule {
                    fields: vec![
                        "temperature".to_string(),
                        "humidity".to_string(),
                        "pressure".to_string(),
                    ],
                    required: Vec::new(),
                    device_id: Some("weather-01".to_string()),
                    tags: BTreeMap::from([("site".to_string(), "lab".to_string())]),
                },
            ),
            TopicRule::status("/sensor/+/status"),
        ],
        "dht-sensor01",
    )
}

#[test]
fn dht_payload_yields_two_points() {
    let message = RawMessage::new(
        "/sensor/dht/data",
        br#"{"temperature": 21.5, "humidity": 44.0}"#.to_vec(),
        1_000,
    );
    let points = decoder().decode(&message).expect("decode");

    assert_eq!(points.len(), 2);
    let temperature = &points[0];
    assert_eq!(temperature.measurement, "temperature");
    assert_eq!(temperature.device_id(), Some("dht-sensor01"));
    assert_eq!(temperature.tags.len(), 1);
    assert_eq!(temperature.fields.get(VALUE_FIELD), Some(&21.5));
    let humidity = &points[1];
    assert_eq!(humidity.measurement, "humidity");
    assert_eq!(humidity.device_id(), Some("dht-sensor01"));
    assert_eq!(humidity.fields.get(VALUE_FIELD), Some(&44.0));
    assert!(points.iter().all(|p| p.ts_ms == 1_000));
}

#[test]
fn one_point_per_declared_field_present() {
    let decoder = decoder();
    for (payload, expected) in [
        (r#"{"temperature": 1}"#, 1usize),
        (r#"{"temperature": 1, "humidity": 2}"#, 2),
        (r#"{"temperature": 1, "humidity": 2, "pressure": 1013.2}"#, 3),
        (r#"{"temperature": 1, "unrelated": 9}"#, 1),
    ] {
        let message = RawMessage::new("/sensor/bme/data", payload.as_bytes().to_vec(), 42);
        let points = decoder.decode(&message).expect(payload);
        assert_eq!(points.len(), expected, "{payload}");
        for point in &points {
            assert_eq!(point.tags.get(DEVICE_ID_TAG).map(String::as_str), Some("weather-01"));
            assert_eq!(point.tags.get("site").map(String::as_str), Some("lab"));
            assert_eq!(point.ts_ms, 42);
        }
    }
}

#[test]
fn malformed_json_rejected() {
    let message = RawMessage::new("/sensor/dht/data", b"{\"temperature\": 21.".to_vec(), 1);
    let err = decoder().decode(&message).expect_err("malformed");
    assert!(matches!(err, DecodeError::Malformed(_)));
}

#[test]
fn unknown_topic_rejected() {
    let message = RawMessage::new("/actuator/relay/set", b"{}".to_vec(), 1);
    let err = decoder().decode(&message).expect_err("unknown");
    assert_eq!(err, DecodeError::UnknownTopic("/actuator/relay/set".to_string()));
}

#[test]
fn status_topic_acknowledged_without_points() {
    let message = RawMessage::new("/sensor/dht/status", b"online".to_vec(), 1);
    let points = decoder().decode(&message).expect("status");
    assert!(points.is_empty());
}

#[test]
fn missing_required_fields_listed() {
    let message = RawMessage::new("/sensor/dht/data", br#"{"pressure": 1.0}"#.to_vec(), 1);
    let err = decoder().decode(&message).expect_err("missing");
    assert_eq!(
        err,
        DecodeError::MissingField(vec!["temperature".to_string(), "humidity".to_string()])
    );
}

#[test]
fn data_topic_without_any_reading_rejected() {
    let message = RawMessage::new("/sensor/bme/data", br#"{"battery": 3.3}"#.to_vec(), 1);
    let err = decoder().decode(&message).expect_err("empty");
    assert!(matches!(err, DecodeError::MissingField(fields) if fields.len() == 3));
}

#[test]
fn redelivered_message_decodes_identically() {
    let message = RawMessage::new(
        "/sensor/dht/data",
        br#"{"temperature": 21.5, "humidity": 44.0}"#.to_vec(),
        7,
    );
    let decoder = decoder();
    let first = decoder.decode(&message).expect("first");
    let second = decoder.decode(&message.clone()).expect("second");
    assert_eq!(first, second);
}
