//! Classify raw broker deliveries into typed envelopes.
//!
//! Only the routing key and the root element of the body are inspected.
//! Full payload decoding belongs to downstream handlers.

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;

use super::kind::MessageKind;

/// A delivery exactly as the broker handed it over.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub routing_key: String,
    pub body: Vec<u8>,
}

impl RawDelivery {
    pub fn new(routing_key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
        }
    }
}

/// Classified feed message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageEnvelope {
    pub routing_key: String,
    pub kind: MessageKind,

    /// `product` attribute of the root element.
    pub producer_id: Option<u32>,

    /// Event URN, from the `event_id` attribute or the routing key.
    pub entity_id: Option<String>,

    /// Producer timestamp in epoch milliseconds; 0 when absent.
    pub timestamp: i64,

    /// Correlates `snapshot_complete` with the recovery request that caused it.
    pub request_id: Option<u64>,

    /// `subscribed` flag carried by `alive` messages.
    pub subscribed: Option<bool>,

    pub received_at: DateTime<Utc>,

    /// Body, passed through untouched.
    pub payload: String,
}

/// Root element of an XML document with its attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
}

impl RootElement {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Read the first element of `body`, skipping the prolog.
///
/// # Returns
/// `None` if no well-formed root start tag precedes other content.
pub fn scan_root(body: &[u8]) -> Option<RootElement> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let mut attributes = Vec::new();
                for attr in e.attributes() {
                    let attr = attr.ok()?;
                    let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
                    let value = attr.unescape_value().ok()?.into_owned();
                    attributes.push((key, value));
                }
                return Some(RootElement { name, attributes });
            }
            Ok(Event::Decl(_)) | Ok(Event::Comment(_)) | Ok(Event::PI(_)) | Ok(Event::DocType(_)) => {}
            Ok(_) | Err(_) => return None,
        }
        buf.clear();
    }
}

/// Kind implied by the routing key: last segment first, then any segment.
pub fn kind_from_routing_key(routing_key: &str) -> Option<MessageKind> {
    let segments: Vec<&str> = routing_key.split('.').collect();

    if let Some(kind) = segments.last().and_then(|s| MessageKind::from_name(s)) {
        return Some(kind);
    }
    segments.iter().rev().find_map(|s| MessageKind::from_name(s))
}

/// Event URN embedded in a vendor routing key
/// (`<priority>.<pre>.<live>.<kind>.<sport>.<urn prefix>.<id>.<node>`).
pub fn entity_from_routing_key(routing_key: &str) -> Option<String> {
    let segments: Vec<&str> = routing_key.split('.').collect();
    match (segments.get(5), segments.get(6)) {
        (Some(prefix), Some(id)) if *prefix != "-" && *id != "-" && !prefix.is_empty() => {
            Some(format!("{}:{}", prefix, id))
        }
        _ => None,
    }
}

/// Classify a delivery. Never fails: anything unrecognisable becomes
/// [`MessageKind::Unknown`] with the payload preserved.
pub fn classify(delivery: &RawDelivery) -> MessageEnvelope {
    let root = scan_root(&delivery.body);

    let kind = kind_from_routing_key(&delivery.routing_key)
        .or_else(|| root.as_ref().and_then(|r| MessageKind::from_name(&r.name)))
        .unwrap_or(MessageKind::Unknown);

    let attr = |key: &str| root.as_ref().and_then(|r| r.attr(key));

    MessageEnvelope {
        routing_key: delivery.routing_key.clone(),
        kind,
        producer_id: attr("product").and_then(|v| v.trim().parse().ok()),
        entity_id: attr("event_id")
            .map(str::to_string)
            .or_else(|| entity_from_routing_key(&delivery.routing_key)),
        timestamp: attr("timestamp")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0),
        request_id: attr("request_id").and_then(|v| v.trim().parse().ok()),
        subscribed: attr("subscribed").map(|v| v.trim() == "1"),
        received_at: Utc::now(),
        payload: String::from_utf8_lossy(&delivery.body).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alive_from_routing_key() {
        let delivery = RawDelivery::new(
            "-.-.-.alive.-.-.-.-",
            r#"<?xml version="1.0" encoding="UTF-8"?><alive product="3" timestamp="1700000000000" subscribed="1"/>"#,
        );

        let envelope = classify(&delivery);

        assert_eq!(envelope.kind, MessageKind::Alive);
        assert_eq!(envelope.producer_id, Some(3));
        assert_eq!(envelope.timestamp, 1_700_000_000_000);
        assert_eq!(envelope.subscribed, Some(true));
    }

    #[test]
    fn test_kind_segment_not_last() {
        let delivery = RawDelivery::new("hi.-.live.odds_change.1.sr:match.1234.-", "<odds_change/>");

        assert_eq!(classify(&delivery).kind, MessageKind::OddsChange);
    }

    #[test]
    fn test_root_tag_fallback() {
        let delivery = RawDelivery::new(
            "some.opaque.key",
            r#"<snapshot_complete request_id="42" product="1" timestamp="5"/>"#,
        );

        let envelope = classify(&delivery);

        assert_eq!(envelope.kind, MessageKind::SnapshotComplete);
        assert_eq!(envelope.request_id, Some(42));
    }

    #[test]
    fn test_malformed_body_and_opaque_key_is_unknown() {
        let delivery = RawDelivery::new("x.y.z", "this is not xml <<<");

        let envelope = classify(&delivery);

        assert_eq!(envelope.kind, MessageKind::Unknown);
        assert_eq!(envelope.payload, "this is not xml <<<");
        assert_eq!(envelope.timestamp, 0);
    }

    #[test]
    fn test_empty_body_is_unknown() {
        let envelope = classify(&RawDelivery::new("", Vec::new()));
        assert_eq!(envelope.kind, MessageKind::Unknown);
    }

    #[test]
    fn test_entity_from_attribute_or_routing_key() {
        let with_attr = classify(&RawDelivery::new(
            "hi.-.live.bet_stop.1.sr:match.1234.-",
            r#"<bet_stop event_id="sr:match:999" product="1"/>"#,
        ));
        let from_key = classify(&RawDelivery::new(
            "hi.-.live.bet_stop.1.sr:match.1234.-",
            r#"<bet_stop product="1"/>"#,
        ));

        assert_eq!(with_attr.entity_id.as_deref(), Some("sr:match:999"));
        assert_eq!(from_key.entity_id.as_deref(), Some("sr:match:1234"));
    }

    #[test]
    fn test_subscribed_zero() {
        let envelope = classify(&RawDelivery::new(
            "-.-.-.alive.-.-.-.-",
            r#"<alive product="1" timestamp="10" subscribed="0"/>"#,
        ));
        assert_eq!(envelope.subscribed, Some(false));
    }
}
