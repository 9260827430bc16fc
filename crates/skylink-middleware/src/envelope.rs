//! Tolerant decoding of inbound payloads into [`Envelope`]s.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use skylink_types::Envelope;

/// Topic used for payloads that carry no recognisable envelope.
pub const DEFAULT_TOPIC: &str = "default";

/// Turn a raw inbound payload into an [`Envelope`].
///
/// Tried in order:
///
/// 1. an object with a string `topic` and a `data` field;
/// 2. a string (JSON string or raw text frame) holding base64 (standard
///    alphabet) of such an object;
/// 3. anything else is delivered whole as `data` under [`DEFAULT_TOPIC`].
///
/// Never fails, so every inbound message reaches some handler set.
pub fn parse_message(raw: Value) -> Envelope {
    if let Some(envelope) = as_envelope(&raw) {
        return envelope;
    }
    if let Value::String(text) = &raw {
        if let Some(envelope) = decode_base64(text).as_ref().and_then(as_envelope) {
            return envelope;
        }
    }
    Envelope::new(DEFAULT_TOPIC, raw)
}

fn as_envelope(value: &Value) -> Option<Envelope> {
    let object = value.as_object()?;
    let topic = object.get("topic")?.as_str()?;
    let data = object.get("data")?;
    Some(Envelope::new(topic, data.clone()))
}

fn decode_base64(text: &str) -> Option<Value> {
    let bytes = STANDARD.decode(text.trim()).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_envelope_is_taken_as_is() {
        let env = parse_message(json!({ "topic": "mount/status", "data": { "parked": false } }));
        assert_eq!(env.topic, "mount/status");
        assert_eq!(env.data, json!({ "parked": false }));
    }

    #[test]
    fn null_data_is_still_an_envelope() {
        let env = parse_message(json!({ "topic": "guider/stop", "data": null }));
        assert_eq!(env.topic, "guider/stop");
        assert_eq!(env.data, Value::Null);
    }

    #[test]
    fn base64_wrapped_envelope_is_unwrapped() {
        let inner = r#"{"topic":"darks/progress","data":{"done":3,"total":10}}"#;
        let raw = Value::String(STANDARD.encode(inner));

        let env = parse_message(raw);
        assert_eq!(env.topic, "darks/progress");
        assert_eq!(env.data["done"], 3);
    }

    #[test]
    fn missing_data_field_falls_back_to_default() {
        let raw = json!({ "topic": "orphan" });
        let env = parse_message(raw.clone());
        assert_eq!(env.topic, DEFAULT_TOPIC);
        assert_eq!(env.data, raw);
    }

    #[test]
    fn non_string_topic_falls_back_to_default() {
        let raw = json!({ "topic": 7, "data": 1 });
        assert_eq!(parse_message(raw.clone()), Envelope::new(DEFAULT_TOPIC, raw));
    }

    #[test]
    fn plain_string_falls_back_with_raw_payload() {
        let raw = json!("hello, not base64!");
        let env = parse_message(raw.clone());
        assert_eq!(env.topic, DEFAULT_TOPIC);
        assert_eq!(env.data, raw);
    }

    #[test]
    fn base64_of_non_envelope_keeps_the_encoded_string() {
        // Valid base64 of `[1,2]`, which is JSON but not an envelope.
        let raw = Value::String(STANDARD.encode("[1,2]"));
        let env = parse_message(raw.clone());
        assert_eq!(env.topic, DEFAULT_TOPIC);
        assert_eq!(env.data, raw);
    }
}
