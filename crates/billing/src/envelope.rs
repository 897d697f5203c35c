//! Generic webhook envelope
//!
//! `{"id": "...", "type": "...", "data": {"object": ...}}` is the only shape
//! checked here. Event types are not looked at, so types added by the
//! provider later still pass.

use serde_json::Value;

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// The event's own id. May be empty, in which case the delivery id stands in.
    pub id: String,
    pub event_type: String,
    /// `data.object`, kept verbatim
    pub object: Value,
}

impl Envelope {
    pub fn from_value(value: Value) -> BillingResult<Self> {
        let Value::Object(mut map) = value else {
            return Err(invalid("body must be a JSON object"));
        };

        let id = match map.remove("id") {
            Some(Value::String(id)) => id,
            Some(_) => return Err(invalid("`id` must be a string")),
            None => return Err(invalid("missing `id`")),
        };

        let event_type = match map.remove("type") {
            Some(Value::String(t)) if !t.trim().is_empty() => t,
            Some(Value::String(_)) => return Err(invalid("`type` must not be empty")),
            Some(_) => return Err(invalid("`type` must be a string")),
            None => return Err(invalid("missing `type`")),
        };

        let object = match map.remove("data") {
            Some(Value::Object(mut data)) => data
                .remove("object")
                .ok_or_else(|| invalid("missing `data.object`"))?,
            Some(_) => return Err(invalid("`data` must be an object")),
            None => return Err(invalid("missing `data`")),
        };

        Ok(Self {
            id,
            event_type,
            object,
        })
    }

    /// Idempotency key: the event's own id, else the delivery id
    pub fn canonical_id<'a>(&'a self, delivery_id: &'a str) -> &'a str {
        let id = self.id.trim();
        if id.is_empty() {
            delivery_id
        } else {
            id
        }
    }

    /// Strict phase: check `data.object` against its type's schema
    pub fn decode_event(&self) -> BillingResult<BillingEvent> {
        BillingEvent::parse(&self.event_type, &self.object)
    }
}

fn invalid(message: &str) -> BillingError {
    BillingError::InvalidEnvelope(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_well_formed_envelope() {
        let envelope = Envelope::from_value(json!({
            "id": "evt_1",
            "type": "subscription.active",
            "timestamp": "2025-01-14T10:00:00Z",
            "business_id": "biz_1",
            "data": {"object": {"subscription_id": "sub_1"}, "previous_attributes": {}}
        }))
        .unwrap();

        assert_eq!(envelope.id, "evt_1");
        assert_eq!(envelope.event_type, "subscription.active");
        assert_eq!(envelope.object, json!({"subscription_id": "sub_1"}));
        assert_eq!(envelope.canonical_id("msg_1"), "evt_1");
    }

    #[test]
    fn test_empty_id_falls_back_to_delivery_id() {
        let envelope = Envelope::from_value(json!({
            "id": "",
            "type": "payment.succeeded",
            "data": {"object": {}}
        }))
        .unwrap();
        assert_eq!(envelope.canonical_id("msg_1"), "msg_1");
    }

    #[test]
    fn test_object_may_be_any_json() {
        for object in [json!(null), json!([1, 2]), json!("text")] {
            let envelope = Envelope::from_value(json!({
                "id": "evt_1",
                "type": "something.new",
                "data": {"object": object}
            }))
            .unwrap();
            assert_eq!(envelope.object, object);
        }
    }

    #[test]
    fn test_malformed_envelopes_rejected() {
        let cases = [
            json!([]),
            json!("evt_1"),
            json!({"type": "payment.succeeded", "data": {"object": {}}}),
            json!({"id": 42, "type": "payment.succeeded", "data": {"object": {}}}),
            json!({"id": "evt_1", "data": {"object": {}}}),
            json!({"id": "evt_1", "type": "", "data": {"object": {}}}),
            json!({"id": "evt_1", "type": ["payment.succeeded"], "data": {"object": {}}}),
            json!({"id": "evt_1", "type": "payment.succeeded"}),
            json!({"id": "evt_1", "type": "payment.succeeded", "data": []}),
            json!({"id": "evt_1", "type": "payment.succeeded", "data": {}}),
        ];

        for case in cases {
            assert!(
                matches!(
                    Envelope::from_value(case.clone()),
                    Err(BillingError::InvalidEnvelope(_))
                ),
                "accepted {}",
                case
            );
        }
    }

    #[test]
    fn test_decode_event_applies_strict_schema() {
        let envelope = Envelope::from_value(json!({
            "id": "evt_1",
            "type": "payment.succeeded",
            "data": {"object": {"payment_id": "pay_1", "amount": 10, "extra": true}}
        }))
        .unwrap();

        assert!(matches!(
            envelope.decode_event(),
            Err(BillingError::InvalidEventPayload { .. })
        ));
    }
}
