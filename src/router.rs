use crate::config::{Rule, RuleSet};
use crate::transport::{qos_from_u8, ConnectionError, InboundMessage, OutboundMessage, Publisher};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// Why a message was dropped.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("Error decoding JSON payload: {0}")]
    Json(#[source] serde_json::Error),
    #[error("Payload is not a JSON object")]
    NotAnObject,
    #[error("Field '{field}' is not numeric: {value}")]
    NotNumeric { field: String, value: Value },
    #[error("Transformed value {0} cannot be encoded as JSON")]
    NonFinite(f64),
    #[error("Invalid publish QoS {0}")]
    InvalidQos(u8),
    #[error("Error encoding JSON payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Publish(#[from] ConnectionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UnknownTopic,
    MissingField,
}

/// What happened to one inbound message.
#[derive(Debug)]
pub enum Outcome {
    Published(OutboundMessage),
    Ignored(IgnoreReason),
    Dropped(MessageError),
}

/// Routes inbound messages to their rule and publishes the transformed value.
pub struct Router {
    rules: Arc<RuleSet>,
    publisher: Arc<dyn Publisher>,
}

impl Router {
    pub fn new(rules: Arc<RuleSet>, publisher: Arc<dyn Publisher>) -> Self {
        Self { rules, publisher }
    }

    /// Handle one message to completion. Never fails: every problem is
    /// logged and reported through the returned [`Outcome`].
    pub fn handle(&self, message: InboundMessage) -> Outcome {
        let topic = message.topic.as_str();
        debug!(topic, payload = %String::from_utf8_lossy(&message.payload), "Received message");

        let Some(rule) = self.rules.get(topic) else {
            debug!(topic, "Topic not in config, ignoring.");
            return Outcome::Ignored(IgnoreReason::UnknownTopic);
        };

        let outbound = match transform(rule, &message.payload) {
            Ok(Some(outbound)) => outbound,
            Ok(None) => {
                debug!(topic, field = %rule.field, "Field not found in message payload.");
                return Outcome::Ignored(IgnoreReason::MissingField);
            }
            Err(e) => {
                error!(topic, "{}", e);
                return Outcome::Dropped(e);
            }
        };

        if let Err(e) = self.publisher.publish(outbound.clone()) {
            let e = MessageError::from(e);
            error!(topic, "{}", e);
            return Outcome::Dropped(e);
        }

        debug!(
            topic = %outbound.topic,
            qos = ?outbound.qos,
            retain = outbound.retain,
            payload = %String::from_utf8_lossy(&outbound.payload),
            "Published transformed message"
        );
        Outcome::Published(outbound)
    }
}

/// Build the outbound message for `payload` under `rule`.
///
/// `Ok(None)` means the rule's field is absent or null, which is not an error.
pub fn transform(rule: &Rule, payload: &[u8]) -> Result<Option<OutboundMessage>, MessageError> {
    let text = std::str::from_utf8(payload)?;
    let document: Value = serde_json::from_str(text).map_err(MessageError::Json)?;
    let object = document.as_object().ok_or(MessageError::NotAnObject)?;

    let x = match object.get(&rule.field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(number)) => number.as_f64().ok_or_else(|| MessageError::NotNumeric {
            field: rule.field.clone(),
            value: Value::Number(number.clone()),
        })?,
        Some(other) => {
            return Err(MessageError::NotNumeric {
                field: rule.field.clone(),
                value: other.clone(),
            })
        }
    };

    let y = rule.apply(x);
    debug!(x, y, "Transformed value");
    if !y.is_finite() {
        return Err(MessageError::NonFinite(y));
    }

    let qos = qos_from_u8(rule.publish_qos).ok_or(MessageError::InvalidQos(rule.publish_qos))?;

    let mut body = Map::with_capacity(1);
    body.insert(rule.publish_field.clone(), Value::from(y));
    let payload = serde_json::to_vec(&Value::Object(body)).map_err(MessageError::Encode)?;

    Ok(Some(OutboundMessage {
        topic: rule.publish_topic.clone(),
        payload,
        qos,
        retain: rule.retain,
    }))
}
