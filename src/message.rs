use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::Filter;

const MAX_SUBSCRIPTION_ID_LEN: usize = 64;

/// Inbound frame, parsed from a JSON array whose first element names the
/// command.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Event(Box<Event>),
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Count {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close(String),
    Auth(Box<Event>),
}

fn subscription_id(value: Option<&Value>) -> Result<String> {
    let id = value
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::protocol("missing subscription id"))?;
    if id.is_empty() || id.len() > MAX_SUBSCRIPTION_ID_LEN {
        return Err(Error::protocol("invalid subscription id"));
    }
    Ok(id.to_string())
}

fn event_arg(value: Option<&Value>) -> Result<Event> {
    let value = value
        .cloned()
        .ok_or_else(|| Error::protocol("missing event object"))?;
    let event: Event = serde_json::from_value(value)?;
    event.validate()?;
    Ok(event)
}

fn filter_args(values: &[Value]) -> Result<Vec<Filter>> {
    if values.is_empty() {
        return Err(Error::protocol("at least one filter is required"));
    }
    values
        .iter()
        .map(|v| {
            serde_json::from_value(v.clone())
                .map_err(|e| Error::InvalidFilter(e.to_string()))
        })
        .collect()
}

impl ClientMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let frame = value
            .as_array()
            .ok_or_else(|| Error::protocol("message is not a json array"))?;
        let command = frame
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::protocol("missing command"))?;

        match command {
            "EVENT" => Ok(Self::Event(Box::new(event_arg(frame.get(1))?))),
            "REQ" => Ok(Self::Req {
                subscription_id: subscription_id(frame.get(1))?,
                filters: filter_args(&frame[2.min(frame.len())..])?,
            }),
            "COUNT" => Ok(Self::Count {
                subscription_id: subscription_id(frame.get(1))?,
                filters: filter_args(&frame[2.min(frame.len())..])?,
            }),
            "CLOSE" => Ok(Self::Close(subscription_id(frame.get(1))?)),
            "AUTH" => Ok(Self::Auth(Box::new(event_arg(frame.get(1))?))),
            other => Err(Error::protocol(format!("unknown command: {other}"))),
        }
    }
}

/// Outbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    Eose {
        subscription_id: String,
    },
    Closed {
        subscription_id: String,
        message: String,
    },
    Notice {
        message: String,
    },
    Auth {
        challenge: String,
    },
    Count {
        subscription_id: String,
        count: u64,
    },
}

impl RelayMessage {
    pub fn ok(event_id: impl Into<String>, accepted: bool, message: impl Into<String>) -> Self {
        Self::Ok {
            event_id: event_id.into(),
            accepted,
            message: message.into(),
        }
    }

    pub fn event(subscription_id: impl Into<String>, event: Event) -> Self {
        Self::Event {
            subscription_id: subscription_id.into(),
            event: Box::new(event),
        }
    }

    pub fn eose(subscription_id: impl Into<String>) -> Self {
        Self::Eose {
            subscription_id: subscription_id.into(),
        }
    }

    pub fn closed(subscription_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Closed {
            subscription_id: subscription_id.into(),
            message: message.into(),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        Self::Notice {
            message: message.into(),
        }
    }

    pub fn auth(challenge: impl Into<String>) -> Self {
        Self::Auth {
            challenge: challenge.into(),
        }
    }

    pub fn count(subscription_id: impl Into<String>, count: u64) -> Self {
        Self::Count {
            subscription_id: subscription_id.into(),
            count,
        }
    }

    pub fn as_json(&self) -> String {
        match self {
            Self::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            Self::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            Self::Eose { subscription_id } => json!(["EOSE", subscription_id]),
            Self::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
            Self::Notice { message } => json!(["NOTICE", message]),
            Self::Auth { challenge } => json!(["AUTH", challenge]),
            Self::Count {
                subscription_id,
                count,
            } => json!(["COUNT", subscription_id, { "count": count }]),
        }
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"id":"2be17aa3031bdcb006f0fce80c146dea9c1c0268b0af2398bb673365c6444d45","pubkey":"f86c44a2de95d9149b51c6a29afeabba264c18e2fa7c49de93424a0c56947785","created_at":1640839235,"kind":4,"tags":[["p","13adc511de7e1cfcf1c6b7f6365fb5a03442d7bcacf565ea57fa7770912c023d"]],"content":"uRuvYr585B80L6rSJiHocw==?iv=oh6LVqdsYYol3JfFnXTbPA==","sig":"a5d9290ef9659083c490b303eb7ee41356d8778ff19f2f91776c8dc4443388a64ffcf336e61af4c25c05ac3ae952d1ced889ed655b67790891222aaa15b99fdd"}"#;

    #[test]
    fn parse_event() {
        let frame = format!(r#"["EVENT",{SAMPLE}]"#);
        match ClientMessage::from_json(&frame).unwrap() {
            ClientMessage::Event(event) => assert_eq!(event.kind, 4),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parse_req() {
        let frame = r#"["REQ","sub1",{"kinds":[1]},{"authors":["ab"]}]"#;
        match ClientMessage::from_json(frame).unwrap() {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert_eq!(filters.len(), 2);
                assert_eq!(filters[0].kinds, Some(vec![1]));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parse_close_and_auth() {
        assert_eq!(
            ClientMessage::from_json(r#"["CLOSE","sub1"]"#).unwrap(),
            ClientMessage::Close("sub1".to_string())
        );

        let frame = format!(r#"["AUTH",{SAMPLE}]"#);
        assert!(matches!(
            ClientMessage::from_json(&frame).unwrap(),
            ClientMessage::Auth(_)
        ));
    }

    #[test]
    fn parse_count() {
        let frame = r#"["COUNT","c1",{"kinds":[1]}]"#;
        assert!(matches!(
            ClientMessage::from_json(frame).unwrap(),
            ClientMessage::Count { .. }
        ));
    }

    #[test]
    fn malformed_frames_rejected() {
        assert!(ClientMessage::from_json("not json").is_err());
        assert!(ClientMessage::from_json(r#"{"op":"EVENT"}"#).is_err());
        assert!(ClientMessage::from_json(r#"[42]"#).is_err());
        assert!(ClientMessage::from_json(r#"["PUBLISH",{}]"#).is_err());
        assert!(ClientMessage::from_json(r#"["EVENT"]"#).is_err());
        assert!(ClientMessage::from_json(r#"["REQ","sub1"]"#).is_err());
        assert!(ClientMessage::from_json(r#"["REQ","",{"kinds":[1]}]"#).is_err());
        assert!(ClientMessage::from_json(r#"["CLOSE"]"#).is_err());
    }

    #[test]
    fn serialize_relay_messages() {
        assert_eq!(
            RelayMessage::ok("abc", true, "").as_json(),
            r#"["OK","abc",true,""]"#
        );
        assert_eq!(RelayMessage::eose("s").as_json(), r#"["EOSE","s"]"#);
        assert_eq!(
            RelayMessage::notice("oops").as_json(),
            r#"["NOTICE","oops"]"#
        );
        assert_eq!(
            RelayMessage::closed("s", "done").as_json(),
            r#"["CLOSED","s","done"]"#
        );
        assert_eq!(
            RelayMessage::auth("nonce").as_json(),
            r#"["AUTH","nonce"]"#
        );
        assert_eq!(
            RelayMessage::count("s", 3).as_json(),
            r#"["COUNT","s",{"count":3}]"#
        );

        let event = serde_json::from_str::<Event>(SAMPLE).unwrap();
        let json = RelayMessage::event("s", event).as_json();
        assert!(json.starts_with(r#"["EVENT","s",{"#));
    }
}
