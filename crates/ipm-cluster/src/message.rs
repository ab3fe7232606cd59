use ipm_registry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Wire type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    CreateRuleSet = 1,
    DeleteRuleSet = 2,
    /// Answered with a `CreateRuleSet`
    RequestRuleSet = 3,
    RegistryList = 4,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::CreateRuleSet => "create_rule_set",
            MessageType::DeleteRuleSet => "delete_rule_set",
            MessageType::RequestRuleSet => "request_rule_set",
            MessageType::RegistryList => "registry_list",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(MessageType::CreateRuleSet),
            2 => Ok(MessageType::DeleteRuleSet),
            3 => Ok(MessageType::RequestRuleSet),
            4 => Ok(MessageType::RegistryList),
            other => Err(format!("unknown message type {}", other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> u8 {
        kind as u8
    }
}

/// Envelope exchanged between peers, one JSON text frame each
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub epoch: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Message {
    /// Full rule set, payload is the registry entry
    pub fn create_rule_set(id: &str, entry: &Entry) -> Self {
        Self {
            kind: MessageType::CreateRuleSet,
            epoch: entry.epoch,
            name: id.to_string(),
            payload: json!({ "epoch": entry.epoch, "rule": entry.rule }),
        }
    }

    pub fn delete_rule_set(id: &str, epoch: i64) -> Self {
        Self {
            kind: MessageType::DeleteRuleSet,
            epoch,
            name: id.to_string(),
            payload: Value::Null,
        }
    }

    pub fn request_rule_set(id: &str) -> Self {
        Self {
            kind: MessageType::RequestRuleSet,
            epoch: 0,
            name: id.to_string(),
            payload: Value::Null,
        }
    }

    /// Inventory of every registered id at `epoch`
    pub fn registry_list(epoch: i64, ids: &[String]) -> Self {
        Self {
            kind: MessageType::RegistryList,
            epoch,
            name: String::new(),
            payload: json!(ids),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_is_encoded_as_number() {
        let msg = Message::delete_rule_set("12+abc", 12);
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(text, r#"{"type":2,"epoch":12,"name":"12+abc"}"#);
    }

    #[test]
    fn create_carries_the_entry() {
        let entry = Entry {
            epoch: 9,
            rule: "-t filter -A INPUT -j DROP".into(),
        };
        let msg = Message::create_rule_set("9+x", &entry);
        let decoded: Message = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageType::CreateRuleSet);
        assert_eq!(decoded.epoch, 9);
        let back: Entry = serde_json::from_value(decoded.payload).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn registry_list_payload_is_an_id_array() {
        let msg = Message::registry_list(5, &["1+a".to_string(), "2+b".to_string()]);
        assert_eq!(msg.payload, json!(["1+a", "2+b"]));
        assert!(msg.name.is_empty());
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<Message>(r#"{"type":9,"epoch":1}"#).is_err());
        assert!(serde_json::from_str::<Message>(r#"{"epoch":1}"#).is_err());
    }

    #[test]
    fn missing_fields_default() {
        let msg: Message = serde_json::from_str(r#"{"type":3,"name":"1+a"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::RequestRuleSet);
        assert_eq!(msg.epoch, 0);
        assert!(msg.payload.is_null());
    }
}
