use serde::{Deserialize, Serialize};

/// Mutations that flow through the replicated log.
///
/// The `op` tag is written explicitly so a payload decodes to exactly one
/// variant or fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. } | Command::Delete { key } => key,
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_carries_discriminant() {
        let set = Command::Set {
            key: "k".into(),
            value: "v".into(),
        };
        let encoded = String::from_utf8(set.encode().unwrap()).unwrap();
        assert_eq!(encoded, r#"{"op":"set","key":"k","value":"v"}"#);

        let delete = Command::Delete { key: "k".into() };
        let encoded = String::from_utf8(delete.encode().unwrap()).unwrap();
        assert_eq!(encoded, r#"{"op":"delete","key":"k"}"#);
    }

    #[test]
    fn decode_rejects_untagged_payloads() {
        // The old format carried no tag; it must not be guessed into a variant.
        assert!(Command::decode(br#"{"key":"k","value":"v"}"#).is_err());
        assert!(Command::decode(br#"{"op":"rename","key":"k"}"#).is_err());
        assert!(Command::decode(b"snapshot").is_err());
    }

    #[test]
    fn decode_accepts_empty_key_when_tagged() {
        let cmd = Command::decode(br#"{"op":"delete","key":""}"#).unwrap();
        assert_eq!(cmd.key(), "");
    }
}
