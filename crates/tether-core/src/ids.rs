use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ChatId, "chat");
branded_id!(SubChatId, "subchat");
branded_id!(TurnId, "turn");
branded_id!(MessageId, "msg");
branded_id!(ToolUseId, "toolu");
// Upstream agents mint these themselves; `new()` is only used by mocks.
branded_id!(AgentSessionId, "sess");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes() {
        assert!(ChatId::new().as_str().starts_with("chat_"));
        assert!(SubChatId::new().as_str().starts_with("subchat_"));
        assert!(TurnId::new().as_str().starts_with("turn_"));
        assert!(MessageId::new().as_str().starts_with("msg_"));
        assert!(ToolUseId::new().as_str().starts_with("toolu_"));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(SubChatId::new(), SubChatId::new());
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = ToolUseId::from_raw("toolu_01ABC");
        assert_eq!(id.as_str(), "toolu_01ABC");
        assert_eq!(id.to_string(), "toolu_01ABC");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = SubChatId::from_raw("sc-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""sc-1""#);
        let parsed: SubChatId = serde_json::from_str(r#""sc-1""#).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<TurnId> = (0..50).map(|_| TurnId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str(), "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
