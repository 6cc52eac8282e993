use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Snowflake ids travel as decimal strings on the wire; numbers are accepted too.
macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserializer.deserialize_any(SnowflakeVisitor).map(Self)
            }
        }
    };
}

struct SnowflakeVisitor;

impl<'de> de::Visitor<'de> for SnowflakeVisitor {
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a snowflake as a decimal string or unsigned integer")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<u64, E> {
        Ok(value)
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<u64, E> {
        u64::try_from(value).map_err(|_| E::custom(format!("negative snowflake {value}")))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<u64, E> {
        value
            .parse()
            .map_err(|_| E::custom(format!("invalid snowflake '{value}'")))
    }
}

id_newtype!(UserId);
id_newtype!(GuildId);
id_newtype!(ChannelId);
id_newtype!(RoleId);
id_newtype!(MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    #[default]
    Text,
    Voice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Online,
    Idle,
    #[serde(alias = "dnd")]
    DoNotDisturb,
    #[default]
    Offline,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snowflakes_accept_strings_and_numbers() {
        let from_str: GuildId = serde_json::from_str("\"81384788765712384\"").expect("string id");
        let from_num: GuildId = serde_json::from_str("81384788765712384").expect("numeric id");
        assert_eq!(from_str, from_num);
        assert_eq!(
            serde_json::to_string(&from_str).expect("serialize"),
            "\"81384788765712384\""
        );
    }

    #[test]
    fn rejects_garbage_snowflakes() {
        assert!(serde_json::from_str::<UserId>("\"not-a-number\"").is_err());
        assert!(serde_json::from_str::<UserId>("-4").is_err());
    }
}
