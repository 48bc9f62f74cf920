//! Serde helpers for human-readable durations in configuration.
//!
//! Accepts either an integer number of seconds or a `humantime` string
//! such as `"500ms"`, `"30s"` or `"1h30m"`.

use serde::de::{self, Visitor};
use serde::{Deserializer, Serializer};
use std::{fmt, time::Duration};

fn parse_str<E: de::Error>(value: &str) -> Result<Duration, E> {
    humantime::parse_duration(value.trim())
        .map_err(|e| de::Error::custom(format!("Invalid duration '{value}': {e}")))
}

pub mod duration {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let duration_str = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&duration_str)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a duration as seconds (number) or human-readable string (e.g. '500ms', '30s', '1h30m')")
            }

            fn visit_u64<E>(self, seconds: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Duration::from_secs(seconds))
            }

            // TOML integers arrive as i64.
            fn visit_i64<E>(self, seconds: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u64::try_from(seconds)
                    .map(Duration::from_secs)
                    .map_err(|_| de::Error::custom(format!("Negative duration: {seconds}")))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                parse_str(value)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

pub mod option_duration {
    use super::*;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => {
                let duration_str = humantime::format_duration(*d).to_string();
                serializer.serialize_some(&duration_str)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OptionDurationVisitor;

        impl<'de> Visitor<'de> for OptionDurationVisitor {
            type Value = Option<Duration>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter
                    .write_str("null or a duration as seconds (number) or human-readable string")
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(None)
            }

            fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
            where
                D: Deserializer<'de>,
            {
                super::duration::deserialize(deserializer).map(Some)
            }
        }

        deserializer.deserialize_option(OptionDurationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Deserialize)]
    struct Holder {
        #[serde(with = "super::duration")]
        every: Duration,
        #[serde(default, with = "super::option_duration")]
        timeout: Option<Duration>,
    }

    #[test]
    fn accepts_humantime_strings() {
        let h: Holder = figment::Figment::new()
            .merge(figment::providers::Serialized::defaults(
                [("every", "1h30m"), ("timeout", "500ms")]
                    .into_iter()
                    .collect::<std::collections::BTreeMap<_, _>>(),
            ))
            .extract()
            .unwrap();
        assert_eq!(h.every, Duration::from_secs(90 * 60));
        assert_eq!(h.timeout, Some(Duration::from_millis(500)));
    }

    #[test]
    fn accepts_integer_seconds() {
        let h: Holder = figment::Figment::new()
            .merge(figment::providers::Serialized::default("every", 45))
            .extract()
            .unwrap();
        assert_eq!(h.every, Duration::from_secs(45));
        assert_eq!(h.timeout, None);
    }
}
