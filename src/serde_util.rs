//! Serde helpers shared by the options structs.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Deserializes a `Duration` from an integer number of milliseconds.
pub(crate) fn deserialize_duration_from_u64_millis<'de, D>(
    deserializer: D,
) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// Deserializes an `Option<Duration>` from an integer number of
/// milliseconds, treating `null` as `None`.
pub(crate) fn deserialize_duration_option_from_u64_millis<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis.map(Duration::from_millis))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Timeouts {
        #[serde(deserialize_with = "super::deserialize_duration_from_u64_millis")]
        connect: Duration,
        #[serde(
            default,
            deserialize_with = "super::deserialize_duration_option_from_u64_millis"
        )]
        idle: Option<Duration>,
    }

    #[test]
    fn durations_deserialize_from_millis() {
        let parsed: Timeouts = serde_json::from_str(r#"{ "connect": 1500, "idle": 250 }"#).unwrap();
        assert_eq!(parsed.connect, Duration::from_millis(1500));
        assert_eq!(parsed.idle, Some(Duration::from_millis(250)));

        let parsed: Timeouts = serde_json::from_str(r#"{ "connect": 0 }"#).unwrap();
        assert_eq!(parsed.idle, None);
    }
}
