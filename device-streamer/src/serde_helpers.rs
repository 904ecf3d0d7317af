use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use common::{Mode, Quality};

pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    (duration.as_millis() as u64).serialize(serializer)
}

pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

pub fn serialize_duration_secs<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    duration.as_secs().serialize(serializer)
}

pub fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

pub mod duration_millis {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize_duration(duration, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize_duration(deserializer)
    }
}

pub mod duration_secs {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize_duration_secs(duration, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize_duration_secs(deserializer)
    }
}

/// Parse a stored enum value, falling back to its default when the stored
/// text is no longer recognised. A stale settings file must never stop the
/// streamer from starting.
fn lenient<'de, D, T>(deserializer: D, field: &str) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Default + std::fmt::Display,
{
    let raw = String::deserialize(deserializer)?;
    match raw.parse::<T>() {
        Ok(value) => Ok(value),
        Err(_) => {
            let fallback = T::default();
            warn!("Unrecognised {} {:?} in settings, using {}", field, raw, fallback);
            Ok(fallback)
        }
    }
}

pub mod lenient_mode {
    use super::*;

    pub fn serialize<S>(mode: &Mode, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        mode.as_str().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Mode, D::Error>
    where
        D: Deserializer<'de>,
    {
        lenient(deserializer, "mode")
    }
}

pub mod lenient_quality {
    use super::*;

    pub fn serialize<S>(quality: &Quality, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        quality.as_str().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Quality, D::Error>
    where
        D: Deserializer<'de>,
    {
        lenient(deserializer, "quality")
    }
}
