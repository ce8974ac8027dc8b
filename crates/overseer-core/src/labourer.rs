use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Seconds one invocation may run when the labourer does not say otherwise.
pub const DEFAULT_DURATION: u64 = 900;

/// Grace seconds after `duration` before a lease is considered dead.
pub const DEFAULT_COOLDOWN: u64 = 300;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Attribute keys accepted from untrusted input.
const STRICT_ATTRIBUTES: &[&str] = &["id", "arn"];

/// Statically configured attributes of a labourer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabourerAttributes {
    #[serde(default)]
    pub arn: Option<String>,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub cooldown: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub max_simultaneous_invocations: Option<u32>,
}

/// The three write-once window timestamps of a [`Labourer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimestampName {
    Start,
    Invoked,
    Expired,
}

impl TimestampName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampName::Start => "start",
            TimestampName::Invoked => "invoked",
            TimestampName::Expired => "expired",
        }
    }
}

impl FromStr for TimestampName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(TimestampName::Start),
            "invoked" => Ok(TimestampName::Invoked),
            "expired" => Ok(TimestampName::Expired),
            other => Err(CoreError::InvalidTimestamp(other.to_string())),
        }
    }
}

impl fmt::Display for TimestampName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a greenfield value sits relative to a registered labourer window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowState {
    /// Waiting in the queue (`greenfield < start`).
    Queued,
    /// Leased long enough ago that duration + cooldown has elapsed.
    Expired,
    /// Leased within the last duration + cooldown seconds.
    Running,
    /// Leased at or after this window was opened.
    Invoked,
}

impl WindowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowState::Queued => "queued",
            WindowState::Expired => "expired",
            WindowState::Running => "running",
            WindowState::Invoked => "invoked",
        }
    }
}

/// One type of executor that tasks are dispatched to.
///
/// A labourer is rebuilt from configuration for every orchestration or
/// scavenger cycle. Registration stamps it with a time window:
///
/// * `start`: the moment of registration
/// * `invoked`: `start` pushed forward by the invocation delta
/// * `expired`: `invoked - (duration + cooldown)`
///
/// Every queue query compares task greenfields against these three values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Labourer {
    pub id: String,
    pub arn: Option<String>,
    pub duration: u64,
    pub cooldown: u64,
    pub max_attempts: u32,
    pub max_simultaneous_invocations: Option<u32>,
    pub health: Option<u8>,
    pub average_duration: Option<u64>,
    pub max_duration: Option<u64>,
    start: Option<i64>,
    invoked: Option<i64>,
    expired: Option<i64>,
}

impl Labourer {
    /// Build a labourer, applying defaults for attributes that are absent.
    ///
    /// An explicit zero `duration` or `cooldown` is rejected instead of being
    /// silently replaced by the default.
    pub fn new(id: impl Into<String>, attributes: LabourerAttributes) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(CoreError::InvalidAttribute {
                name: "id".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let duration = positive("duration", attributes.duration, DEFAULT_DURATION)?;
        let cooldown = positive("cooldown", attributes.cooldown, DEFAULT_COOLDOWN)?;
        let max_attempts = attributes.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);

        Ok(Labourer {
            id,
            arn: attributes.arn,
            duration,
            cooldown,
            max_attempts,
            max_simultaneous_invocations: attributes.max_simultaneous_invocations,
            health: None,
            average_duration: None,
            max_duration: None,
            start: None,
            invoked: None,
            expired: None,
        })
    }

    /// Build a labourer from a loosely typed attribute map.
    ///
    /// In `strict` mode only `id` and `arn` are accepted; use it when the map
    /// comes from untrusted input.
    pub fn from_attributes(attributes: &Map<String, Value>, strict: bool) -> Result<Self> {
        if strict {
            if let Some(key) = attributes
                .keys()
                .find(|key| !STRICT_ATTRIBUTES.contains(&key.as_str()))
            {
                return Err(CoreError::UnexpectedAttribute(key.clone()));
            }
        }

        let id = match attributes.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(CoreError::InvalidAttribute {
                    name: "id".to_string(),
                    reason: format!("unsupported value {}", other),
                })
            }
            None => {
                return Err(CoreError::InvalidAttribute {
                    name: "id".to_string(),
                    reason: "missing".to_string(),
                })
            }
        };

        let mut known = Map::new();
        for (key, value) in attributes {
            match key.as_str() {
                "id" => {}
                "arn" | "duration" | "cooldown" | "max_attempts"
                | "max_simultaneous_invocations" => {
                    known.insert(key.clone(), value.clone());
                }
                other => debug!("Ignoring unknown attribute {} for labourer {}", other, id),
            }
        }

        let parsed: LabourerAttributes =
            serde_json::from_value(Value::Object(known)).map_err(|e| {
                CoreError::InvalidAttribute {
                    name: "attributes".to_string(),
                    reason: e.to_string(),
                }
            })?;

        Labourer::new(id, parsed)
    }

    /// Set one of the window timestamps by name. Each may be set once.
    pub fn set_timestamp(&mut self, name: &str, value: i64) -> Result<()> {
        let name: TimestampName = name.parse()?;
        let slot = match name {
            TimestampName::Start => &mut self.start,
            TimestampName::Invoked => &mut self.invoked,
            TimestampName::Expired => &mut self.expired,
        };

        if slot.is_some() {
            return Err(CoreError::TimestampAlreadySet {
                labourer_id: self.id.clone(),
                name: name.as_str(),
            });
        }

        *slot = Some(value);
        Ok(())
    }

    /// Read one of the window timestamps by name.
    pub fn get_timestamp(&self, name: &str) -> Result<i64> {
        self.timestamp(name.parse()?)
    }

    fn timestamp(&self, name: TimestampName) -> Result<i64> {
        let slot = match name {
            TimestampName::Start => self.start,
            TimestampName::Invoked => self.invoked,
            TimestampName::Expired => self.expired,
        };

        slot.ok_or_else(|| CoreError::NotRegistered {
            labourer_id: self.id.clone(),
            name: name.as_str(),
        })
    }

    pub fn start(&self) -> Result<i64> {
        self.timestamp(TimestampName::Start)
    }

    pub fn invoked(&self) -> Result<i64> {
        self.timestamp(TimestampName::Invoked)
    }

    pub fn expired(&self) -> Result<i64> {
        self.timestamp(TimestampName::Expired)
    }

    pub fn is_registered(&self) -> bool {
        self.start.is_some() && self.invoked.is_some() && self.expired.is_some()
    }

    /// Seconds after an invocation before its lease is treated as dead.
    pub fn lease_window(&self) -> u64 {
        self.duration + self.cooldown
    }

    /// Stamp the window for a cycle that begins at `now`.
    pub fn register(&mut self, now: i64, invocation_delta: i64) -> Result<()> {
        let lease_window = self.lease_window() as i64;
        if invocation_delta <= lease_window {
            return Err(CoreError::InvalidAttribute {
                name: "greenfield_invocation_delta".to_string(),
                reason: format!(
                    "{} must exceed duration + cooldown ({}) of labourer {}",
                    invocation_delta, lease_window, self.id
                ),
            });
        }

        let invoked = now + invocation_delta;
        self.set_timestamp("start", now)?;
        self.set_timestamp("invoked", invoked)?;
        self.set_timestamp("expired", invoked - lease_window)?;
        Ok(())
    }

    /// Classify a greenfield against this labourer's window.
    pub fn window_state(&self, greenfield: i64) -> Result<WindowState> {
        let start = self.start()?;
        let expired = self.expired()?;
        let invoked = self.invoked()?;

        Ok(if greenfield < start {
            WindowState::Queued
        } else if greenfield >= invoked {
            WindowState::Invoked
        } else if greenfield >= expired {
            WindowState::Running
        } else {
            WindowState::Expired
        })
    }

    /// Longest observed run, falling back to the configured duration.
    pub fn max_duration_or_default(&self) -> u64 {
        self.max_duration.unwrap_or(self.duration)
    }
}

fn positive(name: &str, value: Option<u64>, default: u64) -> Result<u64> {
    match value {
        None => Ok(default),
        Some(0) => Err(CoreError::InvalidAttribute {
            name: name.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        Some(v) => Ok(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    const DELTA: i64 = 31_557_600;

    fn labourer() -> Labourer {
        Labourer::new("some_lambda", LabourerAttributes::default()).unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let lab = labourer();
        assert_eq!(lab.duration, DEFAULT_DURATION);
        assert_eq!(lab.cooldown, DEFAULT_COOLDOWN);
        assert_eq!(lab.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(!lab.is_registered());
    }

    #[test]
    fn test_explicit_zero_duration_rejected() {
        let result = Labourer::new(
            "lab",
            LabourerAttributes {
                duration: Some(0),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(CoreError::InvalidAttribute { .. })));
    }

    #[test]
    fn test_timestamp_protocol() {
        let mut lab = labourer();

        match lab.get_timestamp("start") {
            Err(CoreError::NotRegistered { name, .. }) => assert_eq!(name, "start"),
            other => panic!("Expected NotRegistered, got {:?}", other),
        }

        assert!(matches!(
            lab.set_timestamp("health", 1),
            Err(CoreError::InvalidTimestamp(_))
        ));
        assert!(matches!(
            lab.get_timestamp("health"),
            Err(CoreError::InvalidTimestamp(_))
        ));

        lab.set_timestamp("start", 100).unwrap();
        assert_eq!(lab.get_timestamp("start").unwrap(), 100);
        assert!(matches!(
            lab.set_timestamp("start", 200),
            Err(CoreError::TimestampAlreadySet { .. })
        ));
    }

    #[test]
    fn test_register_window() {
        let mut lab = labourer();
        lab.register(1_000, DELTA).unwrap();

        assert_eq!(lab.start().unwrap(), 1_000);
        assert_eq!(lab.invoked().unwrap(), 1_000 + DELTA);
        assert_eq!(lab.expired().unwrap(), 1_000 + DELTA - 1_200);
    }

    #[test]
    fn test_register_rejects_small_delta() {
        let mut lab = labourer();
        assert!(lab.register(1_000, 600).is_err());
        assert!(!lab.is_registered());
    }

    #[test]
    fn test_window_state() {
        let mut lab = labourer();
        let now = 50_000;
        lab.register(now, DELTA).unwrap();

        assert_eq!(lab.window_state(2_000).unwrap(), WindowState::Queued);
        // invoked right now
        assert_eq!(lab.window_state(now + DELTA).unwrap(), WindowState::Invoked);
        // invoked ten minutes ago
        assert_eq!(
            lab.window_state(now - 600 + DELTA).unwrap(),
            WindowState::Running
        );
        // invoked an hour ago, duration + cooldown is 20 minutes
        assert_eq!(
            lab.window_state(now - 3_600 + DELTA).unwrap(),
            WindowState::Expired
        );
    }

    #[test]
    fn test_strict_attributes() {
        let attrs = json!({"id": "lab", "arn": "arn:aws:lambda:lab"});
        let lab = Labourer::from_attributes(attrs.as_object().unwrap(), true).unwrap();
        assert_eq!(lab.arn.as_deref(), Some("arn:aws:lambda:lab"));

        let attrs = json!({"id": "lab", "duration": 60});
        match Labourer::from_attributes(attrs.as_object().unwrap(), true) {
            Err(CoreError::UnexpectedAttribute(key)) => assert_eq!(key, "duration"),
            other => panic!("Expected UnexpectedAttribute, got {:?}", other),
        }
    }

    #[test]
    fn test_loose_attributes() {
        let attrs = json!({"id": 42, "duration": 60, "cooldown": 30, "colour": "red"});
        let lab = Labourer::from_attributes(attrs.as_object().unwrap(), false).unwrap();
        assert_eq!(lab.id, "42");
        assert_eq!(lab.duration, 60);
        assert_eq!(lab.cooldown, 30);
    }

    proptest! {
        #[test]
        fn prop_window_ordering(
            now in 0i64..4_000_000_000,
            duration in 1u64..86_400,
            cooldown in 1u64..86_400,
        ) {
            let mut lab = Labourer::new("lab", LabourerAttributes {
                duration: Some(duration),
                cooldown: Some(cooldown),
                ..Default::default()
            }).unwrap();
            lab.register(now, DELTA).unwrap();

            let start = lab.start().unwrap();
            let expired = lab.expired().unwrap();
            let invoked = lab.invoked().unwrap();
            prop_assert!(start < expired);
            prop_assert!(expired < invoked);
            prop_assert_eq!(invoked - expired, (duration + cooldown) as i64);
        }
    }
}
