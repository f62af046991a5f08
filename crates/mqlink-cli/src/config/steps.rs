//! Scripted steps run after connecting.

use std::fmt;
use std::time::Duration;

use mqlink_client::QoS;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    Subscribe,
    Unsubscribe,
    Publish,
    /// Keep dispatching events for `millis`.
    Wait,
}

/// One `[[steps]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct StepConfig {
    pub action: StepAction,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub millis: u64,
}

impl StepConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self.action {
            StepAction::Wait => {
                if self.millis == 0 {
                    return Err(format!("{}: millis must be greater than 0", self));
                }
            }
            _ => {
                if self.topic.is_empty() {
                    return Err(format!("{}: topic is required", self.action));
                }
                QoS::try_from(self.qos).map_err(|e| format!("{}: {}", self, e))?;
            }
        }
        Ok(())
    }

    /// Requested QoS. Only meaningful after `validate`.
    pub fn qos(&self) -> QoS {
        QoS::try_from(self.qos).unwrap_or_default()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.millis)
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepAction::Subscribe => "subscribe",
            StepAction::Unsubscribe => "unsubscribe",
            StepAction::Publish => "publish",
            StepAction::Wait => "wait",
        })
    }
}

impl fmt::Display for StepConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action {
            StepAction::Wait => write!(f, "wait {}ms", self.millis),
            StepAction::Unsubscribe => write!(f, "unsubscribe {}", self.topic),
            action => write!(f, "{} {} (qos {})", action, self.topic, self.qos),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(action: StepAction) -> StepConfig {
        StepConfig {
            action,
            topic: String::new(),
            payload: String::new(),
            qos: 0,
            retain: false,
            millis: 0,
        }
    }

    #[test]
    fn test_topic_required() {
        assert!(step(StepAction::Publish).validate().is_err());
        let with_topic = StepConfig {
            topic: "t".into(),
            ..step(StepAction::Publish)
        };
        assert!(with_topic.validate().is_ok());
    }

    #[test]
    fn test_invalid_qos() {
        let bad = StepConfig {
            topic: "t".into(),
            qos: 3,
            ..step(StepAction::Subscribe)
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_wait_needs_duration() {
        assert!(step(StepAction::Wait).validate().is_err());
        let wait = StepConfig {
            millis: 250,
            ..step(StepAction::Wait)
        };
        assert!(wait.validate().is_ok());
        assert_eq!(wait.duration(), Duration::from_millis(250));
        assert_eq!(wait.to_string(), "wait 250ms");
    }

    #[test]
    fn test_display() {
        let sub = StepConfig {
            topic: "sensors/#".into(),
            qos: 1,
            ..step(StepAction::Subscribe)
        };
        assert_eq!(sub.to_string(), "subscribe sensors/# (qos 1)");
        assert_eq!(sub.qos(), QoS::AtLeastOnce);
    }
}
