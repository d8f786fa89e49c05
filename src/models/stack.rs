use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// An imported compose stack. Advisory: it decides what a stack backup
/// captures and provides the manifest to redeploy from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackDefinition {
    pub stack_name: String,
    pub compose_text: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env_vars: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_file: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
    pub updated_at: String,
}

/// Per-service view derived from the manifest on import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Absolute container-side paths declared as volume destinations,
    /// in manifest order.
    #[serde(default)]
    pub volume_destinations: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env_overrides: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Manual,
    Daily,
    Weekly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleTarget {
    Container,
    Stack,
}

/// A recurring backup trigger, keyed in the store by container id or
/// stack name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub target: ScheduleTarget,
    pub frequency: Frequency,
    /// "HH:MM", 24-hour wall clock.
    pub time: String,
    /// 0 = Sunday .. 6 = Saturday; only meaningful for weekly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u8>,
}

impl Schedule {
    /// Translate to a cron expression for the scheduler runtime (seconds
    /// field first). Returns None for manual frequency or unparseable time.
    pub fn to_cron(&self) -> Option<String> {
        if self.frequency == Frequency::Manual {
            return None;
        }
        let (hour, minute) = parse_hhmm(&self.time)?;
        match self.frequency {
            Frequency::Daily => Some(format!("0 {minute} {hour} * * *")),
            Frequency::Weekly => {
                let dow = DOW_NAMES.get(self.day_of_week? as usize)?;
                Some(format!("0 {minute} {hour} * * {dow}"))
            }
            Frequency::Manual => None,
        }
    }
}

const DOW_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn parse_hhmm(time: &str) -> Option<(u8, u8)> {
    let (h, m) = time.split_once(':')?;
    let hour: u8 = h.parse().ok()?;
    let minute: u8 = m.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(frequency: Frequency, time: &str, dow: Option<u8>) -> Schedule {
        Schedule {
            target: ScheduleTarget::Container,
            frequency,
            time: time.into(),
            day_of_week: dow,
        }
    }

    #[test]
    fn test_daily_cron() {
        let s = schedule(Frequency::Daily, "03:30", None);
        assert_eq!(s.to_cron().unwrap(), "0 30 3 * * *");
    }

    #[test]
    fn test_weekly_cron_uses_day_names() {
        let s = schedule(Frequency::Weekly, "22:05", Some(0));
        assert_eq!(s.to_cron().unwrap(), "0 5 22 * * SUN");
        let s = schedule(Frequency::Weekly, "22:05", Some(6));
        assert_eq!(s.to_cron().unwrap(), "0 5 22 * * SAT");
    }

    #[test]
    fn test_manual_registers_nothing() {
        assert!(schedule(Frequency::Manual, "12:00", None).to_cron().is_none());
    }

    #[test]
    fn test_invalid_time_rejected() {
        assert!(schedule(Frequency::Daily, "24:00", None).to_cron().is_none());
        assert!(schedule(Frequency::Daily, "7pm", None).to_cron().is_none());
        assert!(schedule(Frequency::Weekly, "12:00", Some(7)).to_cron().is_none());
        assert!(schedule(Frequency::Weekly, "12:00", None).to_cron().is_none());
    }
}
