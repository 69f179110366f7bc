use serde::{Deserialize, Serialize};

/// Quota/expiry policy tuple carried by ports, server-user grants and
/// port-user grants. `valid_until` is epoch milliseconds.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default,
)]
pub struct UsagePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<i64>,
    #[serde(default)]
    pub quota_action: LimitAction,
    #[serde(default)]
    pub due_action: LimitAction,
}

/// What the enforcer does when a port or server-user trips its policy.
///
/// Stored numerically in config bags so operator payloads stay compact.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum LimitAction {
    #[default]
    NoAction,
    SpeedLimit10k,
    SpeedLimit100k,
    SpeedLimit1m,
    SpeedLimit10m,
    SpeedLimit30m,
    SpeedLimit100m,
    SpeedLimit1g,
    DeleteRule,
}

impl LimitAction {
    /// The throttle tier in kbit/s, or `None` for the non-shaping actions.
    pub fn speed_kbit(self) -> Option<u32> {
        match self {
            LimitAction::SpeedLimit10k => Some(10),
            LimitAction::SpeedLimit100k => Some(100),
            LimitAction::SpeedLimit1m => Some(1_000),
            LimitAction::SpeedLimit10m => Some(10_000),
            LimitAction::SpeedLimit30m => Some(30_000),
            LimitAction::SpeedLimit100m => Some(100_000),
            LimitAction::SpeedLimit1g => Some(1_000_000),
            LimitAction::NoAction | LimitAction::DeleteRule => None,
        }
    }
}

impl From<LimitAction> for u8 {
    fn from(action: LimitAction) -> u8 {
        action as u8
    }
}

impl TryFrom<u8> for LimitAction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => LimitAction::NoAction,
            1 => LimitAction::SpeedLimit10k,
            2 => LimitAction::SpeedLimit100k,
            3 => LimitAction::SpeedLimit1m,
            4 => LimitAction::SpeedLimit10m,
            5 => LimitAction::SpeedLimit30m,
            6 => LimitAction::SpeedLimit100m,
            7 => LimitAction::SpeedLimit1g,
            8 => LimitAction::DeleteRule,
            other => return Err(format!("unknown limit action: {other}")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_map_to_kbit() {
        assert_eq!(LimitAction::SpeedLimit10k.speed_kbit(), Some(10));
        assert_eq!(LimitAction::SpeedLimit1m.speed_kbit(), Some(1_000));
        assert_eq!(LimitAction::SpeedLimit1g.speed_kbit(), Some(1_000_000));
        assert_eq!(LimitAction::NoAction.speed_kbit(), None);
        assert_eq!(LimitAction::DeleteRule.speed_kbit(), None);
    }

    #[test]
    fn numeric_round_trip() {
        let parsed: LimitAction = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, LimitAction::SpeedLimit1m);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "3");
        assert!(serde_json::from_str::<LimitAction>("9").is_err());
    }
}
