use crate::alarm::Alarm;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorInfo {
    pub error_code: u32,
    pub error_description: String,
}

impl std::error::Error for ErrorInfo {}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:08x})", self.error_description, self.error_code)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct SetAlarmParams {
    pub alarm: Alarm,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct GetAlarmParams {
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct SubscribeAlarmParams {
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct AlarmParams {
    pub alarm: Alarm,
}

// Serialize as 'Params: {...}'
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct ParamWrapperCap<T> {
    pub params: T,
}

impl<T> From<T> for ParamWrapperCap<T> {
    fn from(v: T) -> Self {
        ParamWrapperCap { params: v }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "Message")]
pub enum MessageVariant {
    SetAlarm(ParamWrapperCap<SetAlarmParams>),
    NotifySetAlarm,
    ErrorSetAlarm(ErrorInfo),

    GetAlarm(ParamWrapperCap<GetAlarmParams>),
    NotifyGetAlarm(ParamWrapperCap<AlarmParams>),
    ErrorGetAlarm(ErrorInfo),

    SubscribeAlarm(ParamWrapperCap<SubscribeAlarmParams>),
    NotifySubscribeAlarm(ParamWrapperCap<AlarmParams>),
    ErrorSubscribeAlarm(ErrorInfo),
    UnsubscribeAlarm,
    NotifyUnsubscribeAlarm,
    ErrorUnsubscribeAlarm(ErrorInfo),

    // Unsolicited push after a committed set
    NotifyAlarm(ParamWrapperCap<AlarmParams>),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    #[serde(flatten)]
    pub message: MessageVariant,
    pub client_cookie: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_round_trip() {
        let alarm =
            Alarm::with_fields("test_alarm", true, "node_a", "trouble", "json", 3).unwrap();
        let msg = Message {
            message: MessageVariant::NotifyAlarm(AlarmParams { alarm }.into()),
            client_cookie: "cookie_1_1".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"Message\":\"NotifyAlarm\""));
        assert!(json.contains("\"ClientCookie\":\"cookie_1_1\""));

        let back: Message = serde_json::from_str(&json).unwrap();
        match back.message {
            MessageVariant::NotifyAlarm(p) => {
                assert_eq!(p.params.alarm.name(), "test_alarm");
                assert_eq!(p.params.alarm.severity, 3);
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn serialize_error_reply() {
        let msg = Message {
            message: MessageVariant::ErrorSetAlarm(ErrorInfo {
                error_code: 1,
                error_description: "Alarm name is empty".to_string(),
            }),
            client_cookie: "c".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert!(matches!(back.message, MessageVariant::ErrorSetAlarm(e)
                         if e.error_code == 1));
    }
}
