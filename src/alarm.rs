use serde::{Deserialize, Serialize};

/// Highest severity an alarm may carry. Severities are ordered, higher
/// means more severe; what each level means is up to the application.
pub const MAX_SEVERITY: u8 = 5;

#[derive(Debug, PartialEq, Eq)]
pub enum InvalidAlarm {
    EmptyName,
    SeverityOutOfRange(u8),
}

impl std::error::Error for InvalidAlarm {}

impl std::fmt::Display for InvalidAlarm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use InvalidAlarm::*;
        match self {
            EmptyName => f.write_str("Alarm name is empty"),
            SeverityOutOfRange(s) => {
                write!(f, "Severity {} outside 0..={}", s, MAX_SEVERITY)
            }
        }
    }
}

/// Current status of one named alarm. This is the record that goes over
/// the wire, field for field.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Alarm {
    name: String,
    pub raised: bool,
    pub node_name: String,
    pub problem_description: String,
    pub parameters: String,
    pub severity: u8,
}

impl Alarm {
    /// A cleared alarm with no metadata and severity 0. This is also what
    /// the broker reports for a name that was never set.
    pub fn new(name: &str) -> Result<Alarm, InvalidAlarm> {
        Self::with_fields(name, false, "", "", "", 0)
    }

    pub fn with_fields(
        name: &str,
        raised: bool,
        node_name: &str,
        problem_description: &str,
        parameters: &str,
        severity: u8,
    ) -> Result<Alarm, InvalidAlarm> {
        let alarm = Alarm {
            name: name.to_string(),
            raised,
            node_name: node_name.to_string(),
            problem_description: problem_description.to_string(),
            parameters: parameters.to_string(),
            severity,
        };
        alarm.validate()?;
        Ok(alarm)
    }

    /// The name is fixed at construction, everything else may be changed
    /// through the public fields.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cleared(&self) -> bool {
        !self.raised
    }

    pub fn validate(&self) -> Result<(), InvalidAlarm> {
        if self.name.is_empty() {
            return Err(InvalidAlarm::EmptyName);
        }
        if self.severity > MAX_SEVERITY {
            return Err(InvalidAlarm::SeverityOutOfRange(self.severity));
        }
        Ok(())
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse the wire record and check it describes a valid alarm.
    pub fn decode(json: &str) -> Result<Alarm, Box<dyn std::error::Error + Send + Sync>> {
        let alarm: Alarm = serde_json::from_str(json)?;
        alarm.validate()?;
        Ok(alarm)
    }
}

impl std::fmt::Display for Alarm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}: {} severity={} node={}",
            self.name,
            if self.raised { "RAISED" } else { "cleared" },
            self.severity,
            self.node_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct() {
        let alarm = Alarm::new("test_alarm").unwrap();
        assert_eq!(alarm.name(), "test_alarm");
        assert!(!alarm.raised);
        assert!(alarm.cleared());
        assert_eq!(alarm.severity, 0);
        assert_eq!(alarm.node_name, "");

        let alarm =
            Alarm::with_fields("test_alarm", false, "test_client", "", "json", 5).unwrap();
        assert_eq!(alarm.node_name, "test_client");
        assert_eq!(alarm.parameters, "json");
        assert_eq!(alarm.severity, 5);
    }

    #[test]
    fn reject_invalid() {
        assert_eq!(Alarm::new("").unwrap_err(), InvalidAlarm::EmptyName);
        assert_eq!(
            Alarm::with_fields("a", true, "", "", "", MAX_SEVERITY + 1).unwrap_err(),
            InvalidAlarm::SeverityOutOfRange(MAX_SEVERITY + 1)
        );
    }

    #[test]
    fn copies_are_equal() {
        let alarm =
            Alarm::with_fields("test_alarm", true, "node", "trouble", "json", 3).unwrap();
        let copy1 = alarm.clone();
        let copy2 = alarm.clone();
        assert_eq!(alarm, copy1);
        assert_eq!(copy1, copy2);
        let mut changed = alarm.clone();
        changed.raised = false;
        assert_ne!(alarm, changed);
    }

    #[test]
    fn wire_round_trip() {
        let alarm =
            Alarm::with_fields("test_alarm", true, "node_a", "overheated", "{\"t\":99}", 4)
                .unwrap();
        let json = alarm.encode().unwrap();
        assert_eq!(alarm, Alarm::decode(&json).unwrap());

        // Field names on the wire are fixed
        assert!(json.contains("\"Name\""));
        assert!(json.contains("\"Raised\""));
        assert!(json.contains("\"NodeName\""));
        assert!(json.contains("\"ProblemDescription\""));
        assert!(json.contains("\"Parameters\""));
        assert!(json.contains("\"Severity\""));
    }

    #[test]
    fn decode_checks_validity() {
        let json = r#"{"Name":"","Raised":false,"NodeName":"","ProblemDescription":"","Parameters":"","Severity":0}"#;
        assert!(Alarm::decode(json).is_err());
        let json = r#"{"Name":"a","Raised":true,"NodeName":"","ProblemDescription":"","Parameters":"","Severity":9}"#;
        assert!(Alarm::decode(json).is_err());
    }
}
