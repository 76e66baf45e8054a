//! Answers and bus event shapes

use std::fmt;

use serde_json::{json, Value};

/// A command answer: code 0 for success, anything else with text.
///
/// On the wire answers look like `{"result": [0]}` or
/// `{"result": [1, "why"]}`.
#[derive(Clone, Debug, PartialEq)]
pub struct Answer {
    pub code: u32,
    pub text: Option<String>,
}

impl Answer {
    pub fn ok() -> Answer {
        Answer {
            code: 0,
            text: None,
        }
    }

    pub fn error(text: impl Into<String>) -> Answer {
        Answer {
            code: 1,
            text: Some(text.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    pub fn to_value(&self) -> Value {
        match &self.text {
            Some(text) => json!({ "result": [self.code, text] }),
            None => json!({ "result": [self.code] }),
        }
    }

    pub fn parse(value: &Value) -> Option<Answer> {
        let result = value.get("result")?.as_array()?;
        let code = result.first()?.as_u64()? as u32;
        let text = result.get(1).and_then(Value::as_str).map(str::to_string);
        Some(Answer { code, text })
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{} ({})", self.code, text),
            None => write!(f, "{}", self.code),
        }
    }
}

/// One input delivered by a bus session.
#[derive(Clone, Debug, PartialEq)]
pub enum BusEvent {
    /// A command addressed to this module; `reply_to` routes the answer.
    Command {
        name: String,
        args: Value,
        reply_to: Option<String>,
    },
    /// A group notification.
    Notification {
        group: String,
        event: String,
        args: Value,
    },
    /// An update to this module's own configuration.
    ModuleConfig {
        value: Value,
        reply_to: Option<String>,
    },
    /// An update to the shared data source configuration.
    DatasrcConfig {
        value: Value,
        reply_to: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_wire_shapes() {
        assert_eq!(json!({"result": [0]}), Answer::ok().to_value());
        assert_eq!(
            json!({"result": [1, "bad class: XX"]}),
            Answer::error("bad class: XX").to_value()
        );
    }

    #[test]
    fn test_answer_parse_round_trip() {
        for answer in [Answer::ok(), Answer::error("nope")] {
            assert_eq!(Some(answer.clone()), Answer::parse(&answer.to_value()));
        }
        assert_eq!(None, Answer::parse(&json!({"result": "nope"})));
        assert_eq!(None, Answer::parse(&json!({})));
    }
}
