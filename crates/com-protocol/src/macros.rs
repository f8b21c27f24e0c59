//! Command macros
//!
//! A macro is one line written to the device together with the pattern that
//! marks the response as complete.

use std::fmt;

use regex::Regex;
use serde_json::Value;

use crate::error::ProtocolError;
use crate::template;

/// A command template paired with its response pattern
///
/// Macros are immutable. Substituting parameters produces a new macro and
/// leaves the original untouched, so one profile can serve many ports.
#[derive(Clone)]
pub struct Macro {
    command: String,
    response: Regex,
}

impl Macro {
    /// Create a macro, compiling `response` as a regular expression
    pub fn new(command: impl Into<String>, response: &str) -> Result<Self, ProtocolError> {
        let response = Regex::new(response).map_err(|e| ProtocolError::InvalidPattern {
            pattern: response.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            command: command.into(),
            response,
        })
    }

    /// Create a macro from an already compiled pattern
    pub fn with_pattern(command: impl Into<String>, response: Regex) -> Self {
        Self {
            command: command.into(),
            response,
        }
    }

    /// The command template (placeholders not yet substituted)
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The response pattern
    pub fn response(&self) -> &Regex {
        &self.response
    }

    /// Return a copy with every `{token}` in the command resolved against `params`
    pub fn with_params(&self, params: &Value) -> Self {
        Self {
            command: template::render(&self.command, params),
            response: self.response.clone(),
        }
    }

    /// Whether the response pattern matches `text`
    pub fn matches(&self, text: &str) -> bool {
        self.response.is_match(text)
    }
}

impl fmt::Debug for Macro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Macro")
            .field("command", &self.command)
            .field("response", &self.response.as_str())
            .finish()
    }
}
