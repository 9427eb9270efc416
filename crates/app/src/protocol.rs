//! Command protocol engine: the confirmation dialogue with one device.
//!
//! The engine is a pure state machine: the sensor task writes the command
//! bytes, then feeds every output line and deadline tick into the engine,
//! which decides when the command resolves.
//!
//! ```text
//! Idle ──begin──▶ AwaitingConfirmation ──token / prompt / deadline──▶ Idle
//! ```

use std::time::Duration;

use tokio::time::Instant;

use sensord_domain::command::{CommandOutcome, FailureKind};
use sensord_domain::sensor::ProtocolOverrides;

/// How a device output line relates to the command in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    /// The device acknowledged the command.
    Confirmation,
    /// The device rejected the command.
    Failure,
    /// The device echoed the command back.
    Echo,
    /// The device finished its response and is waiting for input.
    Prompt,
    /// Anything else; kept as diagnostic context.
    Other,
}

/// Token vocabulary of a device family.
///
/// Matching is done on trimmed lines, case-insensitively, after stripping a
/// leading prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub confirm: Vec<String>,
    pub failure: Vec<String>,
    pub prompt: Option<String>,
    /// Reaching the prompt right after the echo confirms the command.
    pub end_of_response_confirms: bool,
}

impl TokenSet {
    /// Apply per-sensor overrides on top of the family vocabulary.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &ProtocolOverrides) -> Self {
        if let Some(confirm) = &overrides.confirm_tokens {
            self.confirm.clone_from(confirm);
        }
        if let Some(failure) = &overrides.failure_tokens {
            self.failure.clone_from(failure);
        }
        if let Some(prompt) = &overrides.prompt {
            self.prompt = Some(prompt.clone()).filter(|p| !p.is_empty());
        }
        if let Some(flag) = overrides.end_of_response_confirms {
            self.end_of_response_confirms = flag;
        }
        self
    }

    /// Remove a leading prompt, returning the rest and whether one was found.
    fn strip_prompt<'a>(&self, line: &'a str) -> (&'a str, bool) {
        let trimmed = line.trim();
        match &self.prompt {
            Some(prompt) => match trimmed.strip_prefix(prompt.as_str()) {
                Some(rest) => (rest.trim(), true),
                None => (trimmed, false),
            },
            None => (trimmed, false),
        }
    }

    /// Text of the line with any prompt removed.
    #[must_use]
    pub fn content<'a>(&self, line: &'a str) -> &'a str {
        self.strip_prompt(line).0
    }

    /// Classify `line` against the vocabulary and the echo of the command.
    #[must_use]
    pub fn classify(&self, line: &str, echo: &str) -> LineClass {
        let (text, had_prompt) = self.strip_prompt(line);
        if text.is_empty() {
            return if had_prompt {
                LineClass::Prompt
            } else {
                LineClass::Other
            };
        }
        let matches = |tokens: &[String]| tokens.iter().any(|t| t.eq_ignore_ascii_case(text));
        if matches(&self.confirm) {
            LineClass::Confirmation
        } else if matches(&self.failure) {
            LineClass::Failure
        } else if !echo.is_empty() && text.eq_ignore_ascii_case(echo.trim()) {
            LineClass::Echo
        } else {
            LineClass::Other
        }
    }
}

#[derive(Debug)]
struct Pending {
    echo: String,
    deadline: Instant,
    lines: Vec<String>,
    echo_seen: bool,
}

/// Engine state.
#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    AwaitingConfirmation(Pending),
}

/// Per-sensor command/confirmation state machine.
#[derive(Debug)]
pub struct ProtocolEngine {
    tokens: TokenSet,
    timeout: Duration,
    state: State,
}

impl ProtocolEngine {
    #[must_use]
    pub fn new(tokens: TokenSet, timeout: Duration) -> Self {
        Self {
            tokens,
            timeout,
            state: State::Idle,
        }
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenSet {
        &self.tokens
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Deadline of the command in flight.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            State::Idle => None,
            State::AwaitingConfirmation(pending) => Some(pending.deadline),
        }
    }

    /// Start waiting for the confirmation of a command whose echo is `echo`.
    ///
    /// # Errors
    ///
    /// Returns [`FailureKind::Busy`] when a command is already in flight.
    pub fn begin(&mut self, echo: impl Into<String>, now: Instant) -> Result<(), FailureKind> {
        if !self.is_idle() {
            return Err(FailureKind::Busy);
        }
        self.state = State::AwaitingConfirmation(Pending {
            echo: echo.into(),
            deadline: now + self.timeout,
            lines: Vec::new(),
            echo_seen: false,
        });
        Ok(())
    }

    /// Feed one output line. Returns the outcome when the line resolves the
    /// command in flight.
    pub fn on_line(&mut self, line: &str) -> Option<CommandOutcome> {
        let State::AwaitingConfirmation(pending) = &mut self.state else {
            match self.tokens.classify(line, "") {
                LineClass::Confirmation | LineClass::Failure => {
                    tracing::debug!(line, "discarding late token");
                }
                _ => {}
            }
            return None;
        };

        let class = self.tokens.classify(line, &pending.echo);
        let text = self.tokens.content(line);
        if !text.is_empty() {
            pending.lines.push(text.to_string());
        }

        let outcome = match class {
            LineClass::Confirmation => CommandOutcome::Confirmed {
                lines: std::mem::take(&mut pending.lines),
            },
            LineClass::Failure => CommandOutcome::Failed {
                failure: FailureKind::Device(text.to_string()),
                lines: std::mem::take(&mut pending.lines),
            },
            LineClass::Echo => {
                pending.echo_seen = true;
                return None;
            }
            LineClass::Prompt if pending.echo_seen && self.tokens.end_of_response_confirms => {
                CommandOutcome::Confirmed {
                    lines: std::mem::take(&mut pending.lines),
                }
            }
            LineClass::Prompt if pending.echo_seen => CommandOutcome::Failed {
                failure: FailureKind::NoCommandConfirmation,
                lines: std::mem::take(&mut pending.lines),
            },
            // A prompt before the echo closes the previous response.
            LineClass::Prompt | LineClass::Other => return None,
        };
        self.state = State::Idle;
        Some(outcome)
    }

    /// Resolve the command in flight as timed out once its deadline passed.
    pub fn on_deadline(&mut self, now: Instant) -> Option<CommandOutcome> {
        match &mut self.state {
            State::AwaitingConfirmation(pending) if now >= pending.deadline => {
                let lines = std::mem::take(&mut pending.lines);
                self.state = State::Idle;
                Some(CommandOutcome::TimedOut { lines })
            }
            _ => None,
        }
    }

    /// Force the engine back to idle, resolving the command in flight with
    /// `failure`.
    pub fn abort(&mut self, failure: FailureKind) -> Option<CommandOutcome> {
        match std::mem::take(&mut self.state) {
            State::Idle => None,
            State::AwaitingConfirmation(pending) => Some(CommandOutcome::Failed {
                failure,
                lines: pending.lines,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> TokenSet {
        TokenSet {
            confirm: vec!["Done".to_string()],
            failure: vec!["Error".to_string()],
            prompt: Some("leapMMW:/>".to_string()),
            end_of_response_confirms: true,
        }
    }

    fn engine() -> ProtocolEngine {
        ProtocolEngine::new(tokens(), Duration::from_secs(2))
    }

    #[test]
    fn should_classify_lines_case_insensitively() {
        let tokens = tokens();
        assert_eq!(tokens.classify("  done\r", "sensorStop"), LineClass::Confirmation);
        assert_eq!(tokens.classify("ERROR", "sensorStop"), LineClass::Failure);
        assert_eq!(tokens.classify("sensorstop", "sensorStop"), LineClass::Echo);
        assert_eq!(tokens.classify("leapMMW:/>", "sensorStop"), LineClass::Prompt);
        assert_eq!(tokens.classify("garbage", "sensorStop"), LineClass::Other);
    }

    #[test]
    fn should_strip_leading_prompt_before_matching() {
        let tokens = tokens();
        assert_eq!(tokens.classify("leapMMW:/>Done", ""), LineClass::Confirmation);
        assert_eq!(
            tokens.classify("leapMMW:/>sensorStart", "sensorStart"),
            LineClass::Echo
        );
    }

    #[test]
    fn should_confirm_on_token_and_return_lines() {
        let mut engine = engine();
        engine.begin("sensorStop", Instant::now()).unwrap();
        assert!(engine.on_line("sensorStop").is_none());
        let outcome = engine.on_line("Done").unwrap();
        assert_eq!(
            outcome,
            CommandOutcome::Confirmed {
                lines: vec!["sensorStop".to_string(), "Done".to_string()]
            }
        );
        assert!(engine.is_idle());
    }

    #[test]
    fn should_reject_second_command_while_awaiting() {
        let mut engine = engine();
        engine.begin("sensorStart", Instant::now()).unwrap();
        assert_eq!(
            engine.begin("sensorStop", Instant::now()),
            Err(FailureKind::Busy)
        );
        assert!(engine.deadline().is_some());
    }

    #[test]
    fn should_pass_device_failure_text_through() {
        let mut engine = engine();
        engine.begin("setSensitivity 12", Instant::now()).unwrap();
        let outcome = engine.on_line("Error").unwrap();
        assert!(matches!(
            outcome,
            CommandOutcome::Failed {
                failure: FailureKind::Device(ref text),
                ..
            } if text == "Error"
        ));
    }

    #[test]
    fn should_buffer_unrecognized_lines() {
        let mut engine = engine();
        engine.begin("sensorStart", Instant::now()).unwrap();
        assert!(engine.on_line("sensor is started already").is_none());
        let outcome = engine.on_line("Done").unwrap();
        assert_eq!(outcome.lines().len(), 2);
    }

    #[test]
    fn should_confirm_when_prompt_follows_echo() {
        let mut engine = engine();
        engine.begin("sensorStop", Instant::now()).unwrap();
        engine.on_line("sensorStop");
        let outcome = engine.on_line("leapMMW:/>").unwrap();
        assert!(outcome.is_confirmed());
    }

    #[test]
    fn should_fail_without_confirmation_when_fallback_disabled() {
        let mut tokens = tokens();
        tokens.end_of_response_confirms = false;
        let mut engine = ProtocolEngine::new(tokens, Duration::from_secs(1));
        engine.begin("sensorStop", Instant::now()).unwrap();
        engine.on_line("sensorStop");
        let outcome = engine.on_line("leapMMW:/>").unwrap();
        assert!(matches!(
            outcome,
            CommandOutcome::Failed {
                failure: FailureKind::NoCommandConfirmation,
                ..
            }
        ));
    }

    #[test]
    fn should_ignore_prompt_before_echo() {
        let mut engine = engine();
        engine.begin("sensorStop", Instant::now()).unwrap();
        assert!(engine.on_line("leapMMW:/>").is_none());
        assert!(!engine.is_idle());
    }

    #[test]
    fn should_confirm_after_prompt_left_by_previous_response() {
        let mut engine = engine();
        engine.begin("sensorStop", Instant::now()).unwrap();
        assert!(engine.on_line("leapMMW:/>").is_none());
        assert!(engine.on_line("sensorStop").is_none());
        let outcome = engine.on_line("Done").unwrap();
        assert!(outcome.is_confirmed());
        assert_eq!(outcome.lines(), ["sensorStop", "Done"]);
    }

    #[test]
    fn should_time_out_after_deadline() {
        let mut engine = engine();
        let start = Instant::now();
        engine.begin("sensorStart", start).unwrap();
        engine.on_line("noise");
        assert!(engine.on_deadline(start + Duration::from_secs(1)).is_none());
        let outcome = engine.on_deadline(start + Duration::from_secs(2)).unwrap();
        assert_eq!(
            outcome,
            CommandOutcome::TimedOut {
                lines: vec!["noise".to_string()]
            }
        );
        assert!(engine.is_idle());
    }

    #[test]
    fn should_discard_late_token_after_timeout() {
        let mut engine = engine();
        let start = Instant::now();
        engine.begin("sensorStart", start).unwrap();
        engine.on_deadline(start + Duration::from_secs(5));
        assert!(engine.on_line("Done").is_none());
        assert!(engine.is_idle());
    }

    #[test]
    fn should_abort_pending_command() {
        let mut engine = engine();
        engine.begin("sensorStart", Instant::now()).unwrap();
        let outcome = engine.abort(FailureKind::Superseded).unwrap();
        assert!(matches!(
            outcome,
            CommandOutcome::Failed {
                failure: FailureKind::Superseded,
                ..
            }
        ));
        assert!(engine.abort(FailureKind::Superseded).is_none());
    }

    #[test]
    fn should_apply_protocol_overrides() {
        let overrides = ProtocolOverrides {
            confirm_tokens: Some(vec!["OK".to_string()]),
            end_of_response_confirms: Some(false),
            ..ProtocolOverrides::default()
        };
        let tokens = tokens().with_overrides(&overrides);
        assert_eq!(tokens.classify("ok", ""), LineClass::Confirmation);
        assert_eq!(tokens.classify("Done", ""), LineClass::Other);
        assert!(!tokens.end_of_response_confirms);
        assert_eq!(tokens.prompt.as_deref(), Some("leapMMW:/>"));
    }
}
