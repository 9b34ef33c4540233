//! User-facing error messages and recovery suggestions.
//!
//! Errors reaching the terminal are classified by message so the user gets
//! a category and a short list of things to try, and failed plan steps get
//! a one-line tip.

use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedError {
    pub title: String,
    pub message: String,
    pub suggestions: Vec<String>,
    pub error_type: ErrorType,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorType {
    /// Missing API key, bad settings file
    Configuration,
    /// Timeouts, refused connections
    Network,
    /// File access or privilege problems
    Permission,
    /// A program the step needs is not installed
    MissingCommand,
    /// Bad input: unknown plan, malformed request
    Validation,
    /// Anything else that failed while running
    Runtime,
    Unknown,
}

impl EnhancedError {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        error_type: ErrorType,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            suggestions: Vec::new(),
            error_type,
            context: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions<I, S>(mut self, suggestions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggestions.extend(suggestions.into_iter().map(Into::into));
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn into_error(self) -> Error {
        Error::new(self)
    }

    pub fn format(&self, verbose: bool) -> String {
        let mut output = format!("{}: {}\n  {}\n", self.error_type.label(), self.title, self.message);
        if verbose && let Some(context) = &self.context {
            output.push_str(&format!("\n  Context: {context}\n"));
        }
        if !self.suggestions.is_empty() {
            output.push_str("\n  Suggestions:\n");
            for (i, suggestion) in self.suggestions.iter().enumerate() {
                output.push_str(&format!("    {}. {suggestion}\n", i + 1));
            }
        }
        output
    }
}

impl ErrorType {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorType::Configuration => "config",
            ErrorType::Network => "network",
            ErrorType::Permission => "permission",
            ErrorType::MissingCommand => "missing-command",
            ErrorType::Validation => "invalid",
            ErrorType::Runtime => "runtime",
            ErrorType::Unknown => "error",
        }
    }
}

impl fmt::Display for EnhancedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format(false))
    }
}

impl std::error::Error for EnhancedError {}

#[derive(Debug, Default)]
pub struct ErrorHandler {
    verbose: bool,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn handle(&self, error: &Error) -> String {
        if let Some(enhanced) = error.downcast_ref::<EnhancedError>() {
            return enhanced.format(self.verbose);
        }
        let mut enhanced = classify(&format!("{error:#}"));
        if self.verbose {
            enhanced = enhanced.with_context(format!("{error:?}"));
        }
        enhanced.format(self.verbose)
    }
}

/// Classifies an error message by the words it contains.
pub fn classify(error_message: &str) -> EnhancedError {
    let lower = error_message.to_lowercase();

    if lower.contains("api key") || lower.contains("configuration") || lower.contains("settings") {
        return EnhancedError::new("Configuration Error", error_message, ErrorType::Configuration)
            .with_suggestions([
                "Check .sysop/settings.json",
                "Set the SYSOP_API_KEY environment variable",
                "Use `--backend offline` to plan without a service",
            ]);
    }

    if lower.contains("permission denied") || lower.contains("operation not permitted") {
        return EnhancedError::new("Permission Error", error_message, ErrorType::Permission)
            .with_suggestions([
                "Run with sudo or check file permissions",
                "Confirm the target path is owned by your user",
            ]);
    }

    if lower.contains("command not found")
        || lower.contains("exit status 127")
        || lower.contains("no such file or directory (os error 2)")
    {
        return EnhancedError::new("Command Not Found", error_message, ErrorType::MissingCommand)
            .with_suggestions([
                "The command might not be installed or not in your PATH",
                "Install the package that provides it and retry",
            ]);
    }

    if lower.contains("network")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection")
    {
        return EnhancedError::new("Network Error", error_message, ErrorType::Network)
            .with_suggestions([
                "Check your internet connection",
                "Verify the planning endpoint is reachable",
                "Try again in a few moments",
            ]);
    }

    if lower.contains("not found") || lower.contains("invalid") || lower.contains("unknown") {
        return EnhancedError::new("Invalid Request", error_message, ErrorType::Validation)
            .with_suggestion("Check the plan id, step numbers, or command name");
    }

    EnhancedError::new("Error", error_message, ErrorType::Unknown)
        .with_suggestion("Re-run with --verbose for more detail")
}

/// One-line hint for a failed plan step, if the failure is recognizable.
pub fn execution_tip(error_message: &str) -> Option<String> {
    let classified = classify(error_message);
    match classified.error_type {
        ErrorType::Permission | ErrorType::MissingCommand => {
            classified.suggestions.into_iter().next()
        }
        _ => None,
    }
}

pub mod errors {
    use super::*;

    pub fn plan_not_found(plan_id: &str) -> EnhancedError {
        EnhancedError::new(
            "Plan Not Found",
            format!("No stored plan has id '{plan_id}'."),
            ErrorType::Validation,
        )
        .with_suggestion("Run `sysop plan list` to see stored plans")
    }

    pub fn unknown_backend(name: &str, available: &[String]) -> EnhancedError {
        EnhancedError::new(
            "Unknown Planning Backend",
            format!("No planning backend is registered as '{name}'."),
            ErrorType::Configuration,
        )
        .with_suggestion(format!("Available backends: {}", available.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn formats_title_message_and_numbered_suggestions() {
        let error = EnhancedError::new("Test Error", "Something went wrong", ErrorType::Runtime)
            .with_suggestion("Try again")
            .with_suggestion("Check logs");
        let formatted = error.format(false);
        assert!(formatted.starts_with("runtime: Test Error"));
        assert!(formatted.contains("1. Try again"));
        assert!(formatted.contains("2. Check logs"));
    }

    #[test]
    fn handler_classifies_plain_errors() {
        let handler = ErrorHandler::new();
        let output = handler.handle(&anyhow!("API key is missing"));
        assert!(output.contains("Configuration Error"));
    }

    #[test]
    fn handler_keeps_enhanced_errors_intact() {
        let handler = ErrorHandler::new();
        let output = handler.handle(&errors::plan_not_found("abc").into_error());
        assert!(output.contains("Plan Not Found"));
        assert!(output.contains("sysop plan list"));
    }

    #[test]
    fn execution_tips_cover_permission_and_missing_commands() {
        assert_eq!(
            execution_tip("exit status 1: touch: /etc/x: Permission denied").as_deref(),
            Some("Run with sudo or check file permissions")
        );
        assert_eq!(
            execution_tip("exit status 127: sh: 1: frobnicate: not found").as_deref(),
            Some("The command might not be installed or not in your PATH")
        );
        assert_eq!(execution_tip("exit status 2"), None);
    }
}
