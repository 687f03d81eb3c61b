//! Bridge configuration

/// Message bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Reply sent in place of handler failures that are not client errors
    pub internal_error_message: String,
    /// Replace non-client handler failures with `internal_error_message`
    pub obfuscate_internal_errors: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            internal_error_message: "Internal server error".to_string(),
            obfuscate_internal_errors: true,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_internal_error_message(mut self, message: impl Into<String>) -> Self {
        self.internal_error_message = message.into();
        self
    }

    pub fn with_obfuscation(mut self, enabled: bool) -> Self {
        self.obfuscate_internal_errors = enabled;
        self
    }
}
