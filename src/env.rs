//! Environment variable substitution for configuration files
//!
//! `${VAR_NAME}` references are replaced with the variable's value before the
//! YAML is parsed, so secrets and bucket names can stay out of the file.

use std::env;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::config::ConfigError;

/// Matches `${VAR_NAME}`
static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is a valid regex")
});

/// Replace every `${VAR_NAME}` in `input` with the variable's value.
///
/// All unset variables are reported together in a single error.
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing: Vec<String> = Vec::new();

    let output = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures<'_>| {
        let name = &caps[1];
        match env::var(name) {
            Ok(value) => value,
            Err(_) => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Missing environment variables: {}",
            missing.join(", ")
        )));
    }

    Ok(output.into_owned())
}
