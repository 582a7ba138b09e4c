use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_VALIDATION: i32 = 2;
pub const EXIT_TIMEOUT: i32 = 124;

/// The result shape every public operation returns.
///
/// Invariant: `success == false` implies `error` is non-empty, and
/// `success == true` implies `output` is present (possibly empty). The
/// constructors below are the only way the rest of the codebase builds one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoreResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub exit_code: i32,
}

impl CoreResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            exit_code: EXIT_SUCCESS,
        }
    }

    /// Failure carrying the child's error payload in `output` (tool errors
    /// preserve what the server reported).
    pub fn failed_with_output(error: &CoreError, output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::from(error)
        }
    }
}

impl From<&CoreError> for CoreResult {
    fn from(error: &CoreError) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.to_string()),
            exit_code: error.exit_code(),
        }
    }
}

impl From<CoreError> for CoreResult {
    fn from(error: CoreError) -> Self {
        Self::from(&error)
    }
}

/// Shaping mode for results that may spill to disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    #[default]
    Auto,
    Full,
    Summary,
    Refs,
}

impl FromStr for ResponseMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "full" => Ok(Self::Full),
            "summary" => Ok(Self::Summary),
            "refs" => Ok(Self::Refs),
            other => Err(CoreError::Validation(format!(
                "unknown response mode '{other}' (expected: auto, full, summary, refs)"
            ))),
        }
    }
}

/// Input envelope for the router: `argv[0]` selects the command, the rest are
/// its arguments. Both the daemon endpoint and the MCP facade build one of
/// these per request.
#[derive(Debug, Clone, Default)]
pub struct CoreExecutionOptions {
    pub argv: Vec<String>,
    pub params: Option<serde_json::Value>,
    pub cwd: Option<PathBuf>,
    pub stdin_data: Option<String>,
    /// Root for spill files written while shaping this request's results.
    pub output_dir: Option<PathBuf>,
}

impl CoreExecutionOptions {
    pub fn from_argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_sets_output_and_zero_exit() {
        let result = CoreResult::ok("hello");
        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("hello"));
        assert_eq!(result.error, None);
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn test_from_error_sets_nonempty_error() {
        let result = CoreResult::from(CoreError::NotFound("server 'x'".into()));
        assert!(!result.success);
        assert!(result.error.as_deref().is_some_and(|e| !e.is_empty()));
        assert_eq!(result.exit_code, 1);
    }

    #[test]
    fn test_validation_maps_to_exit_2() {
        let result = CoreResult::from(CoreError::Validation("bad argv".into()));
        assert_eq!(result.exit_code, 2);
    }

    #[test]
    fn test_failed_with_output_keeps_payload() {
        let err = CoreError::Tool {
            server: "s".into(),
            tool: "t".into(),
        };
        let result = CoreResult::failed_with_output(&err, "{\"detail\":\"boom\"}");
        assert!(!result.success);
        assert_eq!(result.output.as_deref(), Some("{\"detail\":\"boom\"}"));
        assert_eq!(result.exit_code, 1);
    }

    #[test]
    fn test_serde_omits_absent_fields() {
        let json = serde_json::to_string(&CoreResult::ok("x")).unwrap();
        assert!(!json.contains("\"error\""));
        let parsed: CoreResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, CoreResult::ok("x"));
    }

    #[test]
    fn test_response_mode_parse() {
        assert_eq!("auto".parse::<ResponseMode>().unwrap(), ResponseMode::Auto);
        assert_eq!("refs".parse::<ResponseMode>().unwrap(), ResponseMode::Refs);
        assert!("inline".parse::<ResponseMode>().is_err());
    }
}
