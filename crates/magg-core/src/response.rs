//! Standard response model for magg tools
//!
//! Every management tool returns a `MaggResponse` with either output data,
//! a list of error strings, or both (partial success).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standardized response format for magg tools.
///
/// Success with partial failure is expressed by populating both fields,
/// e.g. a batch mount that reports which servers mounted and which didn't.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaggResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl MaggResponse {
    /// Create a success response with output data
    pub fn success(output: Value) -> Self {
        Self {
            output: Some(output),
            errors: None,
        }
    }

    /// Create an error response
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            output: None,
            errors: Some(vec![error.into()]),
        }
    }

    /// Create an error response from multiple errors
    pub fn errors(errors: Vec<String>) -> Self {
        Self {
            output: None,
            errors: Some(errors),
        }
    }

    /// Add an error, keeping any output already present
    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.get_or_insert_with(Vec::new).push(error.into());
    }

    /// Check if this is a successful response (no errors)
    pub fn is_success(&self) -> bool {
        self.errors.as_ref().map_or(true, |e| e.is_empty())
    }

    /// Check if this response contains errors
    pub fn is_error(&self) -> bool {
        !self.is_success()
    }

    /// Serialize to the JSON string carried in a text content item
    pub fn to_json_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"errors\":[\"response serialization failed: {}\"]}}", e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_response() {
        let resp = MaggResponse::success(json!({"action": "server_added"}));
        assert!(resp.is_success());
        assert!(!resp.is_error());
        assert_eq!(resp.output.unwrap()["action"], "server_added");
    }

    #[test]
    fn test_error_response() {
        let resp = MaggResponse::error("Server 'calc' not found");
        assert!(resp.is_error());
        assert_eq!(resp.errors.unwrap(), vec!["Server 'calc' not found"]);
    }

    #[test]
    fn test_partial_failure() {
        let mut resp = MaggResponse::success(json!({"mounted": ["a"]}));
        resp.add_error("failed to mount b");
        assert!(resp.is_error());
        assert!(resp.output.is_some());
    }

    #[test]
    fn test_json_text_omits_empty_fields() {
        let text = MaggResponse::success(json!([])).to_json_text();
        assert!(!text.contains("errors"));
        let text = MaggResponse::error("boom").to_json_text();
        assert!(!text.contains("output"));
    }
}
