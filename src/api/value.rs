//! Normalization of heterogeneous remote value shapes
//!
//! Size and identity fields come back from the appliance either as bare
//! numbers, as strings, or as structured values carrying a parsed-numeric
//! field next to a raw string. All shape-sniffing lives here; everything
//! downstream sees one canonical integer.

use serde::Deserialize;

/// A size or identity field as received on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ApiValue {
    /// Structured property value ({"parsed": N, "rawvalue": "N"})
    Structured {
        #[serde(default)]
        parsed: Option<i64>,
        #[serde(default)]
        rawvalue: Option<String>,
    },
    /// Bare number
    Scalar(i64),
    /// Bare string
    Text(String),
    /// Field missing or null
    Absent,
}

impl Default for ApiValue {
    fn default() -> Self {
        ApiValue::Absent
    }
}

/// Collapse an [`ApiValue`] to one canonical integer.
///
/// Priority: parsed field, then raw string parsed as integer, then the
/// bare scalar, then a bare string parsed as integer, then zero.
pub fn normalize(value: &ApiValue) -> i64 {
    match value {
        ApiValue::Structured { parsed, rawvalue } => {
            if let Some(n) = parsed {
                return *n;
            }
            rawvalue
                .as_deref()
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(0)
        }
        ApiValue::Scalar(n) => *n,
        ApiValue::Text(s) => s.trim().parse().unwrap_or(0),
        ApiValue::Absent => 0,
    }
}

/// Normalize a raw JSON field without an intermediate struct.
pub fn normalize_json(value: &serde_json::Value) -> i64 {
    match ApiValue::deserialize(value) {
        Ok(v) => normalize(&v),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structured_prefers_parsed() {
        let v = ApiValue::Structured {
            parsed: Some(1073741824),
            rawvalue: Some("999".to_string()),
        };
        assert_eq!(normalize(&v), 1073741824);
    }

    #[test]
    fn test_structured_falls_back_to_rawvalue() {
        let v = ApiValue::Structured {
            parsed: None,
            rawvalue: Some("655360".to_string()),
        };
        assert_eq!(normalize(&v), 655360);

        let bad = ApiValue::Structured {
            parsed: None,
            rawvalue: Some("128K".to_string()),
        };
        assert_eq!(normalize(&bad), 0);
    }

    #[test]
    fn test_scalar_and_text() {
        assert_eq!(normalize(&ApiValue::Scalar(42)), 42);
        assert_eq!(normalize(&ApiValue::Text("42".to_string())), 42);
        assert_eq!(normalize(&ApiValue::Text("x".to_string())), 0);
        assert_eq!(normalize(&ApiValue::Absent), 0);
    }

    #[test]
    fn test_normalize_json_shapes() {
        assert_eq!(normalize_json(&json!(17)), 17);
        assert_eq!(normalize_json(&json!("17")), 17);
        assert_eq!(
            normalize_json(&json!({"parsed": 655360, "rawvalue": "655360", "value": "640K"})),
            655360
        );
        assert_eq!(normalize_json(&json!({"rawvalue": "655360"})), 655360);
        assert_eq!(normalize_json(&json!(null)), 0);
        assert_eq!(normalize_json(&json!({})), 0);
    }
}
