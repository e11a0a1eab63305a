//! Small helpers for handling LLM text output.

/// Extract the first balanced JSON object from text, handling nested braces
/// and strings correctly.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut in_string = false;
    let mut escape = false;
    for (i, ch) in text[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a JSON value out of LLM output that may be wrapped in prose or
/// markdown code fences.
pub fn parse_loose_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, String> {
    if let Ok(value) = serde_json::from_str::<T>(text) {
        return Ok(value);
    }
    let cleaned = text.replace("```json", "").replace("```", "");
    if let Ok(value) = serde_json::from_str::<T>(cleaned.trim()) {
        return Ok(value);
    }
    let extracted = extract_json_object(&cleaned).unwrap_or(cleaned.trim());
    serde_json::from_str(extracted).map_err(|e| e.to_string())
}

/// Truncate a string with an ellipsis.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}
