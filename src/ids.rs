//! Identifier generation for workflows, tasks and executions.

use chrono::Utc;
use rand::Rng;

/// Generate a workflow id of the form `wf-<YYYYMMDD>-<HHMMSS>-<rand4>`.
///
/// The random suffix disambiguates workflows created within the same second.
pub fn workflow_id() -> String {
    let now = Utc::now();
    let suffix: String = rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(4)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("wf-{}-{}-{}", now.format("%Y%m%d"), now.format("%H%M%S"), suffix)
}

/// Generate a fresh execution id for one runner attempt at a workflow.
pub fn execution_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Convert a title to a URL-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Derive a stable task id from a position and name, e.g. `task-03-add-jwt-middleware`.
pub fn task_id(index: usize, name: &str) -> String {
    format!("task-{:02}-{}", index, slugify(name, 30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_id_has_expected_shape() {
        let id = workflow_id();
        assert!(id.starts_with("wf-"));
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[1].len(), 8); // YYYYMMDD
        assert_eq!(parts[2].len(), 6); // HHMMSS
        assert_eq!(parts[3].len(), 4);
    }

    #[test]
    fn workflow_ids_are_unique() {
        let a = workflow_id();
        let b = workflow_id();
        assert_ne!(a, b);
    }

    #[test]
    fn slugify_basic() {
        assert_eq!(slugify("Add JWT middleware", 40), "add-jwt-middleware");
        assert_eq!(slugify("Fix: API/v2 bug!!", 40), "fix-api-v2-bug");
    }

    #[test]
    fn slugify_truncates_without_trailing_dash() {
        let slug = slugify("a very long task name that keeps going", 10);
        assert!(slug.len() <= 10);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn task_id_is_stable() {
        assert_eq!(task_id(3, "Add JWT middleware"), "task-03-add-jwt-middleware");
    }
}
