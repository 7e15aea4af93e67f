//! Group folder name validation.
//!
//! Folder names become filesystem paths, queue keys, container names, and
//! mount sources; a hostile name must never escape the groups tree.

/// Maximum folder name length. Keeps container names well under engine
/// limits once the `agent-{folder}-{epoch_ms}` prefix and suffix are added.
const MAX_FOLDER_LEN: usize = 64;

/// Whether a folder name is safe to use as a path component.
pub fn is_safe_folder(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FOLDER_LEN
        && !name.starts_with('-')
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Derive a safe folder name from a display name.
///
/// Lowercases, maps whitespace and punctuation runs to single dashes, and
/// trims to the length limit. Returns `None` when nothing usable remains.
pub fn sanitize_folder(name: &str) -> Option<String> {
    let mut out = String::new();
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if c == '_' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    let truncated: String = trimmed.chars().take(MAX_FOLDER_LEN).collect();
    let cleaned = truncated.trim_matches('-').to_string();
    if is_safe_folder(&cleaned) {
        Some(cleaned)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_are_safe() {
        assert!(is_safe_folder("main"));
        assert!(is_safe_folder("team-eng"));
        assert!(is_safe_folder("ops_2"));
    }

    #[test]
    fn traversal_and_separators_are_rejected() {
        assert!(!is_safe_folder(".."));
        assert!(!is_safe_folder("a/b"));
        assert!(!is_safe_folder("a\\b"));
        assert!(!is_safe_folder(".hidden"));
        assert!(!is_safe_folder("-flag"));
        assert!(!is_safe_folder(""));
    }

    #[test]
    fn sanitize_display_names() {
        assert_eq!(sanitize_folder("Team Eng!").as_deref(), Some("team-eng"));
        assert_eq!(sanitize_folder("  Ops / Infra ").as_deref(), Some("ops-infra"));
        assert_eq!(sanitize_folder("日本語"), None);
    }

    #[test]
    fn sanitize_enforces_length() {
        let long = "x".repeat(200);
        let out = sanitize_folder(&long).unwrap();
        assert!(out.len() <= 64);
    }
}
