//! Path component sanitization for rendered destination templates.
//!
//! Values come from media metadata and may contain anything: separators that
//! would create unintended directories, characters Windows rejects, control
//! characters, runs of whitespace. Unicode text (CJK titles and the like) is
//! preserved.

/// Characters removed from a component, including both path separators.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Windows reserved filenames (case-insensitive)
const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Placeholder used when nothing printable is left.
pub const EMPTY_COMPONENT: &str = "Unknown";

/// Sanitize one path component.
///
/// - removes control characters and `<>:"/\|?*`
/// - collapses whitespace runs into a single space
/// - trims leading/trailing spaces and dots
/// - prefixes Windows reserved names with `_`
/// - returns `"Unknown"` if nothing is left
///
/// ```
/// use vpo_worker::utils::filename::sanitize_component;
///
/// assert_eq!(sanitize_component("AC/DC: Live"), "ACDC Live");
/// assert_eq!(sanitize_component("  ..  "), "Unknown");
/// ```
pub fn sanitize_component(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut pending_space = false;

    for c in input.chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if c.is_control() || INVALID_CHARS.contains(&c) {
            continue;
        }
        if pending_space && !result.is_empty() {
            result.push(' ');
        }
        pending_space = false;
        result.push(c);
    }

    let trimmed = result.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return EMPTY_COMPONENT.to_string();
    }

    let upper = trimmed.to_uppercase();
    for reserved in WINDOWS_RESERVED_NAMES {
        if upper == *reserved || upper.starts_with(&format!("{}.", reserved)) {
            return format!("_{}", trimmed);
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_invisible_input() {
        assert_eq!(sanitize_component(""), "Unknown");
        assert_eq!(sanitize_component("   "), "Unknown");
        assert_eq!(sanitize_component("???"), "Unknown");
        assert_eq!(sanitize_component("..."), "Unknown");
    }

    #[test]
    fn test_separators_removed() {
        assert_eq!(sanitize_component("a/b\\c"), "abc");
        assert_eq!(sanitize_component("../../etc"), "etc");
    }

    #[test]
    fn test_invalid_characters_removed() {
        assert_eq!(sanitize_component("What? <Really>"), "What Really");
        assert_eq!(sanitize_component("a:b|c*d\"e"), "abcde");
    }

    #[test]
    fn test_whitespace_collapsed() {
        assert_eq!(sanitize_component("  The   Matrix\t\n1999 "), "The Matrix 1999");
    }

    #[test]
    fn test_control_characters() {
        assert_eq!(sanitize_component("hello\x00world"), "helloworld");
    }

    #[test]
    fn test_leading_trailing_dots() {
        assert_eq!(sanitize_component("...hello..."), "hello");
        assert_eq!(sanitize_component(" . hello . "), "hello");
    }

    #[test]
    fn test_windows_reserved_names() {
        assert_eq!(sanitize_component("CON"), "_CON");
        assert_eq!(sanitize_component("nul.mkv"), "_nul.mkv");
    }

    #[test]
    fn test_unicode_preserved() {
        assert_eq!(sanitize_component("千と千尋の神隠し"), "千と千尋の神隠し");
        assert_eq!(sanitize_component("기생충?"), "기생충");
    }

    #[test]
    fn test_idempotency() {
        for input in ["hello?world", "  a  b ", "CON", "...dots...", "x/y"] {
            let once = sanitize_component(input);
            assert_eq!(once, sanitize_component(&once), "input: {input}");
        }
    }
}
