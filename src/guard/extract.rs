use crate::error::GuardError;

const FENCE: &str = "```";
const SELECT: &str = "select";

/// Text believed to hold a single SELECT statement, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateStatement {
    pub text: String,
    /// Whether the text was taken from a fenced code block.
    pub from_fence: bool,
}

/// Isolate the most plausible SQL statement in free-form model output.
///
/// The last fenced block mentioning `select` wins; without one the whole
/// text is searched. Everything before the first `select` is treated as
/// preamble and dropped.
pub fn extract_candidate(raw: &str) -> Result<CandidateStatement, GuardError> {
    let (scope, from_fence) = match last_select_block(raw) {
        Some(block) => (block, true),
        None => (raw, false),
    };

    let start = find_select(scope).ok_or(GuardError::ExtractionEmpty)?;
    let text = scope[start..].trim_end().to_string();

    Ok(CandidateStatement { text, from_fence })
}

/// Contents of the last fenced block containing `select`. Segments at odd
/// positions after splitting on the fence marker are inside a block; an
/// unterminated final fence yields an odd segment running to the end.
fn last_select_block(raw: &str) -> Option<&str> {
    if !raw.contains(FENCE) {
        return None;
    }
    raw.split(FENCE)
        .enumerate()
        .filter(|(i, _)| i % 2 == 1)
        .map(|(_, block)| block)
        .filter(|block| block.to_ascii_lowercase().contains(SELECT))
        .last()
}

/// Byte offset of the first `select`, preferring a whole-word occurrence so
/// that words like "selected" in a preamble are skipped.
fn find_select(text: &str) -> Option<usize> {
    // ASCII lowercasing keeps byte offsets aligned with `text`.
    let lower = text.to_ascii_lowercase();
    let bytes = lower.as_bytes();

    let is_ident = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let whole_word = lower.match_indices(SELECT).map(|(i, _)| i).find(|&i| {
        let before_ok = i == 0 || !is_ident(bytes[i - 1]);
        let after = i + SELECT.len();
        let after_ok = after >= bytes.len() || !is_ident(bytes[after]);
        before_ok && after_ok
    });

    whole_word.or_else(|| lower.find(SELECT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_statement() {
        let c = extract_candidate("SELECT * FROM orders").unwrap();
        assert_eq!(c.text, "SELECT * FROM orders");
        assert!(!c.from_fence);
    }

    #[test]
    fn test_preamble_is_dropped() {
        let c = extract_candidate("Here is the query you asked for: select id from t").unwrap();
        assert_eq!(c.text, "select id from t");
    }

    #[test]
    fn test_fenced_block_with_language_tag() {
        let raw = "Sure! ```sql\nSELECT category, SUM(price) FROM items GROUP BY category LIMIT 10 LIMIT 5\n```";
        let c = extract_candidate(raw).unwrap();
        assert!(c.from_fence);
        assert_eq!(
            c.text,
            "SELECT category, SUM(price) FROM items GROUP BY category LIMIT 10 LIMIT 5"
        );
        assert!(!c.text.contains("```"));
    }

    #[test]
    fn test_last_matching_block_wins() {
        let raw = "```sql\nSELECT 1\n```\nor better:\n```sql\nSELECT 2\n```\n```text\nno query\n```";
        let c = extract_candidate(raw).unwrap();
        assert_eq!(c.text, "SELECT 2");
    }

    #[test]
    fn test_text_between_blocks_is_not_a_block() {
        let raw = "```json\n{}\n```\nselect from prose\n```\nnothing\n```";
        let c = extract_candidate(raw).unwrap();
        // No fenced block mentions select, so the whole text is searched.
        assert!(!c.from_fence);
        assert!(c.text.starts_with("select from prose"));
    }

    #[test]
    fn test_unterminated_fence() {
        let c = extract_candidate("```sql\nSELECT a FROM b\n").unwrap();
        assert!(c.from_fence);
        assert_eq!(c.text, "SELECT a FROM b");
    }

    #[test]
    fn test_whole_word_preferred() {
        let c = extract_candidate("I selected this: SELECT a FROM b").unwrap();
        assert_eq!(c.text, "SELECT a FROM b");
    }

    #[test]
    fn test_substring_fallback() {
        let c = extract_candidate("preselection").unwrap();
        assert_eq!(c.text, "selection");
    }

    #[test]
    fn test_empty_and_whitespace_input() {
        assert_eq!(extract_candidate(""), Err(GuardError::ExtractionEmpty));
        assert_eq!(extract_candidate("   \n\t "), Err(GuardError::ExtractionEmpty));
        assert_eq!(
            extract_candidate("I cannot answer that."),
            Err(GuardError::ExtractionEmpty)
        );
    }

    #[test]
    fn test_statement_without_select_after_preamble() {
        assert_eq!(
            extract_candidate("DROP TABLE orders"),
            Err(GuardError::ExtractionEmpty)
        );
    }
}
