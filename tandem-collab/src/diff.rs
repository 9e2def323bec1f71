//! Single-region text diff.
//!
//! Strips the longest common prefix and suffix (in chars) and reports what
//! is left as one [`TextEdit`]. Good enough for reconciling a widget with
//! its replica after a missed event; not a general-purpose diff.

use tandem_core::TextEdit;

/// Minimal single-region edit turning `old` into `new`, or `None` if equal.
pub fn minimal_edit(old: &str, new: &str) -> Option<TextEdit> {
    if old == new {
        return None;
    }
    let old: Vec<char> = old.chars().collect();
    let new: Vec<char> = new.chars().collect();

    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();

    // Suffix may not eat into the prefix on either side.
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let deleted = old.len() - prefix - suffix;
    let inserted: String = new[prefix..new.len() - suffix].iter().collect();
    Some(TextEdit::new(prefix, deleted, inserted))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(old: &str, new: &str) -> TextEdit {
        let edit = minimal_edit(old, new).unwrap();
        let mut text = old.to_string();
        edit.apply_to(&mut text);
        assert_eq!(text, new);
        edit
    }

    #[test]
    fn test_equal_is_none() {
        assert_eq!(minimal_edit("same", "same"), None);
        assert_eq!(minimal_edit("", ""), None);
    }

    #[test]
    fn test_insert_in_middle() {
        assert_eq!(check("hello world", "hello brave world"), TextEdit::insert(6, "brave "));
    }

    #[test]
    fn test_delete_at_end() {
        assert_eq!(check("abcdef", "abc"), TextEdit::delete(3, 3));
    }

    #[test]
    fn test_replace() {
        assert_eq!(check("the cat sat", "the dog sat"), TextEdit::new(4, 3, "dog"));
    }

    #[test]
    fn test_repeated_chars_do_not_overlap() {
        // "aaa" -> "aaaa": prefix takes all of old, suffix must stay empty.
        assert_eq!(check("aaa", "aaaa"), TextEdit::insert(3, "a"));
        assert_eq!(check("abab", "ab"), TextEdit::delete(2, 2));
    }

    #[test]
    fn test_from_and_to_empty() {
        assert_eq!(check("", "new"), TextEdit::insert(0, "new"));
        assert_eq!(check("old", ""), TextEdit::delete(0, 3));
    }

    #[test]
    fn test_multibyte_offsets_are_chars() {
        assert_eq!(check("héllo", "héllø"), TextEdit::new(4, 1, "ø"));
        assert_eq!(check("日本", "日本語"), TextEdit::insert(2, "語"));
    }
}
