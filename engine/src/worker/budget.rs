//! Character budget for analysis input

/// Content cut to a character budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bounded {
    pub text: String,
    pub truncated: bool,
}

/// Keep at most `budget` characters of `text`
///
/// Counts Unicode scalar values, so multi-byte characters are never split.
/// The same input always produces the same output.
pub fn bound_content(text: &str, budget: usize) -> Bounded {
    match text.char_indices().nth(budget) {
        Some((cut, _)) => Bounded {
            text: text[..cut].to_string(),
            truncated: true,
        },
        None => Bounded {
            text: text.to_string(),
            truncated: false,
        },
    }
}
