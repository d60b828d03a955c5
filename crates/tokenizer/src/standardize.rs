use regex::Regex;
use std::sync::OnceLock;

/// Punctuation removed during standardization. `<` and `>` are kept so that
/// `<start>` / `<end>` markers stay intact.
pub const STRIP_CHARS: &str = "!\"#$%&'()*+,-./:;=?@[\\]^_`{|}~";

fn strip_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let class = format!("[{}0-9]", regex::escape(STRIP_CHARS));
        Regex::new(&class).expect("static character class")
    })
}

/// Lowercases `text` and drops punctuation and digits.
pub fn standardize(text: &str) -> String {
    let lower = text.to_lowercase();
    strip_regex().replace_all(&lower, "").into_owned()
}

/// Unigram split of an already standardized string.
pub fn split_unigrams(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace()
}
