//! Spoken-number patterns for chapter headings.
//!
//! Recognition output is noisy: "one" arrives as "won", "four" as
//! "for", "eight" as "ate". Each entry matches the number word as a
//! recognizer is likely to have heard it.

use regex_lite::Regex;

/// Index N matches the spoken forms of N. Covers 0–99, which is as far
/// as any audiobook heading realistically goes in one file.
pub(crate) const NUMBER_PATTERNS: [&str; 100] = [
    "zero",
    "(one|won)",
    "(two|to|too)",
    "three",
    "(for|four)",
    "(five|fife)",
    "(six|sex)",
    "seven",
    "(ate|eight)",
    "nine",
    "ten",
    "eleven",
    "twelve",
    "thirteen",
    "fourteen",
    "fifteen",
    "sixteen",
    "seventeen",
    "eighteen",
    "nine?teen",
    "twenty",
    "twenty[- ]one",
    "twenty[- ]two",
    "twenty[- ]three",
    "twenty[- ]four",
    "twenty[- ]five",
    "twenty[- ]six",
    "twenty[- ]seven",
    "twenty[- ]eight",
    "twenty[- ]nine",
    "thirty",
    "thirty[- ]one",
    "thirty[- ]two",
    "thirty[- ]three",
    "thirty[- ]four",
    "thirty[- ]five",
    "thirty[- ]six",
    "thirty[- ]seven",
    "thirty[- ]eight",
    "thirty[- ]nine",
    "forty",
    "forty[- ]one",
    "forty[- ]two",
    "forty[- ]three",
    "forty[- ]four",
    "forty[- ]five",
    "forty[- ]six",
    "forty[- ]seven",
    "forty[- ]eight",
    "forty[- ]nine",
    "fifty",
    "fifty[- ]one",
    "fifty[- ]two",
    "fifty[- ]three",
    "fifty[- ]four",
    "fifty[- ]five",
    "fifty[- ]six",
    "fifty[- ]seven",
    "fifty[- ]eight",
    "fifty[- ]nine",
    "sixty",
    "sixty[- ]one",
    "sixty[- ]two",
    "sixty[- ]three",
    "sixty[- ]four",
    "sixty[- ]five",
    "sixty[- ]six",
    "sixty[- ]seven",
    "sixty[- ]eight",
    "sixty[- ]nine",
    "seventy",
    "seventy[- ]one",
    "seventy[- ]two",
    "seventy[- ]three",
    "seventy[- ]four",
    "seventy[- ]five",
    "seventy[- ]six",
    "seventy[- ]seven",
    "seventy[- ]eight",
    "seventy[- ]nine",
    "eighty",
    "eighty[- ]one",
    "eighty[- ]two",
    "eighty[- ]three",
    "eighty[- ]four",
    "eighty[- ]five",
    "eighty[- ]six",
    "eighty[- ]seven",
    "eighty[- ]eight",
    "eighty[- ]nine",
    "ninety",
    "ninety[- ]one",
    "ninety[- ]two",
    "ninety[- ]three",
    "ninety[- ]four",
    "ninety[- ]five",
    "ninety[- ]six",
    "ninety[- ]seven",
    "ninety[- ]eight",
    "ninety[- ]nine",
];

/// `^Chapter <number> ` at the start of a transcript. The trailing
/// space requires more speech after the heading, which keeps a bare
/// "chapter two" announcement from matching mid-recording noise.
pub(crate) fn strict_heading(number: usize) -> Option<Regex> {
    let pattern = NUMBER_PATTERNS.get(number)?;
    Regex::new(&format!("(?i)^Chapter {pattern} ")).ok()
}

/// `^<number> ` without the "Chapter" keyword, for books whose headings
/// drop it or whose recognizer mangled it.
pub(crate) fn loose_heading(number: usize) -> Option<Regex> {
    let pattern = NUMBER_PATTERNS.get(number)?;
    Regex::new(&format!("(?i)^{pattern} ")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_heading_matches_compound_numbers() {
        let re = strict_heading(21).unwrap();
        assert!(re.is_match("Chapter twenty one the escape"));
        assert!(re.is_match("chapter twenty-one begins"));
        assert!(!re.is_match("Chapter twenty two the escape"));
    }

    #[test]
    fn strict_heading_requires_trailing_speech() {
        let re = strict_heading(3).unwrap();
        assert!(re.is_match("Chapter three the road"));
        assert!(!re.is_match("Chapter three"));
    }

    #[test]
    fn homophones_are_accepted() {
        assert!(strict_heading(1).unwrap().is_match("Chapter won the boy"));
        assert!(strict_heading(2).unwrap().is_match("Chapter too the girl"));
        assert!(strict_heading(4).unwrap().is_match("Chapter for a while"));
        assert!(strict_heading(8).unwrap().is_match("Chapter ate dinner"));
        assert!(strict_heading(19).unwrap().is_match("Chapter nineteen ends"));
        assert!(strict_heading(19).unwrap().is_match("Chapter ninteen ends"));
    }

    #[test]
    fn loose_heading_drops_the_keyword() {
        let re = loose_heading(7).unwrap();
        assert!(re.is_match("seven the last stand"));
        assert!(!re.is_match("chapter seven the last stand"));
    }

    #[test]
    fn out_of_range_numbers_have_no_pattern() {
        assert!(strict_heading(100).is_none());
        assert!(loose_heading(100).is_none());
    }
}
