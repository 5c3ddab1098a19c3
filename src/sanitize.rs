//! Japanese character policy for generated replies
//!
//! The language model occasionally emits long digit runs, leaked English
//! tokens or stray control characters. Replies are cleaned down to an
//! allow-list of Japanese script, short alphanumerics, punctuation and
//! whitespace; anything that does not survive as readable Japanese is
//! replaced wholesale by a fallback apology.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::{Error, Result};

/// Reply used when cleaned text fails the acceptance gate
pub const DEFAULT_FALLBACK: &str =
    "申し訳ございませんが、適切な回答を生成できませんでした。もう一度お試しください。";

/// Five or more digits in a row, ASCII or full-width
static DIGIT_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9０-９]{5,}").expect("valid regex"));

/// Ten or more Latin letters in a row, ASCII or full-width
static LATIN_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-zＡ-Ｚａ-ｚ]{10,}").expect("valid regex"));

/// Anything outside the allow-list
static DISALLOWED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"[^",
        r"\x{3040}-\x{309F}",
        r"\x{30A0}-\x{30FF}",
        r"\x{FF66}-\x{FF9F}",
        r"\x{3400}-\x{4DBF}",
        r"\x{4E00}-\x{9FFF}",
        r"\x{F900}-\x{FAFF}",
        r"々〇",
        r"0-9０-９A-Za-zＡ-Ｚａ-ｚ",
        r"、。，．！？!?,.・「」『』（）()〜～…：:",
        r"\s",
        r"]",
    ))
    .expect("valid regex")
});

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Acceptance thresholds and fallback text
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SanitizerPolicy {
    /// Minimum length in characters of an accepted reply
    pub min_length: usize,
    /// Minimum number of Japanese-script characters in an accepted reply
    pub min_script_chars: usize,
    /// Text returned when a reply is rejected
    pub fallback: String,
}

impl Default for SanitizerPolicy {
    fn default() -> Self {
        Self {
            min_length: 10,
            min_script_chars: 1,
            fallback: DEFAULT_FALLBACK.to_string(),
        }
    }
}

/// Filters reply text down to the character policy
#[derive(Debug, Clone)]
pub struct TextSanitizer {
    policy: SanitizerPolicy,
}

impl Default for TextSanitizer {
    fn default() -> Self {
        Self {
            policy: SanitizerPolicy::default(),
        }
    }
}

impl TextSanitizer {
    /// Create a sanitizer with a custom policy
    ///
    /// # Errors
    ///
    /// Returns error if the fallback text would itself be altered by the
    /// character policy
    pub fn new(policy: SanitizerPolicy) -> Result<Self> {
        if policy.fallback.trim().is_empty() {
            return Err(Error::Config("sanitizer fallback must not be empty".to_string()));
        }

        let cleaned = clean(&policy.fallback);
        if cleaned != policy.fallback {
            return Err(Error::Config(format!(
                "sanitizer fallback does not satisfy the character policy (would become {cleaned:?})"
            )));
        }

        Ok(Self { policy })
    }

    /// Active policy
    #[must_use]
    pub const fn policy(&self) -> &SanitizerPolicy {
        &self.policy
    }

    /// Fallback text
    #[must_use]
    pub fn fallback(&self) -> &str {
        &self.policy.fallback
    }

    /// Clean `text` and apply the acceptance gate
    ///
    /// Always returns either policy-conformant text or exactly the fallback.
    #[must_use]
    pub fn sanitize(&self, text: &str) -> String {
        let cleaned = clean(text);

        if self.accepts(&cleaned) {
            return cleaned;
        }

        tracing::debug!(
            original_chars = text.chars().count(),
            cleaned_chars = cleaned.chars().count(),
            "reply rejected by character policy, using fallback"
        );
        self.policy.fallback.clone()
    }

    /// Whether already-cleaned text passes the acceptance gate
    #[must_use]
    pub fn accepts(&self, cleaned: &str) -> bool {
        let length = cleaned.chars().count();
        let script = cleaned.chars().filter(|&c| is_japanese_script(c)).count();

        length >= self.policy.min_length && script >= self.policy.min_script_chars.max(1)
    }
}

/// Apply the cleaning steps until the text stops changing
///
/// Removing a disallowed character can join two short digit runs into a long
/// one, so a single pass is not a fixpoint.
#[must_use]
pub fn clean(text: &str) -> String {
    let mut current = clean_once(text);
    loop {
        let next = clean_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn clean_once(text: &str) -> String {
    let text = DIGIT_RUNS.replace_all(text, "");
    let text = LATIN_RUNS.replace_all(&text, "");
    let text = DISALLOWED.replace_all(&text, "");
    let text = WHITESPACE.replace_all(&text, " ");
    text.trim().to_string()
}

/// Hiragana, katakana (full and half width) and CJK ideographs
#[must_use]
pub const fn is_japanese_script(c: char) -> bool {
    matches!(
        c,
        '\u{3040}'..='\u{309F}'
            | '\u{30A0}'..='\u{30FF}'
            | '\u{FF66}'..='\u{FF9F}'
            | '\u{3400}'..='\u{4DBF}'
            | '\u{4E00}'..='\u{9FFF}'
            | '\u{F900}'..='\u{FAFF}'
            | '々'
            | '〇'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer() -> TextSanitizer {
        TextSanitizer::default()
    }

    #[test]
    fn test_clean_japanese_passes_through() {
        let text = "こんにちは、今日はいい天気ですね。";
        assert_eq!(sanitizer().sanitize(text), text);
    }

    #[test]
    fn test_strips_long_digit_runs() {
        let out = sanitizer().sanitize("お問い合わせ番号は1234567です。よろしくお願いします。");
        assert_eq!(out, "お問い合わせ番号はです。よろしくお願いします。");
    }

    #[test]
    fn test_keeps_short_numbers() {
        let text = "会議は3時から2024年の計画について話します。";
        assert_eq!(sanitizer().sanitize(text), text);
    }

    #[test]
    fn test_strips_long_latin_runs_keeps_short() {
        let out = sanitizer().sanitize("AIはとても便利です。somethingverylong の話です。");
        assert_eq!(out, "AIはとても便利です。 の話です。");
    }

    #[test]
    fn test_removes_disallowed_characters() {
        let out = sanitizer().sanitize("ありがとう😀ございます\u{0007}。안녕 またね！");
        assert_eq!(out, "ありがとうございます。 またね！");
    }

    #[test]
    fn test_collapses_whitespace() {
        let out = sanitizer().sanitize("  はい、\n\n  わかりました。\t了解です。  ");
        assert_eq!(out, "はい、 わかりました。 了解です。");
    }

    #[test]
    fn test_short_reply_falls_back() {
        assert_eq!(sanitizer().sanitize("はい"), DEFAULT_FALLBACK);
    }

    #[test]
    fn test_reply_without_japanese_falls_back() {
        assert_eq!(sanitizer().sanitize("OK, see you at 10 then."), DEFAULT_FALLBACK);
    }

    #[test]
    fn test_only_disallowed_characters_yield_fallback() {
        assert_eq!(sanitizer().sanitize("안녕하세요 Привет мир 🎉🎉"), DEFAULT_FALLBACK);
        assert_eq!(sanitizer().sanitize(""), DEFAULT_FALLBACK);
    }

    #[test]
    fn test_joined_digit_runs_are_stripped() {
        // Removing the Hangul joins "12" and "345" into a five-digit run
        let once = sanitizer().sanitize("番号は12한345です。確認してください。");
        assert_eq!(once, "番号はです。確認してください。");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let s = sanitizer();
        let inputs = [
            "こんにちは、今日はいい天気ですね。",
            "番号は12한345です。確認してください。",
            "abcdefghijk12345あいうえおかきくけこ",
            "  改行\nと　全角スペース　のテスト文章です ",
            "😀",
            "ＡＢＣＤＥＦＧＨＩＪＫ日本語のテキストです。",
        ];

        for input in inputs {
            let once = s.sanitize(input);
            assert_eq!(s.sanitize(&once), once, "input: {input:?}");
        }
    }

    #[test]
    fn test_fallback_survives_policy() {
        assert_eq!(clean(DEFAULT_FALLBACK), DEFAULT_FALLBACK);
        assert!(sanitizer().accepts(DEFAULT_FALLBACK));
    }

    #[test]
    fn test_custom_thresholds() {
        let s = TextSanitizer::new(SanitizerPolicy {
            min_length: 2,
            ..SanitizerPolicy::default()
        })
        .unwrap();

        assert_eq!(s.sanitize("はい"), "はい");
    }

    #[test]
    fn test_rejects_nonconforming_fallback() {
        let result = TextSanitizer::new(SanitizerPolicy {
            fallback: "エラー😢が発生しました。".to_string(),
            ..SanitizerPolicy::default()
        });

        assert!(matches!(result, Err(Error::Config(_))));
    }
}
