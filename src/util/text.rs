//! テキスト正規化の小物。
use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static CORPORATE_DESIGNATORS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)株式会社|有限会社|合同会社|\(株\)|\(有\)|㈱|\bco\.?,?\s*ltd\b\.?|\binc\b\.?|\bcorporation\b|\bcorp\b\.?",
    )
    .expect("compile corporate designator pattern")
});

/// 企業名を完全一致比較用に正規化する。
///
/// NFKC 正規化、法人格表記の除去、空白の除去、ASCII 小文字化を行う。
#[must_use]
pub fn normalize_company_name(raw: &str) -> String {
    let nfkc: String = raw.nfkc().collect();
    let stripped = CORPORATE_DESIGNATORS.replace_all(&nfkc, "");
    stripped
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',' && *c != '.')
        .collect::<String>()
        .to_ascii_lowercase()
}

/// 先頭から最大 `max_chars` 文字を切り出す（文字境界を保つ）。
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

/// `keywords` のいずれかが `text` に含まれるか（大文字小文字を区別する）。
#[must_use]
pub fn contains_any<S: AsRef<str>>(text: &str, keywords: &[S]) -> bool {
    keywords.iter().any(|keyword| text.contains(keyword.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("株式会社ＮＥＣ", "nec")]
    #[case("NEC Corporation", "nec")]
    #[case("ＪＲ東海", "jr東海")]
    #[case("日本電気(株)", "日本電気")]
    #[case("Acme Co., Ltd.", "acme")]
    #[case("  J-POWER  ", "j-power")]
    fn normalizes_company_names(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize_company_name(raw), expected);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("自動車部品", 3), "自動車");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn contains_any_is_case_sensitive() {
        assert!(contains_any("LLMを提供開始", &["LLM"]));
        assert!(!contains_any("llmを提供開始", &["LLM"]));
    }
}
