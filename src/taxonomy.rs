//! 分類ラベル集合と旧ラベルの読み替え。
use std::{borrow::Cow, cmp::Reverse};

use crate::tables::{LabelEntry, RemapEntry, TablesError};

const TRIM_CHARS: &[char] = &['「', '」', '『', '』', '"', '\'', '“', '”', '`'];

/// 順序付き・不変のラベル集合。
///
/// 各ラベルは英語の正規名と日本語の別名を持つ。外部サービスの応答はどちらの表記でも受け付けるが、
/// 分類結果として返すのは常に正規名。
#[derive(Debug, Clone)]
pub struct Taxonomy {
    version: String,
    labels: Vec<LabelEntry>,
    fallback: String,
    fallback_alias: String,
    legacy: Vec<RemapEntry>,
}

impl Taxonomy {
    /// ラベル一覧と旧ラベル対応表からタクソノミーを構築する。
    ///
    /// # Errors
    /// 対応表の移行先がラベル集合に含まれない場合は [`TablesError::UnknownLabel`] を返す。
    pub fn new(
        version: impl Into<String>,
        labels: Vec<LabelEntry>,
        fallback: impl Into<String>,
        fallback_alias: impl Into<String>,
        legacy: Vec<RemapEntry>,
    ) -> Result<Self, TablesError> {
        let taxonomy = Self {
            version: version.into(),
            labels,
            fallback: fallback.into(),
            fallback_alias: fallback_alias.into(),
            legacy: Vec::new(),
        };
        for entry in &legacy {
            if !taxonomy.contains(&entry.to) {
                return Err(TablesError::UnknownLabel {
                    table: "legacy_remap",
                    label: entry.to.clone(),
                });
            }
        }
        Ok(Self { legacy, ..taxonomy })
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// 宣言順のラベル名。
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|entry| entry.label.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// どの段でも決まらなかった場合のラベル（"Other"）。
    #[must_use]
    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        self.labels.iter().any(|entry| entry.label == label)
    }

    /// 最終ラベルとして有効か（タクソノミー ∪ フォールバック）。
    #[must_use]
    pub fn is_valid_result(&self, label: &str) -> bool {
        label == self.fallback || self.contains(label)
    }

    /// 外部から受け取ったラベル文字列を正規名に変換する。
    ///
    /// 前後の空白と括弧・引用符を除去した上で、英語名（ASCII 大文字小文字無視）、日本語別名、
    /// 旧ラベルの完全一致の順に照合する。どれにも当たらなければ `None`。
    #[must_use]
    pub fn canonicalize(&self, raw: &str) -> Option<&str> {
        let cleaned = raw.trim().trim_matches(TRIM_CHARS).trim();
        if cleaned.is_empty() {
            return None;
        }

        if let Some(entry) = self
            .labels
            .iter()
            .find(|entry| entry.label.eq_ignore_ascii_case(cleaned) || entry.alias == cleaned)
        {
            return Some(entry.label.as_str());
        }

        self.legacy
            .iter()
            .find(|entry| entry.from == cleaned)
            .map(|entry| entry.to.as_str())
    }

    /// 業種テキストに旧ラベルが含まれていれば、テキスト全体を対応する正規ラベルへ置き換える。
    ///
    /// 複数の候補を含む場合は最長のキーを採る。同じ長さなら別名、次いで宣言順で先の旧ラベル。
    /// すでに正規ラベル（もしくはその別名）と一致するテキストは正規名に揃えるだけで、
    /// 旧ラベルの部分一致では書き換えない。
    #[must_use]
    pub fn remap_legacy<'a>(&'a self, text: &'a str) -> Cow<'a, str> {
        let trimmed = text.trim();
        if let Some(entry) = self
            .labels
            .iter()
            .find(|entry| entry.label == trimmed || entry.alias == trimmed)
        {
            return Cow::Borrowed(entry.label.as_str());
        }

        let legacy: Vec<(&str, &str)> = self
            .legacy
            .iter()
            .filter(|entry| trimmed.contains(&entry.from))
            .map(|entry| (entry.from.as_str(), entry.to.as_str()))
            .collect();
        if legacy.is_empty() {
            return Cow::Borrowed(text);
        }

        // 旧ラベルを内包するより長い別名（例: 金融サービス）があればそちらを優先する。
        let aliases = self
            .labels
            .iter()
            .filter(|entry| trimmed.contains(&entry.alias))
            .map(|entry| (entry.alias.as_str(), entry.label.as_str()));
        aliases
            .chain(legacy)
            .min_by_key(|(key, _)| Reverse(key.chars().count()))
            .map_or(Cow::Borrowed(text), |(_, label)| Cow::Borrowed(label))
    }

    /// 正規名に対応する日本語別名。
    #[must_use]
    pub fn alias_of(&self, label: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|entry| entry.label == label)
            .map(|entry| entry.alias.as_str())
    }

    /// プロンプト用の箇条書き。`- Automotive（自動車）` の形式。
    #[must_use]
    pub fn prompt_listing(&self, excluded: Option<&str>) -> String {
        self.labels
            .iter()
            .filter(|entry| Some(entry.label.as_str()) != excluded)
            .map(|entry| format!("- {}（{}）", entry.label, entry.alias))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub(crate) fn fallback_alias(&self) -> &str {
        &self.fallback_alias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn entry(label: &str, alias: &str) -> LabelEntry {
        LabelEntry {
            label: label.to_string(),
            alias: alias.to_string(),
        }
    }

    fn remap(from: &str, to: &str) -> RemapEntry {
        RemapEntry {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    fn sample() -> Taxonomy {
        Taxonomy::new(
            "test",
            vec![
                entry("Industrial Machinery", "産業機械"),
                entry("Information/Communications", "情報通信"),
                entry("Banking/Securities", "銀行・証券"),
                entry("Government/Public Sector", "官公庁・地方自治体・公的機関"),
            ],
            "Other",
            "その他",
            vec![
                remap("製造・プロセス", "Industrial Machinery"),
                remap("通信", "Information/Communications"),
                remap("金融機関", "Banking/Securities"),
                remap("公共", "Government/Public Sector"),
            ],
        )
        .expect("taxonomy builds")
    }

    #[rstest]
    #[case("Banking/Securities", Some("Banking/Securities"))]
    #[case("banking/securities", Some("Banking/Securities"))]
    #[case("  「銀行・証券」 ", Some("Banking/Securities"))]
    #[case("\"Industrial Machinery\"", Some("Industrial Machinery"))]
    #[case("金融機関", Some("Banking/Securities"))]
    #[case("Fintech", None)]
    #[case("", None)]
    fn canonicalize_accepts_labels_aliases_and_legacy_keys(
        #[case] raw: &str,
        #[case] expected: Option<&str>,
    ) {
        assert_eq!(sample().canonicalize(raw), expected);
    }

    #[test]
    fn remap_replaces_whole_text_when_legacy_key_is_contained() {
        let taxonomy = sample();
        assert_eq!(
            taxonomy.remap_legacy("製造・プロセス（組立）"),
            "Industrial Machinery"
        );
        assert_eq!(
            taxonomy.remap_legacy("地域金融機関向け"),
            "Banking/Securities"
        );
    }

    #[test]
    fn remap_keeps_canonical_alias_intact() {
        let taxonomy = sample();
        // "情報通信" contains the legacy key "通信" but is already canonical.
        assert_eq!(
            taxonomy.remap_legacy("情報通信"),
            "Information/Communications"
        );
    }

    #[test]
    fn remap_leaves_unknown_text_untouched() {
        let taxonomy = sample();
        assert_eq!(taxonomy.remap_legacy("サービス業"), "サービス業");
    }

    #[test]
    fn equally_long_legacy_keys_resolve_in_declared_order() {
        let taxonomy = sample();
        assert_eq!(
            taxonomy.remap_legacy("公共通信インフラ"),
            "Information/Communications"
        );
    }

    #[test]
    fn unknown_remap_target_is_rejected() {
        let error = Taxonomy::new(
            "test",
            vec![entry("Automotive", "自動車")],
            "Other",
            "その他",
            vec![remap("車両", "Vehicles")],
        )
        .expect_err("unknown label must fail");
        assert!(matches!(error, TablesError::UnknownLabel { .. }));
    }

    #[test]
    fn prompt_listing_skips_excluded_label() {
        let listing = sample().prompt_listing(Some("Banking/Securities"));
        assert!(listing.contains("- Industrial Machinery（産業機械）"));
        assert!(!listing.contains("Banking/Securities"));
    }

    #[test]
    fn fallback_is_a_valid_result() {
        let taxonomy = sample();
        assert!(taxonomy.is_valid_result("Other"));
        assert!(!taxonomy.is_valid_result("Misc"));
    }

    #[rstest]
    #[case("IT・情報サービス", "Technology")]
    #[case("IT・情報サービス業", "Technology")]
    #[case("サービス業", "Hospitality/Leisure")]
    #[case("金融サービス業", "Financial Services")]
    #[case("人材サービス業", "Human Resources Services")]
    #[case("医療・ヘルスケア関連", "Healthcare/Pharma/Life Sciences")]
    #[case("地方公共団体", "Government/Public Sector")]
    #[case("卸売・小売業・飲食店", "Consumer Goods/Retail/Distribution")]
    fn embedded_table_prefers_the_most_specific_legacy_key(
        #[case] raw: &str,
        #[case] expected: &str,
    ) {
        let tables = crate::tables::TableSet::embedded().expect("embedded tables");
        let taxonomy = tables.industry_taxonomy().expect("taxonomy");

        assert_eq!(taxonomy.remap_legacy(raw), expected);
    }

    #[test]
    fn every_embedded_legacy_key_maps_to_its_own_target() {
        let tables = crate::tables::TableSet::embedded().expect("embedded tables");
        let taxonomy = tables.industry_taxonomy().expect("taxonomy");

        for entry in &tables.legacy_remap {
            assert_eq!(
                taxonomy.remap_legacy(&entry.from),
                entry.to.as_str(),
                "legacy key {}",
                entry.from
            );
        }
    }
}
