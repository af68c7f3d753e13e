use serde::{Deserialize, Serialize};

use crate::taxonomy::Taxonomy;

/// 1 エンティティ分の生テキスト証拠。分類リクエストごとに 1 回作られ、読み取り専用で扱う。
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_title: Option<String>,
}

impl Evidence {
    /// ログ出力用の識別子。`id`、企業名、URL、記事タイトルの順に最初に存在するものを使う。
    #[must_use]
    pub fn entity(&self) -> &str {
        [
            &self.id,
            &self.company_name,
            &self.url,
            &self.article_title,
        ]
        .into_iter()
        .find_map(|field| non_empty(field.as_deref()))
        .unwrap_or("-")
    }

    #[must_use]
    pub fn company_name(&self) -> Option<&str> {
        non_empty(self.company_name.as_deref())
    }

    #[must_use]
    pub fn url(&self) -> Option<&str> {
        non_empty(self.url.as_deref())
    }

    #[must_use]
    pub fn business_type(&self) -> Option<&str> {
        non_empty(self.business_type.as_deref())
    }

    #[must_use]
    pub fn business_field(&self) -> Option<&str> {
        non_empty(self.business_field.as_deref())
    }

    #[must_use]
    pub fn profile_text(&self) -> Option<&str> {
        non_empty(self.profile_text.as_deref())
    }

    #[must_use]
    pub fn full_content(&self) -> Option<&str> {
        non_empty(self.full_content.as_deref())
    }

    #[must_use]
    pub fn article_title(&self) -> Option<&str> {
        non_empty(self.article_title.as_deref())
    }

    /// 記事（ナラティブ）として分類すべきか。
    #[must_use]
    pub fn is_article(&self) -> bool {
        self.article_title().is_some()
    }

    /// 業種テキストに旧ラベルの読み替えを適用した複製を返す。
    #[must_use]
    pub fn with_remapped_business_type(&self, taxonomy: &Taxonomy) -> Self {
        let business_type = self
            .business_type()
            .map(|raw| taxonomy.remap_legacy(raw).into_owned());
        Self {
            business_type,
            ..self.clone()
        }
    }

    /// 重み付きスコアリングに渡すコーパス。
    #[must_use]
    pub fn scoring_corpus(&self) -> String {
        [
            self.company_name(),
            self.business_type(),
            self.business_field(),
            self.profile_text(),
            self.full_content(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join("\n")
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// 分類結果を確定させた段。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum SourceStage {
    Rule,
    Scorer,
    Semantic,
    SearchFallback,
    Narrative,
}

impl SourceStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Scorer => "scorer",
            Self::Semantic => "semantic",
            Self::SearchFallback => "search_fallback",
            Self::Narrative => "narrative",
        }
    }
}

/// 1 エンティティの最終分類。生成後は変更しない。
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub label: String,
    pub source_stage: SourceStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl ClassificationResult {
    #[must_use]
    pub fn new(label: impl Into<String>, source_stage: SourceStage) -> Self {
        Self {
            label: label.into(),
            source_stage,
            confidence: None,
        }
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evidence_deserializes_from_camel_case() {
        let evidence: Evidence = serde_json::from_value(json!({
            "companyName": "○○銀行",
            "businessType": "金融機関",
            "profileText": "  ",
        }))
        .expect("evidence parses");

        assert_eq!(evidence.company_name(), Some("○○銀行"));
        assert_eq!(evidence.business_type(), Some("金融機関"));
        assert_eq!(evidence.profile_text(), None);
        assert!(!evidence.is_article());
    }

    #[test]
    fn entity_prefers_id_then_company() {
        let evidence = Evidence {
            company_name: Some("アクメ".to_string()),
            url: Some("https://example.com".to_string()),
            ..Evidence::default()
        };
        assert_eq!(evidence.entity(), "アクメ");

        let with_id = Evidence {
            id: Some("case-42".to_string()),
            ..evidence
        };
        assert_eq!(with_id.entity(), "case-42");
        assert_eq!(Evidence::default().entity(), "-");
    }

    #[test]
    fn result_serializes_stage_and_omits_missing_confidence() {
        let result = ClassificationResult::new("Banking/Securities", SourceStage::Rule);
        let value = serde_json::to_value(&result).expect("serializes");
        assert_eq!(
            value,
            json!({"label": "Banking/Securities", "sourceStage": "Rule"})
        );

        let narrative = ClassificationResult::new("AI Infrastructure", SourceStage::Narrative)
            .with_confidence(72.0);
        let value = serde_json::to_value(&narrative).expect("serializes");
        assert_eq!(value["confidence"], json!(72.0));
    }

    #[test]
    fn scoring_corpus_joins_present_fields() {
        let evidence = Evidence {
            company_name: Some("アクメ".to_string()),
            profile_text: Some("自動車部品の製造".to_string()),
            ..Evidence::default()
        };
        assert_eq!(evidence.scoring_corpus(), "アクメ\n自動車部品の製造");
    }
}
