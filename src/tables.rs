//! 分類表（タクソノミー、ルール、キーワード重み）の読み込み。
//!
//! 既定値はバイナリに埋め込んだ `config/classifier_tables.yaml`。`CLASSIFIER_TABLES_PATH`
//! で起動時に差し替えられる。順序に意味がある表はすべて YAML のシーケンスで持つ。
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

use crate::taxonomy::Taxonomy;

const EMBEDDED_TABLES: &str = include_str!("../config/classifier_tables.yaml");

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TableSet {
    pub version: String,
    pub taxonomy: TaxonomyTable,
    #[serde(default)]
    pub legacy_remap: Vec<RemapEntry>,
    pub rules: RuleTables,
    pub scoring: ScoringTables,
    pub search: SearchTables,
    pub narrative: NarrativeTables,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TaxonomyTable {
    pub fallback: String,
    pub fallback_alias: String,
    pub labels: Vec<LabelEntry>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LabelEntry {
    pub label: String,
    pub alias: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RemapEntry {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RuleTables {
    pub government_label: String,
    pub government_phrase: String,
    pub url_tokens: Vec<TokenRule>,
    pub region: RegionTable,
    pub explicit_companies: Vec<KeywordEntry>,
    pub business_type_vocabulary: Vec<TermEntry>,
    pub business_field: Vec<TokenRule>,
    pub generic_patterns: Vec<PatternEntry>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TokenRule {
    pub tokens: Vec<String>,
    pub category: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RegionTable {
    pub municipality_pattern: String,
    pub prefectures: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct KeywordEntry {
    pub keyword: String,
    pub category: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TermEntry {
    pub term: String,
    pub category: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PatternEntry {
    pub pattern: String,
    pub category: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ScoringTables {
    #[serde(default)]
    pub company_overrides: Vec<CompanyOverride>,
    #[serde(default)]
    pub emphasis_bonus: f64,
    pub categories: Vec<WeightedCategory>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CompanyOverride {
    pub company: String,
    pub category: String,
}

/// カテゴリごとの重みとキーワード。重みはキーワードの特異性を表す（概ね 1.0〜1.5）。
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WeightedCategory {
    pub category: String,
    pub weight: f64,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub emphasis: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SearchTables {
    pub query_suffix: String,
    pub language: String,
    pub country: String,
    pub extraction: ExtractionTable,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ExtractionTable {
    pub patterns: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NarrativeTables {
    pub fallback: String,
    pub gated: String,
    pub labels: Vec<LabelEntry>,
    pub gate: GateTables,
    pub title_rules: TitleRuleTables,
    pub scoring: ScoringTables,
    #[serde(default)]
    pub confusable_overrides: Vec<ConfusableOverride>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GateTables {
    pub research_keywords: Vec<String>,
    pub academic_terms: Vec<String>,
    pub non_research_keywords: Vec<String>,
    pub leading_companies: Vec<String>,
    pub product_patterns: Vec<String>,
    pub announcement_suffix: String,
    pub user_experience_keywords: Vec<String>,
    pub serial_markers: Vec<String>,
    pub event_pattern: String,
    pub interview_pattern: String,
    pub product_names: Vec<String>,
    pub research_announcement_phrases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TitleRuleTables {
    pub model_vocabulary: Vec<String>,
    pub launch_phrase: String,
    pub model_launch_label: String,
    pub clear_product_keywords: Vec<String>,
    pub product_label: String,
    pub announcement_pattern: String,
    pub announcement_model_keywords: Vec<String>,
    pub announcement_label: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ConfusableOverride {
    pub from: String,
    pub to: String,
    pub indicators: Vec<String>,
}

#[derive(Debug, Error)]
pub enum TablesError {
    #[error("failed to read classifier tables at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse classifier tables: {0}")]
    Deserialize(#[from] serde_yaml::Error),
    #[error("{table} refers to unknown label {label:?}")]
    UnknownLabel { table: &'static str, label: String },
    #[error("{table} declares {label:?} more than once")]
    DuplicateLabel { table: &'static str, label: String },
    #[error("invalid weight {weight} for {category}")]
    InvalidWeight { category: String, weight: f64 },
    #[error("invalid pattern {pattern:?} in {table}: {source}")]
    Pattern {
        table: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to build matcher for {table}: {source}")]
    Matcher {
        table: &'static str,
        #[source]
        source: aho_corasick::BuildError,
    },
}

impl TableSet {
    /// バイナリ埋め込みの既定表を読み込む。
    ///
    /// # Errors
    /// 埋め込み YAML のパースや検証に失敗した場合はエラーを返す。
    pub fn embedded() -> Result<Self, TablesError> {
        Self::from_yaml_str(EMBEDDED_TABLES)
    }

    /// `path` が指定されていればそのファイルを、なければ埋め込み表を読み込む。
    ///
    /// # Errors
    /// ファイル読み込み、パース、検証のいずれかに失敗した場合はエラーを返す。
    pub fn load(path: Option<&Path>) -> Result<Self, TablesError> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::embedded(),
        }
    }

    /// # Errors
    /// ファイルが読めない、もしくは内容が不正な場合はエラーを返す。
    pub fn load_from_path(path: &Path) -> Result<Self, TablesError> {
        let contents = fs::read_to_string(path).map_err(|source| TablesError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let tables = Self::from_yaml_str(&contents)?;
        tracing::info!(path = %path.display(), version = %tables.version, "loaded classifier tables");
        Ok(tables)
    }

    /// # Errors
    /// YAML が不正、もしくは検証に失敗した場合はエラーを返す。
    pub fn from_yaml_str(contents: &str) -> Result<Self, TablesError> {
        let tables: Self = serde_yaml::from_str(contents)?;
        tables.validate()?;
        Ok(tables)
    }

    /// 業種タクソノミーを構築する。
    ///
    /// # Errors
    /// 旧ラベル対応表の移行先が未知の場合はエラーを返す。
    pub fn industry_taxonomy(&self) -> Result<Taxonomy, TablesError> {
        Taxonomy::new(
            self.version.clone(),
            self.taxonomy.labels.clone(),
            self.taxonomy.fallback.clone(),
            self.taxonomy.fallback_alias.clone(),
            self.legacy_remap.clone(),
        )
    }

    /// 記事トピック用タクソノミーを構築する。
    ///
    /// # Errors
    /// 構築に失敗した場合はエラーを返す。
    pub fn narrative_taxonomy(&self) -> Result<Taxonomy, TablesError> {
        Taxonomy::new(
            self.version.clone(),
            self.narrative.labels.clone(),
            self.narrative.fallback.clone(),
            self.taxonomy.fallback_alias.clone(),
            Vec::new(),
        )
    }

    fn validate(&self) -> Result<(), TablesError> {
        let industry = label_set("taxonomy.labels", &self.taxonomy.labels)?;
        let narrative = label_set("narrative.labels", &self.narrative.labels)?;

        for entry in &self.legacy_remap {
            known("legacy_remap", &entry.to, &industry)?;
        }
        known("rules.government_label", &self.rules.government_label, &industry)?;
        for rule in &self.rules.url_tokens {
            known("rules.url_tokens", &rule.category, &industry)?;
        }
        for entry in &self.rules.explicit_companies {
            known("rules.explicit_companies", &entry.category, &industry)?;
        }
        for entry in &self.rules.business_type_vocabulary {
            known("rules.business_type_vocabulary", &entry.category, &industry)?;
        }
        for rule in &self.rules.business_field {
            known("rules.business_field", &rule.category, &industry)?;
        }
        for entry in &self.rules.generic_patterns {
            known("rules.generic_patterns", &entry.category, &industry)?;
        }
        validate_scoring("scoring", &self.scoring, &industry)?;

        known("narrative.gated", &self.narrative.gated, &narrative)?;
        let rules = &self.narrative.title_rules;
        for label in [
            &rules.model_launch_label,
            &rules.product_label,
            &rules.announcement_label,
        ] {
            known("narrative.title_rules", label, &narrative)?;
        }
        validate_scoring("narrative.scoring", &self.narrative.scoring, &narrative)?;
        for entry in &self.narrative.confusable_overrides {
            known("narrative.confusable_overrides", &entry.from, &narrative)?;
            known("narrative.confusable_overrides", &entry.to, &narrative)?;
        }

        Ok(())
    }
}

fn known(table: &'static str, label: &str, set: &HashSet<&str>) -> Result<(), TablesError> {
    if set.contains(label) {
        Ok(())
    } else {
        Err(TablesError::UnknownLabel {
            table,
            label: label.to_string(),
        })
    }
}

fn label_set<'a>(
    table: &'static str,
    labels: &'a [LabelEntry],
) -> Result<HashSet<&'a str>, TablesError> {
    let mut set = HashSet::with_capacity(labels.len());
    for entry in labels {
        if !set.insert(entry.label.as_str()) {
            return Err(TablesError::DuplicateLabel {
                table,
                label: entry.label.clone(),
            });
        }
    }
    Ok(set)
}

fn validate_scoring(
    table: &'static str,
    scoring: &ScoringTables,
    labels: &HashSet<&str>,
) -> Result<(), TablesError> {
    for category in &scoring.categories {
        if !labels.contains(category.category.as_str()) {
            return Err(TablesError::UnknownLabel {
                table,
                label: category.category.clone(),
            });
        }
        if !category.weight.is_finite() || category.weight <= 0.0 {
            return Err(TablesError::InvalidWeight {
                category: category.category.clone(),
                weight: category.weight,
            });
        }
    }
    for entry in &scoring.company_overrides {
        if !labels.contains(entry.category.as_str()) {
            return Err(TablesError::UnknownLabel {
                table,
                label: entry.category.clone(),
            });
        }
    }
    Ok(())
}
