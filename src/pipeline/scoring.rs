//! 重み付きキーワード採点。
//!
//! `score = Σ 出現回数(keyword) × weight` をカテゴリごとに計算し、最大のカテゴリを選ぶ。
//! 同点は表の宣言順で先に現れたカテゴリが勝つ。
use std::collections::HashMap;

use regex::{Regex, RegexBuilder};

use crate::{
    tables::{ScoringTables, TablesError},
    util::text::normalize_company_name,
};

#[derive(Debug, Clone)]
struct CompiledCategory {
    category: String,
    weight: f64,
    keywords: Vec<Regex>,
    emphasis: Vec<Regex>,
}

/// コンパイル済みのカテゴリ表。宣言順を保持する。
#[derive(Debug, Clone)]
pub struct WeightedTable {
    categories: Vec<CompiledCategory>,
    emphasis_bonus: f64,
    fallback: String,
}

/// 採点結果。`scores` は 0 点を除いた宣言順のスコア一覧。
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreReport {
    pub label: String,
    pub top_score: f64,
    pub scores: Vec<(String, f64)>,
    pub via_override: bool,
}

impl ScoreReport {
    fn fallback(label: &str) -> Self {
        Self {
            label: label.to_string(),
            top_score: 0.0,
            scores: Vec::new(),
            via_override: false,
        }
    }

    /// 指定カテゴリのスコア（採点されなかった場合は 0）。
    #[must_use]
    pub fn score_of(&self, category: &str) -> f64 {
        self.scores
            .iter()
            .find(|(label, _)| label == category)
            .map_or(0.0, |(_, score)| *score)
    }

    /// 上書き表に当たったか、最高点が `min_score` 以上か。
    #[must_use]
    pub fn is_resolved(&self, min_score: f64) -> bool {
        self.via_override || (!self.scores.is_empty() && self.top_score >= min_score)
    }
}

fn keyword_regex(table: &'static str, keyword: &str) -> Result<Regex, TablesError> {
    RegexBuilder::new(&regex::escape(keyword))
        .case_insensitive(true)
        .build()
        .map_err(|source| TablesError::Pattern {
            table,
            pattern: keyword.to_string(),
            source,
        })
}

impl WeightedTable {
    /// # Errors
    /// キーワードの正規表現化に失敗した場合はエラーを返す。
    pub fn from_tables(
        table: &'static str,
        tables: &ScoringTables,
        fallback: impl Into<String>,
    ) -> Result<Self, TablesError> {
        let categories = tables
            .categories
            .iter()
            .map(|category| {
                let keywords = category
                    .keywords
                    .iter()
                    .map(|keyword| keyword_regex(table, keyword))
                    .collect::<Result<Vec<_>, _>>()?;
                let emphasis = category
                    .emphasis
                    .iter()
                    .map(|keyword| keyword_regex(table, keyword))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CompiledCategory {
                    category: category.category.clone(),
                    weight: category.weight,
                    keywords,
                    emphasis,
                })
            })
            .collect::<Result<Vec<_>, TablesError>>()?;

        Ok(Self {
            categories,
            emphasis_bonus: tables.emphasis_bonus,
            fallback: fallback.into(),
        })
    }

    #[must_use]
    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    /// テキストを採点する。何も当たらなければフォールバックラベルを返す。
    #[must_use]
    pub fn score(&self, text: &str) -> ScoreReport {
        let mut scores = Vec::new();
        let mut best: Option<(usize, f64)> = None;

        for category in &self.categories {
            let occurrences: usize = category
                .keywords
                .iter()
                .map(|keyword| keyword.find_iter(text).count())
                .sum();
            let emphasized = category
                .emphasis
                .iter()
                .filter(|keyword| keyword.is_match(text))
                .count();

            #[allow(clippy::cast_precision_loss)]
            let score = occurrences as f64 * category.weight
                + emphasized as f64 * self.emphasis_bonus;
            if score <= 0.0 {
                continue;
            }

            // 厳密な大小比較で、同点は先に宣言されたカテゴリを残す
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((scores.len(), score));
            }
            scores.push((category.category.clone(), score));
        }

        match best {
            Some((index, top_score)) => ScoreReport {
                label: scores[index].0.clone(),
                top_score,
                scores,
                via_override: false,
            },
            None => ScoreReport::fallback(&self.fallback),
        }
    }
}

/// 企業名の完全一致上書き表と採点表の組み合わせ。
#[derive(Debug, Clone)]
pub struct WeightedScorer {
    table: WeightedTable,
    overrides: HashMap<String, String>,
}

impl WeightedScorer {
    /// # Errors
    /// 採点表の構築に失敗した場合はエラーを返す。
    pub fn from_tables(
        table: &'static str,
        tables: &ScoringTables,
        fallback: impl Into<String>,
    ) -> Result<Self, TablesError> {
        let overrides = tables
            .company_overrides
            .iter()
            .map(|entry| (normalize_company_name(&entry.company), entry.category.clone()))
            .collect();

        Ok(Self {
            table: WeightedTable::from_tables(table, tables, fallback)?,
            overrides,
        })
    }

    #[must_use]
    pub fn table(&self) -> &WeightedTable {
        &self.table
    }

    /// 正規化した企業名が上書き表に完全一致すればそのカテゴリ。
    #[must_use]
    pub fn override_for(&self, company: &str) -> Option<&str> {
        let normalized = normalize_company_name(company);
        if normalized.is_empty() {
            return None;
        }
        self.overrides.get(&normalized).map(String::as_str)
    }

    /// 上書き表を先に確認し、当たらなければ `corpus` を採点する。
    #[must_use]
    pub fn classify(&self, company: Option<&str>, corpus: &str) -> ScoreReport {
        if let Some(category) = company.and_then(|company| self.override_for(company)) {
            return ScoreReport {
                label: category.to_string(),
                top_score: 0.0,
                scores: Vec::new(),
                via_override: true,
            };
        }
        self.table.score(corpus)
    }
}
