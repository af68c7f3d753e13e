//! 決定的なルール照合。
//!
//! 10 段の規則を宣言順に評価し、最初に当たった段で確定する。スコアリングは行わない。
use std::sync::Arc;

use aho_corasick::AhoCorasick;
use regex::Regex;
use tracing::debug;

use crate::{
    evidence::Evidence,
    tables::{RuleTables, TablesError},
    taxonomy::Taxonomy,
    util::text::contains_any,
};

const MIN_PREFIX_TOKEN_LEN: usize = 4;

/// どの規則で確定したか。宣言順がそのまま評価順。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleStep {
    UrlToken,
    UrlRegion,
    ExplicitCompany,
    CompanyRegion,
    ProfileRegion,
    GovernmentPhrase,
    BusinessTypeVocabulary,
    BusinessField,
    CompanyPattern,
    ProfilePattern,
}

impl RuleStep {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UrlToken => "url_token",
            Self::UrlRegion => "url_region",
            Self::ExplicitCompany => "explicit_company",
            Self::CompanyRegion => "company_region",
            Self::ProfileRegion => "profile_region",
            Self::GovernmentPhrase => "government_phrase",
            Self::BusinessTypeVocabulary => "business_type_vocabulary",
            Self::BusinessField => "business_field",
            Self::CompanyPattern => "company_pattern",
            Self::ProfilePattern => "profile_pattern",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Matched { category: String, step: RuleStep },
    Unresolved,
}

/// 都道府県名と市区町村接尾辞の検出。
#[derive(Debug, Clone)]
struct RegionMatcher {
    prefectures: AhoCorasick,
    municipality: Regex,
}

impl RegionMatcher {
    fn contains(&self, text: &str) -> bool {
        self.prefectures.is_match(text) || self.municipality.is_match(text)
    }
}

#[derive(Debug, Clone)]
pub struct RuleMatcher {
    taxonomy: Arc<Taxonomy>,
    government_label: String,
    government_phrase: String,
    url_rules: Vec<(Vec<String>, String)>,
    region: RegionMatcher,
    explicit_companies: Vec<(String, String)>,
    vocabulary: Vec<(String, String)>,
    field_rules: Vec<(Vec<String>, String)>,
    generic_patterns: Vec<(Regex, String)>,
}

impl RuleMatcher {
    /// # Errors
    /// 正規表現のコンパイル、もしくは都道府県マッチャーの構築に失敗した場合はエラーを返す。
    pub fn from_tables(taxonomy: Arc<Taxonomy>, tables: &RuleTables) -> Result<Self, TablesError> {
        let prefectures =
            AhoCorasick::new(&tables.region.prefectures).map_err(|source| TablesError::Matcher {
                table: "rules.region.prefectures",
                source,
            })?;
        let municipality =
            Regex::new(&tables.region.municipality_pattern).map_err(|source| TablesError::Pattern {
                table: "rules.region.municipality_pattern",
                pattern: tables.region.municipality_pattern.clone(),
                source,
            })?;

        let generic_patterns = tables
            .generic_patterns
            .iter()
            .map(|entry| {
                Regex::new(&entry.pattern)
                    .map(|regex| (regex, entry.category.clone()))
                    .map_err(|source| TablesError::Pattern {
                        table: "rules.generic_patterns",
                        pattern: entry.pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let lowercase_tokens = |tokens: &[String]| {
            tokens
                .iter()
                .map(|token| token.to_ascii_lowercase())
                .collect::<Vec<_>>()
        };

        Ok(Self {
            taxonomy,
            government_label: tables.government_label.clone(),
            government_phrase: tables.government_phrase.clone(),
            url_rules: tables
                .url_tokens
                .iter()
                .map(|rule| (lowercase_tokens(&rule.tokens), rule.category.clone()))
                .collect(),
            region: RegionMatcher {
                prefectures,
                municipality,
            },
            explicit_companies: tables
                .explicit_companies
                .iter()
                .map(|entry| (entry.keyword.clone(), entry.category.clone()))
                .collect(),
            vocabulary: tables
                .business_type_vocabulary
                .iter()
                .map(|entry| (entry.term.clone(), entry.category.clone()))
                .collect(),
            field_rules: tables
                .business_field
                .iter()
                .map(|rule| (rule.tokens.clone(), rule.category.clone()))
                .collect(),
            generic_patterns,
        })
    }

    /// 証拠に対して規則を宣言順に評価する。
    ///
    /// `businessType` は旧ラベルの読み替え済みであることを前提とする
    /// （[`Evidence::with_remapped_business_type`]）。
    #[must_use]
    pub fn match_evidence(&self, evidence: &Evidence) -> RuleOutcome {
        let outcome = self.evaluate(evidence);
        if let RuleOutcome::Matched { category, step } = &outcome {
            debug!(
                entity = evidence.entity(),
                step = step.as_str(),
                category = %category,
                "rule matched"
            );
        }
        outcome
    }

    fn evaluate(&self, evidence: &Evidence) -> RuleOutcome {
        let url = evidence.url();
        let company = evidence.company_name();
        let profile = evidence.profile_text();
        let business_type = evidence.business_type();

        if let Some(category) = url.and_then(|url| self.match_url_tokens(url)) {
            return matched(category, RuleStep::UrlToken);
        }
        if url.is_some_and(|url| self.region.contains(url)) {
            return matched(&self.government_label, RuleStep::UrlRegion);
        }
        if let Some(category) = company.and_then(|company| {
            first_contained(company, &self.explicit_companies)
        }) {
            return matched(category, RuleStep::ExplicitCompany);
        }
        if company.is_some_and(|company| self.region.contains(company)) {
            return matched(&self.government_label, RuleStep::CompanyRegion);
        }
        if profile.is_some_and(|profile| self.region.contains(profile)) {
            return matched(&self.government_label, RuleStep::ProfileRegion);
        }
        if business_type.is_some_and(|text| text.contains(&self.government_phrase)) {
            return matched(&self.government_label, RuleStep::GovernmentPhrase);
        }
        if let Some(category) = business_type.and_then(|text| self.match_vocabulary(text)) {
            return matched(category, RuleStep::BusinessTypeVocabulary);
        }
        if let Some(category) = evidence.business_field().and_then(|field| {
            self.field_rules
                .iter()
                .find(|(tokens, _)| contains_any(field, tokens))
                .map(|(_, category)| category.as_str())
        }) {
            return matched(category, RuleStep::BusinessField);
        }
        if let Some(category) = company.and_then(|company| self.match_generic(company)) {
            return matched(category, RuleStep::CompanyPattern);
        }
        if let Some(category) = profile.and_then(|profile| self.match_generic(profile)) {
            return matched(category, RuleStep::ProfilePattern);
        }

        RuleOutcome::Unresolved
    }

    fn match_url_tokens(&self, url: &str) -> Option<&str> {
        let lowered = url.to_ascii_lowercase();
        let segments: Vec<&str> = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|segment| !segment.is_empty())
            .collect();

        self.url_rules
            .iter()
            .find(|(rule_tokens, _)| {
                rule_tokens.iter().any(|token| {
                    segments
                        .iter()
                        .any(|segment| url_token_matches(segment, token))
                })
            })
            .map(|(_, category)| category.as_str())
    }

    fn match_vocabulary(&self, business_type: &str) -> Option<&str> {
        if let Some(label) = self.taxonomy.canonicalize(business_type) {
            return Some(label);
        }
        first_contained(business_type, &self.vocabulary)
    }

    fn match_generic(&self, text: &str) -> Option<&str> {
        self.generic_patterns
            .iter()
            .find(|(pattern, _)| pattern.is_match(text))
            .map(|(_, category)| category.as_str())
    }
}

/// 短いトークン（car など）は完全一致のみ。それ以外はセグメントの先頭一致も認める。
fn url_token_matches(segment: &str, token: &str) -> bool {
    segment == token || (token.len() >= MIN_PREFIX_TOKEN_LEN && segment.starts_with(token))
}

fn first_contained<'a>(text: &str, table: &'a [(String, String)]) -> Option<&'a str> {
    table
        .iter()
        .find(|(keyword, _)| text.contains(keyword.as_str()))
        .map(|(_, category)| category.as_str())
}

fn matched(category: &str, step: RuleStep) -> RuleOutcome {
    RuleOutcome::Matched {
        category: category.to_string(),
        step,
    }
}
