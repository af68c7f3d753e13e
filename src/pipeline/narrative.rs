//! 記事タイトルの二段分類。
//!
//! 1. 事前フィルタと yes/no ゲートで「研究動向」かどうかを判定する
//! 2. 違う場合はタイトル規則、次に残りのカテゴリから信頼度付きで 1 つ選ばせる
//! 3. 信頼度帯に従って重み付き採点の結果と調停する
//!
//! どの段で失敗しても採点結果を返し、エラーは呼び出し元に伝播させない。
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    clients::CompletionRequest,
    evidence::Evidence,
    tables::{ConfusableOverride, GateTables, NarrativeTables, TablesError, TitleRuleTables},
    taxonomy::Taxonomy,
    util::text::contains_any,
};

use super::{
    arbitration::{ArbitrationBand, ArbitrationConfig, SemanticChoice, arbitrate},
    scoring::{ScoreReport, WeightedTable},
    semantic::{SemanticClassifier, SemanticError},
};

const STAGE: &str = "narrative";
const GATE_MAX_TOKENS: u32 = 20;
const GATE_TEMPERATURE: f32 = 0.1;
const CHOICE_MAX_TOKENS: u32 = 200;
const CHOICE_TEMPERATURE: f32 = 0.2;

static CATEGORY_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<category>(.*?)</category>").expect("compile category tag pattern")
});
static CONFIDENCE_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<confidence>(.*?)</confidence>").expect("compile confidence tag pattern")
});

const AFFIRMATIVE: &[&str] = &["はい", "yes", "true"];
const NEGATIVE: &[&str] = &["いいえ", "no", "false"];

/// どの経路でラベルが決まったか。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NarrativePath {
    Gate,
    TitleRule,
    Arbitration(ArbitrationBand),
    /// 意味分類が構成されていないため採点結果を使った
    Scorer,
    /// 意味分類が失敗したため採点結果を使った
    Degraded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NarrativeDecision {
    pub label: String,
    pub confidence: Option<f64>,
    pub path: NarrativePath,
}

/// ゲート前の事前フィルタ。当たれば「研究動向ではない」と判定する。
#[derive(Debug, Clone)]
struct GateFilter {
    tables: GateTables,
    product_patterns: Vec<Regex>,
    announcement: Regex,
    event: Regex,
    interview: Regex,
}

fn compile(table: &'static str, pattern: &str) -> Result<Regex, TablesError> {
    Regex::new(pattern).map_err(|source| TablesError::Pattern {
        table,
        pattern: pattern.to_string(),
        source,
    })
}

fn announcement_pattern(companies: &[String], suffix: &str) -> String {
    let names = companies
        .iter()
        .map(|name| regex::escape(name))
        .collect::<Vec<_>>()
        .join("|");
    format!("(.+社|.+[株]|{names}){suffix}")
}

impl GateFilter {
    fn from_tables(tables: &GateTables) -> Result<Self, TablesError> {
        let product_patterns = tables
            .product_patterns
            .iter()
            .map(|pattern| compile("narrative.gate.product_patterns", pattern))
            .collect::<Result<Vec<_>, _>>()?;
        let announcement = compile(
            "narrative.gate.announcement_suffix",
            &announcement_pattern(&tables.leading_companies, &tables.announcement_suffix),
        )?;

        Ok(Self {
            tables: tables.clone(),
            product_patterns,
            announcement,
            event: compile("narrative.gate.event_pattern", &tables.event_pattern)?,
            interview: compile("narrative.gate.interview_pattern", &tables.interview_pattern)?,
        })
    }

    /// 当たった事前フィルタの名前。
    fn rejects(&self, title: &str) -> Option<&'static str> {
        let t = &self.tables;
        let academic = contains_any(title, &t.academic_terms);

        if t.leading_companies.iter().any(|company| {
            ["、", "が", "は"]
                .iter()
                .any(|particle| title.starts_with(&format!("{company}{particle}")))
        }) {
            return Some("leading_company");
        }
        if self.product_patterns.iter().any(|pattern| pattern.is_match(title)) {
            return Some("product_pattern");
        }
        if contains_any(title, &t.non_research_keywords) && !contains_any(title, &t.research_keywords)
        {
            return Some("non_research_keyword");
        }
        if self.announcement.is_match(title) && !academic {
            return Some("company_announcement");
        }
        if contains_any(title, &t.user_experience_keywords) {
            return Some("user_experience");
        }
        if contains_any(title, &t.serial_markers) {
            return Some("serial");
        }
        if self.event.is_match(title) {
            return Some("event");
        }
        if self.interview.is_match(title) {
            return Some("interview");
        }
        if contains_any(title, &t.product_names) && !academic {
            return Some("product_name");
        }
        if title.contains("研究")
            && contains_any(title, &t.research_announcement_phrases)
            && !academic
        {
            return Some("research_announcement");
        }
        None
    }
}

/// ゲート通過後の決定的なタイトル規則。
#[derive(Debug, Clone)]
struct TitleRules {
    tables: TitleRuleTables,
    announcement: Regex,
}

impl TitleRules {
    fn from_tables(tables: &TitleRuleTables) -> Result<Self, TablesError> {
        Ok(Self {
            tables: tables.clone(),
            announcement: compile(
                "narrative.title_rules.announcement_pattern",
                &tables.announcement_pattern,
            )?,
        })
    }

    fn resolve(&self, title: &str, scorer: &ScoreReport) -> Option<&str> {
        let t = &self.tables;
        if contains_any(title, &t.model_vocabulary) && title.contains(&t.launch_phrase) {
            return Some(t.model_launch_label.as_str());
        }
        if contains_any(title, &t.clear_product_keywords) && scorer.label == t.product_label {
            return Some(t.product_label.as_str());
        }
        if self.announcement.is_match(title) && contains_any(title, &t.announcement_model_keywords)
        {
            return Some(t.announcement_label.as_str());
        }
        None
    }
}

pub struct NarrativeClassifier {
    semantic: Option<Arc<SemanticClassifier>>,
    taxonomy: Arc<Taxonomy>,
    scorer: WeightedTable,
    gate: GateFilter,
    title_rules: TitleRules,
    overrides: Vec<ConfusableOverride>,
    arbitration: ArbitrationConfig,
    gated: String,
    model: String,
}

impl NarrativeClassifier {
    /// # Errors
    /// 表の正規表現のコンパイルに失敗した場合はエラーを返す。
    pub fn new(
        tables: &NarrativeTables,
        taxonomy: Arc<Taxonomy>,
        semantic: Option<Arc<SemanticClassifier>>,
        model: impl Into<String>,
        arbitration: ArbitrationConfig,
    ) -> Result<Self, TablesError> {
        Ok(Self {
            semantic,
            scorer: WeightedTable::from_tables(
                "narrative.scoring",
                &tables.scoring,
                taxonomy.fallback(),
            )?,
            taxonomy,
            gate: GateFilter::from_tables(&tables.gate)?,
            title_rules: TitleRules::from_tables(&tables.title_rules)?,
            overrides: tables.confusable_overrides.clone(),
            arbitration,
            gated: tables.gated.clone(),
            model: model.into(),
        })
    }

    #[must_use]
    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub async fn classify(&self, evidence: &Evidence, cancel: &CancellationToken) -> NarrativeDecision {
        let title = evidence.article_title().unwrap_or_default();
        let url = evidence.url().unwrap_or_default();
        let entity = evidence.entity();
        let report = self.scorer.score(title);

        let gated = match self.gate.rejects(title) {
            Some(filter) => {
                debug!(entity, filter, "gate pre-filter rejected the gated category");
                false
            }
            None => match &self.semantic {
                Some(semantic) => match self.ask_gate(semantic, title, url, cancel).await {
                    Ok(answer) => answer,
                    Err(error) => return self.degrade(entity, &report, &error),
                },
                None => false,
            },
        };
        if gated {
            return NarrativeDecision {
                label: self.gated.clone(),
                confidence: None,
                path: NarrativePath::Gate,
            };
        }

        if let Some(label) = self.title_rules.resolve(title, &report) {
            debug!(entity, label, "title rule matched");
            return NarrativeDecision {
                label: label.to_string(),
                confidence: None,
                path: NarrativePath::TitleRule,
            };
        }

        let Some(semantic) = &self.semantic else {
            return NarrativeDecision {
                label: report.label,
                confidence: None,
                path: NarrativePath::Scorer,
            };
        };

        let choice = match self.ask_choice(semantic, title, url, cancel).await {
            Ok(choice) => choice,
            Err(error) => return self.degrade(entity, &report, &error),
        };
        let outcome = arbitrate(&self.arbitration, &choice, &report, title, &self.overrides);
        debug!(
            entity,
            semantic_label = ?choice.label,
            confidence = choice.confidence,
            scorer_label = %report.label,
            label = %outcome.label,
            band = ?outcome.band,
            overridden = outcome.overridden,
            "narrative arbitration"
        );

        NarrativeDecision {
            label: outcome.label,
            confidence: Some(choice.confidence),
            path: NarrativePath::Arbitration(outcome.band),
        }
    }

    fn degrade(&self, entity: &str, report: &ScoreReport, error: &SemanticError) -> NarrativeDecision {
        warn!(
            entity,
            stage = STAGE,
            error = %error,
            fallback = %report.label,
            "narrative classification failed, using keyword scorer"
        );
        NarrativeDecision {
            label: report.label.clone(),
            confidence: None,
            path: NarrativePath::Degraded,
        }
    }

    async fn ask_gate(
        &self,
        semantic: &SemanticClassifier,
        title: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, SemanticError> {
        let gated_alias = self.alias_of(&self.gated);
        let request = CompletionRequest {
            model: self.model.clone(),
            system: format!(
                "あなたはAIニュース記事が「{gated_alias}」カテゴリに該当するかを厳密に判定する専門家です。\
                 製品発表や商用サービスの記事を「{gated_alias}」と誤判定しないでください。"
            ),
            user: format!(
                "タイトル: {title}\nURL: {url}\n\n\
                 「{gated_alias}」は学術論文や学会発表、大学・研究機関による基礎研究の成果に限ります。\n\
                 製品の発売や提供開始、導入事例、市場調査、インタビュー、イベントレポートは該当しません。\n\n\
                 例:\n\
                 - 深層学習を用いた新しい画像認識アルゴリズムの研究 → はい\n\
                 - GPUを用いた機械学習の高速化に関する理論研究 → はい\n\
                 - 企業がAIチャットボットサービスの提供を開始 → いいえ\n\
                 - AIを活用した業務改善事例 → いいえ\n\n\
                 この記事は「{gated_alias}」に該当しますか？「はい」または「いいえ」で回答してください。"
            ),
            max_tokens: GATE_MAX_TOKENS,
            temperature: GATE_TEMPERATURE,
        };

        let response = semantic.ask(&request, cancel).await?;
        Ok(parse_gate_answer(&response))
    }

    async fn ask_choice(
        &self,
        semantic: &SemanticClassifier,
        title: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<SemanticChoice, SemanticError> {
        let gated_alias = self.alias_of(&self.gated);
        let request = CompletionRequest {
            model: self.model.clone(),
            system: "あなたは日本のAIニュース記事を指定されたカテゴリに分類する専門家です。".to_string(),
            user: format!(
                "この記事は「{gated_alias}」に該当しないことが確認済みです。\
                 次のカテゴリから最も適切なものを 1 つだけ選んでください。\n\n{}\n\n\
                 タイトル: {title}\nURL: {url}\n\n\
                 次の形式で回答してください。\n\
                 <category>選択したカテゴリ</category>\n\
                 <confidence>0-100の数値</confidence>",
                self.taxonomy.prompt_listing(Some(&self.gated))
            ),
            max_tokens: CHOICE_MAX_TOKENS,
            temperature: CHOICE_TEMPERATURE,
        };

        let response = semantic.ask(&request, cancel).await?;
        Ok(self.parse_choice(&response))
    }

    fn alias_of<'a>(&'a self, label: &'a str) -> &'a str {
        self.taxonomy.alias_of(label).unwrap_or(label)
    }

    /// `<category>` と `<confidence>` を取り出す。解釈できない信頼度は 0 とする。
    fn parse_choice(&self, response: &str) -> SemanticChoice {
        let label = CATEGORY_TAG
            .captures(response)
            .and_then(|captures| captures.get(1))
            .and_then(|found| self.taxonomy.canonicalize(found.as_str()))
            .filter(|label| *label != self.gated)
            .map(ToString::to_string);
        if label.is_none() {
            warn!(response, "choice response has no usable category");
        }

        let confidence = CONFIDENCE_TAG
            .captures(response)
            .and_then(|captures| captures.get(1))
            .and_then(|found| found.as_str().trim().trim_end_matches('%').parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .map_or(0.0, |value| value.clamp(0.0, 100.0));

        SemanticChoice { label, confidence }
    }
}

/// 応答中で最初に現れた肯定語・否定語で判定する。どちらもなければ否定。
fn parse_gate_answer(response: &str) -> bool {
    let lowered = response.to_lowercase();
    let first = |tokens: &[&str]| {
        tokens
            .iter()
            .filter_map(|token| find_token(&lowered, token))
            .min()
    };

    match (first(AFFIRMATIVE), first(NEGATIVE)) {
        (Some(yes), Some(no)) => yes < no,
        (Some(_), None) => true,
        _ => false,
    }
}

/// ASCII の語は前後が英数字でない位置にだけ一致させる。
fn find_token(text: &str, token: &str) -> Option<usize> {
    let ascii = token.is_ascii();
    text.match_indices(token)
        .map(|(index, _)| index)
        .find(|&index| {
            if !ascii {
                return true;
            }
            let before = text[..index].chars().next_back();
            let after = text[index + token.len()..].chars().next();
            !before.is_some_and(|c| c.is_ascii_alphanumeric())
                && !after.is_some_and(|c| c.is_ascii_alphanumeric())
        })
}
