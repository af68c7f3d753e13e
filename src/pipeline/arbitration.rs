//! 意味分類の回答と重み付き採点の調停。
use crate::tables::ConfusableOverride;

use super::scoring::ScoreReport;

/// 信頼度帯の境界。いずれも `[0, 100]` の信頼度に対する値。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArbitrationConfig {
    /// これ未満は意味分類の回答を捨てる
    pub discard_below: f64,
    /// これ未満は採点結果との照合を行う
    pub verify_below: f64,
    /// これ以上は無条件に受け入れる（紛らわしいカテゴリの上書きは適用する）
    pub trust_above: f64,
    /// 採点結果が意味分類を覆すのに必要な最高点
    pub min_scorer_strength: f64,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            discard_below: 50.0,
            verify_below: 70.0,
            trust_above: 80.0,
            min_scorer_strength: 3.0,
        }
    }
}

impl ArbitrationConfig {
    #[must_use]
    pub fn band(&self, confidence: f64) -> ArbitrationBand {
        if confidence < self.discard_below {
            ArbitrationBand::Discard
        } else if confidence < self.verify_below {
            ArbitrationBand::Verify
        } else if confidence < self.trust_above {
            ArbitrationBand::Accept
        } else {
            ArbitrationBand::Trust
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationBand {
    Discard,
    Verify,
    Accept,
    Trust,
}

/// 選択段の回答。ラベルが解釈できなかった場合は `None`。
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticChoice {
    pub label: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArbitrationOutcome {
    pub label: String,
    pub band: ArbitrationBand,
    /// 採点結果を採用したか
    pub from_scorer: bool,
    /// 紛らわしいカテゴリの上書きが適用されたか
    pub overridden: bool,
}

/// 信頼度帯に従って意味分類の回答と採点結果のどちらを採るか決める。
///
/// `text` は上書き表の指標語を探す対象（記事タイトル）。指標語は大文字小文字を区別しない。
#[must_use]
pub fn arbitrate(
    config: &ArbitrationConfig,
    semantic: &SemanticChoice,
    scorer: &ScoreReport,
    text: &str,
    overrides: &[ConfusableOverride],
) -> ArbitrationOutcome {
    let band = config.band(semantic.confidence);

    let Some(label) = semantic.label.as_deref() else {
        return from_scorer(scorer, band);
    };

    match band {
        ArbitrationBand::Discard => return from_scorer(scorer, band),
        ArbitrationBand::Verify => {
            let strong = !scorer.scores.is_empty() && scorer.top_score >= config.min_scorer_strength;
            if strong && scorer.label != label {
                return from_scorer(scorer, band);
            }
        }
        ArbitrationBand::Accept | ArbitrationBand::Trust => {}
    }

    match apply_overrides(label, text, overrides) {
        Some(replacement) => ArbitrationOutcome {
            label: replacement.to_string(),
            band,
            from_scorer: false,
            overridden: true,
        },
        None => ArbitrationOutcome {
            label: label.to_string(),
            band,
            from_scorer: false,
            overridden: false,
        },
    }
}

fn from_scorer(scorer: &ScoreReport, band: ArbitrationBand) -> ArbitrationOutcome {
    ArbitrationOutcome {
        label: scorer.label.clone(),
        band,
        from_scorer: true,
        overridden: false,
    }
}

fn apply_overrides<'a>(
    label: &str,
    text: &str,
    overrides: &'a [ConfusableOverride],
) -> Option<&'a str> {
    let lowered = text.to_lowercase();
    overrides
        .iter()
        .filter(|entry| entry.from == label)
        .find(|entry| {
            entry
                .indicators
                .iter()
                .any(|indicator| lowered.contains(&indicator.to_lowercase()))
        })
        .map(|entry| entry.to.as_str())
}
