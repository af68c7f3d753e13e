//! 多段フォールバック分類パイプライン。
//!
//! ルール照合 → 重み付きキーワード採点 → 外部意味分類 / 検索 / 記事二段分類 の順に、
//! 前段が未解決のときだけ次段を実行する。
pub mod arbitration;
mod external;
pub mod narrative;
pub mod orchestrator;
pub mod rules;
pub mod scoring;
pub mod search;
pub mod semantic;

pub use arbitration::{
    ArbitrationBand, ArbitrationConfig, ArbitrationOutcome, SemanticChoice, arbitrate,
};
pub use narrative::{NarrativeClassifier, NarrativeDecision, NarrativePath};
pub use orchestrator::{ClassificationPipeline, PipelineBuilder, PipelineOptions};
pub use rules::{RuleMatcher, RuleOutcome, RuleStep};
pub use scoring::{ScoreReport, WeightedScorer, WeightedTable};
pub use search::{SearchClassifier, SearchSettings};
pub use semantic::{PromptContext, SemanticClassifier, SemanticError, SemanticSettings};
