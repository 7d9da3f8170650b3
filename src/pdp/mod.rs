//! Policy decision point: rule evaluation, LLM judgment, caching, and the
//! hybrid orchestration that combines them.

pub mod cache;
pub mod detect;
pub mod engine;
pub mod llm;
pub mod rules;

pub use cache::{CacheKey, CacheStats, DecisionCache, DEFAULT_CACHE_MAX_SIZE, DEFAULT_CACHE_TTL_SECS};
pub use detect::{detect_format, FormatDetection, PolicyFormat};
pub use engine::{HybridPdp, PdpConfig, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_MAX_DELEGATION_DEPTH};
pub use llm::{JudgmentEngine, LlmConfig, DEFAULT_LLM_TIMEOUT_SECS};
pub use rules::RuleEvaluator;
