use super::{
    stages::{AssembleStage, ExpandStage, RerankStage, RetrieveStage, SelfQueryStage},
    BoxedStage, StrategyDriver,
};

/// Full pipeline: self-querying, query expansion, multi-query hybrid
/// retrieval, cross-encoder reranking, quality evaluation.
pub struct AdvancedStrategyDriver;

impl StrategyDriver for AdvancedStrategyDriver {
    fn stages(&self) -> Vec<BoxedStage> {
        vec![
            Box::new(SelfQueryStage),
            Box::new(ExpandStage),
            Box::new(RetrieveStage),
            Box::new(RerankStage),
            Box::new(AssembleStage),
        ]
    }
}

/// Plain hybrid retrieval: single query, no LLM round-trips, identity
/// reranking. The rerank stage still runs to apply the pool cap and
/// final truncation.
pub struct BaselineStrategyDriver;

impl StrategyDriver for BaselineStrategyDriver {
    fn stages(&self) -> Vec<BoxedStage> {
        vec![
            Box::new(RetrieveStage),
            Box::new(RerankStage),
            Box::new(AssembleStage),
        ]
    }
}
