pub mod dedup;
pub mod expression;
pub mod generator;

pub use dedup::{UniqueQueries, normalize_query};
pub use expression::{has_searchable_terms, parse_query_expression};
pub use generator::{FailedQuery, MultiModelQueryGenerator, QueryPipelineOutcome, QueryReviewer};
