// Pipeline processing: mapping, normalization, keys, merge and enrichment

pub mod enrich;
pub mod keys;
pub mod mapping;
pub mod merge;
pub mod normalize;

pub use enrich::{EnrichedRecord, EnrichmentJoiner, EnrichmentStats, JoinSpec, ReferenceTable};
pub use keys::{KeyDeriver, KeyPolicy};
pub use mapping::{HeaderResolver, MappingSpec};
pub use merge::{KeyedBatch, MergeOutcome, MergeStats, Merger};
pub use normalize::{normalize_table, NormalizedBatch, RowRejection};
