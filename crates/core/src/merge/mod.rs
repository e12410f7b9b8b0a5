//! Warehouse merge and post-merge aggregation

mod coordinator;
mod error;
mod post_merge;

pub use coordinator::{
    MERGE_ALIAS, MergeCoordinator, MergeReport, cleanup_temp_dbs, is_merge_schema,
    prepare_warehouse,
};
pub use error::{MergeError, MergeResult};
pub use post_merge::{PostMergeReport, run_merged_sql};
