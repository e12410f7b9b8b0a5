//! Template transforms in isolated per-dataset databases

mod error;
mod executor;
mod geometry;
mod phases;

pub use error::{TransformError, TransformResult};
pub use executor::{
    BASE_SCHEMAS, DatasetTransform, ParallelTransformResult, TransformExecutor, remove_db_files,
};
pub use geometry::normalize_geometry_column;
pub use phases::{Phase, Phases};
