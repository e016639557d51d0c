pub mod config;
pub mod crosswalk;
pub mod diagnostics;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod identity;
pub mod merge;
pub mod normalize;
pub mod output;
pub mod pipeline;
pub mod scale;
pub mod schema;
pub mod store;
pub mod validate;
pub mod writer;
