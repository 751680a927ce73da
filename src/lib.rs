//! Binary delta codec and a staged, checksum-gated patch applier for
//! installed software trees.

pub mod apply;
pub mod binary_diff;
pub mod binary_patch;
pub mod checksum;
pub mod create;
pub mod error;
pub mod ops;
pub mod paged;
pub mod patch_file;
pub mod patch_format;
pub mod rolling_hash;
pub mod script;
pub mod space;
pub mod stream;
pub mod util;

pub use error::{Error, Result};
