pub(crate) mod builder;
pub(crate) mod decoder;
pub(crate) mod model;
pub(crate) mod preprocess;
pub(crate) mod utils;

pub(crate) use builder::{PqlBuilderResult, build_query};
pub(crate) use decoder::decode_rows;
pub(crate) use model::{PqlQuery, QueryElement};
pub(crate) use preprocess::{PqlError, PqlErrorKind, preprocess_query};
