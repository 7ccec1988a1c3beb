pub use crate::error::{Error, LsResult};
pub use crate::key::{Key, KeyRange};
pub use crate::types::{DocumentType, Timestamp};

pub use tracing::{debug, debug_span, error, error_span, info, info_span, trace, warn, warn_span};

// vim: ts=4
