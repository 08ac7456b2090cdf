//! redb table definitions.
//!
//! Every table maps a `&str` key to a JSON-serialized `&[u8]` value.

use redb::TableDefinition;

/// Last successful function record keyed by `{account}/{subscription}/{boundary}/{function}`.
pub const FUNCTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("functions");

/// Build status keyed by build id.
pub const BUILDS: TableDefinition<&str, &[u8]> = TableDefinition::new("builds");

/// In-flight build request payloads keyed by build id.
pub const BUILD_REQUESTS: TableDefinition<&str, &[u8]> = TableDefinition::new("build_requests");

/// Artifact build metadata keyed by `{runtime}/{name}/{version}`.
pub const ARTIFACTS: TableDefinition<&str, &[u8]> = TableDefinition::new("artifacts");

/// Search tags keyed by function key.
pub const TAGS: TableDefinition<&str, &[u8]> = TableDefinition::new("tags");
