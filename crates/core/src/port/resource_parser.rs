// Resource Parser Port

use crate::domain::ParsedResource;

/// Parses one NDJSON line into a resource and its search parameters.
///
/// A rejected line is reported through `Err(reason)`; the import records it
/// in the error file and continues.
pub trait ResourceParser: Send + Sync {
    fn parse(&self, expected_type: &str, line: &str) -> std::result::Result<ParsedResource, String>;
}
