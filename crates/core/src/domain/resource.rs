// Resource rows handed to the bulk loader

use serde::{Deserialize, Serialize};

/// Search-parameter row derived from a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchParam {
    Token {
        name: String,
        system: Option<String>,
        code: String,
    },
    String {
        name: String,
        value: String,
    },
    Reference {
        name: String,
        reference_type: Option<String>,
        reference_id: String,
    },
    DateTime {
        name: String,
        start: String,
        end: String,
    },
}

/// A validated record, before it receives a surrogate identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResource {
    pub resource_type: String,
    pub resource_id: String,
    pub last_updated: Option<String>,
    pub raw: String,
    pub search_params: Vec<SearchParam>,
}

/// A record ready to be bulk-inserted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportResource {
    /// Storage surrogate key, unique across every job
    pub surrogate_id: i64,
    /// 1-based line number in the source file
    pub line_index: u64,
    pub resource: ParsedResource,
}
