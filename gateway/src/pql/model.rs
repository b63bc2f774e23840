use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum EntityType {
    File,
    Text,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Column {
    FileId,
    Sha256,
    Path,
    Filename,
    LastModified,
    ItemId,
    Md5,
    Type,
    Size,
    Width,
    Height,
    Duration,
    TimeAdded,
    AudioTracks,
    VideoTracks,
    SubtitleTracks,
    DataId,
    Language,
    LanguageConfidence,
    Text,
    Confidence,
    TextLength,
    JobId,
    SetterId,
    SetterName,
    DataIndex,
    SourceId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum OrderByField {
    FileId,
    Sha256,
    Path,
    Filename,
    LastModified,
    ItemId,
    Md5,
    Type,
    Size,
    Width,
    Height,
    Duration,
    TimeAdded,
    AudioTracks,
    VideoTracks,
    SubtitleTracks,
    DataId,
    Language,
    LanguageConfidence,
    Text,
    Confidence,
    TextLength,
    JobId,
    SetterId,
    SetterName,
    DataIndex,
    SourceId,
    Random,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum ScalarValue {
    Int(i64),
    Float(f64),
    String(String),
}

/// Reciprocal-rank-fusion parameters for coalescing two or more ranking
/// filters at the same `priority` into a single weighted score, instead of
/// the plain `MIN`/`MAX` fallback `build_coalesced_expr` otherwise uses.
/// `score = weight / (k + rank)`, summed across the group's filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Rrf {
    pub k: i32,
    pub weight: f64,
}

impl Default for Rrf {
    fn default() -> Self {
        Self { k: 1, weight: 1.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SortableOptions {
    #[serde(default)]
    pub order_by: bool,
    #[serde(default = "default_direction")]
    pub direction: OrderDirection,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub row_n: bool,
    #[serde(default = "default_direction")]
    pub row_n_direction: OrderDirection,
    #[serde(default)]
    pub gt: Option<ScalarValue>,
    #[serde(default)]
    pub lt: Option<ScalarValue>,
    #[serde(default)]
    pub select_as: Option<String>,
    /// When set, this filter's contribution to a same-priority coalesce
    /// group is fused via `Rrf` instead of taking the group's `MIN`/`MAX`.
    #[serde(default)]
    pub rrf: Option<Rrf>,
}

impl Default for SortableOptions {
    fn default() -> Self {
        Self {
            order_by: false,
            direction: OrderDirection::Asc,
            priority: 0,
            row_n: false,
            row_n_direction: OrderDirection::Asc,
            gt: None,
            lt: None,
            select_as: None,
            rrf: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct OrderArgs {
    #[serde(default = "default_order_by_field")]
    pub order_by: OrderByField,
    #[serde(default)]
    pub order: Option<OrderDirection>,
    #[serde(default)]
    pub priority: i32,
}

impl Default for OrderArgs {
    fn default() -> Self {
        Self {
            order_by: OrderByField::LastModified,
            order: None,
            priority: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct PqlQuery {
    pub query: Option<QueryElement>,
    pub order_by: Vec<OrderArgs>,
    pub select: Vec<Column>,
    pub entity: EntityType,
    /// Keeps only the first row per distinct combination of these columns
    /// (after ordering), e.g. one row per `item_id` when a query matches
    /// several files of the same item. See `builder::apply_partition_by`.
    pub partition_by: Option<Vec<Column>>,
    pub page: i64,
    pub page_size: i64,
    pub count: bool,
}

impl Default for PqlQuery {
    fn default() -> Self {
        Self {
            query: None,
            order_by: default_order_args(),
            select: default_select_fields(),
            entity: EntityType::File,
            partition_by: None,
            page: 1,
            page_size: 10,
            count: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AndOperator {
    pub and_: Vec<QueryElement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct OrOperator {
    pub or_: Vec<QueryElement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct NotOperator {
    pub not_: Box<QueryElement>,
}

/// The filter catalog is exactly what original_source/db/pql/filters/__init__.py
/// shipped: `Union[InPaths, InBookmarks, TypeIn, MatchPath, MatchText]`.
/// Tag/embedding filters were never built in the system this crate descends
/// from, so they are not added here.
///
/// `Never` is not part of that catalog and is never produced by
/// deserializing caller-supplied JSON (its shape, `{"__never__": true}`, is
/// not a filter a client would have reason to send). It exists only as the
/// preprocessor's "always false" sentinel: see `preprocess::preprocess_query`'s
/// `Or` arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum QueryElement {
    And(AndOperator),
    Or(OrOperator),
    Not(NotOperator),
    InPaths(InPaths),
    TypeIn(TypeIn),
    MatchPath(MatchPath),
    MatchText(MatchText),
    InBookmarks(InBookmarks),
    Never(NeverMatch),
}

/// Sentinel payload for `QueryElement::Never`. Carries no data; the field
/// exists only so the variant has a JSON shape distinct from every real
/// filter's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct NeverMatch {
    #[serde(rename = "__never__")]
    pub never: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct InPathsArgs {
    pub in_paths: Vec<String>,
}

/// Matches files whose `path` starts with one of `in_paths`. Prefixes are
/// **not** escaped for SQLite `LIKE` wildcards (`%`, `_`) before matching,
/// mirroring the original system's `files.c.path.like(f"{path}%")`: a prefix
/// containing `%` behaves as a wildcard, not a literal character.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct InPaths {
    pub in_paths: InPathsArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TypeInArgs {
    pub type_in: Vec<String>,
}

/// Matches items whose `type` starts with one of the given MIME-style
/// prefixes (e.g. `"image"` matches `"image/png"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TypeIn {
    pub type_in: TypeInArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MatchPathArgs {
    pub r#match: String,
    #[serde(default)]
    pub filename_only: bool,
    #[serde(default = "default_true")]
    pub raw_fts5_match: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MatchPath {
    #[serde(flatten, default)]
    pub sort: SortableOptions,
    pub match_path: MatchPathArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MatchTextArgs {
    pub r#match: String,
    #[serde(default)]
    pub filter_only: bool,
    #[serde(default)]
    pub setters: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub min_language_confidence: Option<f64>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default = "default_true")]
    pub raw_fts5_match: bool,
    #[serde(default)]
    pub min_length: Option<i64>,
    #[serde(default)]
    pub max_length: Option<i64>,
    #[serde(default)]
    pub select_snippet_as: Option<String>,
    #[serde(default = "default_snippet_max_len")]
    pub s_max_len: i64,
    #[serde(default = "default_snippet_ellipsis")]
    pub s_ellipsis: String,
    #[serde(default = "default_snippet_start_tag")]
    pub s_start_tag: String,
    #[serde(default = "default_snippet_end_tag")]
    pub s_end_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MatchText {
    #[serde(flatten, default)]
    pub sort: SortableOptions,
    pub match_text: MatchTextArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct InBookmarksArgs {
    #[serde(default = "default_true")]
    pub filter: bool,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub sub_ns: bool,
    #[serde(default = "default_bookmarks_user")]
    pub user: String,
    #[serde(default = "default_true")]
    pub include_wildcard: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct InBookmarks {
    #[serde(flatten, default = "default_sort_desc")]
    pub sort: SortableOptions,
    pub in_bookmarks: InBookmarksArgs,
}

fn default_direction() -> OrderDirection {
    OrderDirection::Asc
}

fn default_order_by_field() -> OrderByField {
    OrderByField::LastModified
}

fn default_sort_desc() -> SortableOptions {
    let mut options = SortableOptions::default();
    options.direction = OrderDirection::Desc;
    options.row_n_direction = OrderDirection::Desc;
    options
}

fn default_order_args() -> Vec<OrderArgs> {
    vec![OrderArgs {
        order_by: OrderByField::LastModified,
        order: Some(OrderDirection::Desc),
        priority: 0,
    }]
}

fn default_select_fields() -> Vec<Column> {
    vec![
        Column::Sha256,
        Column::Path,
        Column::LastModified,
        Column::Type,
    ]
}

fn default_true() -> bool {
    true
}

fn default_bookmarks_user() -> String {
    "user".to_string()
}

fn default_snippet_max_len() -> i64 {
    30
}

fn default_snippet_ellipsis() -> String {
    "...".to_string()
}

fn default_snippet_start_tag() -> String {
    "<b>".to_string()
}

fn default_snippet_end_tag() -> String {
    "</b>".to_string()
}
