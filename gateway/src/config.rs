use anyhow::{Context, Result};
use serde::Deserialize;
use std::{env, path::PathBuf};

pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG_PATH";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub db: DbConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_page_size")]
    pub default_page_size: i64,
    #[serde(default = "default_bookmark_user")]
    pub default_bookmark_user: String,
    #[serde(default = "default_snippet_max_len")]
    pub snippet_max_len: i64,
    #[serde(default = "default_snippet_ellipsis")]
    pub snippet_ellipsis: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            default_bookmark_user: default_bookmark_user(),
            snippet_max_len: default_snippet_max_len(),
            snippet_ellipsis: default_snippet_ellipsis(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    #[serde(default = "default_db_name")]
    pub index_db: String,
    #[serde(default = "default_db_name")]
    pub user_data_db: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            index_db: default_db_name(),
            user_data_db: default_db_name(),
        }
    }
}

fn default_page_size() -> i64 {
    10
}

fn default_bookmark_user() -> String {
    "user".to_string()
}

fn default_snippet_max_len() -> i64 {
    30
}

fn default_snippet_ellipsis() -> String {
    "...".to_string()
}

fn default_db_name() -> String {
    "default".to_string()
}

impl Settings {
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => path,
            None => default_config_path()?,
        };
        let builder = config::Config::builder()
            .set_default("search.default_page_size", default_page_size())?
            .set_default("search.default_bookmark_user", default_bookmark_user())?
            .set_default("search.snippet_max_len", default_snippet_max_len())?
            .set_default("search.snippet_ellipsis", default_snippet_ellipsis())?
            .set_default("db.index_db", default_db_name())?
            .set_default("db.user_data_db", default_db_name())?
            .add_source(config::File::from(config_path).required(false))
            .add_source(config::Environment::with_prefix("GATEWAY").separator("__"));

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = env::var("GATEWAY__SEARCH_DEFAULT_PAGE_SIZE") {
            self.search.default_page_size = value
                .parse()
                .context("GATEWAY__SEARCH_DEFAULT_PAGE_SIZE must be a valid integer")?;
        }
        if let Ok(value) = env::var("GATEWAY__SEARCH_DEFAULT_BOOKMARK_USER") {
            self.search.default_bookmark_user = value;
        }
        if let Ok(value) = env::var("INDEX_DB") {
            self.db.index_db = value;
        }
        if let Ok(value) = env::var("USER_DATA_DB") {
            self.db.user_data_db = value;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.search.default_page_size <= 0 {
            anyhow::bail!("search.default_page_size must be positive");
        }
        if self.search.default_bookmark_user.trim().is_empty() {
            anyhow::bail!("search.default_bookmark_user must not be empty");
        }
        if self.search.snippet_max_len <= 0 {
            anyhow::bail!("search.snippet_max_len must be positive");
        }
        Ok(())
    }
}

impl SearchConfig {
    /// Fills in this config's defaults wherever a caller's raw query JSON
    /// left the corresponding key unset, before it's deserialized into a
    /// `PqlQuery`. Has to run at the `serde_json::Value` level: once a key
    /// is missing, `PqlQuery`'s own `#[serde(default)]` already fills it
    /// with a fixed constant, and nothing in the resulting typed struct
    /// still distinguishes "defaulted" from "caller explicitly chose the
    /// same value".
    pub fn apply_defaults(&self, raw: &mut serde_json::Value) {
        let Some(root) = raw.as_object_mut() else {
            return;
        };
        root.entry("page_size")
            .or_insert_with(|| serde_json::json!(self.default_page_size));
        if let Some(query) = root.get_mut("query") {
            self.apply_filter_defaults(query);
        }
    }

    fn apply_filter_defaults(&self, element: &mut serde_json::Value) {
        let Some(obj) = element.as_object_mut() else {
            return;
        };
        for wrapper in ["and_", "or_"] {
            if let Some(children) = obj.get_mut(wrapper).and_then(|v| v.as_array_mut()) {
                for child in children {
                    self.apply_filter_defaults(child);
                }
            }
        }
        if let Some(child) = obj.get_mut("not_") {
            self.apply_filter_defaults(child);
        }
        if let Some(args) = obj.get_mut("in_bookmarks").and_then(|v| v.as_object_mut()) {
            args.entry("user")
                .or_insert_with(|| serde_json::json!(self.default_bookmark_user));
        }
        if let Some(args) = obj.get_mut("match_text").and_then(|v| v.as_object_mut()) {
            args.entry("s_max_len")
                .or_insert_with(|| serde_json::json!(self.snippet_max_len));
            args.entry("s_ellipsis")
                .or_insert_with(|| serde_json::json!(self.snippet_ellipsis.clone()));
        }
    }
}

fn default_config_path() -> Result<PathBuf> {
    let cwd = env::current_dir().context("failed to resolve current directory")?;
    Ok(cwd.join("config").join("gateway").join("default.toml"))
}
