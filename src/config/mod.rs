//! Layered JSON configuration.
//!
//! Each section merges three layers in order: defaults bundled with the
//! daemon, per-section files under `<config>/<section>/*.json` in descending
//! filename order, then the top-level `<config>/<section>.json`. The
//! settings section merges meta-aware (honoring `ns:*` clear keys); the
//! rest merge simple. Parse errors are collected with file, line, and
//! column — parsing never aborts startup.

mod watcher;

pub use watcher::ConfigWatcher;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::base::Paths;
use crate::obj::{MetaMap, merge_meta};

pub const SETTINGS_FILE: &str = "settings.json";
pub const CONNECTIONS_FILE: &str = "connections.json";

/// (section name, meta-aware merge)
const SECTIONS: &[(&str, bool)] = &[
    ("settings", true),
    ("connections", false),
    ("presets", false),
    ("widgets", false),
    ("defaultwidgets", false),
    ("mimetypes", false),
    ("termthemes", false),
    ("bookmarks", false),
];

const DEFAULT_SETTINGS_JSON: &str = r##"{
  "ai:model": "gpt-4o-mini",
  "ai:maxtokens": 2048,
  "term:fontsize": 12,
  "term:copyonselect": true,
  "web:defaulturl": "https://github.com/commandlinedev/starterm",
  "web:defaultsearch": "https://www.google.com/search?q={query}",
  "autoupdate:enabled": true,
  "autoupdate:intervalms": 3600000,
  "telemetry:enabled": true,
  "conn:wshenabled": true
}"##;

const DEFAULT_WIDGETS_JSON: &str = r##"{
  "defwidget@terminal": {
    "icon": "square-terminal",
    "label": "terminal",
    "blockdef": {"meta": {"view": "term", "controller": "shell"}}
  },
  "defwidget@files": {
    "icon": "folder",
    "label": "files",
    "blockdef": {"meta": {"view": "preview", "file": "~"}}
  },
  "defwidget@web": {
    "icon": "globe",
    "label": "web",
    "blockdef": {"meta": {"view": "web"}}
  },
  "defwidget@sysinfo": {
    "icon": "chart-line",
    "label": "sysinfo",
    "blockdef": {"meta": {"view": "sysinfo"}}
  },
  "defwidget@starai": {
    "icon": "sparkles",
    "label": "ai",
    "blockdef": {"meta": {"view": "starai"}}
  }
}"##;

fn bundled_defaults(section: &str) -> Option<&'static str> {
    match section {
        "settings" => Some(DEFAULT_SETTINGS_JSON),
        "defaultwidgets" => Some(DEFAULT_WIDGETS_JSON),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigError {
    pub file: String,
    pub err: String,
}

/// Typed view over the settings keys the daemon itself consumes. Unknown
/// keys survive in the raw section map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsType {
    #[serde(rename = "app:globalhotkey", default, skip_serializing_if = "String::is_empty")]
    pub app_global_hotkey: String,

    #[serde(rename = "ai:model", default, skip_serializing_if = "String::is_empty")]
    pub ai_model: String,
    #[serde(rename = "ai:apitoken", default, skip_serializing_if = "String::is_empty")]
    pub ai_api_token: String,
    #[serde(rename = "ai:maxtokens", default, skip_serializing_if = "Option::is_none")]
    pub ai_max_tokens: Option<f64>,

    #[serde(rename = "term:fontsize", default, skip_serializing_if = "Option::is_none")]
    pub term_font_size: Option<f64>,
    #[serde(rename = "term:fontfamily", default, skip_serializing_if = "String::is_empty")]
    pub term_font_family: String,
    #[serde(rename = "term:theme", default, skip_serializing_if = "String::is_empty")]
    pub term_theme: String,
    #[serde(
        rename = "term:localshellpath",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub term_local_shell_path: String,
    #[serde(
        rename = "term:localshellopts",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub term_local_shell_opts: Vec<String>,
    #[serde(rename = "term:scrollback", default, skip_serializing_if = "Option::is_none")]
    pub term_scrollback: Option<i64>,
    #[serde(
        rename = "term:copyonselect",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub term_copy_on_select: Option<bool>,

    #[serde(rename = "web:defaulturl", default, skip_serializing_if = "String::is_empty")]
    pub web_default_url: String,
    #[serde(
        rename = "web:defaultsearch",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub web_default_search: String,

    #[serde(rename = "autoupdate:enabled", default)]
    pub auto_update_enabled: bool,
    #[serde(
        rename = "autoupdate:intervalms",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_update_interval_ms: Option<f64>,
    #[serde(
        rename = "autoupdate:channel",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub auto_update_channel: String,

    #[serde(rename = "telemetry:enabled", default)]
    pub telemetry_enabled: bool,

    #[serde(rename = "conn:wshenabled", default)]
    pub conn_wsh_enabled: bool,
    #[serde(
        rename = "conn:askbeforewshinstall",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub conn_ask_before_wsh_install: Option<bool>,

    #[serde(rename = "window:tilegapsize", default, skip_serializing_if = "Option::is_none")]
    pub window_tile_gap_size: Option<i64>,
}

const KNOWN_SETTINGS_KEYS: &[&str] = &[
    "app:globalhotkey",
    "ai:model",
    "ai:apitoken",
    "ai:maxtokens",
    "term:fontsize",
    "term:fontfamily",
    "term:theme",
    "term:localshellpath",
    "term:localshellopts",
    "term:scrollback",
    "term:copyonselect",
    "web:defaulturl",
    "web:defaultsearch",
    "autoupdate:enabled",
    "autoupdate:intervalms",
    "autoupdate:channel",
    "telemetry:enabled",
    "conn:wshenabled",
    "conn:askbeforewshinstall",
    "window:tilegapsize",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FullConfig {
    #[serde(default)]
    pub settings: SettingsType,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub connections: HashMap<String, MetaMap>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub presets: HashMap<String, MetaMap>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub widgets: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub defaultwidgets: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub mimetypes: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub termthemes: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub bookmarks: HashMap<String, Value>,
    #[serde(rename = "configerrors", default)]
    pub config_errors: Vec<ConfigError>,
}

/// Read and layer every config section from disk.
pub fn read_full_config(paths: &Paths) -> FullConfig {
    let mut full = FullConfig::default();
    for (section, meta_merge) in SECTIONS {
        let (map, mut errs) = read_config_part(paths, section, *meta_merge);
        full.config_errors.append(&mut errs);
        let value = Value::Object(map.0.into_iter().collect());
        match *section {
            "settings" => match serde_json::from_value::<SettingsType>(value) {
                Ok(settings) => full.settings = settings,
                Err(e) => full.config_errors.push(ConfigError {
                    file: format!("{section}.json"),
                    err: format!("invalid settings values: {e}"),
                }),
            },
            "connections" => full.connections = decode_section(value),
            "presets" => full.presets = decode_section(value),
            "widgets" => full.widgets = decode_section(value),
            "defaultwidgets" => full.defaultwidgets = decode_section(value),
            "mimetypes" => full.mimetypes = decode_section(value),
            "termthemes" => full.termthemes = decode_section(value),
            "bookmarks" => full.bookmarks = decode_section(value),
            _ => {}
        }
    }
    full
}

fn decode_section<T: serde::de::DeserializeOwned + Default>(value: Value) -> T {
    serde_json::from_value(value).unwrap_or_default()
}

fn read_config_part(paths: &Paths, section: &str, meta_merge: bool) -> (MetaMap, Vec<ConfigError>) {
    let mut errs = Vec::new();
    let mut merged = MetaMap::new();

    if let Some(defaults) = bundled_defaults(section) {
        let (map, mut e) = parse_config_bytes(&format!("defaults:{section}.json"), defaults.as_bytes());
        errs.append(&mut e);
        merged = do_merge(merged, &map, meta_merge);
    }

    // per-section directory, descending filename order
    let dir = paths.config_dir.join(section);
    let mut dir_files: Vec<std::path::PathBuf> = fs::read_dir(&dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
                .collect()
        })
        .unwrap_or_default();
    dir_files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    for file in dir_files {
        let (map, mut e) = read_config_file(&file);
        errs.append(&mut e);
        merged = do_merge(merged, &map, meta_merge);
    }

    // top-level <section>.json
    let top = paths.config_dir.join(format!("{section}.json"));
    if top.exists() {
        let (map, mut e) = read_config_file(&top);
        errs.append(&mut e);
        merged = do_merge(merged, &map, meta_merge);
    }
    (merged, errs)
}

fn do_merge(target: MetaMap, incoming: &MetaMap, meta_merge: bool) -> MetaMap {
    if meta_merge {
        merge_meta(target, incoming, true)
    } else {
        merge_meta(target, incoming, false)
    }
}

fn read_config_file(path: &Path) -> (MetaMap, Vec<ConfigError>) {
    let name = path.display().to_string();
    match fs::read(path) {
        Ok(bytes) => parse_config_bytes(&name, &bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (MetaMap::new(), Vec::new()),
        Err(e) => (
            MetaMap::new(),
            vec![ConfigError {
                file: name,
                err: e.to_string(),
            }],
        ),
    }
}

fn parse_config_bytes(name: &str, bytes: &[u8]) -> (MetaMap, Vec<ConfigError>) {
    if bytes.is_empty() {
        return (MetaMap::new(), Vec::new());
    }
    match serde_json::from_slice::<MetaMap>(bytes) {
        Ok(map) => (map, Vec::new()),
        Err(e) => {
            let err = if is_trailing_comma_error(bytes, e.line(), e.column()) {
                format!(
                    "json syntax error at line {}, col {}: probably an extra trailing comma: {e}",
                    e.line(),
                    e.column()
                )
            } else {
                format!("json syntax error at line {}, col {}: {e}", e.line(), e.column())
            };
            (
                MetaMap::new(),
                vec![ConfigError {
                    file: name.to_string(),
                    err,
                }],
            )
        }
    }
}

fn offset_from_line_col(bytes: &[u8], line: usize, col: usize) -> usize {
    if line == 0 {
        return 0;
    }
    let mut current_line = 1;
    let mut offset = 0;
    for (i, b) in bytes.iter().enumerate() {
        if current_line == line {
            offset = i + col.saturating_sub(1);
            break;
        }
        if *b == b'\n' {
            current_line += 1;
        }
    }
    offset.min(bytes.len().saturating_sub(1))
}

fn go_back_ws(bytes: &[u8], mut offset: usize) -> usize {
    if offset >= bytes.len() {
        offset = bytes.len().saturating_sub(1);
    }
    while offset > 0 {
        offset -= 1;
        if !matches!(bytes[offset], b' ' | b'\t' | b'\n' | b'\r') {
            return offset;
        }
    }
    0
}

/// Heuristic: a syntax error just after `,}` (modulo whitespace) is almost
/// always a trailing comma.
fn is_trailing_comma_error(bytes: &[u8], line: usize, col: usize) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let offset = offset_from_line_col(bytes, line, col);
    let offset = go_back_ws(bytes, offset + 1);
    if bytes.get(offset) == Some(&b'}') {
        let offset = go_back_ws(bytes, offset);
        return bytes.get(offset) == Some(&b',');
    }
    false
}

/// Merge settings keys into `<config>/settings.json`. Keys must be known;
/// null values delete.
pub fn set_base_config_value(paths: &Paths, to_merge: &MetaMap) -> Result<()> {
    write_config_file(paths, SETTINGS_FILE, |m| {
        for (key, val) in to_merge.iter() {
            if !KNOWN_SETTINGS_KEYS.contains(&key.as_str()) {
                bail!("invalid config key: {key}");
            }
            if val.is_null() {
                m.remove(key);
            } else {
                m.insert(key.clone(), val.clone());
            }
        }
        Ok(())
    })
}

/// Merge keyword values for one connection into `<config>/connections.json`.
pub fn set_connections_config_value(paths: &Paths, host: &str, to_merge: &MetaMap) -> Result<()> {
    write_config_file(paths, CONNECTIONS_FILE, |m| {
        let mut conn_data = match m.get(host) {
            Some(Value::Object(existing)) => existing.clone(),
            _ => serde_json::Map::new(),
        };
        for (key, val) in to_merge.iter() {
            conn_data.insert(key.clone(), val.clone());
        }
        m.insert(host.to_string(), Value::Object(conn_data));
        Ok(())
    })
}

fn write_config_file(
    paths: &Paths,
    file_name: &str,
    mutate: impl FnOnce(&mut MetaMap) -> Result<()>,
) -> Result<()> {
    let path = paths.config_dir.join(file_name);
    let (mut current, errs) = read_config_file(&path);
    if let Some(err) = errs.first() {
        bail!("error reading config file: {}: {}", err.file, err.err);
    }
    mutate(&mut current)?;
    fs::create_dir_all(&paths.config_dir)?;
    fs::write(&path, marshal_config_in_order(&current))?;
    Ok(())
}

fn config_key_namespace(key: &str) -> &str {
    key.split_once(':').map(|(ns, _)| ns).unwrap_or("")
}

/// Stable output: keys grouped by namespace, then lexicographic, two-space
/// indent.
fn marshal_config_in_order(m: &MetaMap) -> String {
    if m.is_empty() {
        return "{}".to_string();
    }
    let mut keys: Vec<&String> = m.keys().collect();
    keys.sort_by(|a, b| {
        let ans = config_key_namespace(a);
        let bns = config_key_namespace(b);
        ans.cmp(bns).then_with(|| a.cmp(b))
    });
    let mut out = String::from("{\n");
    for (idx, key) in keys.iter().enumerate() {
        let val = &m[*key];
        let key_json = serde_json::to_string(key).expect("keys serialize");
        let val_json = serde_json::to_string_pretty(val).expect("values serialize");
        let val_json = val_json.replace('\n', "\n  ");
        out.push_str("  ");
        out.push_str(&key_json);
        out.push_str(": ");
        out.push_str(&val_json);
        if idx < keys.len() - 1 {
            out.push(',');
        }
        out.push('\n');
    }
    out.push('}');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_paths() -> (Paths, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("data"), tmp.path().join("config"));
        fs::create_dir_all(&paths.config_dir).unwrap();
        (paths, tmp)
    }

    #[test]
    fn test_defaults_apply_without_files() {
        let (paths, _tmp) = test_paths();
        let full = read_full_config(&paths);
        assert!(full.config_errors.is_empty());
        assert!(full.settings.telemetry_enabled);
        assert!(full.settings.conn_wsh_enabled);
        assert_eq!(full.settings.term_font_size, Some(12.0));
        assert!(full.defaultwidgets.contains_key("defwidget@terminal"));
    }

    #[test]
    fn test_top_level_file_overrides_defaults() {
        let (paths, _tmp) = test_paths();
        fs::write(
            paths.config_dir.join("settings.json"),
            r#"{"term:fontsize": 14, "telemetry:enabled": false}"#,
        )
        .unwrap();
        let full = read_full_config(&paths);
        assert_eq!(full.settings.term_font_size, Some(14.0));
        assert!(!full.settings.telemetry_enabled);
    }

    #[test]
    fn test_section_dir_layering_descending_order() {
        let (paths, _tmp) = test_paths();
        let dir = paths.config_dir.join("settings");
        fs::create_dir_all(&dir).unwrap();
        // descending filename order: 20- before 10-, so 10- wins last
        fs::write(dir.join("20-base.json"), r#"{"term:fontsize": 20}"#).unwrap();
        fs::write(dir.join("10-override.json"), r#"{"term:fontsize": 10}"#).unwrap();
        let full = read_full_config(&paths);
        assert_eq!(full.settings.term_font_size, Some(10.0));
    }

    #[test]
    fn test_parse_errors_collected_not_fatal() {
        let (paths, _tmp) = test_paths();
        fs::write(
            paths.config_dir.join("settings.json"),
            "{\"term:fontsize\": 14,\n}",
        )
        .unwrap();
        let full = read_full_config(&paths);
        assert_eq!(full.config_errors.len(), 1);
        assert!(full.config_errors[0].err.contains("trailing comma"));
        // defaults still apply
        assert!(full.settings.conn_wsh_enabled);
    }

    #[test]
    fn test_set_base_config_value_validates_keys() {
        let (paths, _tmp) = test_paths();
        let mut meta = MetaMap::new();
        meta.insert("term:fontsize".to_string(), json!(16));
        set_base_config_value(&paths, &meta).unwrap();

        let written = fs::read_to_string(paths.config_dir.join("settings.json")).unwrap();
        assert!(written.contains("\"term:fontsize\": 16"));

        let mut bad = MetaMap::new();
        bad.insert("nope:key".to_string(), json!(1));
        assert!(set_base_config_value(&paths, &bad).is_err());
    }

    #[test]
    fn test_set_connections_config_value() {
        let (paths, _tmp) = test_paths();
        let mut meta = MetaMap::new();
        meta.insert("conn:wshenabled".to_string(), json!(false));
        set_connections_config_value(&paths, "user@host", &meta).unwrap();
        let full = read_full_config(&paths);
        let conn = full.connections.get("user@host").unwrap();
        assert_eq!(conn.get_bool("conn:wshenabled", true), false);
    }

    #[test]
    fn test_marshal_orders_by_namespace() {
        let mut m = MetaMap::new();
        m.insert("term:theme".to_string(), json!("dark"));
        m.insert("ai:model".to_string(), json!("m"));
        m.insert("term:fontsize".to_string(), json!(12));
        let out = marshal_config_in_order(&m);
        let ai_pos = out.find("ai:model").unwrap();
        let font_pos = out.find("term:fontsize").unwrap();
        let theme_pos = out.find("term:theme").unwrap();
        assert!(ai_pos < font_pos && font_pos < theme_pos);
    }
}
