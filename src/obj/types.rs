//! The persistable entity variants.
//!
//! JSON field names are all-lowercase without separators (`tabids`,
//! `parentoref`, ...) because the store's structural lookups use JSON-path
//! queries against the serialized form.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{MetaMap, ORef};
use super::{OTYPE_BLOCK, OTYPE_CLIENT, OTYPE_LAYOUT, OTYPE_TAB, OTYPE_WINDOW, OTYPE_WORKSPACE};

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub oid: String,
    #[serde(default)]
    pub version: i64,
    #[serde(rename = "windowids", default)]
    pub window_ids: Vec<String>,
    #[serde(rename = "tempoid", default, skip_serializing_if = "String::is_empty")]
    pub temp_oid: String,
    #[serde(rename = "tosagreed", default, skip_serializing_if = "is_zero_i64")]
    pub tos_agreed: i64,
    #[serde(default, skip_serializing_if = "MetaMap::is_empty")]
    pub meta: MetaMap,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    #[serde(default)]
    pub x: i64,
    #[serde(default)]
    pub y: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WinSize {
    #[serde(default)]
    pub width: i64,
    #[serde(default)]
    pub height: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TermSize {
    #[serde(default)]
    pub rows: i64,
    #[serde(default)]
    pub cols: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub oid: String,
    #[serde(default)]
    pub version: i64,
    #[serde(rename = "workspaceid", default)]
    pub workspace_id: String,
    #[serde(rename = "isnew", default, skip_serializing_if = "is_false")]
    pub is_new: bool,
    #[serde(default)]
    pub pos: Point,
    #[serde(rename = "winsize", default)]
    pub win_size: WinSize,
    #[serde(default, skip_serializing_if = "MetaMap::is_empty")]
    pub meta: MetaMap,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub oid: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub color: String,
    #[serde(rename = "tabids", default)]
    pub tab_ids: Vec<String>,
    #[serde(rename = "pinnedtabids", default)]
    pub pinned_tab_ids: Vec<String>,
    #[serde(rename = "activetabid", default, skip_serializing_if = "String::is_empty")]
    pub active_tab_id: String,
    #[serde(default, skip_serializing_if = "MetaMap::is_empty")]
    pub meta: MetaMap,
}

impl Workspace {
    /// The authoritative tab order: pinned tabs first, then regular tabs.
    pub fn all_tab_ids(&self) -> Vec<String> {
        let mut rtn = self.pinned_tab_ids.clone();
        rtn.extend(self.tab_ids.iter().cloned());
        rtn
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tab {
    pub oid: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "layoutstate", default)]
    pub layout_state: String,
    #[serde(rename = "blockids", default)]
    pub block_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "MetaMap::is_empty")]
    pub meta: MetaMap,
}

impl Tab {
    pub fn block_orefs(&self) -> Vec<ORef> {
        self.block_ids
            .iter()
            .map(|id| ORef::new(OTYPE_BLOCK, id.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub oid: String,
    #[serde(default)]
    pub version: i64,
    #[serde(rename = "parentoref", default)]
    pub parent_oref: String,
    #[serde(rename = "subblockids", default, skip_serializing_if = "Vec::is_empty")]
    pub sub_block_ids: Vec<String>,
    #[serde(rename = "runtimeopts", default, skip_serializing_if = "Option::is_none")]
    pub runtime_opts: Option<RuntimeOpts>,
    #[serde(default, skip_serializing_if = "MetaMap::is_empty")]
    pub meta: MetaMap,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutState {
    pub oid: String,
    #[serde(default)]
    pub version: i64,
    #[serde(
        rename = "pendingbackendactions",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub pending_backend_actions: Vec<LayoutActionData>,
    #[serde(default, skip_serializing_if = "MetaMap::is_empty")]
    pub meta: MetaMap,
}

/// Command queued on a tab's layout state describing a structural UI change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutActionData {
    #[serde(rename = "actiontype")]
    pub action_type: String,
    #[serde(rename = "blockid", default, skip_serializing_if = "String::is_empty")]
    pub block_id: String,
    #[serde(
        rename = "targetblockid",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub target_block_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub position: String,
    #[serde(rename = "indexarr", default, skip_serializing_if = "Option::is_none")]
    pub index_arr: Option<Vec<i64>>,
    #[serde(rename = "nodesize", default, skip_serializing_if = "Option::is_none")]
    pub node_size: Option<u64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub magnified: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ephemeral: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub focused: bool,
}

/// Definition of a block to create: metadata plus optional initial files
/// written into the block's blob zone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockDef {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub files: HashMap<String, FileDef>,
    #[serde(default, skip_serializing_if = "MetaMap::is_empty")]
    pub meta: MetaMap,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileDef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "MetaMap::is_empty")]
    pub meta: MetaMap,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeOpts {
    #[serde(rename = "termsize", default, skip_serializing_if = "Option::is_none")]
    pub term_size: Option<TermSize>,
    #[serde(rename = "winsize", default, skip_serializing_if = "Option::is_none")]
    pub win_size: Option<WinSize>,
}

/// UI-side context sent with service calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UIContext {
    #[serde(rename = "windowid", default)]
    pub window_id: String,
    #[serde(rename = "activetabid", default)]
    pub active_tab_id: String,
}

/// Any persistable entity, tagged by `otype` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "otype", rename_all = "lowercase")]
pub enum StarObj {
    Client(Client),
    Window(Window),
    Workspace(Workspace),
    Tab(Tab),
    Block(Block),
    Layout(LayoutState),
}

impl StarObj {
    pub fn otype(&self) -> &'static str {
        match self {
            StarObj::Client(_) => OTYPE_CLIENT,
            StarObj::Window(_) => OTYPE_WINDOW,
            StarObj::Workspace(_) => OTYPE_WORKSPACE,
            StarObj::Tab(_) => OTYPE_TAB,
            StarObj::Block(_) => OTYPE_BLOCK,
            StarObj::Layout(_) => OTYPE_LAYOUT,
        }
    }

    pub fn oid(&self) -> &str {
        match self {
            StarObj::Client(o) => &o.oid,
            StarObj::Window(o) => &o.oid,
            StarObj::Workspace(o) => &o.oid,
            StarObj::Tab(o) => &o.oid,
            StarObj::Block(o) => &o.oid,
            StarObj::Layout(o) => &o.oid,
        }
    }

    pub fn version(&self) -> i64 {
        match self {
            StarObj::Client(o) => o.version,
            StarObj::Window(o) => o.version,
            StarObj::Workspace(o) => o.version,
            StarObj::Tab(o) => o.version,
            StarObj::Block(o) => o.version,
            StarObj::Layout(o) => o.version,
        }
    }

    pub fn set_version(&mut self, version: i64) {
        match self {
            StarObj::Client(o) => o.version = version,
            StarObj::Window(o) => o.version = version,
            StarObj::Workspace(o) => o.version = version,
            StarObj::Tab(o) => o.version = version,
            StarObj::Block(o) => o.version = version,
            StarObj::Layout(o) => o.version = version,
        }
    }

    pub fn meta(&self) -> &MetaMap {
        match self {
            StarObj::Client(o) => &o.meta,
            StarObj::Window(o) => &o.meta,
            StarObj::Workspace(o) => &o.meta,
            StarObj::Tab(o) => &o.meta,
            StarObj::Block(o) => &o.meta,
            StarObj::Layout(o) => &o.meta,
        }
    }

    pub fn set_meta(&mut self, meta: MetaMap) {
        match self {
            StarObj::Client(o) => o.meta = meta,
            StarObj::Window(o) => o.meta = meta,
            StarObj::Workspace(o) => o.meta = meta,
            StarObj::Tab(o) => o.meta = meta,
            StarObj::Block(o) => o.meta = meta,
            StarObj::Layout(o) => o.meta = meta,
        }
    }

    pub fn oref(&self) -> ORef {
        ORef::new(self.otype(), self.oid())
    }
}

macro_rules! star_obj_variant {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for StarObj {
            fn from(v: $ty) -> StarObj {
                StarObj::$variant(v)
            }
        }

        impl TryFrom<StarObj> for $ty {
            type Error = anyhow::Error;

            fn try_from(obj: StarObj) -> Result<Self, Self::Error> {
                match obj {
                    StarObj::$variant(v) => Ok(v),
                    other => anyhow::bail!(
                        "type mismatch: got {}, expected {}",
                        other.otype(),
                        stringify!($variant)
                    ),
                }
            }
        }
    };
}

star_obj_variant!(Client, Client);
star_obj_variant!(Window, Window);
star_obj_variant!(Workspace, Workspace);
star_obj_variant!(Tab, Tab);
star_obj_variant!(Block, Block);
star_obj_variant!(LayoutState, Layout);

// Meta keys used by the daemon itself. Clients attach arbitrary namespaced
// keys beyond these.
pub const META_KEY_VIEW: &str = "view";
pub const META_KEY_CONTROLLER: &str = "controller";
pub const META_KEY_URL: &str = "url";
pub const META_KEY_FILE: &str = "file";
pub const META_KEY_CONNECTION: &str = "connection";
pub const META_KEY_CMD_CWD: &str = "cmd:cwd";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_star_obj_json_roundtrip() {
        let tab = Tab {
            oid: "t1".into(),
            version: 3,
            name: "scratch".into(),
            layout_state: "l1".into(),
            block_ids: vec!["b1".into(), "b2".into()],
            meta: MetaMap::new(),
        };
        let obj = StarObj::from(tab.clone());
        let json = serde_json::to_string(&obj).unwrap();
        assert!(json.contains("\"otype\":\"tab\""));
        assert!(json.contains("\"blockids\""));
        let back: StarObj = serde_json::from_str(&json).unwrap();
        assert_eq!(back, obj);
        let tab_back: Tab = back.try_into().unwrap();
        assert_eq!(tab_back, tab);
    }

    #[test]
    fn test_star_obj_roundtrip_all_variants() {
        let objs: Vec<StarObj> = vec![
            Client {
                oid: "c".into(),
                window_ids: vec!["w".into()],
                ..Default::default()
            }
            .into(),
            Window {
                oid: "w".into(),
                workspace_id: "ws".into(),
                is_new: true,
                win_size: WinSize {
                    width: 800,
                    height: 600,
                },
                ..Default::default()
            }
            .into(),
            Workspace {
                oid: "ws".into(),
                name: "main".into(),
                tab_ids: vec!["t".into()],
                active_tab_id: "t".into(),
                ..Default::default()
            }
            .into(),
            Tab {
                oid: "t".into(),
                layout_state: "l".into(),
                ..Default::default()
            }
            .into(),
            Block {
                oid: "b".into(),
                parent_oref: "tab:t".into(),
                meta: [("view".to_string(), json!("term"))].into_iter().collect(),
                ..Default::default()
            }
            .into(),
            LayoutState {
                oid: "l".into(),
                pending_backend_actions: vec![LayoutActionData {
                    action_type: "insert".into(),
                    block_id: "b".into(),
                    focused: true,
                    ..Default::default()
                }],
                ..Default::default()
            }
            .into(),
        ];
        for obj in objs {
            let json = serde_json::to_value(&obj).unwrap();
            let back: StarObj = serde_json::from_value(json).unwrap();
            assert_eq!(back, obj);
        }
    }

    #[test]
    fn test_unknown_otype_fails_decode() {
        let err = serde_json::from_value::<StarObj>(json!({"otype": "gadget", "oid": "x"}));
        assert!(err.is_err());
    }

    #[test]
    fn test_workspace_all_tab_ids_order() {
        let ws = Workspace {
            pinned_tab_ids: vec!["p1".into(), "p2".into()],
            tab_ids: vec!["t1".into()],
            ..Default::default()
        };
        assert_eq!(ws.all_tab_ids(), vec!["p1", "p2", "t1"]);
    }
}
