//! Per-transaction update capture records.
//!
//! Mutating store operations append one record per touched row to the
//! transaction's update buffer. On commit the buffer is handed back to the
//! caller, which returns it in service responses and feeds it to the broker
//! as `starobj:update` events.

use serde::{Deserialize, Serialize};

use super::{ORef, StarObj};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    #[serde(rename = "updatetype")]
    pub update_type: UpdateType,
    pub otype: String,
    pub oid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obj: Option<StarObj>,
}

impl UpdateRecord {
    pub fn update(obj: &StarObj) -> Self {
        Self {
            update_type: UpdateType::Update,
            otype: obj.otype().to_string(),
            oid: obj.oid().to_string(),
            obj: Some(obj.clone()),
        }
    }

    pub fn delete(otype: &str, oid: &str) -> Self {
        Self {
            update_type: UpdateType::Delete,
            otype: otype.to_string(),
            oid: oid.to_string(),
            obj: None,
        }
    }

    pub fn oref(&self) -> ORef {
        ORef::new(self.otype.clone(), self.oid.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::Tab;

    #[test]
    fn test_update_record_serialization() {
        let tab = Tab {
            oid: "t1".into(),
            version: 2,
            ..Default::default()
        };
        let rec = UpdateRecord::update(&StarObj::from(tab));
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"updatetype\":\"update\""));
        assert!(json.contains("\"otype\":\"tab\""));

        let del = UpdateRecord::delete("block", "b1");
        let json = serde_json::to_string(&del).unwrap();
        assert!(json.contains("\"updatetype\":\"delete\""));
        assert!(!json.contains("\"obj\""));
    }
}
