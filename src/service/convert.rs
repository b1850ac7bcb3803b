//! JSON argument conversion for service calls. Arguments are positional;
//! conversion failures reject the call before any mutation happens.

use anyhow::{Result, anyhow, bail};
use serde_json::Value;

use crate::obj::{MetaMap, ORef, StarObj};

pub fn arg<'a>(args: &'a [Value], idx: usize, name: &str) -> Result<&'a Value> {
    args.get(idx)
        .ok_or_else(|| anyhow!("not enough arguments: missing {name:?} (idx {idx})"))
}

pub fn arg_str(args: &[Value], idx: usize, name: &str) -> Result<String> {
    match arg(args, idx, name)? {
        Value::String(s) => Ok(s.clone()),
        other => bail!("cannot convert {other:?} to string for {name:?}"),
    }
}

pub fn arg_bool(args: &[Value], idx: usize, name: &str) -> Result<bool> {
    match arg(args, idx, name)? {
        Value::Bool(b) => Ok(*b),
        other => bail!("cannot convert {other:?} to bool for {name:?}"),
    }
}

/// Numbers are routed to the declared integer kind; a fractional value is a
/// bad argument, not a silent truncation.
pub fn arg_i64(args: &[Value], idx: usize, name: &str) -> Result<i64> {
    match arg(args, idx, name)? {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            bail!("cannot convert {n} to integer for {name:?}")
        }
        other => bail!("cannot convert {other:?} to number for {name:?}"),
    }
}

pub fn arg_oref(args: &[Value], idx: usize, name: &str) -> Result<ORef> {
    let s = arg_str(args, idx, name)?;
    s.parse()
        .map_err(|e| anyhow!("invalid oref string for {name:?}: {e}"))
}

pub fn arg_meta(args: &[Value], idx: usize, name: &str) -> Result<MetaMap> {
    match arg(args, idx, name)? {
        Value::Null => Ok(MetaMap::new()),
        v @ Value::Object(_) => Ok(serde_json::from_value(v.clone())?),
        other => bail!("cannot convert {other:?} to meta map for {name:?}"),
    }
}

/// StarObj values are decoded by their `otype` key.
pub fn arg_star_obj(args: &[Value], idx: usize, name: &str) -> Result<StarObj> {
    match arg(args, idx, name)? {
        v @ Value::Object(_) => {
            serde_json::from_value(v.clone()).map_err(|e| anyhow!("cannot decode {name:?}: {e}"))
        }
        other => bail!("cannot convert {other:?} to star object for {name:?}"),
    }
}

/// Structs and nullable struct pointers decode through serde; null maps to
/// None.
pub fn arg_struct_opt<T: serde::de::DeserializeOwned>(
    args: &[Value],
    idx: usize,
    name: &str,
) -> Result<Option<T>> {
    match args.get(idx) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => Ok(Some(
            serde_json::from_value(v.clone()).map_err(|e| anyhow!("cannot decode {name:?}: {e}"))?,
        )),
    }
}

pub fn arg_struct<T: serde::de::DeserializeOwned>(
    args: &[Value],
    idx: usize,
    name: &str,
) -> Result<T> {
    let v = arg(args, idx, name)?;
    serde_json::from_value(v.clone()).map_err(|e| anyhow!("cannot decode {name:?}: {e}"))
}

pub fn arg_str_vec(args: &[Value], idx: usize, name: &str) -> Result<Vec<String>> {
    match arg(args, idx, name)? {
        Value::Null => Ok(Vec::new()),
        v @ Value::Array(_) => Ok(serde_json::from_value(v.clone())?),
        other => bail!("cannot convert {other:?} to string list for {name:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_kind_routing() {
        let args = vec![json!(5), json!(2.5)];
        assert_eq!(arg_i64(&args, 0, "n").unwrap(), 5);
        let err = arg_i64(&args, 1, "frac").unwrap_err();
        assert!(err.to_string().contains("cannot convert"));
    }

    #[test]
    fn test_missing_argument_rejected() {
        let args = vec![json!("x")];
        assert!(arg_str(&args, 0, "a").is_ok());
        let err = arg_str(&args, 1, "b").unwrap_err();
        assert!(err.to_string().contains("not enough arguments"));
    }

    #[test]
    fn test_oref_parsing() {
        let oid = uuid::Uuid::new_v4().to_string();
        let args = vec![json!(format!("block:{oid}")), json!("nope")];
        let oref = arg_oref(&args, 0, "oref").unwrap();
        assert_eq!(oref.otype, "block");
        assert!(arg_oref(&args, 1, "oref").is_err());
    }

    #[test]
    fn test_star_obj_by_otype() {
        let args = vec![json!({"otype": "tab", "oid": "t1", "blockids": ["b"]})];
        let obj = arg_star_obj(&args, 0, "obj").unwrap();
        assert_eq!(obj.otype(), "tab");
        let bad = vec![json!({"otype": "gadget", "oid": "x"})];
        assert!(arg_star_obj(&bad, 0, "obj").is_err());
    }

    #[test]
    fn test_wrong_type_rejected() {
        let args = vec![json!(12)];
        assert!(arg_str(&args, 0, "s").is_err());
        assert!(arg_bool(&args, 0, "b").is_err());
        assert!(arg_meta(&args, 0, "m").is_err());
    }
}
