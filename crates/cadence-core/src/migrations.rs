use crate::error::{CadenceError, Result};
use crate::snapshot::SCHEMA_VERSION;
use crate::types::PlatformKind;
use serde_yaml::{Mapping, Value};
use tracing::debug;

/// Upgrade a raw snapshot document to the current schema, in memory.
///
/// Nothing is written back; the upgraded form reaches disk on the next save.
///
/// - v1 (unversioned): platform tag missing or stored as `connection_type`,
///   `duration_days` instead of `duration`, status spelled `error`.
pub fn migrate_snapshot(mut doc: Value) -> Result<Value> {
    let Some(map) = doc.as_mapping_mut() else {
        return Ok(doc);
    };
    let version = map
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;

    if version > SCHEMA_VERSION {
        return Err(CadenceError::UnsupportedSchema(version));
    }
    if version < 2 {
        migrate_v1_to_v2(map);
    }
    Ok(doc)
}

fn migrate_v1_to_v2(map: &mut Mapping) {
    let legacy_kind = map
        .remove("connection_type")
        .and_then(|v| v.as_str().map(str::to_string));

    if map.get("status").and_then(Value::as_str) == Some("error") {
        map.insert("status".into(), "errored".into());
    }

    if !map.contains_key("config") {
        map.insert("config".into(), Value::Mapping(Mapping::new()));
    }
    if let Some(cfg) = map.get_mut("config").and_then(Value::as_mapping_mut) {
        let platform = match cfg.remove("platform") {
            // Bare tag: `platform: okta`.
            Some(Value::String(kind)) => Some(tagged(&kind)),
            Some(v @ Value::Mapping(_)) => Some(v),
            _ => None,
        };
        let platform = platform.unwrap_or_else(|| {
            let kind = legacy_kind
                .as_deref()
                .and_then(|k| k.parse::<PlatformKind>().ok())
                .unwrap_or_default();
            tagged(kind.as_str())
        });
        cfg.insert("platform".into(), platform);

        if let Some(days) = cfg.remove("duration_days") {
            if !cfg.contains_key("duration") {
                let duration = match days {
                    Value::Null => Value::String("indefinite".into()),
                    other => other,
                };
                cfg.insert("duration".into(), duration);
            }
        }
    }

    debug!("migrated snapshot schema v1 -> v2");
    map.insert("schema_version".into(), Value::from(2u32));
}

fn tagged(kind: &str) -> Value {
    let mut m = Mapping::new();
    m.insert("kind".into(), kind.into());
    Value::Mapping(m)
}
