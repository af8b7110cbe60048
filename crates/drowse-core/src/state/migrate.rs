//! Schema migrations over the raw JSON document.
//!
//! Each step upgrades exactly one version and is applied in order until
//! the document reaches [`CURRENT_SCHEMA`].

use crate::error::{CoreError, Result};
use crate::state::model::CURRENT_SCHEMA;
use serde_json::{json, Map, Value};

/// Schema assumed for documents that predate the `schema` field.
const UNVERSIONED_SCHEMA: u32 = 1;

/// Schema a raw document declares.
pub fn stored_schema(doc: &Value) -> u32 {
    doc.get("schema")
        .and_then(Value::as_u64)
        .map(|v| v.min(u32::MAX as u64) as u32)
        .unwrap_or(UNVERSIONED_SCHEMA)
}

/// Bring `doc` up to the current schema.
///
/// Returns the version it started from.
pub fn upgrade(doc: &mut Value) -> Result<u32> {
    let from = stored_schema(doc);
    if from > CURRENT_SCHEMA {
        return Err(CoreError::UnsupportedSchema {
            found: from,
            supported: CURRENT_SCHEMA,
        });
    }

    let mut version = from;
    while version < CURRENT_SCHEMA {
        match version {
            1 => v1_to_v2(doc)?,
            2 => v2_to_v3(doc)?,
            other => {
                return Err(CoreError::Migration {
                    from: other,
                    reason: "no migration registered".into(),
                })
            }
        }
        version += 1;
        tracing::debug!(schema = version, "Applied state migration");
    }

    if let Some(obj) = doc.as_object_mut() {
        obj.insert("schema".into(), json!(CURRENT_SCHEMA));
    }
    Ok(from)
}

fn environments_mut(doc: &mut Value, from: u32) -> Result<Option<&mut Map<String, Value>>> {
    let obj = doc.as_object_mut().ok_or_else(|| CoreError::Migration {
        from,
        reason: "document is not an object".into(),
    })?;
    match obj.get_mut("environments") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(envs)) => Ok(Some(envs)),
        Some(_) => Err(CoreError::Migration {
            from,
            reason: "environments is not an object".into(),
        }),
    }
}

/// v1 -> v2: environments gain `migrated_dirs`.
fn v1_to_v2(doc: &mut Value) -> Result<()> {
    let Some(envs) = environments_mut(doc, 1)? else {
        return Ok(());
    };
    for env in envs.values_mut() {
        if let Some(env) = env.as_object_mut() {
            env.entry("migrated_dirs").or_insert_with(|| json!({}));
        }
    }
    Ok(())
}

/// v2 -> v3: environment `ports` changes from `{name: port}` to a list
/// of mappings.
fn v2_to_v3(doc: &mut Value) -> Result<()> {
    let Some(envs) = environments_mut(doc, 2)? else {
        return Ok(());
    };
    for (name, env) in envs.iter_mut() {
        let Some(env) = env.as_object_mut() else {
            continue;
        };
        let converted = match env.get("ports") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(_)) => continue,
            Some(Value::Object(named)) => {
                let mut ports = Vec::with_capacity(named.len());
                for (label, port) in named {
                    let port = port
                        .as_u64()
                        .filter(|p| (1..=u16::MAX as u64).contains(p))
                        .ok_or_else(|| CoreError::Migration {
                            from: 2,
                            reason: format!("environment {name}: port {label} is not a valid port"),
                        })?;
                    ports.push(json!({
                        "host_port": port,
                        "container_port": port,
                        "protocol": "tcp",
                    }));
                }
                ports
            }
            Some(_) => {
                return Err(CoreError::Migration {
                    from: 2,
                    reason: format!("environment {name}: ports has an unexpected shape"),
                })
            }
        };
        env.insert("ports".into(), Value::Array(converted));
    }
    Ok(())
}
