use serde::Deserialize;
use serde_json::Value;

/// Storage location of proposal preimages, keyed by preimage hash.
pub const PREIMAGE_STORAGE: &str = "preimage.preimage_for";
pub const PREIMAGE_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreimageMeta {
    pub title: String,
    pub description: String,
    pub proposer: String,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PreimageError {
    #[error("preimage is not valid json: {0}")]
    Json(String),
    #[error("unsupported preimage schema version {0:?}")]
    Version(Option<u64>),
    #[error("preimage field `{0}` is empty")]
    Empty(&'static str),
}

#[derive(Deserialize)]
struct PreimageV1 {
    title: String,
    #[serde(default)]
    description: String,
    proposer: String,
}

/// Decode a preimage payload. The stored value may be the JSON object itself
/// or a string holding it.
pub fn decode_preimage(raw: &Value) -> Result<PreimageMeta, PreimageError> {
    let owned;
    let v = match raw {
        Value::String(s) => {
            owned = serde_json::from_str::<Value>(s).map_err(|e| PreimageError::Json(e.to_string()))?;
            &owned
        }
        other => other,
    };
    let version = v.get("v").and_then(Value::as_u64);
    if version != Some(PREIMAGE_SCHEMA_VERSION) {
        return Err(PreimageError::Version(version));
    }
    let p: PreimageV1 =
        serde_json::from_value(v.clone()).map_err(|e| PreimageError::Json(e.to_string()))?;
    if p.title.trim().is_empty() {
        return Err(PreimageError::Empty("title"));
    }
    if p.proposer.trim().is_empty() {
        return Err(PreimageError::Empty("proposer"));
    }
    Ok(PreimageMeta {
        title: p.title,
        description: p.description,
        proposer: p.proposer,
    })
}
