//! Document encoding.
//!
//! Documents are stored as pretty-printed JSON objects. A zero-length file
//! decodes to the empty document; anything other than a top-level object is
//! rejected.

use crate::error::{PrefsError, Result};
use crate::model::Value;
use crate::tree::ConfigTree;

/// Encode a tree for writing to disk.
pub fn encode_document(tree: &ConfigTree) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(tree.root())?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode file contents into a tree.
pub fn decode_document(bytes: &[u8]) -> Result<ConfigTree> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(ConfigTree::new());
    }

    match serde_json::from_slice::<Value>(bytes)? {
        Value::Mapping(root) => Ok(ConfigTree::from_mapping(root.as_ref().clone())),
        Value::Link(_) => Err(PrefsError::Serialize(
            "document root cannot be a link".to_string(),
        )),
        _ => Err(PrefsError::Serialize(
            "document root is not a mapping".to_string(),
        )),
    }
}
