//! Durable snapshots of drain data.
//!
//! A snapshot is a JSON envelope `{ version, checksum, data }` where
//! `checksum` is the hex SHA-256 of the serialized `data`.

use crate::core::DrainData;
use crate::errors::DrainflowError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Envelope format written by [`dump_drain_data`].
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    checksum: String,
    data: serde_json::Value,
}

fn digest(value: &serde_json::Value) -> Result<String, DrainflowError> {
    let json = serde_json::to_string(value)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Returns the checksum a snapshot of `data` carries.
pub fn checksum(data: &DrainData) -> Result<String, DrainflowError> {
    digest(&serde_json::to_value(data)?)
}

/// Writes `data` to `path` and returns its checksum.
///
/// The envelope goes to a sibling temporary file first and is renamed into
/// place, so a reader never sees a partial snapshot.
pub fn dump_drain_data(path: impl AsRef<Path>, data: &DrainData) -> Result<String, DrainflowError> {
    let path = path.as_ref();
    let value = serde_json::to_value(data)?;
    let envelope = Envelope {
        version: FORMAT_VERSION,
        checksum: digest(&value)?,
        data: value,
    };

    let staging = path.with_extension("partial");
    fs::write(&staging, serde_json::to_vec_pretty(&envelope)?)?;
    fs::rename(&staging, path)?;
    info!(
        path = %path.display(),
        items = data.item_count(),
        members = data.state().len(),
        "Drain data written"
    );
    Ok(envelope.checksum)
}

/// Reads a snapshot written by [`dump_drain_data`], verifying its version
/// and checksum.
pub fn read_drain_data(path: impl AsRef<Path>) -> Result<DrainData, DrainflowError> {
    let path = path.as_ref();
    let envelope: Envelope = serde_json::from_slice(&fs::read(path)?)?;
    if envelope.version != FORMAT_VERSION {
        return Err(DrainflowError::Serialization(format!(
            "unsupported drain data version {} in {}",
            envelope.version,
            path.display()
        )));
    }
    let actual = digest(&envelope.data)?;
    if actual != envelope.checksum {
        return Err(DrainflowError::Serialization(format!(
            "checksum mismatch in {}: expected {}, found {actual}",
            path.display(),
            envelope.checksum
        )));
    }
    let data: DrainData = serde_json::from_value(envelope.data)?;
    debug!(path = %path.display(), items = data.item_count(), "Drain data read");
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FieldMap, MemberId, Token};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn sample() -> DrainData {
        let mut data = BTreeMap::new();
        data.insert(Token::new(-1, 0), vec![json!(1), json!({"k": "v"})]);
        data.insert(Token::new(0, 1), vec![]);
        let mut fields = FieldMap::new();
        fields.insert("count".to_string(), json!(7));
        let mut state = BTreeMap::new();
        state.insert(MemberId(2), fields);
        DrainData::new(data, state)
    }

    #[test]
    fn test_dump_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("round.json");
        let data = sample();

        let written = dump_drain_data(&path, &data).unwrap();
        assert_eq!(written, checksum(&data).unwrap());
        assert!(!path.with_extension("partial").exists());
        assert_eq!(read_drain_data(&path).unwrap(), data);
    }

    #[test]
    fn test_tampered_snapshot_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("round.json");
        dump_drain_data(&path, &sample()).unwrap();

        let mut envelope: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        envelope["data"]["state"]["2"]["count"] = json!(8);
        fs::write(&path, serde_json::to_vec(&envelope).unwrap()).unwrap();

        let err = read_drain_data(&path).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("round.json");
        let envelope = json!({ "version": 99, "checksum": "", "data": {} });
        fs::write(&path, serde_json::to_vec(&envelope).unwrap()).unwrap();
        assert!(matches!(read_drain_data(&path), Err(DrainflowError::Serialization(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_drain_data(dir.path().join("absent.json")),
            Err(DrainflowError::Io(_))
        ));
    }
}
