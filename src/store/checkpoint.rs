//! Checkpoint file I/O
//!
//! A checkpoint is a whole-store snapshot serialized as one JSON object.
//! Writing goes through a temp file in the same directory followed by an
//! atomic rename, so at every instant the live path holds either the old
//! complete checkpoint or the new complete one. The temp file is synced
//! before the rename: WAL truncation is gated on the snapshot being
//! durable, not merely written.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde_json::Value;

use crate::error::Result;

/// Serialize `map` to `path` atomically.
pub fn write_snapshot(path: &Path, map: &HashMap<String, Value>) -> Result<()> {
    let temp_path = path.with_extension("pkl.tmp");

    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, map)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Load the checkpoint at `path`.
///
/// A missing file or one that fails to deserialize both mean "no
/// checkpoint": recovery starts from an empty store and the WAL tail.
pub fn load_snapshot(path: &Path) -> Option<HashMap<String, Value>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return None,
    };
    match serde_json::from_reader(BufReader::new(file)) {
        Ok(map) => Some(map),
        Err(e) => {
            log::warn!("Ignoring unreadable checkpoint '{}': {}", path.display(), e);
            None
        }
    }
}
