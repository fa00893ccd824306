use anyhow::{anyhow, Result};
use std::path::PathBuf;

use super::util::{decode_value_arg, open_engine};

pub fn exec(path: PathBuf, name: String, key: String, value: String) -> Result<()> {
    let (bytes, src) = decode_value_arg(&value)?;
    let sb = open_engine(&path, &name)?;
    let mut batch = sb.edit();
    batch.put(&key, bytes.clone());
    if !sb.commit_batch(batch) {
        return Err(anyhow!("commit failed for '{}'", key));
    }
    sb.close()?;
    println!("OK put '{}' ({} B from {})", key, bytes.len(), src);
    Ok(())
}
