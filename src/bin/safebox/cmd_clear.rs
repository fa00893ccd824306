use anyhow::{anyhow, Result};
use std::path::PathBuf;

use super::util::open_engine;

pub fn exec(path: PathBuf, name: String) -> Result<()> {
    let sb = open_engine(&path, &name)?;
    let n = sb.len();
    let mut batch = sb.edit();
    batch.clear();
    if !sb.commit_batch(batch) {
        return Err(anyhow!("clear failed"));
    }
    sb.close()?;
    println!("OK cleared '{}' ({} entries)", name, n);
    Ok(())
}
