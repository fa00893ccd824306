use anyhow::{anyhow, Result};
use std::path::PathBuf;

use super::util::open_engine;

pub fn exec(path: PathBuf, name: String, keys: Vec<String>) -> Result<()> {
    let sb = open_engine(&path, &name)?;
    let present = keys.iter().filter(|k| sb.contains(k)).count();
    let mut batch = sb.edit();
    for k in keys.iter() {
        batch.remove(k);
    }
    if !sb.commit_batch(batch) {
        return Err(anyhow!("commit failed"));
    }
    sb.close()?;
    println!("OK deleted {} of {} key(s)", present, keys.len());
    Ok(())
}
