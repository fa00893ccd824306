use anyhow::Result;
use std::path::PathBuf;

use super::util::{display_text, hex_preview, open_engine};

pub fn exec(path: PathBuf, name: String, key: String) -> Result<()> {
    let sb = open_engine(&path, &name)?;
    match sb.get_value(&key) {
        Some(v) => {
            println!("FOUND '{}': {} B", key, v.len());
            println!("text: {}", display_text(&v));
            println!("hex:  {}", hex_preview(&v));
        }
        None => println!("NOT FOUND '{}'", key),
    }
    sb.close()
}
