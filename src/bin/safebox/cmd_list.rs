use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;

use super::util::{display_text, hex_preview, open_engine};

pub fn exec(path: PathBuf, name: String, json: bool) -> Result<()> {
    let sb = open_engine(&path, &name)?;
    let mut entries: Vec<(String, Vec<u8>)> = sb.get_entries().into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    if json {
        let items: Vec<serde_json::Value> = entries
            .iter()
            .map(|(k, v)| match std::str::from_utf8(v) {
                Ok(s) => json!({ "key": k, "value": s }),
                Err(_) => json!({ "key": k, "value_hex": hex_preview(v), "len": v.len() }),
            })
            .collect();
        println!("{}", serde_json::to_string(&items)?);
    } else {
        for (k, v) in entries.iter() {
            println!("{} = {}", k, display_text(v));
        }
        println!("({} entries)", entries.len());
    }
    sb.close()
}
