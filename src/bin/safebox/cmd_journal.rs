use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;

use SafeBox::{RecoveryBlobStore, SafeBoxConfig};

pub fn exec(path: PathBuf, json: bool) -> Result<()> {
    let cfg = SafeBoxConfig::from_env();
    let journal = RecoveryBlobStore::open(&path, &cfg)?;
    // Пересканировать (с починкой битого хвоста) и построить индекс по файлам.
    journal.load_persisted_entries("")?;
    let js = journal.stats();

    if json {
        let v = json!({
            "path": journal.path().display().to_string(),
            "capacity": js.capacity,
            "used": js.tail,
            "files": js.files,
        });
        println!("{}", serde_json::to_string(&v)?);
    } else {
        println!("recovery journal {}", journal.path().display());
        println!("  used: {}/{} B", js.tail, js.capacity);
        if js.files.is_empty() {
            println!("  (empty)");
        }
        for (file, n) in js.files.iter() {
            println!("  {:<24} {} record(s)", file, n);
        }
    }
    journal.close()
}
