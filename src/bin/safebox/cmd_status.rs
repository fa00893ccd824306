use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;

use SafeBox::metrics::metrics_snapshot;

use super::util::open_engine;

pub fn exec(path: PathBuf, name: String, json: bool) -> Result<()> {
    let sb = open_engine(&path, &name)?;
    sb.await_idle();
    let st = sb.store_stats();
    let js = sb.journal_stats();
    let journal_records = js.files.get(&name).copied().unwrap_or(0);
    let ms = metrics_snapshot();

    if json {
        let v = json!({
            "file": st.file_name,
            "state": sb.state(),
            "page_capacity": st.capacity,
            "pages": st.pages,
            "tails": st.tails,
            "entries": st.entries,
            "journal": {
                "capacity": js.capacity,
                "used": js.tail,
                "records_for_file": journal_records,
            },
            "config": sb.config().to_string(),
            "metrics": ms,
        });
        println!("{}", serde_json::to_string(&v)?);
    } else {
        println!("SafeBox '{}' [{}]", st.file_name, sb.state());
        println!("  config:   {}", sb.config());
        println!("  pages:    {} x {} B", st.pages, st.capacity);
        for (i, t) in st.tails.iter().enumerate() {
            println!("    page {:>2}: tail={} ({:.1}% used)", i, t, *t as f64 * 100.0 / st.capacity as f64);
        }
        println!("  entries:  {}", st.entries);
        println!(
            "  journal:  {}/{} B used, {} record(s) for this file",
            js.tail, js.capacity, journal_records
        );
        println!(
            "  metrics:  written={} deleted={} compactions={} avg_reclaimed={:.1} B repairs={}",
            ms.entries_written,
            ms.entries_deleted,
            ms.compactions,
            ms.avg_reclaimed_bytes(),
            ms.load_repairs
        );
    }
    sb.close()
}
