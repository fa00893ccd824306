use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use oorandom::Rand64;
use SafeBox::{is_capacity_exceeded, SafeBoxBlobStore, SafeBoxConfig, SafeBoxError};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("sbtest-store-{prefix}-{pid}-{t}-{id}"))
}

fn small_cfg(page: usize, max_pages: usize) -> SafeBoxConfig {
    SafeBoxConfig::default()
        .with_page_capacity(page)
        .with_max_pages(max_pages)
}

#[test]
fn store_round_trip_and_reopen() -> Result<()> {
    let root = unique_root("roundtrip");
    fs::create_dir_all(&root)?;
    let cfg = SafeBoxConfig::default();

    let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    {
        let store = SafeBoxBlobStore::open(&root, "prefs", &cfg)?;
        assert!(store.load_persisted_entries()?.is_empty());
        for i in 0..100u32 {
            let k = format!("key-{i}").into_bytes();
            let v = vec![i as u8; (i as usize % 17) + 1];
            store.write(&k, &v)?;
            model.insert(k, v);
        }
        assert_eq!(store.file_name(), "prefs");
        store.flush()?;
        store.verify_layout()?;
    }

    // файл кратен ёмкости страницы
    let len = fs::metadata(root.join("prefs.bin"))?.len();
    assert_eq!(len % cfg.page_capacity as u64, 0);

    let store = SafeBoxBlobStore::open(&root, "prefs", &cfg)?;
    let loaded = store.load_persisted_entries()?;
    assert_eq!(loaded, model);
    assert!(store.contains(b"key-7"));
    store.verify_layout()?;
    Ok(())
}

#[test]
fn delete_first_middle_last_keeps_neighbours() -> Result<()> {
    for victim in [0usize, 2, 4] {
        let root = unique_root("compact");
        let store = SafeBoxBlobStore::open(&root, "c", &SafeBoxConfig::default())?;
        store.load_persisted_entries()?;

        let keys: Vec<Vec<u8>> = (0..5).map(|i| format!("k{i}").into_bytes()).collect();
        for (i, k) in keys.iter().enumerate() {
            store.write(k, &vec![b'a' + i as u8; 10 + i * 3])?;
        }
        let tail_before = store.stats().tails[0];
        let victim_size = store.entry_meta(&keys[victim]).map(|m| m.size).unwrap_or(0);

        assert_eq!(store.delete(&[&keys[victim]])?, 1);
        assert!(!store.contains(&keys[victim]));
        assert!(store.entry_meta(&keys[victim]).is_none());
        assert_eq!(store.stats().tails[0], tail_before - victim_size);
        store.verify_layout()?;

        store.flush()?;
        drop(store);
        let store = SafeBoxBlobStore::open(&root, "c", &SafeBoxConfig::default())?;
        let loaded = store.load_persisted_entries()?;
        assert_eq!(loaded.len(), 4);
        assert!(!loaded.contains_key(&keys[victim]));
        for (i, k) in keys.iter().enumerate() {
            if i != victim {
                assert_eq!(loaded.get(k), Some(&vec![b'a' + i as u8; 10 + i * 3]));
            }
        }
    }
    Ok(())
}

#[test]
fn delete_unknown_or_empty_is_noop() -> Result<()> {
    let root = unique_root("noop");
    let store = SafeBoxBlobStore::open(&root, "n", &SafeBoxConfig::default())?;
    store.load_persisted_entries()?;
    store.write(b"a", b"1")?;
    let empty: [&[u8]; 0] = [];
    assert_eq!(store.delete(&empty)?, 0);
    assert_eq!(store.delete(&[b"zz".as_ref()])?, 0);
    assert!(store.contains(b"a"));
    store.verify_layout()?;
    Ok(())
}

#[test]
fn overwrite_smaller_equal_larger_leaves_single_entry() -> Result<()> {
    let root = unique_root("overwrite");
    let store = SafeBoxBlobStore::open(&root, "o", &SafeBoxConfig::default())?;
    store.load_persisted_entries()?;

    store.write(b"before", b"x")?;
    store.write(b"k", &[1u8; 20])?;
    store.write(b"after", b"y")?;

    for v in [vec![2u8; 5], vec![3u8; 5], vec![4u8; 40]] {
        store.write(b"k", &v)?;
        store.verify_layout()?;
        assert_eq!(store.stats().entries, 3);
    }
    // перезапись уезжает в хвост страницы
    let m = store.entry_meta(b"k").expect("meta");
    assert_eq!(m.offset + m.size, store.stats().tails[0]);

    store.flush()?;
    drop(store);
    let store = SafeBoxBlobStore::open(&root, "o", &SafeBoxConfig::default())?;
    let loaded = store.load_persisted_entries()?;
    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded.get(b"k".as_ref()), Some(&vec![4u8; 40]));
    Ok(())
}

#[test]
fn grows_pages_up_to_ceiling() -> Result<()> {
    let root = unique_root("grow");
    let cfg = small_cfg(128, 3);
    let store = SafeBoxBlobStore::open(&root, "g", &cfg)?;
    store.load_persisted_entries()?;

    // 6 + 2 + 52 = 60 B: по две записи на страницу
    let mut written = 0;
    let err = loop {
        let k = format!("{:02}", written);
        match store.write(k.as_bytes(), &[7u8; 52]) {
            Ok(()) => written += 1,
            Err(e) => break e,
        }
    };
    assert_eq!(written, 6);
    assert!(is_capacity_exceeded(&err));
    assert_eq!(
        err.downcast_ref::<SafeBoxError>(),
        Some(&SafeBoxError::PageLimitReached { max_pages: 3 })
    );
    assert_eq!(store.stats().pages, 3);
    assert_eq!(fs::metadata(root.join("g.bin"))?.len(), 3 * 128);
    store.verify_layout()?;

    // запись больше страницы - отказ сразу
    let big = store.write(b"big", &[0u8; 200]).unwrap_err();
    assert!(matches!(
        big.downcast_ref::<SafeBoxError>(),
        Some(SafeBoxError::EntryTooLarge { .. })
    ));

    // освободили место на первой странице - следующая запись помещается туда
    store.delete(&[b"00".as_ref()])?;
    store.write(b"zz", &[1u8; 52])?;
    assert_eq!(store.entry_meta(b"zz").map(|m| m.page), Some(0));
    store.verify_layout()?;
    Ok(())
}

#[test]
fn key_moves_to_other_page_when_it_outgrows_its_own() -> Result<()> {
    let root = unique_root("move");
    let store = SafeBoxBlobStore::open(&root, "m", &small_cfg(64, 4))?;
    store.load_persisted_entries()?;

    store.write(b"a", &[1u8; 20])?; // 27 B
    store.write(b"b", &[2u8; 20])?; // 27 B, страница 0: tail 54
    store.write(b"a", &[3u8; 50])?; // 57 B: на странице 0 не помещается даже после выкидывания "a"
    assert_eq!(store.entry_meta(b"a").map(|m| m.page), Some(1));
    assert_eq!(store.entry_meta(b"b").map(|m| (m.page, m.offset)), Some((0, 0)));
    store.verify_layout()?;
    Ok(())
}

#[test]
fn delete_all_truncates_to_one_page() -> Result<()> {
    let root = unique_root("clear");
    let cfg = small_cfg(64, 8);
    let store = SafeBoxBlobStore::open(&root, "d", &cfg)?;
    store.load_persisted_entries()?;
    for i in 0..6u8 {
        store.write(&[b'k', i], &[i; 40])?;
    }
    assert!(store.stats().pages >= 6);

    store.delete_all()?;
    store.flush()?;
    let st = store.stats();
    assert_eq!((st.pages, st.entries, st.tails.clone()), (1, 0, vec![0]));
    assert_eq!(fs::metadata(root.join("d.bin"))?.len(), 64);
    store.verify_layout()?;

    store.write(b"fresh", b"v")?;
    drop(store);
    let store = SafeBoxBlobStore::open(&root, "d", &cfg)?;
    let loaded = store.load_persisted_entries()?;
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded.get(b"fresh".as_ref()), Some(&b"v".to_vec()));
    Ok(())
}

#[test]
fn corrupted_tail_is_zero_filled_and_space_is_lost() -> Result<()> {
    let root = unique_root("corrupt");
    fs::create_dir_all(&root)?;
    let cfg = small_cfg(64, 1);
    let path = root.join("bad.bin");

    {
        let store = SafeBoxBlobStore::open_path(&path, &cfg)?;
        store.load_persisted_entries()?;
        // 6 + 5 + 50 = 61 B
        store.write(b"valid", &[9u8; 50])?;
        store.flush()?;
    }

    // 3 мусорных байта: меньше заголовка
    {
        let mut f = OpenOptions::new().write(true).open(&path)?;
        f.seek(SeekFrom::Start(61))?;
        f.write_all(&[0xAB, 0xCD, 0xEF])?;
        f.sync_all()?;
    }

    let store = SafeBoxBlobStore::open_path(&path, &cfg)?;
    let loaded = store.load_persisted_entries()?;
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded.get(b"valid".as_ref()), Some(&vec![9u8; 50]));
    store.flush()?;

    let raw = fs::read(&path)?;
    assert_eq!(&raw[61..64], &[0, 0, 0]);
    store.verify_layout()?;

    let err = store.write(b"k2", b"v").unwrap_err();
    assert!(is_capacity_exceeded(&err));
    Ok(())
}

#[test]
fn bytes_past_sentinel_are_zero_filled() -> Result<()> {
    let root = unique_root("leftover");
    fs::create_dir_all(&root)?;
    let cfg = small_cfg(128, 1);
    let path = root.join("left.bin");
    {
        let store = SafeBoxBlobStore::open_path(&path, &cfg)?;
        store.load_persisted_entries()?;
        // 6 + 1 + 20 = 27 B
        store.write(b"a", &[1u8; 20])?;
        store.flush()?;
    }

    // остаток прерванной компакции: нулевой заголовок, за ним хвост старой записи
    {
        let mut f = OpenOptions::new().write(true).open(&path)?;
        f.seek(SeekFrom::Start(27 + 6))?;
        f.write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x04, b'z', 7, 7, 7, 7])?;
        f.sync_all()?;
    }

    let store = SafeBoxBlobStore::open_path(&path, &cfg)?;
    let loaded = store.load_persisted_entries()?;
    assert_eq!(loaded.len(), 1);
    store.flush()?;
    let raw = fs::read(&path)?;
    assert!(raw[27..].iter().all(|&b| b == 0));
    store.verify_layout()?;

    store.write(b"b", &[2u8; 20])?;
    store.flush()?;
    drop(store);

    let store = SafeBoxBlobStore::open_path(&path, &cfg)?;
    let loaded = store.load_persisted_entries()?;
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded.get(b"b".as_ref()), Some(&vec![2u8; 20]));
    store.verify_layout()?;
    Ok(())
}

#[test]
fn overrunning_header_is_repaired() -> Result<()> {
    let root = unique_root("overrun");
    fs::create_dir_all(&root)?;
    let cfg = small_cfg(64, 2);
    let path = root.join("ovr.bin");
    {
        let store = SafeBoxBlobStore::open_path(&path, &cfg)?;
        store.load_persisted_entries()?;
        store.write(b"ok", b"12345")?; // 13 B
        store.flush()?;
    }
    // заголовок с value_len далеко за пределами страницы
    {
        let mut f = OpenOptions::new().write(true).open(&path)?;
        f.seek(SeekFrom::Start(13))?;
        f.write_all(&[0x00, 0x02, 0x00, 0x00, 0xFF, 0xFF, b'x', b'y'])?;
        f.sync_all()?;
    }
    let store = SafeBoxBlobStore::open_path(&path, &cfg)?;
    let loaded = store.load_persisted_entries()?;
    assert_eq!(loaded.len(), 1);
    assert_eq!(store.stats().tails[0], 13);
    store.verify_layout()?;
    Ok(())
}

#[test]
fn load_is_idempotent() -> Result<()> {
    let root = unique_root("idem");
    let cfg = small_cfg(256, 4);
    {
        let store = SafeBoxBlobStore::open(&root, "i", &cfg)?;
        store.load_persisted_entries()?;
        for i in 0..20u8 {
            store.write(&[b'k', i], &vec![i; (i as usize * 7) % 40 + 1])?;
        }
        store.flush()?;
    }
    let store = SafeBoxBlobStore::open(&root, "i", &cfg)?;
    let a = store.load_persisted_entries()?;
    let b = store.load_persisted_entries()?;
    assert_eq!(a, b);
    assert_eq!(a.len(), 20);
    store.verify_layout()?;
    Ok(())
}

#[test]
fn randomized_churn_matches_model() -> Result<()> {
    let root = unique_root("churn");
    let cfg = small_cfg(512, 16);
    let store = SafeBoxBlobStore::open(&root, "r", &cfg)?;
    store.load_persisted_entries()?;

    let mut rng = Rand64::new(0x5AFE_B0C5_0000_0001);
    let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();

    for step in 0..3000u32 {
        let k = format!("key{:02}", rng.rand_range(0..40)).into_bytes();
        match rng.rand_range(0..10) {
            0..=6 => {
                let len = rng.rand_range(0..120) as usize;
                let v = vec![(step % 251) as u8; len];
                store.write(&k, &v)?;
                model.insert(k, v);
            }
            _ => {
                store.delete(&[&k])?;
                model.remove(&k);
            }
        }
        if step % 500 == 0 {
            store.verify_layout()?;
        }
    }
    store.verify_layout()?;
    assert_eq!(store.stats().entries, model.len());

    store.flush()?;
    drop(store);
    let store = SafeBoxBlobStore::open(&root, "r", &cfg)?;
    assert_eq!(store.load_persisted_entries()?, model);
    Ok(())
}

#[test]
fn closed_store_rejects_writes() -> Result<()> {
    let root = unique_root("closed");
    let store = SafeBoxBlobStore::open(&root, "x", &SafeBoxConfig::default())?;
    store.close()?;
    let err = store.write(b"a", b"b").unwrap_err();
    assert!(SafeBox::is_closed(&err));
    // повторный close - no-op
    store.close()?;
    Ok(())
}
