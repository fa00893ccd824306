use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use SafeBox::{
    AesGcmCipher, ChangeEvent, RecoveryBlobStore, SafeBoxBuilder, SafeBoxConfig, SafeBoxEngine, SafeBoxError,
    SafeBoxRegistry, SafeBoxState,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

const KEY_A: [u8; 32] = [0x11; 32];
const KEY_B: [u8; 32] = [0x22; 32];

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("sbtest-engine-{prefix}-{pid}-{t}-{id}"))
}

fn open(
    root: &Path,
    name: &str,
    reg: &Arc<SafeBoxRegistry>,
    cfg: SafeBoxConfig,
) -> Result<SafeBoxEngine> {
    SafeBoxBuilder::new(root, name)
        .config(cfg)
        .registry(reg.clone())
        .aes_key(KEY_A)
        .open()
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn put(sb: &SafeBoxEngine, key: &str, value: &[u8]) -> bool {
    let mut b = sb.edit();
    b.put(key, value.to_vec());
    sb.commit_batch(b)
}

#[test]
fn commit_and_reopen_round_trip() -> Result<()> {
    let root = unique_root("roundtrip");
    let reg = SafeBoxRegistry::new();
    {
        let sb = open(&root, "prefs", &reg, SafeBoxConfig::default())?;
        assert!(put(&sb, "alpha", b"1"));
        let mut b = sb.edit();
        b.put("beta", b"2".to_vec()).put("gamma", b"3".to_vec());
        sb.apply_batch(b);
        // память обновлена сразу, до записи на диск
        assert_eq!(sb.get_value("beta"), Some(b"2".to_vec()));
        assert!(sb.contains("gamma"));
        sb.close()?;
    }
    let sb = open(&root, "prefs", &reg, SafeBoxConfig::default())?;
    let all = sb.get_entries();
    assert_eq!(all.len(), 3);
    assert_eq!(all.get("alpha"), Some(&b"1".to_vec()));
    assert_eq!(all.get("gamma"), Some(&b"3".to_vec()));
    assert_eq!(sb.get_value("missing"), None);
    sb.verify_layout()?;
    Ok(())
}

#[test]
fn mixed_apply_commit_preserves_call_order() -> Result<()> {
    let root = unique_root("order");
    let reg = SafeBoxRegistry::new();
    {
        let sb = open(&root, "ord", &reg, SafeBoxConfig::default())?;
        let apply_put = |k: &str| {
            let mut b = sb.edit();
            b.put(k, k.as_bytes().to_vec());
            sb.apply_batch(b);
        };
        let commit_clear = || {
            let mut b = sb.edit();
            b.clear();
            assert!(sb.commit_batch(b));
        };

        apply_put("0");
        apply_put("1");
        commit_clear();
        apply_put("2");
        apply_put("3");
        commit_clear();
        apply_put("4");

        sb.await_idle();
        let keys: HashSet<String> = sb.get_entries().into_keys().collect();
        assert_eq!(keys, HashSet::from(["4".to_string()]));
        assert_eq!(sb.store_stats().entries, 1);
        sb.close()?;
    }
    let sb = open(&root, "ord", &reg, SafeBoxConfig::default())?;
    let keys: HashSet<String> = sb.get_entries().into_keys().collect();
    assert_eq!(keys, HashSet::from(["4".to_string()]));
    Ok(())
}

#[test]
fn many_concurrent_writers_settle_consistently() -> Result<()> {
    let root = unique_root("threads");
    let reg = SafeBoxRegistry::new();
    let sb = Arc::new(open(&root, "mt", &reg, SafeBoxConfig::default())?);

    let mut handles = Vec::new();
    for t in 0..4 {
        let sb = sb.clone();
        handles.push(thread::spawn(move || {
            for i in 0..50 {
                let mut b = sb.edit();
                b.put(&format!("t{t}-{i}"), vec![t as u8; 16]);
                if i % 2 == 0 {
                    sb.apply_batch(b);
                } else {
                    assert!(sb.commit_batch(b));
                }
            }
        }));
    }
    for h in handles {
        h.join().expect("writer thread");
    }
    sb.await_idle();
    assert_eq!(sb.len(), 200);
    assert_eq!(sb.store_stats().entries, 200);
    assert_eq!(sb.state(), SafeBoxState::Idle);
    sb.verify_layout()?;
    Ok(())
}

#[test]
fn state_machine_and_registry() -> Result<()> {
    let root = unique_root("state");
    let reg = SafeBoxRegistry::new();

    let from_registry = Arc::new(Mutex::new(Vec::new()));
    let fr = from_registry.clone();
    let _sub = reg.subscribe("st", move |name, s| {
        assert_eq!(name, "st");
        fr.lock().unwrap().push(s);
    });

    let from_listener = Arc::new(Mutex::new(Vec::new()));
    let fl = from_listener.clone();
    let sb = SafeBoxBuilder::new(&root, "st")
        .config(SafeBoxConfig::default())
        .registry(reg.clone())
        .aes_key(KEY_A)
        .state_listener(move |s| fl.lock().unwrap().push(s))
        .open()?;

    // второй экземпляр того же файла в том же реестре запрещён
    let dup = SafeBoxBuilder::new(&root, "st")
        .registry(reg.clone())
        .aes_key(KEY_A)
        .open();
    let err = dup.err().expect("second instance must fail");
    assert!(matches!(
        err.downcast_ref::<SafeBoxError>(),
        Some(SafeBoxError::AlreadyOpen { .. })
    ));

    sb.await_idle();
    assert!(put(&sb, "k", b"v"));
    sb.await_idle();

    let expected = vec![
        SafeBoxState::Starting,
        SafeBoxState::Idle,
        SafeBoxState::Writing,
        SafeBoxState::Idle,
    ];
    assert_eq!(*from_listener.lock().unwrap(), expected);
    assert_eq!(*from_registry.lock().unwrap(), expected);
    assert_eq!(reg.current_state("st"), Some(SafeBoxState::Idle));
    assert_eq!(sb.state(), SafeBoxState::Idle);

    sb.close()?;
    assert!(!reg.is_active("st"));
    assert!(!put(&sb, "k2", b"v"));

    // после close файл снова можно открыть
    let again = open(&root, "st", &reg, SafeBoxConfig::default())?;
    assert_eq!(again.get_value("k"), Some(b"v".to_vec()));
    Ok(())
}

#[test]
fn change_notifications_only_for_real_changes() -> Result<()> {
    let root = unique_root("changes");
    let reg = SafeBoxRegistry::new();
    let sb = open(&root, "ch", &reg, SafeBoxConfig::default())?;

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let sub = sb.subscribe_changes(move |ev: &ChangeEvent| s.lock().unwrap().push(ev.key.clone()));

    let mut b = sb.edit();
    b.put("a", b"1".to_vec()).put("b", b"2".to_vec());
    assert!(sb.commit_batch(b));
    assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);

    // то же значение - без события; удаление отсутствующего - тоже
    seen.lock().unwrap().clear();
    let mut b = sb.edit();
    b.put("a", b"1".to_vec()).remove("nope");
    assert!(sb.commit_batch(b));
    assert!(seen.lock().unwrap().is_empty());

    let mut b = sb.edit();
    b.remove("b").put("c", b"3".to_vec()).put("d", b"4".to_vec());
    assert!(sb.commit_batch(b));
    assert_eq!(*seen.lock().unwrap(), vec!["b", "c", "d"]);

    // clear: сначала очищенные ключи, затем изменения батча
    seen.lock().unwrap().clear();
    let mut b = sb.edit();
    b.clear().put("a", b"9".to_vec());
    assert!(sb.commit_batch(b));
    let got = seen.lock().unwrap().clone();
    assert_eq!(got.len(), 3);
    assert_eq!(got[2], "a");
    let cleared: HashSet<&str> = got[..2].iter().map(|s| s.as_str()).collect();
    assert_eq!(cleared, HashSet::from(["c", "d"]));

    drop(sub);
    seen.lock().unwrap().clear();
    assert!(put(&sb, "z", b"1"));
    assert!(seen.lock().unwrap().is_empty());
    Ok(())
}

#[test]
fn overflow_is_rerouted_to_journal_and_drained() -> Result<()> {
    let root = unique_root("drain");
    let reg = SafeBoxRegistry::new();
    // ключ 2 B + значение 10 B -> 6 + 30 + 38 = 74 B на запись: три на страницу
    let cfg = SafeBoxConfig::default()
        .with_page_capacity(256)
        .with_max_pages(1)
        .with_recovery_backoff_ms(10, 50)
        .with_recovery_max_attempts(1000);
    let sb = open(&root, "ovf", &reg, cfg)?;

    for i in 0..5 {
        assert!(put(&sb, &format!("k{i}"), &[i as u8; 10]), "commit k{i}");
    }
    assert_eq!(sb.store_stats().entries, 3);
    assert_eq!(sb.journal_stats().files.get("ovf"), Some(&2));
    for i in 0..5 {
        assert_eq!(sb.get_value(&format!("k{i}")), Some(vec![i as u8; 10]));
    }

    // освобождаем место: слив переносит записи из журнала в стор
    let mut b = sb.edit();
    b.remove("k0").remove("k1");
    assert!(sb.commit_batch(b));

    wait_until("journal drain", || !sb.journal_stats().files.contains_key("ovf"));
    sb.await_idle();
    assert_eq!(sb.store_stats().entries, 3);
    sb.verify_layout()?;
    sb.close()?;

    let sb = open(&root, "ovf", &reg, SafeBoxConfig::default().with_page_capacity(256))?;
    let keys: HashSet<String> = sb.get_entries().into_keys().collect();
    let want: HashSet<String> = ["k2", "k3", "k4"].iter().map(|s| s.to_string()).collect();
    assert_eq!(keys, want);
    Ok(())
}

/// Одна страница на три записи по 74 B: четвёртая уходит в журнал.
fn tight_config() -> SafeBoxConfig {
    SafeBoxConfig::default()
        .with_page_capacity(256)
        .with_max_pages(1)
        .with_recovery_backoff_ms(10, 20)
}

fn fill_past_page(sb: &SafeBoxEngine, prefix: &str) {
    for i in 0..4 {
        let key = format!("{prefix}{i}");
        assert!(put(sb, &key, &[i as u8; 10]), "commit {key}");
    }
}

#[test]
fn unlimited_drain_keeps_retrying_until_space_frees() -> Result<()> {
    let root = unique_root("drain-unlimited");
    let reg = SafeBoxRegistry::new();
    let sb = open(&root, "p", &reg, tight_config().with_recovery_max_attempts(0))?;

    fill_past_page(&sb, "k");
    assert_eq!(sb.journal_stats().files.get("p"), Some(&1));

    // десятки неудачных попыток, пока стор полон
    thread::sleep(Duration::from_millis(200));
    assert_eq!(sb.journal_stats().files.get("p"), Some(&1));

    let mut b = sb.edit();
    b.remove("k0");
    assert!(sb.commit_batch(b));

    wait_until("journal drain", || !sb.journal_stats().files.contains_key("p"));
    sb.await_idle();
    assert_eq!(sb.store_stats().entries, 3);
    assert_eq!(sb.get_value("k3"), Some(vec![3u8; 10]));
    sb.verify_layout()?;
    Ok(())
}

#[test]
fn finite_drain_gives_up_until_reopen() -> Result<()> {
    let root = unique_root("drain-giveup");
    let reg = SafeBoxRegistry::new();
    {
        let sb = open(&root, "p", &reg, tight_config().with_recovery_max_attempts(2))?;
        fill_past_page(&sb, "k");
        assert_eq!(sb.journal_stats().files.get("p"), Some(&1));

        // обе попытки проваливаются, слив сдаётся
        thread::sleep(Duration::from_millis(300));
        let mut b = sb.edit();
        b.remove("k0");
        assert!(sb.commit_batch(b));

        thread::sleep(Duration::from_millis(300));
        assert_eq!(sb.journal_stats().files.get("p"), Some(&1));
        assert_eq!(sb.store_stats().entries, 2);
        assert_eq!(sb.get_value("k3"), Some(vec![3u8; 10]));
        sb.close()?;
    }

    // при открытии журнал снова сливается
    let sb = open(&root, "p", &reg, tight_config().with_recovery_max_attempts(2))?;
    wait_until("journal drain after reopen", || {
        !sb.journal_stats().files.contains_key("p")
    });
    sb.await_idle();
    let keys: HashSet<String> = sb.get_entries().into_keys().collect();
    let want: HashSet<String> = ["k1", "k2", "k3"].iter().map(|s| s.to_string()).collect();
    assert_eq!(keys, want);
    assert_eq!(sb.store_stats().entries, 3);
    Ok(())
}

#[test]
fn registry_clear_keeps_shared_journal_for_open_engines() -> Result<()> {
    let root = unique_root("clear-journal");
    let reg = SafeBoxRegistry::new();
    // долгий backoff: слив не вмешивается, пока стор полон
    let cfg = tight_config().with_recovery_backoff_ms(60_000, 60_000);
    {
        let a = open(&root, "a", &reg, cfg.clone())?;
        reg.clear();
        let b = open(&root, "b", &reg, cfg.clone())?;

        fill_past_page(&a, "a");
        fill_past_page(&b, "b");
        let stats = b.journal_stats();
        assert_eq!(stats.files.get("a"), Some(&1));
        assert_eq!(stats.files.get("b"), Some(&1));

        a.close()?;
        b.close()?;
    }

    let journal = RecoveryBlobStore::open(&root, &cfg)?;
    let a = journal.load_persisted_entries("a")?;
    let b = journal.load_persisted_entries("b")?;
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    Ok(())
}

#[test]
fn journal_entries_survive_reopen_and_merge_over_store() -> Result<()> {
    let root = unique_root("merge");
    let reg = SafeBoxRegistry::new();
    let tight = SafeBoxConfig::default()
        .with_page_capacity(256)
        .with_max_pages(1)
        .with_recovery_backoff_ms(60_000, 60_000);
    {
        let sb = open(&root, "mrg", &reg, tight)?;
        for i in 0..3 {
            assert!(put(&sb, &format!("k{i}"), &[1u8; 10]));
        }
        // в стор не помещается - журнал; значение k0 обновлено только там
        assert!(put(&sb, "k3", &[2u8; 10]));
        assert!(put(&sb, "k0", &[3u8; 60]));
        assert_eq!(sb.journal_stats().files.get("mrg"), Some(&2));
        sb.close()?;
    }

    let roomy = SafeBoxConfig::default()
        .with_page_capacity(256)
        .with_max_pages(4)
        .with_recovery_backoff_ms(10, 10);
    let sb = open(&root, "mrg", &reg, roomy)?;
    assert_eq!(sb.get_value("k0"), Some(vec![3u8; 60]));
    assert_eq!(sb.get_value("k3"), Some(vec![2u8; 10]));
    assert_eq!(sb.len(), 4);

    wait_until("journal drain", || !sb.journal_stats().files.contains_key("mrg"));
    sb.await_idle();
    assert_eq!(sb.store_stats().entries, 4);
    sb.verify_layout()?;
    Ok(())
}

#[test]
fn undecryptable_entries_are_swept() -> Result<()> {
    let root = unique_root("sweep");
    let reg = SafeBoxRegistry::new();
    {
        let sb = open(&root, "dead", &reg, SafeBoxConfig::default())?;
        let mut b = sb.edit();
        for i in 0..5 {
            b.put(&format!("old{i}"), b"secret".to_vec());
        }
        assert!(sb.commit_batch(b));
        sb.close()?;
    }

    // ключи шифруются прежним ключом, значения - новым: старые значения «мертвы»
    let sb = SafeBoxBuilder::new(&root, "dead")
        .config(SafeBoxConfig::default())
        .registry(reg.clone())
        .key_cipher(Arc::new(AesGcmCipher::deterministic(KEY_A)))
        .value_cipher(Arc::new(AesGcmCipher::randomized(KEY_B)))
        .open()?;
    assert!(put(&sb, "fresh", b"new"));
    assert_eq!(sb.len(), 6);

    assert_eq!(sb.get_value("old0"), None);
    wait_until("dead entry sweep", || sb.len() == 1);
    sb.await_idle();
    assert_eq!(sb.store_stats().entries, 1);
    assert_eq!(sb.get_entries().len(), 1);
    assert_eq!(sb.get_value("fresh"), Some(b"new".to_vec()));
    Ok(())
}
