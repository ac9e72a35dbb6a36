use anyhow::Result;
use std::sync::Arc;
use symsolve::store::is_reserved;
use symsolve::{FileStore, MemStore, Store, StoreMode};

#[test]
fn mem_store_get_set_delete() -> Result<()> {
    let store = MemStore::new();
    assert_eq!(store.get(b"k")?, None);

    store.set(b"k", b"v1")?;
    store.set(b"k", b"v2")?;
    assert_eq!(store.get(b"k")?.as_deref(), Some(b"v2".as_slice()));

    store.delete(b"k")?;
    assert_eq!(store.get(b"k")?, None);
    Ok(())
}

#[test]
fn cursor_iterates_in_key_order() -> Result<()> {
    let store = MemStore::new();
    store.set(b"b", b"2")?;
    store.set(b"a", b"1")?;
    store.set(b"c", b"3")?;

    let keys: Vec<Vec<u8>> = store.cursor()?.map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    let mut cursor = store.cursor()?;
    cursor.next();
    cursor.reset();
    assert_eq!(cursor.next().map(|(k, _)| k), Some(b"a".to_vec()));
    Ok(())
}

#[test]
fn file_store_persists_across_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("PR1.dat");

    {
        let store = FileStore::open(&path, StoreMode::Create)?;
        store.set(b"alpha", b"first")?;
        store.set(b"beta", &[0u8, 1, 2, 255])?;
        store.flush()?;
    }

    let store = FileStore::open(&path, StoreMode::Read)?;
    assert_eq!(store.get(b"alpha")?.as_deref(), Some(b"first".as_slice()));
    assert_eq!(store.get(b"beta")?.as_deref(), Some([0u8, 1, 2, 255].as_slice()));
    Ok(())
}

#[test]
fn file_store_flushes_on_drop() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("PR2.dat");

    {
        let store = FileStore::open(&path, StoreMode::Create)?;
        store.set(b"k", b"v")?;
        // No explicit flush.
    }

    let store = FileStore::open(&path, StoreMode::Read)?;
    assert_eq!(store.get(b"k")?.as_deref(), Some(b"v".as_slice()));
    Ok(())
}

#[test]
fn file_store_missing_file_is_an_error_in_read_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.dat");
    assert!(FileStore::open(&path, StoreMode::Read).is_err());
    assert!(FileStore::open(&path, StoreMode::Write).is_err());
}

#[test]
fn file_store_rejects_writes_in_read_mode() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("PR3.dat");
    FileStore::open(&path, StoreMode::Create)?.flush()?;

    let store = FileStore::open(&path, StoreMode::Read)?;
    assert!(store.set(b"k", b"v").is_err());
    assert!(store.delete(b"k").is_err());
    Ok(())
}

#[test]
fn file_store_delete_persists() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("PR4.dat");

    {
        let store = FileStore::open(&path, StoreMode::Create)?;
        store.set(b"keep", b"1")?;
        store.set(b"drop", b"2")?;
        store.flush()?;
        store.delete(b"drop")?;
    }

    let store = FileStore::open(&path, StoreMode::Read)?;
    assert_eq!(store.get(b"keep")?.as_deref(), Some(b"1".as_slice()));
    assert_eq!(store.get(b"drop")?, None);
    Ok(())
}

#[test]
fn reserved_keys_are_recognised() {
    assert!(is_reserved(b"generated"));
    assert!(is_reserved(b"setup"));
    assert!(!is_reserved(b"PR1"));
}

#[test]
fn stores_share_through_arc() -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(MemStore::new());
    let clone = store.clone();
    store.set(b"k", b"v")?;
    assert_eq!(clone.get(b"k")?.as_deref(), Some(b"v".as_slice()));
    Ok(())
}
