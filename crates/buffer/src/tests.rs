use super::*;

fn pool(capacity: usize) -> (tempfile::TempDir, BufferPool) {
    let dir = tempfile::tempdir().unwrap();
    let pool = BufferPool::new(dir.path(), capacity, 16).unwrap();
    (dir, pool)
}

#[test]
fn fetch_missing_page_yields_zeroed_frame() {
    let (_dir, mut pool) = pool(4);
    let key = PageKey::new("t", false, 0, 0);
    let frame = pool.fetch_page(&key, true).unwrap().unwrap();
    assert_eq!(frame.page.num_records(), 0);
    assert_eq!(frame.pin_count, 1);
}

#[test]
fn pin_unpin_tracks_count_without_underflow() {
    let (_dir, mut pool) = pool(4);
    let key = PageKey::new("t", false, 0, 0);
    pool.fetch_page(&key, true).unwrap();
    assert!(pool.unpin(&key));
    assert!(pool.unpin(&key)); // already 0, must not underflow
    let frame = pool.fetch_page(&key, false).unwrap().unwrap();
    assert_eq!(frame.pin_count, 0);
}

#[test]
fn eviction_is_lru_among_unpinned_frames() {
    let (_dir, mut pool) = pool(2);
    let a = PageKey::new("t", false, 0, 0);
    let b = PageKey::new("t", false, 0, 1);
    let c = PageKey::new("t", false, 0, 2);

    pool.fetch_page(&a, false).unwrap();
    pool.fetch_page(&b, false).unwrap();
    // a is now LRU; fetching c should evict a, not b.
    pool.fetch_page(&c, false).unwrap();

    assert_eq!(pool.len(), 2);
    assert!(!pool.frames.contains_key(&a));
    assert!(pool.frames.contains_key(&b));
    assert!(pool.frames.contains_key(&c));
}

#[test]
fn pinned_frames_are_never_evicted() {
    let (_dir, mut pool) = pool(1);
    let a = PageKey::new("t", false, 0, 0);
    let b = PageKey::new("t", false, 0, 1);
    pool.fetch_page(&a, true).unwrap(); // pinned, stays pinned

    let result = pool.fetch_page(&b, false).unwrap();
    assert!(result.is_none(), "pool full of pinned frames must refuse");
}

#[test]
fn evicting_dirty_frame_writes_back_bytes() {
    let (_dir, mut pool) = pool(1);
    let a = PageKey::new("t", false, 0, 0);
    let b = PageKey::new("t", false, 0, 1);

    {
        let frame = pool.fetch_page(&a, false).unwrap().unwrap();
        frame.page.append(Some(123));
    }
    pool.mark_dirty(&a);
    pool.fetch_page(&b, false).unwrap(); // evicts a, flushing first

    let bytes = pool
        .disk_manager()
        .read_page("t", false, 0, 0)
        .unwrap()
        .unwrap();
    assert_eq!(&bytes[0..8], &123i64.to_be_bytes());
}

#[test]
fn flush_page_is_noop_for_clean_frame() {
    let (_dir, mut pool) = pool(2);
    let a = PageKey::new("t", false, 0, 0);
    pool.fetch_page(&a, false).unwrap();
    assert!(pool.flush_page(&a).unwrap());
}

#[test]
fn discard_page_removes_frame_without_flushing() {
    let (_dir, mut pool) = pool(2);
    let a = PageKey::new("t", false, 0, 0);
    {
        let frame = pool.fetch_page(&a, false).unwrap().unwrap();
        frame.page.append(Some(7));
    }
    pool.mark_dirty(&a);
    pool.discard_page(&a, false).unwrap();
    assert_eq!(pool.len(), 0);
    assert!(pool.disk_manager().read_page("t", false, 0, 0).unwrap().is_none());
}

#[test]
fn flush_all_respects_table_filter() {
    let (_dir, mut pool) = pool(4);
    let a = PageKey::new("t1", false, 0, 0);
    let b = PageKey::new("t2", false, 0, 0);
    for key in [&a, &b] {
        let frame = pool.fetch_page(key, false).unwrap().unwrap();
        frame.page.append(Some(1));
    }
    pool.mark_dirty(&a);
    pool.mark_dirty(&b);
    pool.flush_all(Some("t1")).unwrap();

    assert!(pool.disk_manager().read_page("t1", false, 0, 0).unwrap().is_some());
    assert!(pool.disk_manager().read_page("t2", false, 0, 0).unwrap().is_none());
}
