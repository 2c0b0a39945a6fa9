use anyhow::Result;
use canopy_log::MemoryLog;
use canopy_tree::{DiffEntry, DiffOptions, Snapshot, Tree};

async fn collect(
    left: &Snapshot<MemoryLog>,
    right: &Snapshot<MemoryLog>,
    options: DiffOptions,
) -> Result<Vec<DiffEntry>> {
    let mut iterator = left.diff(right, options);
    let mut differences = Vec::new();
    while let Some(difference) = iterator.next().await? {
        differences.push(difference);
    }
    Ok(differences)
}

fn key_of(difference: &DiffEntry) -> Vec<u8> {
    difference
        .left
        .as_ref()
        .or(difference.right.as_ref())
        .map(|entry| entry.key.clone())
        .unwrap_or_default()
}

#[tokio::test]
async fn it_reports_exactly_the_changed_keys() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    for key in 0..9 {
        let key = format!("{key:02}");
        tree.put(key.as_bytes(), b"seed").await?;
    }
    let before = tree.snapshot().await?;

    tree.del(b"01").await?;
    for key in ["10", "11", "12"] {
        tree.put(key.as_bytes(), b"new").await?;
    }
    let after = tree.snapshot().await?;

    let differences = collect(&before, &after, DiffOptions::all()).await?;
    assert_eq!(differences.len(), 4);

    let deletion = &differences[0];
    assert_eq!(key_of(deletion), b"01");
    assert!(deletion.left.is_some());
    assert!(deletion.right.is_none());

    for (difference, expected) in differences[1..].iter().zip(["10", "11", "12"]) {
        assert_eq!(key_of(difference), expected.as_bytes());
        assert!(difference.left.is_none());
        let added = difference.right.as_ref().expect("addition should be right-sided");
        assert_eq!(added.value.as_deref(), Some(b"new".as_slice()));
    }

    Ok(())
}

#[tokio::test]
async fn it_reports_nothing_between_identical_versions() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    for key in 0..20 {
        let key = format!("{key:02}");
        tree.put(key.as_bytes(), b"x").await?;
    }

    let one = tree.snapshot().await?;
    let other = tree.snapshot().await?;

    assert!(collect(&one, &other, DiffOptions::all()).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn it_pairs_both_sides_of_a_value_change() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    tree.put(b"key", b"old").await?;
    let before = tree.snapshot().await?;
    tree.put(b"key", b"new").await?;
    let after = tree.snapshot().await?;

    let differences = collect(&before, &after, DiffOptions::all()).await?;
    assert_eq!(differences.len(), 1);
    let difference = &differences[0];
    assert_eq!(
        difference.left.as_ref().and_then(|entry| entry.value.as_deref()),
        Some(b"old".as_slice())
    );
    assert_eq!(
        difference.right.as_ref().and_then(|entry| entry.value.as_deref()),
        Some(b"new".as_slice())
    );

    Ok(())
}

#[tokio::test]
async fn it_reports_rewrites_with_identical_bytes() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    tree.put(b"key", b"same").await?;
    let before = tree.snapshot().await?;
    tree.put(b"key", b"same").await?;
    let after = tree.snapshot().await?;

    // The content is byte-identical but the entries live in different
    // blocks, which is a difference.
    let differences = collect(&before, &after, DiffOptions::all()).await?;
    assert_eq!(differences.len(), 1);

    Ok(())
}

#[tokio::test]
async fn it_diffs_against_the_empty_tree() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    let empty = tree.snapshot().await?;
    for key in 0..10 {
        let key = format!("{key:02}");
        tree.put(key.as_bytes(), b"x").await?;
    }
    let full = tree.snapshot().await?;

    let differences = collect(&empty, &full, DiffOptions::all()).await?;
    assert_eq!(differences.len(), 10);
    assert!(differences.iter().all(|difference| difference.left.is_none()));

    Ok(())
}

#[tokio::test]
async fn it_restricts_the_diff_to_a_range() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    let before = tree.snapshot().await?;
    for key in 0..10 {
        let key = format!("{key:02}");
        tree.put(key.as_bytes(), b"x").await?;
    }
    let after = tree.snapshot().await?;

    let differences = collect(
        &before,
        &after,
        DiffOptions::all().gte(*b"03").lt(*b"06"),
    )
    .await?;
    assert_eq!(
        differences.iter().map(key_of).collect::<Vec<_>>(),
        vec![b"03".to_vec(), b"04".to_vec(), b"05".to_vec()]
    );

    Ok(())
}

#[tokio::test]
async fn it_honors_the_limit() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    let before = tree.snapshot().await?;
    for key in 0..10 {
        let key = format!("{key:02}");
        tree.put(key.as_bytes(), b"x").await?;
    }
    let after = tree.snapshot().await?;

    let differences = collect(&before, &after, DiffOptions::all().limit(4)).await?;
    assert_eq!(differences.len(), 4);

    Ok(())
}

#[tokio::test]
async fn it_isolates_a_single_change_in_a_large_tree() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    for key in 0..200 {
        let key = format!("{key:03}");
        tree.put(key.as_bytes(), b"seed").await?;
    }
    let before = tree.snapshot().await?;
    tree.put(b"123", b"changed").await?;
    let after = tree.snapshot().await?;

    let differences = collect(&before, &after, DiffOptions::all()).await?;
    assert_eq!(differences.len(), 1);
    assert_eq!(key_of(&differences[0]), b"123");

    Ok(())
}

#[tokio::test]
async fn it_diffs_through_the_tree_handle() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    tree.put(b"a", b"1").await?;
    let pinned = tree.version().await?;
    tree.put(b"b", b"2").await?;

    let mut iterator = tree.diff(pinned, DiffOptions::all()).await?;
    let difference = iterator.next().await?.expect("one difference expected");
    assert_eq!(key_of(&difference), b"b");
    assert!(iterator.next().await?.is_none());

    Ok(())
}
