use anyhow::Result;
use canopy_log::MemoryLog;
use canopy_tree::{RangeOptions, Snapshot, Tree};
use futures_util::{StreamExt, pin_mut};

async fn seeded_tree(count: usize) -> Result<Tree<MemoryLog>> {
    let tree = Tree::open(MemoryLog::new()).await?;
    for key in 0..count {
        let key = format!("{key:03}");
        tree.put(key.as_bytes(), key.as_bytes()).await?;
    }
    Ok(tree)
}

async fn keys(snapshot: &Snapshot<MemoryLog>, options: RangeOptions) -> Result<Vec<String>> {
    let mut iterator = snapshot.iter(options);
    let mut keys = Vec::new();
    while let Some(entry) = iterator.next().await? {
        keys.push(String::from_utf8(entry.key)?);
    }
    Ok(keys)
}

#[tokio::test]
async fn it_yields_nothing_past_the_last_key() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    for key in ["a", "b", "c"] {
        tree.put(key.as_bytes(), b"x").await?;
    }

    let snapshot = tree.snapshot().await?;
    assert!(keys(&snapshot, RangeOptions::all().gt(*b"c")).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn it_yields_nothing_for_disjoint_bounds() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    for key in ["b", "c", "d"] {
        tree.put(key.as_bytes(), b"x").await?;
    }

    let snapshot = tree.snapshot().await?;
    assert!(keys(&snapshot, RangeOptions::all().lt(*b"a")).await?.is_empty());
    assert!(keys(&snapshot, RangeOptions::all().gte(*b"z")).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn it_scans_an_empty_tree() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    let snapshot = tree.snapshot().await?;

    assert!(keys(&snapshot, RangeOptions::all()).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn it_distinguishes_inclusive_and_strict_bounds() -> Result<()> {
    let tree = seeded_tree(10).await?;
    let snapshot = tree.snapshot().await?;

    assert_eq!(
        keys(&snapshot, RangeOptions::all().gte(*b"003").lte(*b"006")).await?,
        vec!["003", "004", "005", "006"]
    );
    assert_eq!(
        keys(&snapshot, RangeOptions::all().gt(*b"003").lt(*b"006")).await?,
        vec!["004", "005"]
    );

    Ok(())
}

#[tokio::test]
async fn it_seeks_between_keys() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    for key in ["aa", "cc", "ee"] {
        tree.put(key.as_bytes(), b"x").await?;
    }

    let snapshot = tree.snapshot().await?;
    assert_eq!(
        keys(&snapshot, RangeOptions::all().gt(*b"bb")).await?,
        vec!["cc", "ee"]
    );
    assert_eq!(
        keys(&snapshot, RangeOptions::all().reverse().lt(*b"dd")).await?,
        vec!["cc", "aa"]
    );

    Ok(())
}

#[tokio::test]
async fn it_walks_in_reverse() -> Result<()> {
    let tree = seeded_tree(50).await?;
    let snapshot = tree.snapshot().await?;

    let forward = keys(&snapshot, RangeOptions::all()).await?;
    let mut backward = keys(&snapshot, RangeOptions::all().reverse()).await?;
    backward.reverse();

    assert_eq!(forward.len(), 50);
    assert_eq!(forward, backward);

    Ok(())
}

#[tokio::test]
async fn it_walks_bounded_ranges_in_reverse() -> Result<()> {
    let tree = seeded_tree(20).await?;
    let snapshot = tree.snapshot().await?;

    assert_eq!(
        keys(
            &snapshot,
            RangeOptions::all().reverse().gte(*b"004").lte(*b"007")
        )
        .await?,
        vec!["007", "006", "005", "004"]
    );
    assert_eq!(
        keys(
            &snapshot,
            RangeOptions::all().reverse().gt(*b"004").lt(*b"007")
        )
        .await?,
        vec!["006", "005"]
    );

    Ok(())
}

#[tokio::test]
async fn it_honors_the_limit() -> Result<()> {
    let tree = seeded_tree(30).await?;
    let snapshot = tree.snapshot().await?;

    assert_eq!(
        keys(&snapshot, RangeOptions::all().limit(3)).await?,
        vec!["000", "001", "002"]
    );
    assert_eq!(
        keys(&snapshot, RangeOptions::all().reverse().limit(2)).await?,
        vec!["029", "028"]
    );
    assert!(keys(&snapshot, RangeOptions::all().limit(0)).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn it_resumes_from_a_checkpoint() -> Result<()> {
    let tree = seeded_tree(40).await?;
    let snapshot = tree.snapshot().await?;
    let options = RangeOptions::all().gte(*b"005");

    let mut iterator = snapshot.iter(options.clone());
    let mut head = Vec::new();
    for _ in 0..10 {
        let entry = iterator.next().await?.expect("range should not run dry");
        head.push(String::from_utf8(entry.key)?);
    }
    let checkpoint = iterator.checkpoint();
    drop(iterator);

    // A fresh iterator rebuilt from the exported state continues
    // exactly where the first left off.
    let mut resumed = snapshot.resume(options.clone(), &checkpoint).await?;
    let mut tail = Vec::new();
    while let Some(entry) = resumed.next().await? {
        tail.push(String::from_utf8(entry.key)?);
    }

    let whole = keys(&snapshot, options).await?;
    assert_eq!(head, whole[..10].to_vec());
    assert_eq!(tail, whole[10..].to_vec());

    Ok(())
}

#[tokio::test]
async fn it_streams_entries() -> Result<()> {
    let tree = seeded_tree(5).await?;
    let snapshot = tree.snapshot().await?;

    let stream = snapshot.entries(RangeOptions::all());
    pin_mut!(stream);

    let mut collected = Vec::new();
    while let Some(entry) = stream.next().await {
        collected.push(String::from_utf8(entry?.key)?);
    }
    assert_eq!(collected, vec!["000", "001", "002", "003", "004"]);

    Ok(())
}

#[tokio::test]
async fn it_iterates_historical_versions() -> Result<()> {
    let tree = seeded_tree(10).await?;
    tree.del(b"004").await?;
    tree.put(b"900", b"late").await?;

    let old = tree.checkout(10).await?;
    assert_eq!(
        keys(&old, RangeOptions::all().gte(*b"003").limit(3)).await?,
        vec!["003", "004", "005"]
    );

    let current = tree.snapshot().await?;
    assert_eq!(
        keys(&current, RangeOptions::all().gte(*b"003").limit(3)).await?,
        vec!["003", "005", "006"]
    );

    Ok(())
}
