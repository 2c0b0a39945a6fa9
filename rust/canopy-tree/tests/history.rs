use std::time::Duration;

use anyhow::Result;
use canopy_log::MemoryLog;
use canopy_tree::{CanopyTreeError, HistoryOptions, Tree};
use futures_util::{StreamExt, pin_mut};

#[tokio::test]
async fn it_streams_history_newest_first() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    for key in 0..10 {
        let key = format!("{key:02}");
        tree.put(key.as_bytes(), key.as_bytes()).await?;
    }

    let stream = tree.history(HistoryOptions::all().reverse());
    pin_mut!(stream);

    let mut seen = Vec::new();
    while let Some(entry) = stream.next().await {
        let entry = entry?;
        seen.push((entry.seq, String::from_utf8(entry.key)?));
    }

    let expected: Vec<(u64, String)> = (0..10u64)
        .rev()
        .map(|key| (key + 1, format!("{key:02}")))
        .collect();
    assert_eq!(seen, expected);

    Ok(())
}

#[tokio::test]
async fn it_streams_a_bounded_slice_of_history() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    for key in 0..10 {
        let key = format!("{key:02}");
        tree.put(key.as_bytes(), key.as_bytes()).await?;
    }

    let stream = tree.history(HistoryOptions::all().start(3).end(5));
    pin_mut!(stream);

    let mut seqs = Vec::new();
    while let Some(entry) = stream.next().await {
        seqs.push(entry?.seq);
    }
    assert_eq!(seqs, vec![3, 4, 5]);

    Ok(())
}

#[tokio::test]
async fn it_marks_deletions_in_history() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    tree.put(b"key", b"value").await?;
    tree.del(b"key").await?;

    let stream = tree.history(HistoryOptions::all());
    pin_mut!(stream);

    let first = stream.next().await.expect("first write expected")?;
    assert_eq!(first.value.as_deref(), Some(b"value".as_slice()));

    let second = stream.next().await.expect("deletion expected")?;
    assert_eq!(second.key, b"key");
    assert!(second.value.is_none());

    assert!(stream.next().await.is_none());

    Ok(())
}

#[tokio::test]
async fn it_rejects_live_reverse_streams() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;

    let stream = tree.history(HistoryOptions::all().live().reverse());
    pin_mut!(stream);

    assert!(matches!(
        stream.next().await,
        Some(Err(CanopyTreeError::InvalidOptions(_)))
    ));

    Ok(())
}

#[tokio::test]
async fn it_follows_live_commits() -> Result<()> {
    let tree = Tree::open(MemoryLog::new()).await?;
    tree.put(b"first", b"1").await?;

    let writer = tree.clone();
    let stream = tree.history(HistoryOptions::all().live());
    pin_mut!(stream);

    let entry = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await?
        .expect("live stream should yield the existing write")?;
    assert_eq!(entry.key, b"first");

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.put(b"second", b"2").await
    });

    let entry = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await?
        .expect("live stream should yield the new write")?;
    assert_eq!(entry.key, b"second");

    // With nothing further committed the stream stays pending rather
    // than completing.
    assert!(
        tokio::time::timeout(Duration::from_millis(100), stream.next())
            .await
            .is_err()
    );

    Ok(())
}
