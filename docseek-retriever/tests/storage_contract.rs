//! Behaviour every storage backend must share.
//!
//! Each scenario runs against both the SQLite and the columnar backend
//! through the `StorageAdapter` trait object that `open_adapter` returns.

use anyhow::Result;
use chrono::Utc;
use docseek_retriever::storage::{
    BackendKind, ChunkEmbeddingUpdate, DocumentFilters, DocumentStatus, DocumentUpdate,
    HybridWeights, NewChunk, NewDocument, NewQueueItem, QueuePriority, StorageAdapter,
    StorageLocation, StoreError, TagCount, open_adapter,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const BACKENDS: [BackendKind; 2] = [BackendKind::Sqlite, BackendKind::Columnar];

async fn open(backend: BackendKind, directory: &Path) -> Result<Arc<dyn StorageAdapter>> {
    let store = open_adapter(&StorageLocation {
        backend,
        directory: directory.to_path_buf(),
    });
    store.initialize().await?;
    Ok(store)
}

fn chunk(index: u32, text: &str) -> NewChunk {
    NewChunk {
        chunk_index: index,
        text: text.to_string(),
        start_offset: u64::from(index) * 100,
        end_offset: u64::from(index) * 100 + text.len() as u64,
        page: None,
        section: None,
        token_count: None,
    }
}

#[tokio::test]
async fn test_document_and_chunk_round_trip() -> Result<()> {
    for backend in BACKENDS {
        let dir = tempdir()?;
        let store = open(backend, dir.path()).await?;

        let doc = store
            .create_document(NewDocument::for_path("notes/a.txt", 42, "h1", Utc::now()))
            .await?;
        assert_eq!(doc.file_name, "a.txt");
        assert_eq!(doc.file_extension, "txt");
        assert_eq!(doc.status, DocumentStatus::Pending);

        let chunks = store
            .create_chunks(&doc.id, vec![chunk(0, "alpha beta"), chunk(1, "gamma delta")])
            .await?;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.embedding.is_none()));

        let updated = store
            .update_chunk_embeddings(vec![
                ChunkEmbeddingUpdate {
                    chunk_id: chunks[0].id.clone(),
                    embedding: vec![1.0, 0.0, 0.0],
                },
                ChunkEmbeddingUpdate {
                    chunk_id: chunks[1].id.clone(),
                    embedding: vec![0.0, 1.0, 0.0],
                },
            ])
            .await?;
        assert_eq!(updated, 2);

        let doc = store
            .update_document(&doc.id, DocumentUpdate::status(DocumentStatus::Indexed))
            .await?;
        assert_eq!(doc.status, DocumentStatus::Indexed);

        let by_path = store.get_document_by_path("notes/a.txt").await?.unwrap();
        assert_eq!(by_path.id, doc.id);

        let stored = store.get_chunks(&doc.id).await?;
        assert_eq!(
            stored.iter().map(|c| c.chunk_index).collect::<Vec<_>>(),
            vec![0, 1],
            "{backend:?}"
        );
        assert_eq!(stored[1].embedding.as_deref(), Some(&[0.0, 1.0, 0.0][..]));

        let keyword = store
            .search_keyword("gamma", &DocumentFilters::default(), 10)
            .await?;
        assert_eq!(keyword.len(), 1, "{backend:?}");
        assert_eq!(keyword[0].chunk_index, 1);

        let semantic = store
            .search_semantic(&[1.0, 0.0, 0.0], &DocumentFilters::default(), 10)
            .await?;
        assert_eq!(semantic[0].chunk_index, 0, "{backend:?}");

        let hybrid = store
            .search_hybrid(
                "gamma",
                &[0.0, 1.0, 0.0],
                &DocumentFilters::default(),
                1,
                HybridWeights::default(),
                60.0,
            )
            .await?;
        assert_eq!(hybrid.len(), 1);
        assert_eq!(hybrid[0].chunk_index, 1, "{backend:?}");

        assert!(store.delete_document(&doc.id).await?);
        assert!(store.get_document(&doc.id).await?.is_none());
        assert!(store.get_chunks(&doc.id).await?.is_empty());
        store.close().await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_tags() -> Result<()> {
    for backend in BACKENDS {
        let dir = tempdir()?;
        let store = open(backend, dir.path()).await?;
        let a = store
            .create_document(NewDocument::for_path("a.txt", 1, "a", Utc::now()))
            .await?;
        let b = store
            .create_document(NewDocument::for_path("b.txt", 1, "b", Utc::now()))
            .await?;

        store
            .add_tags(&a.id, &["tax".to_string(), "2023".to_string()])
            .await?;
        store.add_tags(&b.id, &["tax".to_string()]).await?;
        store.add_tags(&b.id, &["tax".to_string()]).await?;
        store.remove_tags(&a.id, &["2023".to_string()]).await?;

        assert_eq!(store.get_document_tags(&a.id).await?, vec!["tax"]);
        assert_eq!(
            store.get_all_tags().await?,
            vec![TagCount {
                tag: "tax".into(),
                count: 2
            }],
            "{backend:?}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_queue_priority_order() -> Result<()> {
    for backend in BACKENDS {
        let dir = tempdir()?;
        let store = open(backend, dir.path()).await?;

        let enqueued = store
            .enqueue_items(vec![
                NewQueueItem::for_path("photo.png", 10),
                NewQueueItem::for_path("report.pdf", 10),
                NewQueueItem::for_path("big.txt", 5000),
                NewQueueItem::for_path("small.txt", 5),
            ])
            .await?;
        assert_eq!(enqueued, 4);

        let status = store.get_queue_status().await?;
        assert_eq!(status.pending, 4);
        assert_eq!(status.pending_by_priority.get(&QueuePriority::Text), Some(&2));

        let mut order = Vec::new();
        while let Some(item) = store.dequeue_item().await? {
            assert_eq!(item.attempts, 1);
            order.push(item.file_path);
        }
        assert_eq!(
            order,
            vec!["small.txt", "big.txt", "report.pdf", "photo.png"],
            "{backend:?}"
        );
        assert_eq!(store.get_queue_status().await?.processing, 4);
    }
    Ok(())
}

#[tokio::test]
async fn test_recover_stuck_documents() -> Result<()> {
    for backend in BACKENDS {
        let dir = tempdir()?;
        let store = open(backend, dir.path()).await?;

        let doc = store
            .create_document(NewDocument::for_path("stuck.md", 300, "h", Utc::now()))
            .await?;
        store
            .create_chunks(&doc.id, vec![chunk(0, "orphan one"), chunk(1, "orphan two")])
            .await?;
        store
            .update_document(&doc.id, DocumentUpdate::status(DocumentStatus::Embedding))
            .await?;

        let done = store
            .create_document(NewDocument::for_path("done.md", 10, "d", Utc::now()))
            .await?;
        store.create_chunks(&done.id, vec![chunk(0, "kept")]).await?;
        store
            .update_document(&done.id, DocumentUpdate::status(DocumentStatus::Indexed))
            .await?;

        assert_eq!(store.recover_stuck_documents().await?, 1, "{backend:?}");

        assert!(store.get_chunks(&doc.id).await?.is_empty());
        assert_eq!(store.get_chunks(&done.id).await?.len(), 1);
        let recovered = store.get_document(&doc.id).await?.unwrap();
        assert_eq!(recovered.status, DocumentStatus::Pending);

        let status = store.get_queue_status().await?;
        assert_eq!(status.pending, 1);
        let item = store.get_queue_item("stuck.md").await?.unwrap();
        assert_eq!(item.priority, QueuePriority::Markup);

        assert_eq!(store.recover_stuck_documents().await?, 0);
        assert_eq!(store.get_queue_status().await?.pending, 1);
    }
    Ok(())
}

#[tokio::test]
async fn test_read_only_rejects_writes() -> Result<()> {
    for backend in BACKENDS {
        let dir = tempdir()?;
        let store = open(backend, dir.path()).await?;
        let doc = store
            .create_document(NewDocument::for_path("a.txt", 1, "a", Utc::now()))
            .await?;

        store.set_read_only(true);
        assert!(store.is_read_only());
        let err = store
            .create_document(NewDocument::for_path("b.txt", 1, "b", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly), "{backend:?}: {err}");
        assert!(matches!(
            store.add_tags(&doc.id, &["x".to_string()]).await,
            Err(StoreError::ReadOnly)
        ));
        assert!(store.get_document(&doc.id).await?.is_some());

        store.set_read_only(false);
        store
            .create_document(NewDocument::for_path("b.txt", 1, "b", Utc::now()))
            .await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_use_before_initialize_fails() -> Result<()> {
    for backend in BACKENDS {
        let dir = tempdir()?;
        let store = open_adapter(&StorageLocation {
            backend,
            directory: dir.path().to_path_buf(),
        });
        assert!(!store.is_initialized());
        let err = store.get_document("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotInitialized), "{backend:?}: {err}");
    }
    Ok(())
}

#[tokio::test]
async fn test_concurrent_reconnects_leave_store_usable() -> Result<()> {
    for backend in BACKENDS {
        let dir = tempdir()?;
        let store = open(backend, dir.path()).await?;
        let doc = store
            .create_document(NewDocument::for_path("a.txt", 1, "a", Utc::now()))
            .await?;
        store.create_chunks(&doc.id, vec![chunk(0, "still here")]).await?;

        let (first, second) = tokio::join!(store.reconnect(), store.reconnect());
        first?;
        second?;

        assert_eq!(store.get_chunks(&doc.id).await?.len(), 1, "{backend:?}");
        store
            .create_document(NewDocument::for_path("b.txt", 1, "b", Utc::now()))
            .await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_data_survives_close_and_reopen() -> Result<()> {
    for backend in BACKENDS {
        let dir = tempdir()?;
        let store = open(backend, dir.path()).await?;
        let doc = store
            .create_document(NewDocument::for_path("kept.txt", 5, "k", Utc::now()))
            .await?;
        store.create_chunks(&doc.id, vec![chunk(0, "persisted words")]).await?;
        store
            .set_config_value("answer", serde_json::json!(42))
            .await?;
        store.suspend().await?;
        store.resume().await?;
        store.close().await?;

        let reopened = open(backend, dir.path()).await?;
        let doc = reopened.get_document_by_path("kept.txt").await?.unwrap();
        assert_eq!(reopened.get_chunks(&doc.id).await?.len(), 1, "{backend:?}");
        assert_eq!(
            reopened.get_config_value("answer").await?,
            Some(serde_json::json!(42))
        );
        let stats = reopened.get_storage_stats().await?;
        assert_eq!((stats.documents, stats.chunks), (1, 1));
    }
    Ok(())
}

#[tokio::test]
async fn test_writes_survive_drop_without_close() -> Result<()> {
    for backend in BACKENDS {
        let dir = tempdir()?;
        {
            let store = open(backend, dir.path()).await?;
            let doc = store
                .create_document(NewDocument::for_path("a.txt", 5, "a", Utc::now()))
                .await?;
            store.create_chunks(&doc.id, vec![chunk(0, "hello")]).await?;
            store
                .update_document(&doc.id, DocumentUpdate::status(DocumentStatus::Indexed))
                .await?;
            let bad = store
                .create_document(NewDocument::for_path("bad.txt", 5, "b", Utc::now()))
                .await?;
            store
                .update_document(&bad.id, DocumentUpdate::failed("parse error"))
                .await?;
        }

        let reopened = open(backend, dir.path()).await?;
        let doc = reopened.get_document_by_path("a.txt").await?.unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed, "{backend:?}");
        assert_eq!(reopened.get_chunks(&doc.id).await?.len(), 1);
        let bad = reopened.get_document_by_path("bad.txt").await?.unwrap();
        assert_eq!(bad.status, DocumentStatus::Failed, "{backend:?}");
        assert_eq!(bad.error_message.as_deref(), Some("parse error"));
    }
    Ok(())
}

#[tokio::test]
async fn test_delete_section_chunks_keeps_other_sections() -> Result<()> {
    for backend in BACKENDS {
        let dir = tempdir()?;
        let store = open(backend, dir.path()).await?;
        let doc = store
            .create_document(NewDocument::for_path("scan.pdf", 9, "s", Utc::now()))
            .await?;
        let mut recognized = chunk(1, "handwritten margin note");
        recognized.section = Some("ocr".to_string());
        store
            .create_chunks(&doc.id, vec![chunk(0, "printed text layer"), recognized])
            .await?;

        assert_eq!(store.delete_section_chunks(&doc.id, "ocr").await?, 1, "{backend:?}");
        assert_eq!(store.delete_section_chunks(&doc.id, "ocr").await?, 0);

        let chunks = store.get_chunks(&doc.id).await?;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "printed text layer");
        let hits = store
            .search_keyword("handwritten", &DocumentFilters::default(), 10)
            .await?;
        assert!(hits.is_empty(), "{backend:?}");
    }
    Ok(())
}
