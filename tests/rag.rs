//! Integration tests for retrieval and the RAG query state machine.

mod common;

use arc_swap::ArcSwapOption;
use common::*;
use context_kit::chat::ChatModel;
use context_kit::error::ContextKitError;
use context_kit::index::VectorIndex;
use context_kit::models::{DocField, Document, DocumentMetadata, IndexedDocument};
use context_kit::rag::{QueryOutcome, QueryState, RagEngine, StreamEvent};
use context_kit::service::ContextService;
use context_kit::similarity;
use std::sync::Arc;
use tempfile::TempDir;

fn login_index(model: &str) -> VectorIndex {
    let doc = IndexedDocument {
        document: Document {
            page_content: "ID: FEAT-001\nTitle: Login\nType: feature".to_string(),
            metadata: DocumentMetadata {
                id: "FEAT-001".to_string(),
                entity_type: "feature".to_string(),
                path: "contexts/features/FEAT-001.yaml".to_string(),
                field: DocField::Primary,
                title: Some("Login".to_string()),
            },
        },
        embedding: vec![1.0, 0.0],
    };
    VectorIndex::new(model, "stub", vec![doc])
}

fn engine_with(index: Option<VectorIndex>, chat: Arc<ScriptedChat>) -> Arc<RagEngine> {
    let slot = Arc::new(ArcSwapOption::new(index.map(Arc::new)));
    Arc::new(RagEngine::new(
        slot,
        Arc::new(FixedEmbedder(vec![1.0, 0.0])),
        chat,
        4,
    ))
}

#[tokio::test]
async fn test_single_document_scores_full_relevance() {
    let index = login_index("stub-embed");
    let results = similarity::search(&index, "login", 10, &FixedEmbedder(vec![1.0, 0.0]))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "FEAT-001");
    assert_eq!(results[0].similarity, 100);

    let chat = Arc::new(ScriptedChat::new(vec![Script::complete(vec!["Login ", "uses SSO."])]));
    let engine = engine_with(Some(index), chat.clone());
    let response = engine.query("How does login work?").await.unwrap();

    assert_eq!(response.answer, "Login uses SSO.");
    assert_eq!(response.sources.len(), 1);
    assert_eq!(response.sources[0].id, "FEAT-001");
    assert_eq!(response.sources[0].relevance, 100);
    assert_eq!(engine.state(), QueryState::Completed);

    let prompts = chat.prompts.lock().unwrap();
    assert!(prompts[0][0].content.contains("Title: Login"));
    assert_eq!(prompts[0][1].content, "How does login work?");
}

#[tokio::test]
async fn test_query_without_index_is_not_indexed() {
    let chat = Arc::new(ScriptedChat::new(vec![]));
    let engine = engine_with(None, chat.clone());
    let err = engine.query("anything").await.unwrap_err();
    assert!(matches!(err, ContextKitError::NotIndexed));
    assert_eq!(engine.state(), QueryState::Failed);
    assert!(chat.prompts.lock().unwrap().is_empty());

    let empty = engine_with(Some(VectorIndex::new("stub-embed", "stub", vec![])), chat);
    assert!(matches!(
        empty.query("anything").await.unwrap_err(),
        ContextKitError::NotIndexed
    ));
}

#[tokio::test]
async fn test_model_mismatch_is_rejected() {
    let chat = Arc::new(ScriptedChat::new(vec![]));
    let engine = engine_with(Some(login_index("text-embedding-ada-002")), chat);
    let err = engine.query("login").await.unwrap_err();
    assert!(matches!(err, ContextKitError::Configuration(_)));
    assert!(err.to_string().contains("rebuild the index"));
}

#[tokio::test]
async fn test_cancel_keeps_partial_answer() {
    let chat = Arc::new(ScriptedChat::new(vec![Script::hanging(vec!["Hel", "lo"])]));
    let engine = engine_with(Some(login_index("stub-embed")), chat);

    let canceller = Arc::clone(&engine);
    let mut tokens = 0;
    let outcome = engine
        .stream_query("greet me", move |event| {
            if let StreamEvent::Token(_) = event {
                tokens += 1;
                if tokens == 2 {
                    canceller.cancel();
                }
            }
        })
        .await
        .unwrap();

    match outcome {
        QueryOutcome::Cancelled {
            partial_answer,
            sources,
            ..
        } => {
            assert_eq!(partial_answer, "Hello");
            assert_eq!(sources.len(), 1);
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert_eq!(engine.state(), QueryState::Cancelled);
}

#[tokio::test]
async fn test_non_streaming_query_reports_abort_distinctly() {
    let chat = Arc::new(ScriptedChat::new(vec![Script::hanging(vec!["par"])]));
    let engine = engine_with(Some(login_index("stub-embed")), chat);

    let runner = Arc::clone(&engine);
    let handle = tokio::spawn(async move { runner.query("question").await });
    while engine.state() != QueryState::Streaming {
        tokio::task::yield_now().await;
    }
    // Let the first token through before cancelling.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    engine.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(err.is_aborted());
    match err {
        ContextKitError::StreamAborted { partial_answer } => assert_eq!(partial_answer, "par"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_new_query_supersedes_in_flight_query() {
    let chat = Arc::new(ScriptedChat::new(vec![
        Script::hanging(vec!["first ", "answer"]),
        Script::complete(vec!["second"]),
    ]));
    let engine = engine_with(Some(login_index("stub-embed")), chat);

    let (tx, rx) = tokio::sync::oneshot::channel();
    let runner = Arc::clone(&engine);
    let first = tokio::spawn(async move {
        let mut tx = Some(tx);
        runner
            .stream_query("first", move |event| {
                if event == StreamEvent::Token("answer".to_string()) {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(());
                    }
                }
            })
            .await
    });
    rx.await.unwrap();

    let second = engine.query("second").await.unwrap();
    assert_eq!(second.answer, "second");

    match first.await.unwrap().unwrap() {
        QueryOutcome::Cancelled { partial_answer, .. } => {
            assert_eq!(partial_answer, "first answer")
        }
        other => panic!("first query should be cancelled, got {other:?}"),
    }
    assert_eq!(engine.state(), QueryState::Completed);
}

#[tokio::test]
async fn test_provider_failure_is_scoped_to_one_query() {
    let chat = Arc::new(ScriptedChat::new(vec![
        Script::failing(),
        Script::complete(vec!["ok"]),
    ]));
    let engine = engine_with(Some(login_index("stub-embed")), chat);

    let err = engine.query("first").await.unwrap_err();
    assert!(matches!(err, ContextKitError::ChatProvider(_)));
    assert!(!err.is_aborted());
    assert_eq!(engine.state(), QueryState::Failed);

    let response = engine.query("second").await.unwrap();
    assert_eq!(response.answer, "ok");
}

#[tokio::test]
async fn test_retrieval_failure_fails_query_without_retry() {
    let slot = Arc::new(ArcSwapOption::new(Some(Arc::new(login_index("stub-embed")))));
    let embedder = Arc::new(FlakyEmbedder::new(1, 503));
    let chat = Arc::new(ScriptedChat::new(vec![Script::complete(vec!["Login ", "uses SSO."])]));
    let engine = RagEngine::new(slot, embedder.clone(), chat.clone(), 4);

    let err = engine.query("how do users log in?").await.unwrap_err();
    match &err {
        ContextKitError::EmbeddingRequest {
            operation, status, ..
        } => {
            assert_eq!(*operation, "query");
            assert_eq!(*status, Some(503));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(embedder.attempts(), 1);
    assert_eq!(engine.state(), QueryState::Failed);
    assert!(chat.prompts.lock().unwrap().is_empty());

    let response = engine.query("how do users log in?").await.unwrap();
    assert_eq!(response.answer, "Login uses SSO.");
    assert_eq!(engine.state(), QueryState::Completed);
}

#[tokio::test]
async fn test_service_end_to_end() {
    let tmp = TempDir::new().unwrap();
    seed_repo(tmp.path());
    let config = stub_config(tmp.path().to_path_buf());
    let chat: Arc<dyn ChatModel> =
        Arc::new(ScriptedChat::new(vec![Script::complete(vec!["See FEAT-001."])]));
    let service =
        ContextService::with_providers(config, Arc::new(ContentEmbedder::new()), Some(chat));

    assert!(matches!(
        service.find_similar("FEAT-001", None).unwrap_err(),
        ContextKitError::NotIndexed
    ));

    service.index_repository().await.unwrap();

    let similar = service.find_similar("FEAT-001", Some(10)).unwrap();
    assert!(!similar.is_empty());
    assert!(similar.iter().all(|r| r.id != "FEAT-001"));
    assert!(similar.iter().all(|r| r.similarity <= 100));

    assert!(matches!(
        service.find_similar("NOPE-404", None).unwrap_err(),
        ContextKitError::NotFound { .. }
    ));

    let hits = service.search("Sign in", Some(2)).await.unwrap();
    assert_eq!(hits.len(), 2);

    let answer = service.ask("What covers login?").await.unwrap();
    assert_eq!(answer.answer, "See FEAT-001.");
    assert!(!answer.sources.is_empty());
    assert!(answer.sources.len() <= 4);
}
