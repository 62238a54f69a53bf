//! Admission control through the orchestrator: capacity, request shape,
//! capability checks and model binding.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use common::*;
use vidgen_core::{
    CoreError, GenerationRequest, ImageRef, JobState, Mode, MusicRequest, MusicStyle,
    ProviderFormat,
};

const SEEDANCE_PRO: &str = "doubao-seedance-1-5-pro-251215";
const SEEDANCE_LITE: &str = "doubao-seedance-1-0-pro-250528";

fn text(who: &str) -> GenerationRequest {
    GenerationRequest::text(who, "waves breaking on black sand")
}

// ---------------------------------------------------------------------------
// Test: active count never exceeds max_queue_size
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submission_past_capacity_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockAdapter::new(ProviderFormat::Volcengine));
    let registry = registry_with("seedance", SEEDANCE_PRO, Arc::clone(&adapter)).await;
    let mut config = fast_config(dir.path());
    config.max_queue_size = 3;
    let orch = start(config, registry, Arc::new(MemorySource::new(payload(16), 16)));

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(orch.submit(text(&format!("user-{i}"))).await.unwrap());
    }
    assert_matches!(
        orch.submit(text("user-3")).await,
        Err(CoreError::QueueFull { capacity: 3 })
    );
    assert_eq!(orch.active_count().await, 3);
    assert_eq!(orch.list().await.len(), 3);

    // Remote tasks keep running, so the slots stay taken until one ends.
    for id in &ids {
        wait_for_state(&orch, id, JobState::Polling).await;
    }
    assert!(orch.active_count().await <= 3);
    orch.cancel(&ids[0], &vidgen_engine::CancelScope::Admin)
        .await
        .unwrap();
    assert!(orch.submit(text("user-3")).await.is_ok());
    assert_eq!(orch.active_count().await, 3);

    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: first/last-frame with a single image never enters the queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn firstlast_with_one_image_is_a_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockAdapter::new(ProviderFormat::Volcengine));
    let registry = registry_with("seedance", SEEDANCE_PRO, Arc::clone(&adapter)).await;
    let orch = start(fast_config(dir.path()), registry, Arc::new(MemorySource::new(payload(16), 16)));

    let mut request = text("u1");
    request.mode = Mode::FirstLastFrame;
    request.images = vec![ImageRef("https://img.example/start.png".into())];

    assert_matches!(orch.submit(request).await, Err(CoreError::Validation(_)));
    assert!(orch.list().await.is_empty());
    assert_eq!(orch.active_count().await, 0);
    assert_eq!(adapter.submit_count(), 0);

    orch.shutdown().await;
}

#[tokio::test]
async fn image_count_rules_per_mode() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockAdapter::new(ProviderFormat::Volcengine));
    let registry = registry_with("seedance", SEEDANCE_PRO, Arc::clone(&adapter)).await;
    let orch = start(fast_config(dir.path()), registry, Arc::new(MemorySource::new(payload(16), 16)));
    let img = |n: usize| -> Vec<ImageRef> {
        (0..n)
            .map(|i| ImageRef(format!("https://img.example/{i}.png")))
            .collect()
    };

    for (mode, count, ok) in [
        (Mode::TextToVideo, 0, true),
        (Mode::TextToVideo, 1, false),
        (Mode::FirstFrame, 1, true),
        (Mode::FirstFrame, 0, false),
        (Mode::LastFrame, 1, true),
        (Mode::LastFrame, 2, false),
        (Mode::FirstLastFrame, 2, true),
        (Mode::FirstLastFrame, 3, false),
    ] {
        let mut request = text("u1");
        request.mode = mode;
        request.images = img(count);
        let result = orch.submit(request).await;
        if ok {
            assert!(result.is_ok(), "{mode} with {count} images should be accepted");
        } else {
            assert_matches!(result, Err(CoreError::Validation(_)), "{mode} with {count} images");
        }
    }
    assert_eq!(orch.list().await.len(), 4);

    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: last-frame-only on a model that needs a first frame
// ---------------------------------------------------------------------------

#[tokio::test]
async fn last_frame_alone_on_cogvideo_is_rejected_at_admission() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockAdapter::new(ProviderFormat::Zhipu));
    let registry = registry_with("cog", "cogvideox-3", Arc::clone(&adapter)).await;
    let orch = start(fast_config(dir.path()), registry, Arc::new(MemorySource::new(payload(16), 16)));

    let caps = orch.capabilities("cog").await.unwrap();
    assert!(caps.first_last_frame);
    assert!(!caps.last_frame_only);

    let mut request = text("u1");
    request.mode = Mode::LastFrame;
    request.images = vec![ImageRef("https://img.example/end.png".into())];
    assert_matches!(
        orch.submit(request).await,
        Err(CoreError::Validation(msg)) if msg.contains("last frame alone")
    );
    assert!(orch.list().await.is_empty());
    assert_eq!(orch.active_count().await, 0);
    assert_eq!(adapter.submit_count(), 0);

    // Both frames together are still fine.
    let mut request = text("u1");
    request.mode = Mode::FirstLastFrame;
    request.images = vec![
        ImageRef("https://img.example/start.png".into()),
        ImageRef("https://img.example/end.png".into()),
    ];
    assert!(orch.submit(request).await.is_ok());
    assert_eq!(orch.list().await.len(), 1);

    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: music on a model without music support
// ---------------------------------------------------------------------------

#[tokio::test]
async fn music_on_model_without_music_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockAdapter::new(ProviderFormat::Volcengine));
    let registry = registry_with("lite", SEEDANCE_LITE, Arc::clone(&adapter)).await;
    let orch = start(fast_config(dir.path()), registry, Arc::new(MemorySource::new(payload(16), 16)));

    let mut request = text("u1");
    request.music = Some(MusicRequest::enabled(Some(MusicStyle::Epic)));
    assert_matches!(
        orch.submit(request).await,
        Err(CoreError::Validation(msg)) if msg.contains("music")
    );

    // Disabled music is not a feature request.
    let mut request = text("u1");
    request.music = Some(MusicRequest {
        enabled: false,
        style: Some(MusicStyle::Epic),
        volume: 80,
    });
    assert!(orch.submit(request).await.is_ok());
    assert_eq!(orch.list().await.len(), 1);

    orch.shutdown().await;
}

#[tokio::test]
async fn unknown_model_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockAdapter::new(ProviderFormat::Volcengine));
    let registry = registry_with("seedance", SEEDANCE_PRO, adapter).await;
    let orch = start(fast_config(dir.path()), registry, Arc::new(MemorySource::new(payload(16), 16)));

    let mut request = text("u1");
    request.model = Some("sora".into());
    assert_matches!(orch.submit(request).await, Err(CoreError::UnknownModel(id)) if id == "sora");
    assert_matches!(orch.capabilities("sora").await, Err(CoreError::UnknownModel(_)));

    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: SetDefault does not alter bound jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn set_default_only_affects_later_submissions() {
    let dir = tempfile::tempdir().unwrap();
    let first = Arc::new(MockAdapter::new(ProviderFormat::Volcengine));
    let second = Arc::new(MockAdapter::new(ProviderFormat::Zhipu));
    let registry = registry_with("seedance", SEEDANCE_PRO, Arc::clone(&first)).await;
    register(&registry, "cog", "cogvideox-3", Arc::clone(&second)).await;
    let orch = start(fast_config(dir.path()), registry, Arc::new(MemorySource::new(payload(16), 16)));

    let bound = orch.submit(text("u1")).await.unwrap();
    orch.set_default("cog").await.unwrap();
    let later = orch.submit(text("u1")).await.unwrap();

    wait_for_state(&orch, &bound, JobState::Polling).await;
    wait_for_state(&orch, &later, JobState::Polling).await;

    assert_eq!(orch.status(&bound).await.unwrap().model_id, "seedance");
    assert_eq!(orch.status(&later).await.unwrap().model_id, "cog");

    let first_ids: Vec<_> = first.submitted_jobs().into_iter().map(|j| j.id).collect();
    let second_ids: Vec<_> = second.submitted_jobs().into_iter().map(|j| j.id).collect();
    assert_eq!(first_ids, vec![bound]);
    assert_eq!(second_ids, vec![later]);

    assert_matches!(orch.set_default("nope").await, Err(CoreError::UnknownModel(_)));
    assert_eq!(orch.resolve(None).await.unwrap().id, "cog");
    let models = orch.models().await;
    assert!(models.iter().any(|m| m.id == "cog" && m.is_default));

    orch.shutdown().await;
}

#[tokio::test]
async fn queued_jobs_report_position() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockAdapter::new(ProviderFormat::Volcengine));
    let registry = registry_with("seedance", SEEDANCE_PRO, adapter).await;
    let orch = start(fast_config(dir.path()), registry, Arc::new(MemorySource::new(payload(16), 16)));

    let id = orch.submit(text("u1")).await.unwrap();
    wait_for_state(&orch, &id, JobState::Polling).await;
    assert_eq!(orch.queue_position(&id).await.unwrap(), None);

    orch.shutdown().await;
}
