mod common;

use framepipe_core::job::StageOptions;
use framepipe_core::stages::StageParams;
use framepipe_pipeline::cache::PIPELINE_OPERATION;
use framepipe_pipeline::FingerprintCache;
use serde_json::json;

use common::Fixture;

#[tokio::test]
async fn fingerprint_ignores_file_names() {
    let fx = Fixture::new();
    let originals = fx.images(3);

    let renamed_dir = fx.dir.path().join("renamed");
    std::fs::create_dir_all(&renamed_dir).unwrap();
    let renamed: Vec<_> = originals
        .iter()
        .enumerate()
        .map(|(i, src)| {
            let dst = renamed_dir.join(format!("shot-{i}.jpg"));
            std::fs::copy(src, &dst).unwrap();
            dst
        })
        .collect();

    let params = fx.job("a", originals.clone(), StageOptions::default()).effective_parameters();
    let a = FingerprintCache::key(&originals, PIPELINE_OPERATION, &params).await.unwrap();
    let b = FingerprintCache::key(&renamed, PIPELINE_OPERATION, &params).await.unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn fingerprint_ignores_parameter_insertion_order() {
    let fx = Fixture::new();
    let inputs = fx.images(1);

    let mut first = StageParams::new();
    first.insert("fps".into(), json!(24.0));
    first.insert("denoising".into(), json!({"temporal_strength": 4, "spatial_strength": 3}));

    let mut second = StageParams::new();
    second.insert("denoising".into(), json!({"spatial_strength": 3, "temporal_strength": 4}));
    second.insert("fps".into(), json!(24.0));

    let a = FingerprintCache::key(&inputs, PIPELINE_OPERATION, &first).await.unwrap();
    let b = FingerprintCache::key(&inputs, PIPELINE_OPERATION, &second).await.unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn fingerprint_tracks_content_and_parameters() {
    let fx = Fixture::new();
    let inputs = fx.images(2);
    let job = fx.job("a", inputs.clone(), StageOptions::default());
    let before = FingerprintCache::key(&inputs, PIPELINE_OPERATION, &job.effective_parameters())
        .await
        .unwrap();

    // Implicit defaults count: asking for denoising changes the key.
    let denoised = fx.job(
        "b",
        inputs.clone(),
        StageOptions {
            denoise: Some(true),
            ..Default::default()
        },
    );
    let with_denoise =
        FingerprintCache::key(&inputs, PIPELINE_OPERATION, &denoised.effective_parameters())
            .await
            .unwrap();
    assert_ne!(before, with_denoise);

    // Same path, new content.
    std::fs::write(&inputs[0], b"edited pixels").unwrap();
    let after = FingerprintCache::key(&inputs, PIPELINE_OPERATION, &job.effective_parameters())
        .await
        .unwrap();
    assert_ne!(before, after);
}

#[tokio::test]
async fn deleted_cached_artifact_makes_resubmission_run_again() {
    let fx = Fixture::new();
    let images = fx.images(2);

    let mut first = fx.job("job-1", images.clone(), StageOptions::default());
    let output = fx.executor.execute(&mut first).await.unwrap();
    let entry = fx.executor.cache().get(&output.fingerprint).await.unwrap().unwrap();
    std::fs::remove_file(&entry.artifact_path).unwrap();

    // Dangling entry: a plain miss, not an error.
    assert!(fx.executor.cache().get(&output.fingerprint).await.unwrap().is_none());
    assert_eq!(fx.cache_entry_count(), 0);

    fx.runner.clear();
    let mut second = fx.job("job-2", images, StageOptions::default());
    let rerun = fx.executor.execute(&mut second).await.unwrap();

    assert!(!rerun.cached);
    assert_eq!(fx.runner.calls().len(), 1);
    assert!(rerun.artifact_path.exists());
}
