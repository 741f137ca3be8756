mod common;

use assert_matches::assert_matches;
use framepipe_core::job::StageOptions;
use framepipe_core::stages::StageName;
use framepipe_pipeline::PipelineError;

use common::{all_optional, Behaviour, Fixture};

/// Run a four-stage job that fails at denoising, leaving two completed
/// stages in the checkpoint.
async fn fail_after_two_stages(fx: &Fixture, job_id: &str) -> framepipe_core::job::Job {
    fx.runner
        .set(StageName::Denoising, Behaviour::Fail("transient".into()));
    let mut job = fx.job(job_id, fx.images(4), all_optional());

    let err = fx.executor.execute(&mut job).await.unwrap_err();
    assert_matches!(
        err,
        PipelineError::StageFailed {
            stage: StageName::Denoising,
            ..
        }
    );

    let record = fx.executor.checkpoints().load(job_id).await.unwrap();
    assert_eq!(
        record.completed_steps,
        vec![StageName::BaseConversion, StageName::SuperResolution]
    );

    fx.runner.set(StageName::Denoising, Behaviour::Succeed);
    fx.runner.clear();
    job
}

#[tokio::test]
async fn resubmission_skips_validated_stages() {
    let fx = Fixture::new();
    let mut job = fail_after_two_stages(&fx, "job-resume").await;

    fx.executor.execute(&mut job).await.unwrap();

    assert_eq!(
        fx.runner.calls(),
        vec![StageName::Denoising, StageName::FramerateBoost]
    );
    // Denoising consumed the checkpointed super-resolution output.
    let denoise = &fx.runner.requests()[0];
    assert!(denoise.inputs[0]
        .to_string_lossy()
        .ends_with("job-resume_super_resolution.mp4"));
}

#[tokio::test]
async fn missing_intermediate_reruns_that_stage_and_all_later_ones() {
    let fx = Fixture::new();
    let mut job = fail_after_two_stages(&fx, "job-lost").await;

    let record = fx.executor.checkpoints().load("job-lost").await.unwrap();
    let superres = record.intermediate_files[&StageName::SuperResolution].clone();
    std::fs::remove_file(&superres).unwrap();

    fx.executor.execute(&mut job).await.unwrap();

    assert_eq!(
        fx.runner.calls(),
        vec![
            StageName::SuperResolution,
            StageName::Denoising,
            StageName::FramerateBoost,
        ]
    );
}

#[tokio::test]
async fn changed_parameters_invalidate_checkpointed_stage() {
    let fx = Fixture::new();
    let job = fail_after_two_stages(&fx, "job-params").await;

    // Same job id, but the caller now asks for a different multiplier.
    let options = StageOptions {
        superres: Some("x4".into()),
        ..all_optional()
    };
    let mut changed = fx.job("job-params", job.inputs.clone(), options);

    fx.executor.execute(&mut changed).await.unwrap();

    assert_eq!(
        fx.runner.calls(),
        vec![
            StageName::SuperResolution,
            StageName::Denoising,
            StageName::FramerateBoost,
        ]
    );
}

#[tokio::test]
async fn corrupt_checkpoint_restarts_from_scratch() {
    let fx = Fixture::new();
    let mut job = fail_after_two_stages(&fx, "job-corrupt").await;

    let record_path = fx
        .executor
        .checkpoints()
        .dir()
        .join("job-corrupt.json");
    std::fs::write(&record_path, b"{\"completed_steps\": [").unwrap();

    fx.executor.execute(&mut job).await.unwrap();

    assert_eq!(fx.runner.calls().len(), 4);
}
