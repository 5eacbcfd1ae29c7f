mod common;

use std::fs;

use assert_fs::TempDir;
use common::*;
use logoscope::config::{DataDir, LearnOptions};
use logoscope::error::{ClassifyError, FeedbackError, TrainingError};
use logoscope::learner::{Decision, Feedback};
use logoscope::store::Recognizer;
use logoscope::trainer::{SubmitOutcome, TrainingTask};
use rstest::*;

struct Workspace {
    _dir: TempDir,
    data: DataDir,
}

#[fixture]
fn workspace() -> Workspace {
    let dir = TempDir::new().unwrap();
    let data = DataDir::new(dir.path());
    Workspace { _dir: dir, data }
}

fn started(outcome: SubmitOutcome) -> logoscope::trainer::TrainingHandle {
    match outcome {
        SubmitOutcome::Started(handle) => handle,
        SubmitOutcome::Busy => panic!("training should have started"),
    }
}

fn feedback(domain: &str, image: Vec<u8>, label: &str) -> Feedback {
    Feedback {
        domain: domain.to_string(),
        image,
        label: label.to_string(),
        is_correct: true,
        new_name: None,
    }
}

#[rstest]
#[tokio::test]
async fn train_eight_classes(workspace: Workspace) {
    let names = BRANDS.map(str::to_lowercase);
    let labels = names.iter().enumerate().map(|(i, b)| (i, b.as_str())).collect::<Vec<_>>();
    seed_corpus(&workspace.data, "cars", &labels, 20);

    let engine = engine(&workspace.data, 50, StaticProvider::default());
    let report = started(engine.trainer.submit("cars")).wait().await.unwrap();

    assert_eq!(report.labels.len(), 8);
    assert_eq!(report.images, 160);
    assert!(report.calibrated);
    assert!(report.accuracy.unwrap() > 0.0);

    let dir = workspace.data.models().join("cars");
    for name in ["vocabulary.bin", "scaler.bin", "classifier.bin", "labels.bin", "metrics.json"] {
        assert!(dir.join(name).is_file(), "{name} missing");
    }
    let metrics = engine.store.read_metrics("cars").unwrap().unwrap();
    assert_eq!(metrics.evaluation.confusion.len(), 8);
    assert_eq!(metrics.k, 50);

    let bundle = engine.store.load_bundle("cars").unwrap();
    assert_eq!(bundle.labels(), report.labels.as_slice());

    let result = engine.predictor.classify(&logo(0, 99), "cars").unwrap();
    assert!(bundle.labels().contains(&result.label));
    assert!((0.0..=1.0).contains(&result.confidence));
}

#[rstest]
#[tokio::test]
async fn starved_label_is_expanded_then_trained(workspace: Workspace) {
    seed_corpus(&workspace.data, "cars", &[(0, "audi"), (1, "bmw")], 6);

    let fresh = logo(2, 1);
    let provider = StaticProvider::new(vec![
        Ok(logo(2, 2)),
        Err("connection reset".to_string()),
        Ok(logo(2, 2)),
        Ok(b"<html>not an image</html>".to_vec()),
        Ok(fresh.clone()),
        Ok(logo(2, 3)),
    ]);
    let engine = engine(&workspace.data, 20, provider);

    let mut fb = feedback("Cars", logo(2, 0), "audi");
    fb.is_correct = false;
    fb.new_name = Some("New Brand".to_string());
    let (ack, follow_up) = engine.learner.receive(fb).unwrap();

    assert_eq!(ack.label, "new_brand");
    assert_eq!(ack.domain, "cars");
    assert_eq!(ack.decision, Decision::Starve);
    assert_eq!(ack.status(), "accepted: expanding_and_retraining");
    assert!(ack.saved.is_file());
    assert_eq!(ack.samples, 1);

    let follow_up = follow_up.await.unwrap();
    assert_eq!(engine.learner.provider().calls(), 1);
    assert_eq!(engine.learner.provider().queries(), vec!["new brand logo cars"]);
    let expansion = follow_up.expansion.unwrap();
    assert_eq!(expansion.query, "new brand logo cars");
    assert!(!expansion.timed_out);
    assert_eq!(expansion.accepted, 3);
    assert_eq!(expansion.duplicates, 1);
    assert_eq!(expansion.invalid, 1);
    assert_eq!(expansion.errors, 1);

    let label_dir = workspace.data.corpus().join("cars").join("new_brand");
    assert_eq!(count_files(&label_dir), 4);

    let report = started(follow_up.submission).wait().await.unwrap();
    assert_eq!(report.labels, vec!["audi", "bmw", "new_brand"]);
}

#[rstest]
#[tokio::test]
async fn expansion_yielding_nothing_still_retrains(workspace: Workspace) {
    seed_corpus(&workspace.data, "cars", &[(0, "audi"), (1, "bmw")], 6);
    let engine = engine(&workspace.data, 20, StaticProvider::default());

    let (ack, follow_up) = engine.learner.receive(feedback("cars", logo(3, 0), "kia")).unwrap();
    assert_eq!(ack.decision, Decision::Starve);

    let follow_up = follow_up.await.unwrap();
    assert_eq!(engine.learner.provider().calls(), 1);
    assert_eq!(follow_up.expansion.unwrap().accepted, 0);
    let report = started(follow_up.submission).wait().await.unwrap();
    assert!(report.labels.contains(&"kia".to_string()));
    // 只有一个样本的类别无法校准
    assert!(!report.calibrated);
}

#[rstest]
#[tokio::test]
async fn populated_label_is_retrained_directly(workspace: Workspace) {
    seed_corpus(&workspace.data, "cars", &[(0, "audi"), (1, "bmw")], 6);
    let engine = engine(&workspace.data, 20, StaticProvider::new(vec![Ok(logo(0, 50))]));

    let (ack, follow_up) = engine.learner.receive(feedback("cars", logo(0, 7), "audi")).unwrap();
    assert_eq!(ack.decision, Decision::Refine);
    assert_eq!(ack.status(), "accepted: retraining");
    assert_eq!(ack.samples, 7);

    let follow_up = follow_up.await.unwrap();
    assert!(follow_up.expansion.is_none());
    assert_eq!(engine.learner.provider().calls(), 0);
    started(follow_up.submission).wait().await.unwrap();
}

#[rstest]
#[case::after_items(vec![Ok(logo(2, 1)), Ok(logo(2, 2))], 2)]
#[case::immediately(vec![], 0)]
#[tokio::test]
async fn stalled_source_is_cut_off_by_budget(
    workspace: Workspace,
    #[case] items: Vec<Result<Vec<u8>, String>>,
    #[case] expected: usize,
) {
    seed_corpus(&workspace.data, "cars", &[(0, "audi"), (1, "bmw")], 6);
    let learn = LearnOptions { expand_batch: 5, expand_budget: 1, ..LearnOptions::default() };
    let engine = engine_with(&workspace.data, 20, StaticProvider::stalling(items), learn);

    let (ack, follow_up) = engine.learner.receive(feedback("cars", logo(2, 0), "fiat")).unwrap();
    assert_eq!(ack.decision, Decision::Starve);

    let follow_up = follow_up.await.unwrap();
    assert_eq!(engine.learner.provider().calls(), 1);
    let expansion = follow_up.expansion.unwrap();
    assert!(expansion.timed_out);
    assert_eq!(expansion.accepted, expected);

    // 超时前保存的样本保留在样本库中
    let label_dir = workspace.data.corpus().join("cars").join("fiat");
    assert_eq!(count_files(&label_dir), expected + 1);

    let report = started(follow_up.submission).wait().await.unwrap();
    assert!(report.labels.contains(&"fiat".to_string()));
}

#[rstest]
#[tokio::test]
async fn undecodable_image_is_rejected_without_side_effects(workspace: Workspace) {
    seed_corpus(&workspace.data, "cars", &[(0, "audi"), (1, "bmw")], 6);
    let engine = engine(&workspace.data, 20, StaticProvider::default());

    let err = engine.predictor.classify(b"\x89PNG but truncated", "cars").unwrap_err();
    assert!(matches!(err, ClassifyError::Decode(_)));
    assert_eq!(engine.predictor.cache().disk_loads(), 0);

    let err = engine.learner.receive(feedback("cars", b"garbage".to_vec(), "audi")).unwrap_err();
    assert!(matches!(err, FeedbackError::Decode(_)));
    assert_eq!(count_files(&workspace.data.corpus().join("cars").join("audi")), 6);

    let err = engine.learner.receive(feedback("cars", logo(0, 9), "../etc")).unwrap_err();
    assert!(matches!(err, FeedbackError::InvalidName(_)));
}

#[rstest]
#[tokio::test]
async fn untrained_domain_is_unavailable(workspace: Workspace) {
    let engine = engine(&workspace.data, 20, StaticProvider::default());
    let err = engine.predictor.classify(&logo(0, 0), "cars").unwrap_err();
    assert!(matches!(err, ClassifyError::Unavailable { .. }));
}

#[rstest]
#[tokio::test]
async fn cache_holds_one_domain(workspace: Workspace) {
    seed_corpus(&workspace.data, "cars", &[(0, "audi"), (1, "bmw")], 6);
    seed_corpus(&workspace.data, "fashion", &[(4, "gucci"), (5, "prada")], 6);
    let engine = engine(&workspace.data, 20, StaticProvider::default());
    started(engine.trainer.submit("cars")).wait().await.unwrap();
    started(engine.trainer.submit("fashion")).wait().await.unwrap();

    let cache = engine.predictor.cache();
    let image = logo(0, 3);
    engine.predictor.classify(&image, "cars").unwrap();
    engine.predictor.classify(&image, "cars").unwrap();
    assert_eq!(cache.disk_loads(), 1);

    engine.predictor.classify(&image, "fashion").unwrap();
    assert_eq!(cache.active_domain().as_deref(), Some("fashion"));
    engine.predictor.classify(&image, "cars").unwrap();
    assert_eq!(cache.disk_loads(), 3);

    // 重新训练当前驻留的领域后缓存失效
    started(engine.trainer.submit("cars")).wait().await.unwrap();
    assert_eq!(cache.active_domain(), None);
    engine.predictor.classify(&image, "cars").unwrap();
    assert_eq!(cache.disk_loads(), 4);
}

#[rstest]
#[tokio::test]
async fn concurrent_submits_run_once(workspace: Workspace) {
    seed_corpus(&workspace.data, "cars", &[(0, "audi"), (1, "bmw")], 6);
    let engine = engine(&workspace.data, 20, StaticProvider::default());

    let first = engine.trainer.submit("cars");
    let second = engine.trainer.submit("cars");
    assert!(matches!(second, SubmitOutcome::Busy));
    assert_eq!(engine.trainer.pending(), vec!["cars"]);

    started(first).wait().await.unwrap();
    assert!(!engine.trainer.is_busy());

    let swept = engine.trainer.sweep().unwrap();
    swept.wait().await.unwrap();
    assert!(engine.trainer.pending().is_empty());
}

#[rstest]
#[tokio::test]
async fn failed_training_keeps_previous_model(workspace: Workspace) {
    seed_corpus(&workspace.data, "cars", &[(0, "audi"), (1, "bmw")], 6);
    let engine = engine(&workspace.data, 20, StaticProvider::default());
    let report = started(engine.trainer.submit("cars")).wait().await.unwrap();

    // 删除其中一个标签后只剩一个标签，本轮训练无法产出模型
    fs::remove_dir_all(workspace.data.corpus().join("cars").join("bmw")).unwrap();
    let err = engine.trainer.task().run("cars").unwrap_err();
    assert!(matches!(err, TrainingError::TooFewLabels(1)));
    assert!(!engine.trainer.is_busy());

    let bundle = engine.store.load_bundle("cars").unwrap();
    assert_eq!(bundle.run_id, report.run_id);
}

#[rstest]
#[tokio::test]
async fn empty_domain_has_no_images(workspace: Workspace) {
    let engine = engine(&workspace.data, 20, StaticProvider::default());
    let err = started(engine.trainer.submit("cars")).wait().await.unwrap_err();
    assert!(matches!(err, TrainingError::NoImages(_)));
}

#[rstest]
#[tokio::test]
async fn blank_images_have_no_descriptors(workspace: Workspace) {
    let blank = {
        use opencv::core::{self, Mat, Scalar};
        let img = Mat::new_rows_cols_with_default(64, 64, core::CV_8UC1, Scalar::all(255.)).unwrap();
        logoscope::utils::imencode_png(&img).unwrap()
    };
    for label in ["audi", "bmw"] {
        let dir = workspace.data.corpus().join("cars").join(label);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("blank.png"), &blank).unwrap();
    }
    let engine = engine(&workspace.data, 20, StaticProvider::default());
    let err = engine.trainer.task().run("cars").unwrap_err();
    assert!(matches!(err, TrainingError::NoDescriptors(_)));
    assert!(!engine.store.exists("cars"));
}

#[rstest]
#[tokio::test]
async fn seed_labels_without_images_are_dropped(workspace: Workspace) {
    fs::create_dir_all(workspace.data.path()).unwrap();
    fs::write(
        workspace.data.domains_file(),
        "[domains.cars]\nlabels = [\"audi\", \"bmw\", \"tesla\"]\n",
    )
    .unwrap();
    seed_corpus(&workspace.data, "cars", &[(0, "audi"), (1, "bmw")], 6);

    let engine = engine(&workspace.data, 20, StaticProvider::default());
    let report = started(engine.trainer.submit("cars")).wait().await.unwrap();
    assert_eq!(report.labels, vec!["audi", "bmw"]);
}
