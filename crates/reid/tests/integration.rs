//! Integration tests for the reid crate.
//!
//! These exercise the modules together: config → sampler → model → loss
//! composer → scheduler through the orchestrator, with the synthetic dataset,
//! the burn synthetic network trained by AdamW, and the retrieval evaluator.
//! All use the NdArray backend; no images are involved.

use std::collections::HashSet;
use std::path::PathBuf;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;

use reid::config::ExperimentConfig;
use reid::error::TrainError;
use reid::mocks::{RecordingExporter, RetrievalEvaluator, SyntheticDataConfig, SyntheticIdentityData};
use reid::model::bridge::rows_to_tensor;
use reid::model::synthetic::SyntheticModelConfig;
use reid::training::loss::LossComposer;
use reid::training::sampler::{derive_epoch_seed, IdentityBatchSampler, IdentityCatalog};
use reid::training::schedule::LrScheduler;
use reid::training::trainer::{ExperimentOrchestrator, RankingExporter};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;

fn configs_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../configs")
}

fn small_config(extra: &[&str]) -> ExperimentConfig {
    let mut overrides: Vec<String> = [
        "train.batch_size=16",
        "sampler.num_instances=4",
        "train.max_epoch=3",
        "train.warmup_iters=4",
        "train.print_freq=2",
        "test.eval_freq=1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    overrides.extend(extra.iter().map(|s| s.to_string()));
    ExperimentConfig::load(&configs_dir().join("baseline_60epoch.yaml"), &overrides).unwrap()
}

fn dataset(seed: u64) -> SyntheticIdentityData {
    SyntheticIdentityData::generate(&SyntheticDataConfig {
        identities: 12,
        samples_min: 2,
        samples_max: 9,
        feature_dim: 6,
        noise: 0.2,
        seed,
    })
    .unwrap()
}

#[test]
fn test_all_shipped_configs_load() {
    let mut seen = 0;
    for entry in std::fs::read_dir(configs_dir()).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let cfg = ExperimentConfig::load(&path, &[])
            .unwrap_or_else(|e| panic!("{}: {e}", path.display()));
        assert_eq!(cfg.train.batch_size % cfg.sampler.num_instances, 0);
        LossComposer::<TestBackend>::from_config(&cfg).unwrap();
        LrScheduler::from_config(&cfg, 10).unwrap();
        seen += 1;
    }
    assert!(seen >= 10, "only {seen} configs found");
}

#[test]
fn test_shipped_config_semantics() {
    let dir = configs_dir();
    let pure = ExperimentConfig::load(&dir.join("loss_pure_triplet.yaml"), &[]).unwrap();
    let weights = LossComposer::<TestBackend>::from_config(&pure)
        .unwrap()
        .term_weights();
    assert_eq!(weights, vec![("softmax", 0.0), ("triplet", 1.0)]);

    // Warmup (1000 iters) ends well before the first milestone at 100 steps
    // per epoch.
    let staged = ExperimentConfig::load(&dir.join("advanced_optimization.yaml"), &[]).unwrap();
    assert_eq!(staged.train.warmup_iters, 1000);
    let s = LrScheduler::from_config(&staged, 100).unwrap();
    let lr = staged.train.lr;
    assert!(s.rate_for(999) < lr);
    assert!((s.rate_for(1000) - lr).abs() < 1e-12);
    assert!((s.rate_for(19 * 100 + 99) - lr).abs() < 1e-12);
    assert!((s.rate_for(20 * 100) - lr * 0.1).abs() < 1e-12);
    assert!((s.rate_for(40 * 100) - lr * 0.01).abs() < 1e-12);

    let many = ExperimentConfig::load(&dir.join("sampling_many_instances.yaml"), &[]).unwrap();
    assert_eq!(many.identities_per_batch(), 8);
}

#[test]
fn test_load_written_config_with_overrides() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("exp.yaml");
    std::fs::write(
        &path,
        "sampler:\n  num_instances: 4\ntrain:\n  batch_size: 32\n  stepsize: 20\nmodel:\n  name: osnet\n",
    )
    .unwrap();

    let cfg = ExperimentConfig::load(
        &path,
        &[
            "train.lr_scheduler=multi_step".to_string(),
            "data.save_dir=log/custom".to_string(),
        ],
    )
    .unwrap();
    assert_eq!(cfg.train.stepsize, vec![20]);
    assert_eq!(cfg.data.save_dir, "log/custom");
    assert_eq!(cfg.identities_per_batch(), 8);
    assert!(LrScheduler::from_config(&cfg, 5).unwrap().describe().contains("staged"));

    std::fs::write(&path, "train:\n  batch_size: 30\n").unwrap();
    assert!(matches!(
        ExperimentConfig::load(&path, &[]),
        Err(TrainError::Config(_))
    ));
    assert!(ExperimentConfig::load(&tmp.path().join("missing.yaml"), &[]).is_err());
}

#[test]
fn test_sampler_over_synthetic_dataset() {
    let data = dataset(3);
    let cfg = small_config(&[]);
    let mut sampler = IdentityBatchSampler::from_config(&cfg, data.build_catalog()).unwrap();
    let labels = data.labels();

    for epoch in 0..3 {
        sampler.reset(derive_epoch_seed(cfg.train.seed, epoch));
        let mut batches = 0;
        for batch in sampler.by_ref() {
            assert_eq!(batch.len(), 16);
            let ids: HashSet<usize> = batch.iter().map(|&s| labels[s]).collect();
            assert_eq!(ids.len(), 4);
            for id in ids {
                assert_eq!(batch.iter().filter(|&&s| labels[s] == id).count(), 4);
            }
            batches += 1;
        }
        assert!(batches >= 1);
    }
}

#[test]
fn test_three_small_identities_pinned() {
    // 3 identities × 2 samples, K = 4: with B = 8 the sampler draws with
    // replacement (3 draws → one batch); with B = 16 it cannot fill 4
    // distinct identities.
    let catalog = IdentityCatalog::from_identities(["a", "a", "b", "b", "c", "c"]);
    let mut sampler = IdentityBatchSampler::new(catalog.clone(), 8, 4).unwrap();
    sampler.reset(7);
    assert_eq!(sampler.batches_per_epoch(), 1);
    let batches: Vec<Vec<usize>> = sampler.collect();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 8);

    let err = IdentityBatchSampler::new(catalog, 16, 4).err().unwrap();
    assert!(matches!(
        err,
        TrainError::InsufficientIdentities {
            available: 3,
            required: 4
        }
    ));
}

#[test]
fn test_composer_on_model_output() {
    let device = Default::default();
    let data = dataset(5);
    let cfg = small_config(&[]);
    let catalog = data.build_catalog();
    let mut sampler = IdentityBatchSampler::from_config(&cfg, catalog.clone()).unwrap();
    sampler.reset(1);
    let batch = sampler.next_batch().unwrap();
    let labels = catalog.labels_for(&batch).unwrap();

    let net = SyntheticModelConfig::new(6, catalog.num_identities()).init::<TestBackend>(&device);
    let rows: Vec<Vec<f32>> = batch.iter().map(|&s| data.features()[s].clone()).collect();
    let (emb, logits) = net.forward(rows_to_tensor::<TestBackend>(&rows, &device).unwrap());

    let out = LossComposer::<TestBackend>::from_config(&cfg)
        .unwrap()
        .compute(emb, logits, &labels, true)
        .unwrap();
    let ce = out.term("softmax").unwrap();
    let tri = out.term("triplet").unwrap();
    assert!(ce > 0.0 && tri >= 0.0);
    assert!((out.total_value - (0.5 * ce + 0.5 * tri)).abs() < 1e-5);
}

#[test]
fn test_end_to_end_synthetic_training() {
    let device = Default::default();
    let cfg = small_config(&["test.export_ranking_results=true"]);
    let mut data = dataset(11);
    let labels = data.labels();
    let mut model = SyntheticModelConfig::new(6, data.build_catalog().num_identities())
        .with_d_embedding(8)
        .build::<TestAutodiffBackend>(cfg.train.weight_decay, data.features().to_vec(), &device);
    let mut evaluator = RetrievalEvaluator::new(labels);
    let mut exporter = RecordingExporter::default();

    let orch = ExperimentOrchestrator::<TestAutodiffBackend>::new(&cfg).unwrap();
    let summary = orch
        .run(
            &mut data,
            &mut model,
            &mut evaluator,
            Some(&mut exporter as &mut dyn RankingExporter),
        )
        .unwrap();

    assert_eq!(summary.epochs_completed, 3);
    assert_eq!(summary.trained_steps, 3 * summary.steps_per_epoch);
    assert_eq!(summary.skipped_steps, 0);
    assert_eq!(summary.evaluations.len(), 3);
    assert_eq!(exporter.reports.len(), 3);
    for report in &summary.evaluations {
        let r1 = report.rank1().unwrap();
        assert!((0.0..=1.0).contains(&r1));
        assert!(report.cmc[&20] >= r1);
    }
    assert!(summary.history.epochs().iter().all(|e| e.average.is_some()));

    // The summary serializes for the CLI's run_summary.json.
    let json = serde_json::to_string(&summary).unwrap();
    assert!(json.contains("\"trained_steps\""));
}

#[test]
fn test_end_to_end_is_deterministic() {
    let device = Default::default();
    let cfg = small_config(&["train.max_epoch=2"]);
    let run = || {
        let mut data = dataset(21);
        let labels = data.labels();
        let mut model = SyntheticModelConfig::new(6, data.build_catalog().num_identities())
            .build::<TestAutodiffBackend>(cfg.train.weight_decay, data.features().to_vec(), &device);
        let mut evaluator = RetrievalEvaluator::new(labels);
        ExperimentOrchestrator::<TestAutodiffBackend>::new(&cfg)
            .unwrap()
            .run(&mut data, &mut model, &mut evaluator, None)
            .unwrap()
    };
    let a = run();
    let b = run();
    let losses = |s: &reid::RunSummary| -> Vec<f64> {
        s.history
            .epochs()
            .iter()
            .filter_map(|e| e.average.as_ref().map(|m| m.loss))
            .collect()
    };
    assert_eq!(losses(&a), losses(&b));
    assert_eq!(a.evaluations, b.evaluations);
}
