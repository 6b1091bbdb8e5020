//! Subcommand implementations: single synthetic runs, schedule inspection,
//! config validation, and multi-experiment sessions.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use burn::backend::ndarray::{NdArray, NdArrayDevice};
use burn::backend::Autodiff;
use indicatif::{ProgressBar, ProgressStyle};

use reid::config::ExperimentConfig;
use reid::error::TrainError;
use reid::mocks::{RetrievalEvaluator, SyntheticDataConfig, SyntheticIdentityData};
use reid::model::synthetic::SyntheticModelConfig;
use reid::training::loss::LossComposer;
use reid::training::schedule::LrScheduler;
use reid::training::trainer::{EvalReport, ExperimentOrchestrator, RankingExporter, RunSummary};

use crate::experiments::{self, Experiment};
use crate::results::{ExperimentOutcome, OutcomeStatus, SessionSummary};

type TrainBackend = Autodiff<NdArray<f32>>;

/// Shape of the synthetic dataset and network used in place of images and a
/// backbone.
#[derive(clap::Args, Debug, Clone)]
pub struct SyntheticArgs {
    /// Number of synthetic identities.
    #[arg(long, default_value_t = 32)]
    pub identities: usize,
    /// Minimum samples per identity.
    #[arg(long, default_value_t = 2)]
    pub samples_min: usize,
    /// Maximum samples per identity.
    #[arg(long, default_value_t = 12)]
    pub samples_max: usize,
    /// Feature vector dimension.
    #[arg(long, default_value_t = 16)]
    pub feature_dim: usize,
    /// Embedding dimension of the network.
    #[arg(long, default_value_t = 16)]
    pub embedding_dim: usize,
}

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    pub config: PathBuf,
    pub overrides: Vec<String>,
    pub synthetic: SyntheticArgs,
}

/// Arguments for the `schedule` subcommand.
#[derive(Debug)]
pub struct ScheduleArgs {
    pub config: PathBuf,
    pub steps_per_epoch: usize,
}

/// Arguments for the `validate` subcommand.
#[derive(Debug)]
pub struct ValidateArgs {
    pub config: PathBuf,
    pub overrides: Vec<String>,
}

/// Arguments for the `experiments` subcommand.
#[derive(Debug)]
pub struct ExperimentsArgs {
    pub names: Vec<String>,
    pub list: bool,
    pub dry_run: bool,
    pub timeout_secs: u64,
    pub wait_secs: u64,
    pub configs_dir: PathBuf,
    pub log_root: PathBuf,
    pub synthetic: SyntheticArgs,
}

/// Writes each evaluation report as `ranking_epoch_NNN.json`.
pub struct JsonRankingExporter {
    dir: PathBuf,
}

impl JsonRankingExporter {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl RankingExporter for JsonRankingExporter {
    fn export(&mut self, report: &EvalReport) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("ranking_epoch_{:03}.json", report.epoch));
        std::fs::write(&path, serde_json::to_string_pretty(report)?)?;
        tracing::debug!(path = %path.display(), "Exported ranking results");
        Ok(())
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Train the synthetic network on a generated dataset under `config`.
///
/// Ranking results go to `<save_dir>/rankings` when the config enables them.
pub fn train_synthetic(
    config: &ExperimentConfig,
    synthetic: &SyntheticArgs,
    deadline: Option<Duration>,
) -> anyhow::Result<RunSummary> {
    let device = NdArrayDevice::default();
    let mut data = SyntheticIdentityData::generate(&SyntheticDataConfig {
        identities: synthetic.identities,
        samples_min: synthetic.samples_min,
        samples_max: synthetic.samples_max,
        feature_dim: synthetic.feature_dim,
        noise: 0.3,
        seed: config.train.seed,
    })?;
    let num_classes = data.build_catalog().num_identities();
    let mut model = SyntheticModelConfig::new(synthetic.feature_dim, num_classes)
        .with_d_embedding(synthetic.embedding_dim)
        .with_seed(config.train.seed)
        .build::<TrainBackend>(config.train.weight_decay, data.features().to_vec(), &device);
    let mut evaluator = RetrievalEvaluator::new(data.labels());
    let mut exporter = JsonRankingExporter::new(Path::new(&config.data.save_dir).join("rankings"));

    let mut orchestrator = ExperimentOrchestrator::<TrainBackend>::new(config)?;
    if let Some(limit) = deadline {
        orchestrator = orchestrator.with_deadline(limit);
    }
    let summary = orchestrator.run(
        &mut data,
        &mut model,
        &mut evaluator,
        Some(&mut exporter as &mut dyn RankingExporter),
    )?;
    Ok(summary)
}

fn print_run_summary(summary: &RunSummary) {
    println!("Epochs: {}", summary.epochs_completed);
    println!(
        "Steps: {} trained, {} skipped ({} per epoch)",
        summary.trained_steps, summary.skipped_steps, summary.steps_per_epoch
    );
    println!("Final LR: {:.3e}", summary.final_lr);
    if let Some(avg) = summary.history.last().and_then(|e| e.average.as_ref()) {
        println!("Final loss: {:.4}", avg.loss);
    }
    if let Some(report) = summary.last_eval() {
        for (rank, acc) in &report.cmc {
            println!("Rank-{rank:<2}: {:.1}%", acc * 100.0);
        }
        if let Some(map) = report.map {
            println!("mAP: {:.1}%", map * 100.0);
        }
    }
    println!("Elapsed: {:.1}s", summary.elapsed_secs);
}

/// Single synthetic training run; writes `run_summary.json` into
/// `data.save_dir`.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let config = ExperimentConfig::load(&args.config, &args.overrides)?;
    let summary = train_synthetic(&config, &args.synthetic, None)?;

    let save_dir = PathBuf::from(&config.data.save_dir);
    std::fs::create_dir_all(&save_dir)?;
    let path = save_dir.join("run_summary.json");
    std::fs::write(&path, serde_json::to_string_pretty(&summary)?)?;

    println!("\n--- Training Summary ---");
    print_run_summary(&summary);
    println!("Summary: {}", path.display());
    Ok(())
}

/// Learning rate at every epoch boundary and at the end of warmup.
pub fn schedule_table(config: &ExperimentConfig, steps_per_epoch: usize) -> anyhow::Result<Vec<(String, usize, f64)>> {
    let scheduler = LrScheduler::from_config(config, steps_per_epoch)?;
    let mut rows = Vec::new();
    let warmup = config.train.warmup_iters;
    if warmup > 0 {
        rows.push(("warmup end".to_string(), warmup, scheduler.rate_for(warmup)));
    }
    for epoch in 0..config.train.max_epoch {
        let step = epoch * steps_per_epoch;
        rows.push((format!("epoch {}", epoch + 1), step, scheduler.rate_for(step)));
    }
    let last = config.train.max_epoch * steps_per_epoch;
    rows.push(("end".to_string(), last, scheduler.rate_for(last)));
    rows.sort_by_key(|(_, step, _)| *step);
    Ok(rows)
}

pub fn run_schedule(args: ScheduleArgs) -> anyhow::Result<()> {
    if args.steps_per_epoch == 0 {
        anyhow::bail!("--steps-per-epoch must be positive");
    }
    let config = ExperimentConfig::load(&args.config, &[])?;
    let scheduler = LrScheduler::from_config(&config, args.steps_per_epoch)?;

    println!("--- Schedule ---");
    println!("{}", scheduler.describe());
    println!("Steps per epoch: {}", args.steps_per_epoch);
    for (label, step, lr) in schedule_table(&config, args.steps_per_epoch)? {
        println!("{label:>12}  step {step:>7}  lr {lr:.4e}");
    }
    Ok(())
}

pub fn run_validate(args: ValidateArgs) -> anyhow::Result<()> {
    let config = ExperimentConfig::load(&args.config, &args.overrides)?;
    let composer = LossComposer::<NdArray<f32>>::from_config(&config)?;
    // Steps per epoch depend on the dataset; show the schedule in epochs.
    let scheduler = LrScheduler::from_config(&config, 1)?;

    println!("--- Config: {} ---", args.config.display());
    println!(
        "Sampler: {:?}, B = {}, K = {}, P = {}",
        config.sampler.train_sampler,
        config.train.batch_size,
        config.sampler.num_instances,
        config.identities_per_batch()
    );
    println!("Loss: {:?}", config.loss.name);
    for (name, weight) in composer.term_weights() {
        println!("  {name:<8} weight {weight}");
    }
    println!(
        "  mining: {}, distance: {:?}, margin: {}",
        if composer.hard_mining() { "batch-hard" } else { "batch-all" },
        config.loss.triplet.distance,
        config.loss.triplet.margin
    );
    println!("Schedule (per epoch): {}", scheduler.describe());
    println!(
        "Epochs: {}..{}, eval_freq: {}, save_dir: {}",
        config.train.start_epoch + 1,
        config.train.max_epoch,
        config.test.eval_freq,
        config.data.save_dir
    );
    println!("OK");
    Ok(())
}

/// Run one registered experiment, never failing the session.
fn run_one(
    exp: &Experiment,
    args: &ExperimentsArgs,
    session_id: &str,
) -> ExperimentOutcome {
    let config_path = args.configs_dir.join(format!("{}.yaml", exp.config));
    let save_dir = args.log_root.join(format!("{}_{session_id}", exp.name));
    let mut outcome = ExperimentOutcome {
        key: exp.key.to_string(),
        name: exp.name.to_string(),
        config: config_path.display().to_string(),
        save_dir: save_dir.display().to_string(),
        status: OutcomeStatus::Failed,
        elapsed_secs: 0.0,
        error: None,
        rank1: None,
        map: None,
        final_loss: None,
    };

    if !config_path.exists() {
        tracing::warn!(experiment = exp.key, path = %config_path.display(), "Config file not found");
        outcome.status = OutcomeStatus::MissingConfig;
        outcome.error = Some(format!("config not found: {}", config_path.display()));
        return outcome;
    }

    let start = Instant::now();
    let result = ExperimentConfig::load(
        &config_path,
        &[format!("data.save_dir={}", save_dir.display())],
    )
    .map_err(anyhow::Error::from)
    .and_then(|config| {
        let summary = train_synthetic(
            &config,
            &args.synthetic,
            Some(Duration::from_secs(args.timeout_secs)),
        )?;
        std::fs::create_dir_all(&save_dir)?;
        std::fs::write(
            save_dir.join("run_summary.json"),
            serde_json::to_string_pretty(&summary)?,
        )?;
        Ok(summary)
    });
    outcome.elapsed_secs = start.elapsed().as_secs_f64();

    match result {
        Ok(summary) => {
            outcome.status = OutcomeStatus::Completed;
            outcome.rank1 = summary.last_eval().and_then(EvalReport::rank1);
            outcome.map = summary.last_eval().and_then(|r| r.map);
            outcome.final_loss = summary
                .history
                .last()
                .and_then(|e| e.average.as_ref())
                .map(|m| m.loss);
            tracing::info!(
                experiment = exp.key,
                elapsed_secs = outcome.elapsed_secs,
                rank1 = ?outcome.rank1,
                map = ?outcome.map,
                "Completed"
            );
        }
        Err(e) => {
            if matches!(e.downcast_ref::<TrainError>(), Some(TrainError::TimedOut { .. })) {
                outcome.status = OutcomeStatus::TimedOut;
                tracing::warn!(experiment = exp.key, timeout_secs = args.timeout_secs, "Timed out, skipping");
            } else {
                tracing::warn!(experiment = exp.key, error = %e, "Experiment failed");
            }
            outcome.error = Some(format!("{e:#}"));
        }
    }
    outcome
}

/// Run every experiment in order, waiting `wait_secs` between them.
pub fn run_session(
    experiments: &[&'static Experiment],
    args: &ExperimentsArgs,
    session_id: &str,
) -> SessionSummary {
    let started_unix_secs = unix_secs();
    let start = Instant::now();

    let pb = ProgressBar::new(experiments.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .expect("valid progress bar template")
            .progress_chars("=> "),
    );

    let mut outcomes = Vec::with_capacity(experiments.len());
    for (i, exp) in experiments.iter().enumerate() {
        pb.set_message(exp.key);
        outcomes.push(run_one(exp, args, session_id));
        pb.inc(1);

        if args.wait_secs > 0 && i + 1 < experiments.len() {
            tracing::info!(wait_secs = args.wait_secs, "Waiting before next experiment");
            std::thread::sleep(Duration::from_secs(args.wait_secs));
        }
    }
    pb.finish_with_message("done");

    SessionSummary::from_outcomes(
        session_id.to_string(),
        started_unix_secs,
        start.elapsed().as_secs_f64(),
        outcomes,
    )
}

pub fn run_experiments(args: ExperimentsArgs) -> anyhow::Result<()> {
    if args.list || args.names.is_empty() {
        print!("{}", experiments::listing());
        return Ok(());
    }

    let resolution = experiments::resolve(&args.names);
    if !resolution.unknown.is_empty() {
        println!("Ignoring unknown names: {}", resolution.unknown.join(", "));
    }
    if resolution.experiments.is_empty() {
        anyhow::bail!("no valid experiments in {:?}", args.names);
    }

    let session_id = unix_secs().to_string();
    println!("--- Experiment Session {session_id} ---");
    println!("Timeout per experiment: {}s", args.timeout_secs);
    println!("Wait between experiments: {}s", args.wait_secs);
    println!("Experiments ({}):", resolution.experiments.len());
    for (i, exp) in resolution.experiments.iter().enumerate() {
        println!("  {:2}. {:17} - {}", i + 1, exp.key, exp.description);
    }
    if args.dry_run {
        println!("\nDry run: nothing executed");
        return Ok(());
    }

    let summary = run_session(&resolution.experiments, &args, &session_id);

    println!("\n--- Session Summary ---");
    for o in &summary.experiments {
        let detail = match (o.status, o.rank1) {
            (OutcomeStatus::Completed, Some(r1)) => format!("rank-1 {:.1}%", r1 * 100.0),
            (OutcomeStatus::Completed, None) => String::new(),
            _ => o.error.clone().unwrap_or_default(),
        };
        println!("  {:17} {:?} ({:.1}s) {detail}", o.key, o.status, o.elapsed_secs);
    }
    println!("Completed: {}", summary.completed);
    println!("Failed: {}", summary.failed);
    println!("Success rate: {:.1}%", summary.success_rate);
    println!("Total time: {:.1}s", summary.total_secs);

    let path = args.log_root.join(format!("session_{session_id}.json"));
    summary.write_json(&path)?;
    println!("Session summary: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = "\
data:
  save_dir: 'log/small'
sampler:
  num_instances: 2
loss:
  name: 'triplet'
  triplet:
    margin: 0.3
    weight_t: 0.5
    weight_x: 0.5
train:
  lr: 0.001
  max_epoch: 2
  batch_size: 8
  lr_scheduler: 'cosine'
  warmup_iters: 2
  print_freq: 1
test:
  eval_freq: 1
  ranks: [1, 5]
  export_ranking_results: True
";

    fn small_synthetic() -> SyntheticArgs {
        SyntheticArgs {
            identities: 8,
            samples_min: 2,
            samples_max: 5,
            feature_dim: 4,
            embedding_dim: 4,
        }
    }

    fn session_args(configs_dir: &Path, log_root: &Path) -> ExperimentsArgs {
        ExperimentsArgs {
            names: Vec::new(),
            list: false,
            dry_run: false,
            timeout_secs: 600,
            wait_secs: 0,
            configs_dir: configs_dir.to_path_buf(),
            log_root: log_root.to_path_buf(),
            synthetic: small_synthetic(),
        }
    }

    #[test]
    fn test_train_synthetic_exports_rankings() {
        let tmp = tempfile::tempdir().unwrap();
        let save_dir = tmp.path().join("run");
        let config = ExperimentConfig::from_yaml_with_overrides(
            SMALL,
            &[format!("data.save_dir={}", save_dir.display())],
        )
        .unwrap();

        let summary = train_synthetic(&config, &small_synthetic(), None).unwrap();
        assert_eq!(summary.epochs_completed, 2);
        assert_eq!(summary.evaluations.len(), 2);
        assert!(save_dir.join("rankings/ranking_epoch_001.json").exists());
        assert!(save_dir.join("rankings/ranking_epoch_002.json").exists());
    }

    #[test]
    fn test_run_train_writes_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("small.yaml");
        std::fs::write(&config_path, SMALL).unwrap();
        let save_dir = tmp.path().join("out");

        run_train(TrainArgs {
            config: config_path,
            overrides: vec![
                format!("data.save_dir={}", save_dir.display()),
                "test.export_ranking_results=false".to_string(),
            ],
            synthetic: small_synthetic(),
        })
        .unwrap();

        let text = std::fs::read_to_string(save_dir.join("run_summary.json")).unwrap();
        let summary: RunSummary = serde_json::from_str(&text).unwrap();
        assert_eq!(summary.epochs_completed, 2);
        assert!(!save_dir.join("rankings").exists());
    }

    #[test]
    fn test_schedule_table() {
        let config = ExperimentConfig::from_yaml_str(SMALL).unwrap();
        let rows = schedule_table(&config, 4).unwrap();
        let steps: Vec<usize> = rows.iter().map(|r| r.1).collect();
        assert_eq!(steps, vec![0, 2, 4, 8]);
        // Warmup starts at lr * warmup_factor and reaches lr.
        assert!((rows[0].2 - 0.001 * 0.01).abs() < 1e-12);
        assert!((rows[1].2 - 0.001).abs() < 1e-12);
        assert!(rows[3].2 < rows[2].2);
        assert!(schedule_table(&config, 0).is_err());
    }

    #[test]
    fn test_session_counts_missing_config_as_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let configs = tmp.path().join("configs");
        std::fs::create_dir_all(&configs).unwrap();
        std::fs::write(configs.join("baseline_60epoch.yaml"), SMALL).unwrap();
        let log_root = tmp.path().join("log");
        let args = session_args(&configs, &log_root);

        let resolution = experiments::resolve(&["baseline", "best"]);
        let summary = run_session(&resolution.experiments, &args, "t1");

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.success_rate, 50.0);
        let baseline = &summary.experiments[0];
        assert_eq!(baseline.status, OutcomeStatus::Completed);
        assert!(baseline.rank1.is_some());
        assert!(log_root.join("baseline_resnet50_t1/run_summary.json").exists());
        assert_eq!(summary.experiments[1].status, OutcomeStatus::MissingConfig);
    }

    #[test]
    fn test_contrastive_has_no_shipped_config() {
        let tmp = tempfile::tempdir().unwrap();
        let shipped = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../configs");
        let args = session_args(&shipped, &tmp.path().join("log"));

        let resolution = experiments::resolve(&["contrastive"]);
        let summary = run_session(&resolution.experiments, &args, "t3");
        assert_eq!(summary.failed, 1);
        let outcome = &summary.experiments[0];
        assert_eq!(outcome.status, OutcomeStatus::MissingConfig);
        assert!(outcome.config.ends_with("contrastive_loss.yaml"));
    }

    #[test]
    fn test_session_invalid_config_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let configs = tmp.path().join("configs");
        std::fs::create_dir_all(&configs).unwrap();
        std::fs::write(
            configs.join("loss_pure_triplet.yaml"),
            "train:\n  batch_size: 10\nsampler:\n  num_instances: 4\n",
        )
        .unwrap();
        let args = session_args(&configs, &tmp.path().join("log"));

        let resolution = experiments::resolve(&["triplet"]);
        let summary = run_session(&resolution.experiments, &args, "t2");
        let outcome = &summary.experiments[0];
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.error.as_deref().unwrap().contains("batch_size"));
    }

    #[test]
    fn test_run_experiments_dry_run_and_list() {
        let tmp = tempfile::tempdir().unwrap();
        let mut args = session_args(tmp.path(), &tmp.path().join("log"));
        args.list = true;
        run_experiments(args).unwrap();

        let mut args = session_args(tmp.path(), &tmp.path().join("log"));
        args.names = vec!["quick".to_string()];
        args.dry_run = true;
        run_experiments(args).unwrap();
        assert!(!tmp.path().join("log").exists());

        let mut args = session_args(tmp.path(), &tmp.path().join("log"));
        args.names = vec!["nope".to_string()];
        assert!(run_experiments(args).is_err());
    }
}
