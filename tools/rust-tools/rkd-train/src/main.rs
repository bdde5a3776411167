use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use rkd_core::{logging, LogOutput, Shuffle};
use rkd_data_provider::{DistributedPartition, IndexedDataset, LmCollator, TokenDataset};
use rkd_modeling::{
    batches_from_collated,
    metrics::{MetricsConfig, MetricsRecorder},
    move_to_device, Communicator, Devices, EvalReport, LocalGroup, ResidualKdConfig,
    ResidualKdTrainer, TokenEvalDataset, TorchScriptScorer, TrainableTorchScriptScorer,
};
use std::{path::PathBuf, sync::Arc, time::Instant};
use tch::nn::{self, OptimizerConfig};
use tracing::info;

#[derive(Parser, Debug, Clone)]
struct Args {
    /// TorchScript residual model to train
    #[arg(long)]
    model: PathBuf,

    /// TorchScript base model the residual is added to (frozen)
    #[arg(long)]
    base_model: PathBuf,

    /// TorchScript teacher model (frozen)
    #[arg(long)]
    teacher_model: PathBuf,

    /// Shared model root stripped from --base-model in checkpoint records
    #[arg(long, default_value = "")]
    base_path: String,

    #[arg(long)]
    base_ckpt_name: Option<String>,

    /// Directory holding train_0.{bin,idx} and dev_0.{bin,idx}
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Checkpoints, log.txt and train.log go here
    #[arg(long, default_value = "results")]
    save: PathBuf,

    #[arg(long, default_value_t = 512)]
    max_length: usize,

    #[arg(long, default_value_t = 0)]
    pad_token_id: i64,

    /// Per-replica batch size
    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    #[arg(long, default_value_t = 8)]
    eval_batch_size: usize,

    #[arg(long, default_value_t = 1)]
    epochs: u64,

    /// Stop after this many optimizer steps
    #[arg(long)]
    total_iters: Option<u64>,

    #[arg(long, default_value_t = 1e-5)]
    learning_rate: f64,

    #[arg(long, default_value_t = 0.9)]
    beta1: f64,

    #[arg(long, default_value_t = 0.999)]
    beta2: f64,

    #[arg(long, default_value_t = 1e-2)]
    weight_decay: f64,

    #[arg(long, default_value_t = 1e-8)]
    eps: f64,

    #[arg(long, default_value_t = 0.0)]
    rsd_mix_ratio: f64,

    #[arg(long, default_value_t = 0.5)]
    kd_ratio: f64,

    /// Weight of the residual distillation term; omit to leave it out of the loss
    #[arg(long)]
    kd_rsd_loss: Option<f64>,

    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    log_interval: u64,

    /// 0 evaluates only at the end
    #[arg(long, default_value_t = 1000)]
    eval_interval: u64,

    /// 0 saves only at the end
    #[arg(long, default_value_t = 1000)]
    save_interval: u64,

    /// Evaluate the initial model on the dev split and exit
    #[arg(long, default_value_t = false)]
    eval_only: bool,

    #[arg(long, default_value_t = 10)]
    seed: u64,

    /// Number of data-parallel replicas, one thread each
    #[arg(long, env = "WORLD_SIZE", default_value_t = 1)]
    world_size: usize,

    #[arg(
        long,
        help = "Device(s) to use: auto, cpu, mps, cuda, cuda:N, cuda:X,Y,Z",
        default_value = "auto"
    )]
    device: Devices,

    /// Path to write training metrics (JSONL format)
    #[arg(long)]
    metrics_output: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "console")]
    log_output: LogOutput,
}

fn main() -> Result<()> {
    let args = Args::parse();
    std::fs::create_dir_all(&args.save)
        .with_context(|| format!("creating {}", args.save.display()))?;
    logging()
        .with_output(args.log_output)
        .with_log_file(args.save.join("train.log"))
        .init()?;

    if args.world_size == 0 {
        bail!("world size must be positive");
    }
    if let Some(max) = args.device.max_replicas() {
        if args.world_size > max {
            bail!(
                "{} replicas requested but only {max} devices in {}",
                args.world_size,
                args.device
            );
        }
    }
    rkd_modeling::set_torch_rng_seed(args.seed as i64);

    let args = Arc::new(args);
    let replicas = LocalGroup::new(args.world_size)
        .communicators()
        .into_iter()
        .map(|comm| {
            let args = args.clone();
            std::thread::Builder::new()
                .name(format!("replica-{}", comm.rank()))
                .spawn(move || run_replica(&args, comm))
        })
        .collect::<std::io::Result<Vec<_>>>()?;

    for (rank, replica) in replicas.into_iter().enumerate() {
        replica
            .join()
            .map_err(|_| anyhow!("replica {rank} panicked"))?
            .with_context(|| format!("replica {rank} failed"))?;
    }
    info!("Done");
    Ok(())
}

/// Only the coordinator gets a report, so only it records one.
fn record_eval(
    recorder: &mut MetricsRecorder,
    step: u64,
    report: Option<EvalReport>,
) -> Result<()> {
    if let Some(report) = report {
        recorder.record_eval(step, &report)?;
    }
    Ok(())
}

fn run_replica(args: &Args, comm: Communicator) -> Result<()> {
    let rank = comm.rank();
    let device = args
        .device
        .device_for_rank(rank)
        .with_context(|| format!("no device for rank {rank}"))?;

    let model = TrainableTorchScriptScorer::load(&args.model, device)
        .with_context(|| format!("loading {}", args.model.display()))?;
    let mut optimizer = nn::AdamW {
        beta1: args.beta1,
        beta2: args.beta2,
        wd: args.weight_decay,
        eps: args.eps,
        amsgrad: false,
    }
    .build(model.var_store(), args.learning_rate)?;
    let base = TorchScriptScorer::load(&args.base_model, device)
        .with_context(|| format!("loading {}", args.base_model.display()))?;
    let teacher = TorchScriptScorer::load(&args.teacher_model, device)
        .with_context(|| format!("loading {}", args.teacher_model.display()))?;

    let comm = Arc::new(comm);
    let mut trainer = ResidualKdTrainer::builder()
        .model(Box::new(model))
        .base(Box::new(base))
        .teacher(Box::new(teacher))
        .config(ResidualKdConfig {
            rsd_mix_ratio: args.rsd_mix_ratio,
            kd_ratio: args.kd_ratio,
            kd_rsd_loss: args.kd_rsd_loss,
        })
        .communicator(comm.clone())
        .eval_batch_size(args.eval_batch_size)
        .log_file(args.save.join("log.txt"))
        .base_model_path(args.base_model.to_string_lossy())
        .base_path(args.base_path.clone())
        .base_ckpt_name(args.base_ckpt_name.clone())
        .build()?;

    let collator = LmCollator::new(args.max_length, args.pad_token_id);
    let dev_prefix = args.data_dir.join("dev_0");
    let dev = TokenEvalDataset::new(
        IndexedDataset::open(&dev_prefix)
            .with_context(|| format!("opening {}", dev_prefix.display()))?,
        collator,
        device,
    );

    let mut recorder = match &args.metrics_output {
        Some(path) if comm.is_coordinator() => {
            MetricsRecorder::new(MetricsConfig::enabled(path).record_every(args.log_interval))?
        }
        _ => MetricsRecorder::disabled(),
    };
    if args.eval_only {
        let report = trainer.evaluate(&dev)?;
        return record_eval(&mut recorder, 0, report);
    }

    let train_prefix = args.data_dir.join("train_0");
    let train = IndexedDataset::open(&train_prefix)
        .with_context(|| format!("opening {}", train_prefix.display()))?;
    // every replica must take the same number of steps
    let steps_per_epoch = train.len() / comm.size() / args.batch_size;
    if steps_per_epoch == 0 {
        bail!(
            "{} training examples cannot fill one batch of {} on each of {} replicas",
            train.len(),
            args.batch_size,
            comm.size()
        );
    }
    let total_iters = args
        .total_iters
        .unwrap_or(steps_per_epoch as u64 * args.epochs);
    info!(
        rank,
        ?device,
        examples = train.len(),
        steps_per_epoch,
        total_iters,
        "Starting training"
    );

    let mut global_step = 0u64;
    let mut saved_at = None;
    'epochs: for epoch in 0..args.epochs {
        let partition = DistributedPartition::new(rank, comm.size())
            .with_shuffle(Shuffle::from_seed(args.seed.wrapping_add(epoch)))
            .with_drop_last(true);
        for indices in partition
            .batches(train.len(), args.batch_size)
            .into_iter()
            .take(steps_per_epoch)
        {
            let start = Instant::now();
            let collated = collator.collate(&train.items(&indices)?)?;
            let (model_batch, no_model_batch) = batches_from_collated(&collated);
            let (model_batch, no_model_batch) =
                move_to_device(&model_batch, &no_model_batch, device);

            let (loss, metrics) =
                trainer.train_step(&mut optimizer, &model_batch, &no_model_batch)?;
            global_step += 1;
            recorder.record_train_step(
                global_step,
                loss,
                args.learning_rate,
                &metrics,
                trainer.model(),
            )?;

            if comm.is_coordinator() && global_step % args.log_interval == 0 {
                info!(
                    epoch,
                    step = global_step,
                    total_iters,
                    loss,
                    lm_loss = metrics.lm_loss,
                    kd_loss = metrics.kd_loss,
                    kd_entropy = metrics.kd_entropy,
                    residual_real_loss = ?metrics.residual_real_loss,
                    duration = start.elapsed().as_secs_f32(),
                    "train"
                );
            }
            if args.eval_interval > 0 && global_step % args.eval_interval == 0 {
                let report = trainer.evaluate(&dev)?;
                record_eval(&mut recorder, global_step, report)?;
            }
            if args.save_interval > 0 && global_step % args.save_interval == 0 {
                trainer.save(&args.save, global_step)?;
                saved_at = Some(global_step);
            }
            if global_step >= total_iters {
                break 'epochs;
            }
        }
    }

    if args.eval_interval == 0 || global_step % args.eval_interval != 0 {
        let report = trainer.evaluate(&dev)?;
        record_eval(&mut recorder, global_step, report)?;
    }
    if saved_at != Some(global_step) {
        trainer.save(&args.save, global_step)?;
    }
    Ok(())
}
