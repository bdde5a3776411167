use rkd_core::TokenSize;
use rkd_data_provider::{IndexedDataset, IndexedDatasetBuilder, LmCollator};
use rkd_modeling::{
    metrics::{load_metrics, MetricsConfig, MetricsRecord, MetricsRecorder},
    BaseModelRecord, LocalGroup, ModelBatch, ResidualKdConfig, ResidualKdTrainer, Scorer,
    ScorerError, ScorerRole, TokenEvalDataset, MODEL_FILE_NAME,
};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tch::{
    nn::{self, Module, OptimizerConfig},
    Device, Kind, Tensor,
};

const VOCAB: i64 = 11;

struct Bigram {
    var_store: nn::VarStore,
    embedding: nn::Embedding,
    role: ScorerRole,
    training: Arc<AtomicBool>,
}

impl Bigram {
    fn new(role: ScorerRole, phase: f64) -> Self {
        let var_store = nn::VarStore::new(Device::Cpu);
        let mut embedding = nn::embedding(var_store.root() / "wte", VOCAB, VOCAB, Default::default());
        let init = (Tensor::arange(VOCAB * VOCAB, (Kind::Float, Device::Cpu)) * 0.21 + phase)
            .cos()
            .view([VOCAB, VOCAB]);
        tch::no_grad(|| embedding.ws.copy_(&init));
        Self {
            var_store,
            embedding,
            role,
            training: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl Scorer for Bigram {
    fn score(&self, batch: &ModelBatch) -> Result<Tensor, ScorerError> {
        Ok(self.embedding.forward(&batch.input_ids))
    }

    fn role(&self) -> ScorerRole {
        self.role
    }

    fn device(&self) -> Device {
        self.var_store.device()
    }

    fn set_train(&mut self, train: bool) {
        self.training.store(train, Ordering::SeqCst);
    }

    fn trainable_variables(&self) -> Vec<Tensor> {
        match self.role {
            ScorerRole::Trainable => self.var_store.trainable_variables(),
            ScorerRole::Frozen => Vec::new(),
        }
    }

    fn save(&self, path: &Path) -> Result<(), ScorerError> {
        self.var_store.save(path)?;
        Ok(())
    }
}

/// Nine prompt/response items, so two replicas hold five and four.
fn write_dev_split(dir: &Path) -> std::path::PathBuf {
    let prefix = dir.join("dev_0");
    let mut builder = IndexedDatasetBuilder::new(&prefix, TokenSize::TwoBytes).unwrap();
    for i in 0..9 {
        let prompt = [1 + i % 4, 2 + i % 3];
        let response = [3 + i % 5, 4 + i % 6, 1];
        let item: Vec<i32> = prompt
            .iter()
            .copied()
            .chain(std::iter::once(-1))
            .chain(response.iter().copied())
            .collect();
        builder.add_item(&item).unwrap();
    }
    builder.finalize().unwrap();
    prefix
}

#[test]
fn test_train_evaluate_save_across_replicas() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = write_dev_split(dir.path());
    let root = Arc::new(dir.path().to_path_buf());

    let threads: Vec<_> = LocalGroup::new(2)
        .communicators()
        .into_iter()
        .map(|comm| {
            let root = root.clone();
            let prefix = prefix.clone();
            std::thread::spawn(move || {
                let coordinator = comm.is_coordinator();
                let model = Bigram::new(ScorerRole::Trainable, 0.0);
                let training = model.training.clone();
                let mut optimizer = nn::Adam::default().build(&model.var_store, 1e-2).unwrap();
                let mut trainer = ResidualKdTrainer::builder()
                    .model(Box::new(model))
                    .base(Box::new(Bigram::new(ScorerRole::Frozen, 0.5)))
                    .teacher(Box::new(Bigram::new(ScorerRole::Frozen, 1.5)))
                    .config(ResidualKdConfig {
                        rsd_mix_ratio: 1.0,
                        kd_ratio: 0.5,
                        kd_rsd_loss: Some(0.1),
                    })
                    .communicator(Arc::new(comm))
                    .eval_batch_size(2)
                    .log_file(root.join("log.txt"))
                    .base_model_path(format!("{}/bases/tiny/", root.display()))
                    .base_path(root.display().to_string())
                    .base_ckpt_name(Some("final".to_string()))
                    .build()
                    .unwrap();

                let collator = LmCollator::new(8, 0);
                let dev = TokenEvalDataset::new(
                    IndexedDataset::open(&prefix).unwrap(),
                    collator,
                    Device::Cpu,
                );
                let mut recorder = if coordinator {
                    MetricsRecorder::new(MetricsConfig::enabled(root.join("metrics.jsonl")))
                        .unwrap()
                } else {
                    MetricsRecorder::disabled()
                };

                let before = trainer.evaluate(&dev).unwrap();
                let train = IndexedDataset::open(&prefix).unwrap();
                for step in 1..=3u64 {
                    let items = vec![train.get(step as usize).unwrap(), train.get(0).unwrap()];
                    let (model_batch, no_model_batch) =
                        rkd_modeling::batches_from_collated(&collator.collate(&items).unwrap());
                    let (loss, metrics) = trainer
                        .train_step(&mut optimizer, &model_batch, &no_model_batch)
                        .unwrap();
                    recorder
                        .record_train_step(step, loss, 1e-2, &metrics, trainer.model())
                        .unwrap();
                }
                let after = trainer.evaluate(&dev).unwrap();
                assert!(training.load(Ordering::SeqCst));
                if let Some(report) = &after {
                    recorder.record_eval(3, report).unwrap();
                }
                let saved = trainer.save(&root, 3).unwrap();
                (before, after, saved)
            })
        })
        .collect();
    let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    let (before, after, saved) = &results[0];
    let before = before.as_ref().unwrap();
    let after = after.as_ref().unwrap();
    assert_eq!(before.num_examples, 9);
    assert_eq!(after.num_examples, 9);
    // the teacher, base and kd entropy do not depend on the trained model
    assert_eq!(before.avg_teacher_loss, after.avg_teacher_loss);
    assert_eq!(before.avg_base_loss, after.avg_base_loss);
    assert_eq!(before.avg_kd_entropy, after.avg_kd_entropy);
    assert_ne!(before.avg_residual_loss, after.avg_residual_loss);
    assert!(results[1].0.is_none() && results[1].1.is_none());

    assert_eq!(
        BaseModelRecord::read(saved).unwrap(),
        BaseModelRecord {
            base_model_path: "bases/tiny".to_string(),
            base_ckpt_name: Some("final".to_string()),
        }
    );
    assert!(saved.join(MODEL_FILE_NAME).exists());

    let log = std::fs::read_to_string(root.join("log.txt")).unwrap();
    assert_eq!(log.lines().count(), 2);

    let records = load_metrics(root.join("metrics.jsonl")).unwrap();
    assert_eq!(records.len(), 4);
    assert!(matches!(
        records.last(),
        Some(MetricsRecord::Eval { step: 3, .. })
    ));
}
