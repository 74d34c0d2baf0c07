use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use comms::{InMemoryMesh, PartyRole, Timeouts, Transport};
use ndarray::ArrayD;
use party::{
    PartyConfig, PartyCoordinator, PartyErr, Phase, TrainingLoop,
    data::{DataLoader, InMemoryDataset},
    session,
};
use secure_nn::{
    Block, ExecutionContext, OpErr, OpKind, OpParams, OperatorFactory, Pipeline, Recipe,
    SecretOp, SecretPipeline, SharedOp, SharedOpFactory, TensorShape,
};

const SEED: u64 = 5;

fn timeouts(barrier: Duration) -> Timeouts {
    Timeouts {
        barrier,
        exchange: Duration::from_secs(5),
        connect: Duration::from_secs(5),
    }
}

fn config(role: PartyRole) -> PartyConfig {
    let json = r#"{
        "role": 0,
        "peers": ["127.0.0.1:7100", "127.0.0.1:7101", "127.0.0.1:7102"],
        "arch": { "recipe": {
            "input": { "image": { "batch": 4, "channels": 1, "height": 6, "width": 6 } },
            "blocks": [
                { "block": "conv", "filters": 3, "filter_hw": 3 },
                { "block": "batch_norm" },
                { "block": "relu" },
                { "block": "max_pool", "kernel": 2 },
                { "block": "flatten" },
                { "block": "dense", "units": 5 }
            ]
        } },
        "seed": 5,
        "training": { "epochs": 2, "compare": true },
        "data": { "synthetic": { "samples": 10, "seed": 1 } }
    }"#;

    PartyConfig::from_json(json, Some(role)).unwrap()
}

#[tokio::test]
async fn three_parties_train_and_match_the_plaintext_network() {
    let [m0, m1, m2] = InMemoryMesh::in_memory(timeouts(Duration::from_secs(5)));
    let (c0, c1, c2) = (
        config(PartyRole::Role0),
        config(PartyRole::Role1),
        config(PartyRole::Role2),
    );

    let (s0, s1, s2) = tokio::join!(
        session::run(&c0, m0),
        session::run(&c1, m1),
        session::run(&c2, m2),
    );
    let states = [s0.unwrap(), s1.unwrap(), s2.unwrap()];

    // 10 samples in batches of 4: two full batches and a short tail, per epoch
    for state in &states {
        assert_eq!(state.executed, 4);
        assert_eq!(state.skipped, 2);
    }

    for owner in &states[..2] {
        assert!(owner.mean_loss().unwrap().is_finite());
        assert!(owner.max_abs_diff.unwrap() < 1e-3);
    }

    assert_eq!(states[2].mean_loss(), None);
    assert_eq!(states[2].max_abs_diff, None);
}

#[tokio::test]
async fn every_role_ends_its_session_cleanly() {
    let [m0, m1, m2] = InMemoryMesh::in_memory(timeouts(Duration::from_secs(5)));
    let mut configs = [
        config(PartyRole::Role0),
        config(PartyRole::Role1),
        config(PartyRole::Role2),
    ];
    for config in &mut configs {
        config.training.epochs = 1;
        config.training.max_batches = Some(1);
        config.training.compare = false;
    }

    // Whichever role finishes first drops its links while the others still say goodbye.
    let (s0, s1, s2) = tokio::join!(
        session::run(&configs[0], m0),
        session::run(&configs[1], m1),
        session::run(&configs[2], m2),
    );

    for (role, state) in [("role0", s0), ("role1", s1), ("role2", s2)] {
        let state = state.unwrap_or_else(|e| panic!("{role} failed: {e}"));
        assert_eq!(state.executed, 1);
    }
}

#[tokio::test]
async fn session_rejects_a_link_of_another_role() {
    let [m0, _m1, _m2] = InMemoryMesh::in_memory(timeouts(Duration::from_secs(1)));

    let err = session::run(&config(PartyRole::Role1), m0).await.unwrap_err();
    assert!(matches!(err, PartyErr::Config(_)));
}

/// Wraps the shared operators and counts every forward entry.
struct Counting {
    inner: SharedOp,
    calls: Arc<AtomicUsize>,
}

impl SecretOp for Counting {
    fn kind(&self) -> OpKind {
        self.inner.kind()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn forward<T: Transport>(
        &mut self,
        ctx: &mut ExecutionContext<T>,
        x: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OpErr> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.forward(ctx, x).await
    }

    async fn backward<T: Transport>(
        &mut self,
        ctx: &mut ExecutionContext<T>,
        dy: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OpErr> {
        self.inner.backward(ctx, dy).await
    }
}

struct CountingFactory {
    inner: SharedOpFactory,
    calls: Arc<AtomicUsize>,
}

impl OperatorFactory for CountingFactory {
    type Op = Counting;

    fn create(
        &self,
        kind: OpKind,
        params: &OpParams,
        role: PartyRole,
        name: &str,
    ) -> Result<Counting, OpErr> {
        Ok(Counting {
            inner: self.inner.create(kind, params, role, name)?,
            calls: Arc::clone(&self.calls),
        })
    }
}

fn dense_pipeline() -> Pipeline {
    Recipe::new(TensorShape::flat(4, 3))
        .then(Block::dense(4))
        .then(Block::Relu)
        .then(Block::dense(2))
        .build()
        .unwrap()
}

async fn count_forwards(link: InMemoryMesh, samples: usize) -> (usize, usize, usize) {
    let role = link.role();
    let pipeline = dense_pipeline();
    let layers = pipeline.len();

    let calls = Arc::new(AtomicUsize::new(0));
    let factory = CountingFactory {
        inner: SharedOpFactory::new(SEED),
        calls: Arc::clone(&calls),
    };
    let secret = SecretPipeline::bind(pipeline, &factory, role).unwrap();
    let mut coordinator = PartyCoordinator::new(ExecutionContext::seeded(link, 3), secret);

    let dataset = InMemoryDataset::synthetic(vec![3], samples, 2, 8).unwrap();
    let loader = DataLoader::new(dataset, 4).unwrap();
    let state = TrainingLoop::new(loader, 1)
        .run(&mut coordinator)
        .await
        .unwrap();

    assert_eq!(coordinator.pipeline().forwards(), state.executed);
    (calls.load(Ordering::SeqCst), state.executed * layers, state.skipped)
}

#[tokio::test]
async fn mismatched_batches_never_reach_a_layer() {
    let [m0, m1, m2] = InMemoryMesh::in_memory(timeouts(Duration::from_secs(5)));

    // 11 samples in batches of 4: the 3 sample tail is dropped
    let (r0, r1, r2) = tokio::join!(
        count_forwards(m0, 11),
        count_forwards(m1, 11),
        count_forwards(m2, 11),
    );

    for (calls, expected, skipped) in [r0, r1, r2] {
        assert_eq!(calls, expected);
        assert_eq!(skipped, 1);
    }
}

#[tokio::test]
async fn lone_short_batch_runs_nothing() {
    let [m0, _m1, _m2] = InMemoryMesh::in_memory(timeouts(Duration::from_millis(100)));

    let (calls, expected, skipped) = count_forwards(m0, 3).await;
    assert_eq!(calls, 0);
    assert_eq!(expected, 0);
    assert_eq!(skipped, 1);
}

fn coordinator(link: InMemoryMesh) -> PartyCoordinator<InMemoryMesh, SharedOp> {
    let role = link.role();
    let secret = SecretPipeline::bind(dense_pipeline(), &SharedOpFactory::new(SEED), role).unwrap();
    PartyCoordinator::new(ExecutionContext::seeded(link, 0), secret)
}

#[tokio::test]
async fn absent_role_fails_every_other_role_within_the_bound() {
    let bound = Duration::from_millis(200);
    let [m0, m1, _m2] = InMemoryMesh::in_memory(timeouts(bound));

    let dataset = InMemoryDataset::synthetic(vec![3], 4, 2, 8).unwrap();
    let batch = dataset.batch(0, 4).unwrap();

    let mut c0 = coordinator(m0);
    let mut c1 = coordinator(m1);

    let started = Instant::now();
    let (r0, r1) = tokio::join!(c0.run_batch(0, 0, &batch), c1.run_batch(0, 0, &batch));
    assert!(started.elapsed() < bound * 10);

    for (result, coordinator) in [(r0, &c0), (r1, &c1)] {
        let err = result.unwrap_err();
        assert!(err.is_sync_failure(), "{err}");
        assert_eq!(coordinator.phase(), Phase::Failed);
    }

    assert!(matches!(
        c0.run_batch(0, 1, &batch).await,
        Err(PartyErr::InvalidTransition {
            from: Phase::Failed,
            ..
        })
    ));
}
