//! End-to-end tests: trainer and inference engine against an in-memory store.

use std::sync::Arc;

use candle_core::Device;
use graph_world_model::inference::ObservationSource;
use graph_world_model::model::DynamicsKind;
use graph_world_model::store::{AttentionEdgeRecord, EntityRecord, GraphSnapshot, MockGraphStore};
use graph_world_model::training::checkpoint;
use graph_world_model::{
    InferenceConfig, InferenceEngine, ModelConfig, SnapshotClient, StoreConfig, Trainer,
    TrainingConfig, WorldModel, WorldModelConfig,
};

fn model_config(dynamics: DynamicsKind) -> ModelConfig {
    ModelConfig {
        max_entities: 32,
        num_entity_types: 4,
        entity_dim: 8,
        type_dim: 4,
        content_dim: 4,
        hidden_dim: 16,
        num_heads: 4,
        num_layers: 1,
        ff_multiplier: 2,
        link_dim: 8,
        dropout: 0.0,
        dynamics,
        dynamics_layers: 1,
    }
}

fn knowledge_graph() -> (Vec<EntityRecord>, Vec<AttentionEdgeRecord>) {
    let kinds = ["person", "project", "topic"];
    let entities = (0..10)
        .map(|i| {
            let mut content = vec![0.0f32; 4];
            content[i % 4] = 1.0;
            EntityRecord::new(format!("entity-{:02}", i), kinds[i % 3]).with_embedding(content)
        })
        .collect();
    let edges = vec![
        AttentionEdgeRecord::new("entity-00", "entity-01", 0.9),
        AttentionEdgeRecord::new("entity-01", "entity-02", 0.6),
        AttentionEdgeRecord::new("entity-03", "entity-04", 0.8),
        AttentionEdgeRecord::new("entity-05", "entity-06", 0.4),
        AttentionEdgeRecord::new("entity-07", "entity-08", 0.1),
    ];
    (entities, edges)
}

fn config(dir: &std::path::Path, dynamics: DynamicsKind) -> WorldModelConfig {
    WorldModelConfig {
        model: model_config(dynamics),
        training: TrainingConfig {
            batch_size: 2,
            num_negatives: 4,
            checkpoint_dir: dir.to_path_buf(),
            checkpoint_every: 0,
            ..TrainingConfig::default()
        },
        inference: InferenceConfig {
            proposal_threshold: 0.0,
            max_proposals: 5,
            ..InferenceConfig::default()
        },
        ..WorldModelConfig::default()
    }
}

fn client(store: &Arc<MockGraphStore>) -> SnapshotClient {
    SnapshotClient::new(store.clone(), StoreConfig::default())
}

#[tokio::test]
async fn test_train_then_query_every_dynamics_kind() {
    for dynamics in [DynamicsKind::Recurrent, DynamicsKind::Attention, DynamicsKind::Direct] {
        let dir = tempfile::tempdir().unwrap();
        let (entities, edges) = knowledge_graph();
        let store = Arc::new(MockGraphStore::with_graph(entities, edges));
        let config = config(dir.path(), dynamics);

        let mut trainer = Trainer::new(config.clone(), client(&store), &Device::Cpu).unwrap();
        let report = trainer.fit(2).await.unwrap();
        assert_eq!(report.epochs_completed, 2);

        let mut engine = InferenceEngine::new(trainer.model(), client(&store), config.inference);
        assert!(engine.refresh_state().await.unwrap());

        let next = engine.predict_next_entities(3).await.unwrap();
        assert_eq!(next.len(), 3);

        let p = engine
            .predict_link_probability("entity-00", "entity-01")
            .await
            .unwrap();
        assert!((0.0..=1.0).contains(&p));
        assert_eq!(
            engine
                .predict_link_probability("entity-00", "missing")
                .await
                .unwrap(),
            0.0
        );

        let trajectory = engine
            .simulate_trajectory(5, ObservationSource::SelfState)
            .await
            .unwrap();
        assert_eq!(
            trajectory.iter().map(|s| s.step).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert!(trajectory.iter().all(|s| s.state_change >= 0.0));
    }
}

#[tokio::test]
async fn test_sync_during_training_is_dry_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let (entities, edges) = knowledge_graph();
    let store = Arc::new(MockGraphStore::with_graph(entities, edges));
    let mut config = config(dir.path(), DynamicsKind::Recurrent);
    config.training.sync_every = 1;

    let mut trainer = Trainer::new(config, client(&store), &Device::Cpu).unwrap();
    let report = trainer.fit(2).await.unwrap();

    assert_eq!(report.syncs.len(), 2);
    for stats in &report.syncs {
        assert!(stats.dry_run);
        assert_eq!(stats.num_entities, 10);
        assert_eq!(stats.num_edges, 5);
        assert!(stats.latent_norm > 0.0);
        assert_eq!(stats.num_proposals, 5);
    }
    assert_eq!(store.write_count().await, 0);
}

#[tokio::test]
async fn test_live_sync_writes_with_provenance() {
    let dir = tempfile::tempdir().unwrap();
    let (entities, edges) = knowledge_graph();
    let store = Arc::new(MockGraphStore::with_graph(entities, edges));
    let config = config(dir.path(), DynamicsKind::Direct);

    let model = Arc::new(WorldModel::new(config.model.clone(), &Device::Cpu).unwrap());
    let mut engine = InferenceEngine::new(model, client(&store), config.inference.clone());

    let dry = engine.full_sync(true).await.unwrap();
    assert_eq!(store.write_count().await, 0);

    let live = engine.full_sync(false).await.unwrap();
    assert_eq!(live.num_proposals, dry.num_proposals);
    assert_eq!(live.num_written, live.num_proposals);

    let writes = store.writes().await;
    assert_eq!(writes.len(), live.num_written);
    assert!(writes.iter().all(|w| w.query_id == live.query_id));
    assert!(writes.iter().all(|w| (0.0..=1.0).contains(&w.weight)));
}

#[tokio::test]
async fn test_checkpoint_round_trip_restores_latent() {
    let dir = tempfile::tempdir().unwrap();
    let (entities, edges) = knowledge_graph();
    let store = Arc::new(MockGraphStore::with_graph(entities.clone(), edges.clone()));
    let config = config(dir.path(), DynamicsKind::Attention);

    let mut trainer = Trainer::new(config.clone(), client(&store), &Device::Cpu).unwrap();
    let report = trainer.fit(1).await.unwrap();
    let path = report.final_checkpoint.unwrap();

    let restored = WorldModel::new(config.model.clone(), &Device::Cpu).unwrap();
    let meta = checkpoint::load_into(&path, &restored).unwrap();
    assert_eq!(meta.epoch, 1);
    assert_eq!(meta.config.model, config.model);

    let snapshot = GraphSnapshot::build(&entities, &edges, 32, 4, 4);
    let tensors = snapshot.to_tensors(&Device::Cpu).unwrap();
    let original = trainer.model().encode(&tensors, false).unwrap().latent;
    let reloaded = restored.encode(&tensors, false).unwrap().latent;
    assert_eq!(
        original.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
        reloaded.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    );

    let mismatched = WorldModel::new(
        ModelConfig {
            hidden_dim: 32,
            ..config.model.clone()
        },
        &Device::Cpu,
    )
    .unwrap();
    let err = checkpoint::load_into(&path, &mismatched).unwrap_err();
    assert!(err.to_string().contains("hidden_dim"));
}

#[tokio::test]
async fn test_empty_and_unreachable_store_degrade() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), DynamicsKind::Recurrent);

    let empty = Arc::new(MockGraphStore::new());
    let model = Arc::new(WorldModel::new(config.model.clone(), &Device::Cpu).unwrap());
    let mut engine = InferenceEngine::new(model.clone(), client(&empty), config.inference.clone());
    let stats = engine.full_sync(false).await.unwrap();
    assert_eq!(stats.num_entities, 0);
    assert_eq!(stats.num_edges, 0);
    assert_eq!(stats.latent_norm, 0.0);
    let related = engine.find_related_entities("x", 5, 0.0).await.unwrap();
    assert!(related.is_empty());

    let (entities, edges) = knowledge_graph();
    let down = Arc::new(MockGraphStore::with_graph(entities, edges));
    down.set_unreachable(true);
    let mut trainer = Trainer::new(config, client(&down), &Device::Cpu).unwrap();
    let report = trainer.fit(2).await.unwrap();
    assert_eq!(report.epochs_skipped, 2);
    assert!(report.best_loss.is_none());
}
