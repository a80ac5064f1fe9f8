//! End-to-end training of a small TabNet.

use ndarray::{Array2, ArrayD};
use rustytab::losses::mse_loss_mean;
use rustytab::metrics::threshold_match;
use rustytab::nn::{CategoricalColumn, GhostBatchNormOpts, Initializer, Model, Module, TabNet, TabNetOpts};
use rustytab::optimizers::{Adam, Sgd};
use rustytab::tensor::Tensor;
use rustytab::training::{predict, train, TrainOpts};

fn dataset(rows: usize) -> (ArrayD<f32>, ArrayD<f32>) {
    // Column 2 is categorical with three levels.
    let x = Array2::from_shape_fn((rows, 3), |(i, j)| match j {
        0 => (i as f32 * 0.37).sin(),
        1 => (i as f32 * 0.11).cos(),
        _ => (i % 3) as f32,
    });
    let y = Array2::from_shape_fn((rows, 1), |(i, _)| if x[[i, 0]] + 0.2 * x[[i, 2]] > 0.3 { 1.0 } else { 0.0 });
    (x.into_dyn(), y.into_dyn())
}

fn small_tabnet(model: &Model) -> TabNet {
    TabNet::new(
        model,
        3,
        1,
        TabNetOpts {
            shared_blocks: Some(1),
            independent_blocks: Some(1),
            decision_steps: Some(2),
            prediction_layer_dim: Some(4),
            attention_layer_dim: Some(4),
            gbn: GhostBatchNormOpts { virtual_batch_size: Some(4), ..Default::default() },
            categorical: vec![CategoricalColumn { index: 2, vocab_size: 3, embedding_dim: 2 }],
            ..Default::default()
        },
    )
    .unwrap()
}

fn opts(epochs: usize) -> TrainOpts {
    TrainOpts {
        epochs: Some(epochs),
        batch_size: Some(8),
        solver: Some(Box::new(Adam::new(1e-2))),
        cost_fn: Some(Box::new(|p: &Tensor, t: &Tensor| mse_loss_mean(&p.sigmoid(), t))),
        match_type_for: Some(Box::new(threshold_match(0.0))),
        dev_mode: true,
        ..Default::default()
    }
}

#[test]
fn training_updates_parameters_and_running_statistics() {
    let model = Model::with_seed(3);
    let net = small_tabnet(&model);
    let (x, y) = dataset(20);

    let head_before = model.value(&format!("{}.weight", net.head.name)).unwrap();
    let mean_name = net.input_norm.running_mean_name();
    let mean_before = model.value(&mean_name).unwrap();
    let embedding_names: Vec<String> =
        model.parameter_names().into_iter().filter(|n| n.starts_with("embedding")).collect();
    assert_eq!(embedding_names.len(), 1);
    let table_before = model.value(&embedding_names[0]).unwrap();

    let report = train(&model, &net, &x, &y, &x, &y, opts(3)).unwrap();

    // 20 rows in batches of 8: three batches per epoch, the last padded.
    assert_eq!(report.steps, 9);
    assert_eq!(report.epoch_costs.len(), 3);
    assert!(report.epoch_costs.iter().all(|c| c.is_finite()));
    let matrix = report.validation.unwrap();
    assert_eq!(matrix.total(), 20);
    assert!((0.0..=1.0).contains(&matrix.accuracy()));

    assert_ne!(model.value(&format!("{}.weight", net.head.name)).unwrap(), head_before);
    assert_ne!(model.value(&mean_name).unwrap(), mean_before);
    assert_ne!(model.value(&embedding_names[0]).unwrap(), table_before);
}

#[test]
fn one_epoch_from_constant_weights_moves_a_parameter() {
    let model = Model::with_seed(0).with_weight_init(Initializer::Constant(1.0));
    let net = TabNet::new(
        &model,
        2,
        1,
        TabNetOpts {
            decision_steps: Some(1),
            prediction_layer_dim: Some(2),
            attention_layer_dim: Some(2),
            gbn: GhostBatchNormOpts { virtual_batch_size: Some(2), ..Default::default() },
            ..Default::default()
        },
    )
    .unwrap();
    let x = Array2::from_shape_vec((4, 2), vec![0.1, 0.5, 0.9, -0.3, -0.4, 0.2, 0.7, 0.8]).unwrap().into_dyn();
    let y = Array2::from_shape_vec((4, 1), vec![1.0, -1.0, 0.5, 2.0]).unwrap().into_dyn();
    let before = model.parameter_values();

    let empty = ArrayD::zeros(ndarray::IxDyn(&[0, 2]));
    let report = train(
        &model,
        &net,
        &x,
        &y,
        &empty,
        &empty,
        TrainOpts {
            epochs: Some(1),
            batch_size: Some(4),
            solver: Some(Box::new(Sgd::new(0.1))),
            cost_fn: Some(Box::new(|p: &Tensor, t: &Tensor| mse_loss_mean(p, t))),
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(report.steps, 1);
    let changed = before.iter().filter(|(name, value)| model.value(name).as_ref() != Some(value)).count();
    assert!(changed > 0);
}

#[test]
fn module_parameters_cover_the_model_once() {
    let model = Model::with_seed(5);
    let net = small_tabnet(&model);
    // Shared projections are counted once.
    assert_eq!(net.parameters().len(), model.parameter_names().len());
}

#[test]
fn saved_weights_reproduce_predictions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tabnet.nn1");
    let (x, y) = dataset(16);

    let trained = Model::with_seed(11);
    let net = small_tabnet(&trained);
    let report = train(&trained, &net, &x, &y, &x, &y, opts(2)).unwrap();
    let cost = report.final_cost().unwrap();
    trained.save(&path, cost).unwrap();
    let expected = predict(&trained, &net, &x, 8).unwrap();
    assert_eq!(expected.shape(), &[16, 1]);

    let restored = Model::with_seed(99);
    let restored_net = small_tabnet(&restored);
    assert_eq!(restored.load(&path).unwrap(), cost);
    let actual = predict(&restored, &restored_net, &x, 8).unwrap();
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert!((a - e).abs() < 1e-5, "{} vs {}", a, e);
    }
}
