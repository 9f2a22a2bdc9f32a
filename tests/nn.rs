use approx::assert_abs_diff_eq;
use mlscript::context;
use mlscript::modelio::{load_parameters, save_parameters};
use mlscript::nn::{
    Adam, AdamConfig, AssembledModel, CrossEntropyLoss, Dense, Loss, Module, MseLoss, Optimizer,
    Sequential, Sgd, TrainConfig,
};
use mlscript::{Error, Matrix, Tensor};

fn constant(rows: Vec<Vec<f64>>) -> Tensor {
    Tensor::constant(Matrix::from_rows(rows).unwrap())
}

fn line_data() -> (Tensor, Tensor) {
    let xs = [0.0, 1.0, 2.0, 3.0];
    let data = constant(xs.iter().map(|&x| vec![x]).collect());
    let labels = constant(xs.iter().map(|&x| vec![2.0 * x + 1.0]).collect());
    (data, labels)
}

fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("mlscript-{}-{name}.bpat", std::process::id()))
}

#[test]
fn test_dense_forward_and_backward() {
    let weight = Tensor::from_rows(vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
    let bias = Tensor::from_rows(vec![vec![0.1, 0.2, 0.3]]).unwrap();
    let layer = Dense::from_parameters(weight.clone(), bias.clone()).unwrap();
    assert_eq!(layer.dims(), (2, 3));

    let x = constant(vec![vec![1.0, 2.0]]);
    let y = layer.forward(&x).unwrap();
    assert_eq!(y.shape(), (1, 3));
    for (got, want) in y.value().data().iter().zip([9.1, 12.2, 15.3]) {
        assert_abs_diff_eq!(*got, want, epsilon = 1e-12);
    }

    let loss = MseLoss.apply(&y, &Tensor::zeros(1, 3)).unwrap();
    loss.backward().unwrap();
    assert!(weight.grad().data().iter().all(|&g| g != 0.0));
    assert!(bias.grad().data().iter().all(|&g| g != 0.0));
    assert_abs_diff_eq!(bias.grad().data()[0], 2.0 * 9.1, epsilon = 1e-12);
    assert_abs_diff_eq!(weight.grad().data()[3], 2.0 * 2.0 * 9.1, epsilon = 1e-12);
}

#[test]
fn test_dense_bias_gradient_sums_over_rows() {
    let layer = Dense::from_parameters(Tensor::zeros(1, 2), Tensor::zeros(1, 2)).unwrap();
    let x = constant(vec![vec![1.0], vec![2.0], vec![3.0]]);
    layer.forward(&x).unwrap().sum().backward().unwrap();
    assert_eq!(layer.bias().grad().data(), &[3.0, 3.0]);
    assert_eq!(layer.weight().grad().data(), &[6.0, 6.0]);
}

#[test]
fn test_adam_first_step_moves_by_learning_rate() {
    for g in [2.0, -0.3] {
        let w = Tensor::from_rows(vec![vec![0.5]]).unwrap();
        w.set_grad(Matrix::new(1, 1, vec![g]).unwrap()).unwrap();
        let mut opt = Adam::new(vec![w.clone()]);
        opt.step();
        let moved = w.item().unwrap() - 0.5;
        assert_abs_diff_eq!(moved, -0.001 * f64::signum(g), epsilon = 1e-9);
    }
}

#[test]
fn test_sequential_collects_parameters_in_order() {
    let first = Dense::seeded(2, 3, 1);
    let second = Dense::seeded(3, 1, 2);
    let expected: Vec<_> = first
        .parameters()
        .into_iter()
        .chain(second.parameters())
        .collect();

    let mut net = Sequential::new();
    net.add_module(first);
    net.add_module(mlscript::nn::Relu);
    net.add_module(second);
    let params = net.parameters();
    assert_eq!(params.len(), 4);
    assert!(params.iter().zip(&expected).all(|(a, b)| a.ptr_eq(b)));
}

#[test]
fn test_sgd_training_fits_a_line() {
    let (data, labels) = line_data();
    let net = Sequential::builder(1).seed(3).dense(1).build();
    let opt = Sgd::new(net.parameters(), 0.01);
    let mut model = AssembledModel::new(net, opt, MseLoss)
        .with_config(TrainConfig::default().with_report_every(100));

    let report = model.train(&data, &labels, 500).unwrap();
    assert_eq!(report.epochs(), 500);
    let first = report.history[0];
    let last = report.final_loss().unwrap();
    assert!(last < first);
    assert!(last < 1e-3, "final loss {last}");
    assert!(report.history.windows(2).all(|w| w[1] <= w[0] + 1e-12));
    assert_eq!(context::tape_len(), 0);

    let pred = model.predict(&constant(vec![vec![4.0]])).unwrap();
    assert_abs_diff_eq!(pred.item().unwrap(), 9.0, epsilon = 0.05);
}

#[test]
fn test_adam_training_reduces_loss() {
    let (data, labels) = line_data();
    let net = Sequential::builder(1).seed(11).dense(1).build();
    let opt = Adam::with_config(net.parameters(), AdamConfig::with_lr(0.05));
    assert_abs_diff_eq!(opt.learning_rate(), 0.05);
    let mut model = AssembledModel::new(net, opt, MseLoss);

    let report = model.train(&data, &labels, 300).unwrap();
    assert!(report.final_loss().unwrap() < report.history[0]);
    assert_eq!(model.optimizer.steps(), 300);
}

#[test]
fn test_cross_entropy_training_separates_classes() {
    let data = constant(vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    let labels = constant(vec![vec![0.0, 1.0], vec![1.0, 0.0]]);
    let net = Sequential::builder(2).seed(5).dense(2).build();
    let opt = Adam::with_config(net.parameters(), AdamConfig::with_lr(0.1));
    let mut model = AssembledModel::new(net, opt, CrossEntropyLoss);

    let report = model.train(&data, &labels, 100).unwrap();
    assert!(report.final_loss().unwrap() < report.history[0]);

    let logits = model.predict(&data).unwrap();
    let v = logits.value();
    assert!(v.get(0, 1).unwrap() > v.get(0, 0).unwrap());
    assert!(v.get(1, 0).unwrap() > v.get(1, 1).unwrap());
}

#[test]
fn test_training_reports_shape_errors() {
    let net = Sequential::builder(3).seed(1).dense(2).build();
    let opt = Sgd::new(net.parameters(), 0.1);
    let mut model = AssembledModel::new(net, opt, MseLoss);
    let err = model
        .train(&Tensor::zeros(4, 2), &Tensor::zeros(4, 2), 3)
        .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
    assert_eq!(context::tape_len(), 0);
}

#[test]
fn test_predict_records_nothing() {
    context::reset();
    let net = Sequential::builder(2).seed(9).dense(4).sigmoid().dense(1).build();
    let opt = Sgd::new(net.parameters(), 0.1);
    let model = AssembledModel::new(net, opt, MseLoss);
    let out = model.predict(&constant(vec![vec![0.5, -0.5]])).unwrap();
    assert_eq!(out.shape(), (1, 1));
    assert!(out.is_leaf());
    assert_eq!(context::tape_len(), 0);
    assert!(context::is_recording());
}

#[test]
fn test_checkpoint_round_trip() {
    let path = temp_path("round-trip");
    let trained = Sequential::builder(2).seed(1).dense(3).relu().dense(1).build();
    let fresh = Sequential::builder(2).seed(2).dense(3).relu().dense(1).build();
    save_parameters(&path, &trained.parameters()).unwrap();
    load_parameters(&path, &fresh.parameters()).unwrap();
    std::fs::remove_file(&path).unwrap();

    for (a, b) in trained.parameters().iter().zip(fresh.parameters()) {
        assert_eq!(a.value().data(), b.value().data());
    }
    let x = constant(vec![vec![0.3, -0.7]]);
    assert_abs_diff_eq!(
        trained.forward(&x).unwrap().item().unwrap(),
        fresh.forward(&x).unwrap().item().unwrap()
    );
}

#[test]
fn test_checkpoint_rejects_mismatched_models() {
    let path = temp_path("mismatch");
    let small = Sequential::builder(2).seed(1).dense(3).build();
    save_parameters(&path, &small.parameters()).unwrap();

    let wide = Sequential::builder(2).seed(1).dense(4).build();
    let err = load_parameters(&path, &wide.parameters()).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));

    let deep = Sequential::builder(2).seed(1).dense(3).dense(1).build();
    let err = load_parameters(&path, &deep.parameters()).unwrap_err();
    assert!(matches!(err, Error::Checkpoint(_)));

    std::fs::remove_file(&path).unwrap();
    assert!(matches!(
        load_parameters(&path, &small.parameters()),
        Err(Error::Io(_))
    ));
}

#[test]
fn test_temporary_operands_survive_until_backward() {
    context::reset();
    let p = Tensor::from_rows(vec![vec![1.0, 2.0]]).unwrap();

    let mse = MseLoss.apply(&p, &Tensor::zeros(1, 2)).unwrap();
    mse.backward().unwrap();
    assert_eq!(p.grad().data(), &[2.0, 4.0]);

    p.zero_grad();
    let onehot = Tensor::constant(Matrix::new(1, 2, vec![1.0, 0.0]).unwrap());
    let ce = CrossEntropyLoss.apply(&p, &onehot).unwrap();
    drop(onehot);
    ce.backward().unwrap();
    assert!(p.grad().data().iter().all(|g| g.is_finite() && *g != 0.0));

    p.zero_grad();
    let shifted = p.add(&Tensor::ones(1, 2)).unwrap().sum();
    shifted.backward().unwrap();
    assert_eq!(p.grad().data(), &[1.0, 1.0]);
}
