use std::fs;
use std::path::{Path, PathBuf};

use pico_cnn::config::EvalConfig;
use pico_cnn::dataset::{Dataset, IMAGES_FILE, LABELS_FILE};
use pico_cnn::eval::{ConfusionMatrix, evaluate, evaluate_parallel, sort_prediction};
use pico_cnn::modelio::{load_weights, save_weights};
use pico_cnn::network::{Activation, Network, NetworkSpec};
use pico_cnn::tensors::FeatureMap;
use pico_cnn::weights::{LayerWeights, WeightSet};
use pico_cnn::{Backend, Executor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("pico_cnn_{name}_{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Zero kernels; bias `j` of layer `i` is `0.01 * (i + 1) * (j + 1)`.
fn bias_only_weights(spec: &NetworkSpec) -> WeightSet {
    spec.layer_shapes()
        .unwrap()
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            let bias = (0..s.bias)
                .map(|j| 0.01 * (i + 1) as f32 * (j + 1) as f32)
                .collect();
            LayerWeights::filled(s.kernel, 0.0, bias).unwrap()
        })
        .collect::<Vec<_>>()
        .into()
}

fn random_weights(rng: &mut StdRng, spec: &NetworkSpec) -> WeightSet {
    spec.layer_shapes()
        .unwrap()
        .into_iter()
        .map(|s| {
            let len = s.kernel.iter().product();
            let kernels = (0..len).map(|_| rng.random_range(-0.1..0.1)).collect();
            let bias = (0..s.bias).map(|_| rng.random_range(-0.1..0.1)).collect();
            LayerWeights::new(s.kernel, kernels, bias).unwrap()
        })
        .collect::<Vec<_>>()
        .into()
}

#[test]
fn test_zero_input_reproduces_biases() {
    let spec = NetworkSpec::lenet_caffe();
    let weights = bias_only_weights(&spec);
    let net = Network::new(spec, &weights, Executor::new(Backend::Naive).unwrap()).unwrap();

    let mut seen = Vec::new();
    let scores = net
        .forward_observed(FeatureMap::zeros(28, 28).unwrap(), |index, name, act| {
            seen.push((index, name, act.clone()));
            Ok(())
        })
        .unwrap();

    let names: Vec<_> = seen.iter().map(|s| s.1).collect();
    assert_eq!(
        names,
        ["conv", "max_pool", "conv", "max_pool", "dense", "relu", "dense", "softmax"]
    );

    // every map of a convolution or pooling stage holds its channel's bias
    for (index, layer) in [(0, 0), (1, 0), (2, 1), (3, 1)] {
        let Activation::Maps(maps) = &seen[index].2 else {
            panic!("stage {index} should produce maps");
        };
        for (c, map) in maps.channels().iter().enumerate() {
            let bias = weights.layer(layer).unwrap().bias()[c];
            assert!(map.data().iter().all(|&v| (v - bias).abs() < 1e-6));
        }
    }
    for (index, layer) in [(4, 2), (6, 3)] {
        let Activation::Vector(v) = &seen[index].2 else {
            panic!("stage {index} should produce a vector");
        };
        assert_eq!(v.data(), weights.layer(layer).unwrap().bias());
    }

    let sum: f32 = scores.iter().sum();
    assert!((sum - 1.0).abs() < 1e-5);
    // the largest bias wins
    let labels: Vec<usize> = (0..10).collect();
    assert_eq!(sort_prediction(&scores, &labels).unwrap()[0].0, 9);
}

#[test]
fn test_sparse_connectivity_reproduces_biases() {
    let spec = NetworkSpec::lenet5();
    let weights = bias_only_weights(&spec);
    let net = Network::new(spec, &weights, Executor::new(Backend::Cpu).unwrap()).unwrap();

    let mut c3 = None;
    net.forward_observed(FeatureMap::zeros(32, 32).unwrap(), |index, _, act| {
        if index == 2 {
            c3 = Some(act.clone());
        }
        Ok(())
    })
    .unwrap();

    let Some(Activation::Maps(maps)) = c3 else {
        panic!("C3 should produce maps");
    };
    assert_eq!(maps.len(), 16);
    for (c, map) in maps.channels().iter().enumerate() {
        let bias = weights.layer(1).unwrap().bias()[c];
        assert!(map.data().iter().all(|&v| (v - bias).abs() < 1e-6));
    }
}

#[test]
fn test_sort_prediction_ranks_descending() {
    let ranked = sort_prediction(&[0.1, 0.7, 0.2], &[0, 1, 2]).unwrap();
    let labels: Vec<_> = ranked.iter().map(|p| p.0).collect();
    assert_eq!(labels, vec![1, 2, 0]);
}

#[test]
fn test_confusion_matrix_counts() {
    let mut m = ConfusionMatrix::new(10);
    for (p, a) in [(3, 3), (3, 5), (7, 7), (1, 7)] {
        m.record(p, a).unwrap();
    }
    let rows: u64 = (0..10).map(|c| m.row_sum(c)).sum();
    let cols: u64 = (0..10).map(|c| m.column_sum(c)).sum();
    assert_eq!(rows, 4);
    assert_eq!(cols, 4);
    assert!((m.error_rate() - 0.5).abs() < 1e-12);
    assert_eq!(m.column_sum(7), 2);
}

#[test]
fn test_saved_weights_drive_the_same_network() {
    let mut rng = StdRng::seed_from_u64(5);
    let spec = NetworkSpec::lenet_caffe();
    let weights = random_weights(&mut rng, &spec);

    let dir = scratch("weights");
    let path = dir.join("lenet.pcnw");
    save_weights(&path, &weights).unwrap();
    let loaded = load_weights(&path).unwrap();
    fs::remove_dir_all(&dir).unwrap();

    let image = FeatureMap::filled(28, 28, 0.5).unwrap();
    let a = Network::new(spec.clone(), &weights, Executor::new(Backend::Naive).unwrap())
        .unwrap()
        .forward(image.clone())
        .unwrap();
    let b = Network::new(spec, &loaded, Executor::new(Backend::Naive).unwrap())
        .unwrap()
        .forward(image)
        .unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_missing_weight_layer_is_rejected() {
    let spec = NetworkSpec::lenet_caffe();
    let mut layers = bias_only_weights(&spec).into_layers();
    layers.pop();
    let err = Network::new(spec, &WeightSet::new(layers), Executor::new(Backend::Naive).unwrap())
        .unwrap_err();
    assert!(err.to_string().contains("load"));
}

fn write_idx(dir: &Path, images: &[Vec<u8>], labels: &[u8]) {
    let mut img = Vec::new();
    for v in [2051u32, images.len() as u32, 28, 28] {
        img.extend_from_slice(&v.to_be_bytes());
    }
    for pixels in images {
        img.extend_from_slice(pixels);
    }
    fs::write(dir.join(IMAGES_FILE), img).unwrap();

    let mut lbl = Vec::new();
    for v in [2049u32, labels.len() as u32] {
        lbl.extend_from_slice(&v.to_be_bytes());
    }
    lbl.extend_from_slice(labels);
    fs::write(dir.join(LABELS_FILE), lbl).unwrap();
}

#[test]
fn test_parallel_evaluation_matches_sequential() {
    let mut rng = StdRng::seed_from_u64(99);
    let images: Vec<Vec<u8>> = (0..12)
        .map(|_| (0..28 * 28).map(|_| rng.random_range(0..=255u8)).collect())
        .collect();
    let labels: Vec<u8> = (0..12).map(|i| (i % 10) as u8).collect();

    let dir = scratch("mnist");
    write_idx(&dir, &images, &labels);
    let dataset = Dataset::load_mnist(&dir, None).unwrap();
    fs::remove_dir_all(&dir).unwrap();
    assert_eq!(dataset.len(), 12);
    assert!(dataset.images()[0].data().iter().all(|p| (0.0..=1.0).contains(p)));

    let spec = NetworkSpec::lenet_caffe();
    let weights = random_weights(&mut rng, &spec);
    let exec = Executor::with_threads(Backend::Cpu, Some(2)).unwrap();
    let net = Network::new(spec.clone(), &weights, exec).unwrap();

    let config = EvalConfig::default();
    let seq = evaluate(&net, &dataset, &config).unwrap();
    let par = evaluate_parallel(&net, &dataset, &config).unwrap();
    assert_eq!(seq, par);
    assert_eq!(seq.samples(), 12);

    let limited = EvalConfig {
        sample_limit: Some(5),
        ..EvalConfig::default()
    };
    assert_eq!(evaluate(&net, &dataset, &limited).unwrap().samples(), 5);

    // the naive backend fans samples out over its own bounded pool
    let exec = Executor::with_threads(Backend::Naive, Some(2)).unwrap();
    assert_eq!(exec.threads(), 2);
    let naive = Network::new(spec, &weights, exec).unwrap();
    assert_eq!(
        evaluate_parallel(&naive, &dataset, &config).unwrap(),
        evaluate(&naive, &dataset, &config).unwrap()
    );
}

#[test]
fn test_class_count_must_match_network() {
    let spec = NetworkSpec::lenet_caffe();
    let net = Network::new(
        spec.clone(),
        &bias_only_weights(&spec),
        Executor::new(Backend::Naive).unwrap(),
    )
    .unwrap();
    let dataset = Dataset::new(vec![FeatureMap::zeros(28, 28).unwrap()], vec![0]).unwrap();
    let config = EvalConfig {
        num_classes: 5,
        sample_limit: None,
    };
    assert!(evaluate(&net, &dataset, &config).is_err());
}
