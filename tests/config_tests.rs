//! Tests for loading node configs from disk

use std::io::Write;

use deep_shrink::config::{BetaSchedule, ConfigError, DeepShrinkConfig, NodeConfig};
use deep_shrink::{
    DiscreteModelSampling, ModelPatcher, GradientPatchModelAddDownscaleAdvanced, SamplingSchedule,
};
use std::sync::Arc;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn test_load_advanced_config() {
    let file = write_config(
        r#"{
            "sampling": { "beta_schedule": "linear", "beta_end": 0.02 },
            "node": {
                "kind": "advanced",
                "block_number": 4,
                "downscale_after_skip": false,
                "config": "0 0.5\n0.3 0.75\n0.6 1"
            }
        }"#,
    );
    let config = DeepShrinkConfig::load(file.path()).unwrap();
    assert_eq!(config.sampling.beta_schedule, BetaSchedule::Linear);
    assert_eq!(config.sampling.beta_end, 0.02);
    assert_eq!(config.sampling.beta_start, 0.00085);

    let NodeConfig::Advanced(node) = &config.node else {
        panic!("expected advanced node, got {:?}", config.node);
    };
    assert_eq!(node.block_number, 4);
    assert!(!node.downscale_after_skip);
    assert!(node.interpolate);
    assert_eq!(node.curve().unwrap().points().len(), 3);
}

#[test]
fn test_saved_config_loads_back() {
    let config = DeepShrinkConfig {
        sampling: Default::default(),
        node: NodeConfig::Advanced(GradientPatchModelAddDownscaleAdvanced {
            interpolate: false,
            ..Default::default()
        }),
    };
    let file = write_config(&serde_json::to_string_pretty(&config).unwrap());
    let loaded = DeepShrinkConfig::load(file.path()).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = DeepShrinkConfig::load(dir.path().join("missing.json")).unwrap_err();
    assert!(matches!(err, ConfigError::FileRead { .. }));
    assert!(err.to_string().contains("missing.json"));
}

#[test]
fn test_invalid_json() {
    let file = write_config("{ \"node\": ");
    let err = DeepShrinkConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::JsonParse { .. }));
}

#[test]
fn test_out_of_range_percent() {
    let file = write_config(r#"{ "node": { "kind": "basic", "end_percent": 1.5 } }"#);
    let err = DeepShrinkConfig::load(file.path()).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::OutOfRange {
            field: "end_percent",
            ..
        }
    ));
}

#[test]
fn test_loaded_sampling_drives_patch() {
    let file = write_config(r#"{ "node": { "kind": "advanced" } }"#);
    let config = DeepShrinkConfig::load(file.path()).unwrap();
    let sampling = DiscreteModelSampling::new(&config.sampling);
    assert!(sampling.percent_to_sigma(0.5) < sampling.sigma_max());

    let model = ModelPatcher::new((), Arc::new(sampling));
    let NodeConfig::Advanced(node) = config.node else {
        panic!("expected advanced node");
    };
    let patched = node.patch(&model).unwrap();
    assert_eq!(patched.options().input_block_patches_after_skip(), 1);
    assert_eq!(patched.options().output_block_patches(), 1);
    assert!(patched.is_clone(&model));
}
