//! End-to-end batch conversion tests.
//!
//! These tests exercise the complete pipeline on real files:
//! - safetensors teacher and student checkpoints in several layouts
//! - extraction → merge → wrapped output
//! - per-configuration skipping of missing and malformed students

use std::collections::BTreeMap;
use std::path::Path;

use graft_core::{ConversionConfig, PrefixSpec, StateDict, TensorHandle};
use graft_merge::{
    extract, BatchConverter, CheckpointLoader, CheckpointWriter, ConversionStatus,
    SafetensorsCheckpointLoader, SafetensorsCheckpointWriter, WRAPPER_METADATA_KEY,
};

fn tensor(values: &[f32]) -> TensorHandle {
    TensorHandle::from_f32(vec![values.len()], values).unwrap()
}

fn teacher_state() -> StateDict {
    StateDict::from([
        ("image_encoder.patch_embed.weight".to_string(), tensor(&[0.0, 0.0])),
        ("image_encoder.blocks.0.weight".to_string(), tensor(&[0.0])),
        ("tracker.memory.weight".to_string(), tensor(&[5.0])),
        ("mask_decoder.weight".to_string(), tensor(&[7.0, 8.0])),
        ("text_encoder.weight".to_string(), tensor(&[9.0])),
    ])
}

fn student_state(scale: f32) -> StateDict {
    StateDict::from([
        ("patch_embed.weight".to_string(), tensor(&[scale, scale])),
        ("stages.0.weight".to_string(), tensor(&[scale * 2.0])),
    ])
}

fn read_f32(t: &TensorHandle) -> Vec<f32> {
    t.data()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn write(writer: &SafetensorsCheckpointWriter, state: &StateDict, path: &Path) {
    writer.save(state, path, &BTreeMap::new()).unwrap();
}

#[test]
fn test_batch_conversion_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ConversionConfig::new(
        dir.path().join("sam3.pt"),
        dir.path().join("students"),
        dir.path().join("merged"),
    );
    config.config_names = vec![
        "es_rv_s".to_string(),
        "es_tv_s".to_string(),
        "es_ev_s".to_string(),
        "es_ev_m".to_string(),
    ];
    config.prefixes = PrefixSpec::with_target("image_encoder").skip("tracker");

    // Teacher saved as a bare mapping, students in the wrapped layouts
    // training code produces.
    write(&SafetensorsCheckpointWriter::flat(), &teacher_state(), &config.teacher_path);
    write(
        &SafetensorsCheckpointWriter::new(),
        &student_state(1.0),
        &config.student_path("es_rv_s"),
    );
    write(
        &SafetensorsCheckpointWriter::with_wrapper("state_dict"),
        &student_state(2.0),
        &config.student_path("es_tv_s"),
    );
    // es_ev_s is missing; es_ev_m nests its weights under an unknown field.
    write(
        &SafetensorsCheckpointWriter::with_wrapper("ema"),
        &student_state(3.0),
        &config.student_path("es_ev_m"),
    );

    let converter = BatchConverter::new(config.clone()).unwrap();
    let report = converter.run().unwrap();

    assert_eq!(report.teacher_tensors, 5);
    let summary = report.summary();
    assert_eq!(summary.converted, 2);
    assert_eq!(summary.missing, 1);
    assert_eq!(summary.failed, 1);

    match &report.get("es_rv_s").unwrap().status {
        ConversionStatus::Converted { output_path, stats } => {
            assert_eq!(output_path, &config.output_path("es_rv_s"));
            assert_eq!(stats.replaced, 2);
            assert_eq!(stats.skipped, 1);
            assert_eq!(stats.appended, 2);
            assert_eq!(stats.teacher_total(), 5);
        }
        other => panic!("unexpected status: {other:?}"),
    }
    assert_eq!(
        report.get("es_ev_s").unwrap().status,
        ConversionStatus::Missing
    );
    match &report.get("es_ev_m").unwrap().status {
        ConversionStatus::Failed(reason) => {
            assert!(reason.contains("Unable to extract a state_dict"));
            assert!(reason.contains("es_ev_m"));
        }
        other => panic!("unexpected status: {other:?}"),
    }
    assert!(!config.output_path("es_ev_s").exists());
    assert!(!config.output_path("es_ev_m").exists());

    // The merged output is wrapped under "model" and round-trips through the
    // extractor.
    let loader = SafetensorsCheckpointLoader::new();
    let merged_ckpt = loader.load(&config.output_path("es_tv_s")).unwrap();
    assert_eq!(merged_ckpt.metadata()[WRAPPER_METADATA_KEY], "model");
    assert_eq!(merged_ckpt.metadata()["graft.config"], "es_tv_s");
    let merged = extract(&merged_ckpt).unwrap();

    let keys: Vec<&str> = merged.keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        vec![
            "image_encoder.patch_embed.weight",
            "image_encoder.stages.0.weight",
            "mask_decoder.weight",
            "text_encoder.weight",
        ]
    );
    assert_eq!(read_f32(&merged["image_encoder.patch_embed.weight"]), vec![2.0, 2.0]);
    assert_eq!(read_f32(&merged["image_encoder.stages.0.weight"]), vec![4.0]);
    assert_eq!(read_f32(&merged["mask_decoder.weight"]), vec![7.0, 8.0]);
}

#[test]
fn test_rerun_overwrites_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ConversionConfig::new(
        dir.path().join("teacher.pt"),
        dir.path().join("students"),
        dir.path().join("out"),
    );
    config.config_names = vec!["es_rv_l".to_string()];

    write(&SafetensorsCheckpointWriter::new(), &teacher_state(), &config.teacher_path);
    write(
        &SafetensorsCheckpointWriter::new(),
        &student_state(1.0),
        &config.student_path("es_rv_l"),
    );

    let converter = BatchConverter::new(config.clone()).unwrap();
    let first = converter.run().unwrap();
    let second = converter.run().unwrap();
    assert_eq!(first.results, second.results);

    let merged = extract(
        &SafetensorsCheckpointLoader::new()
            .load(&config.output_path("es_rv_l"))
            .unwrap(),
    )
    .unwrap();
    // Default prefixes skip nothing, so the tracker weight is kept.
    assert!(merged.contains_key("tracker.memory.weight"));
    assert_eq!(merged.len(), 2 + 3);
}

#[test]
fn test_malformed_teacher_aborts_batch() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConversionConfig::new(
        dir.path().join("teacher.pt"),
        dir.path().join("students"),
        dir.path().join("out"),
    );
    write(
        &SafetensorsCheckpointWriter::with_wrapper("optimizer"),
        &teacher_state(),
        &config.teacher_path,
    );

    let err = BatchConverter::new(config.clone()).unwrap().run().unwrap_err();
    assert!(err.to_string().contains("teacher.pt"));
    assert!(!config.output_dir.exists());
}
