//! Batch conversion orchestration.
//!
//! Loads the teacher once, then grafts every configured student into it and
//! writes one merged checkpoint per configuration. A missing or unreadable
//! student only affects its own configuration; the rest of the batch carries
//! on.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use graft_core::{ConversionConfig, StateDict};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::{
    extract, CheckpointLoader, CheckpointWriter, MergeStats, Result, SafetensorsCheckpointLoader,
    SafetensorsCheckpointWriter, WeightMerger,
};

/// One configuration to convert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionJob {
    /// Configuration name.
    pub config_name: String,
    /// Student checkpoint path.
    pub student_path: PathBuf,
    /// Merged checkpoint path.
    pub output_path: PathBuf,
}

impl ConversionJob {
    /// Whether the student checkpoint is present on disk.
    pub fn student_exists(&self) -> bool {
        self.student_path.exists()
    }
}

/// Outcome of converting one configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionStatus {
    /// Merged and written.
    Converted {
        /// Where the merged checkpoint was written.
        output_path: PathBuf,
        /// Merge counters.
        stats: MergeStats,
    },
    /// No student checkpoint at the expected path.
    Missing,
    /// Loading, extraction or writing failed.
    Failed(String),
}

/// Per-configuration result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionResult {
    /// Configuration name.
    pub config_name: String,
    /// Student checkpoint path.
    pub student_path: PathBuf,
    /// What happened.
    pub status: ConversionStatus,
}

/// Totals over a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversionSummary {
    /// Configurations merged and written.
    pub converted: usize,
    /// Configurations without a student checkpoint.
    pub missing: usize,
    /// Configurations that failed.
    pub failed: usize,
}

/// Results of a batch, in configuration order.
#[derive(Debug, Clone)]
pub struct ConversionReport {
    /// Number of tensors in the teacher state dict.
    pub teacher_tensors: usize,
    /// One entry per configuration.
    pub results: Vec<ConversionResult>,
}

impl ConversionReport {
    /// Count results by status.
    pub fn summary(&self) -> ConversionSummary {
        let mut summary = ConversionSummary::default();
        for result in &self.results {
            match result.status {
                ConversionStatus::Converted { .. } => summary.converted += 1,
                ConversionStatus::Missing => summary.missing += 1,
                ConversionStatus::Failed(_) => summary.failed += 1,
            }
        }
        summary
    }

    /// Result for a configuration.
    pub fn get(&self, config_name: &str) -> Option<&ConversionResult> {
        self.results.iter().find(|r| r.config_name == config_name)
    }
}

/// Drives a batch conversion with pluggable checkpoint I/O.
pub struct BatchConverter<L = SafetensorsCheckpointLoader, W = SafetensorsCheckpointWriter> {
    config: ConversionConfig,
    loader: L,
    writer: W,
    merger: WeightMerger,
}

impl BatchConverter {
    /// Converter reading and writing safetensors checkpoints.
    pub fn new(config: ConversionConfig) -> Result<Self> {
        let writer = SafetensorsCheckpointWriter::with_wrapper(config.output_wrapper.clone());
        Self::with_io(config, SafetensorsCheckpointLoader::new(), writer)
    }
}

impl<L: CheckpointLoader, W: CheckpointWriter> BatchConverter<L, W> {
    /// Converter with custom loader and writer. Validates the configuration.
    pub fn with_io(config: ConversionConfig, loader: L, writer: W) -> Result<Self> {
        config.validate()?;
        let merger = WeightMerger::new(&config.prefixes);
        Ok(Self {
            config,
            loader,
            writer,
            merger,
        })
    }

    /// The configuration in effect.
    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    /// The merger in effect.
    pub fn merger(&self) -> &WeightMerger {
        &self.merger
    }

    /// One job per configuration name, in order.
    pub fn plan(&self) -> Vec<ConversionJob> {
        self.config
            .config_names
            .iter()
            .map(|name| ConversionJob {
                config_name: name.clone(),
                student_path: self.config.student_path(name),
                output_path: self.config.output_path(name),
            })
            .collect()
    }

    /// Load and extract the teacher state dict.
    pub fn load_teacher(&self) -> Result<StateDict> {
        info!("Loading teacher checkpoint from {:?}", self.config.teacher_path);
        let checkpoint = self.loader.load(&self.config.teacher_path)?;
        let teacher = extract(&checkpoint)?;
        info!("Teacher checkpoint loaded ({} tensors)", teacher.len());
        Ok(teacher)
    }

    /// Convert a single configuration. Never fails the batch.
    pub fn convert_job(&self, job: &ConversionJob, teacher: &StateDict) -> ConversionResult {
        let status = if !job.student_exists() {
            warn!(
                "Checkpoint not found for {} at {:?}",
                job.config_name, job.student_path
            );
            ConversionStatus::Missing
        } else {
            match self.try_convert(job, teacher) {
                Ok(stats) => ConversionStatus::Converted {
                    output_path: job.output_path.clone(),
                    stats,
                },
                Err(e) => {
                    warn!("Skipping {}: {}", job.config_name, e);
                    ConversionStatus::Failed(e.to_string())
                }
            }
        };

        ConversionResult {
            config_name: job.config_name.clone(),
            student_path: job.student_path.clone(),
            status,
        }
    }

    fn try_convert(&self, job: &ConversionJob, teacher: &StateDict) -> Result<MergeStats> {
        info!("Processing {}...", job.config_name);
        let checkpoint = self.loader.load(&job.student_path)?;
        let student = extract(&checkpoint)?;

        let outcome = self.merger.merge(&student, teacher);
        let stats = outcome.stats;

        let metadata = provenance(
            &job.config_name,
            &self.config.teacher_path,
            &job.student_path,
            &stats,
        );
        self.writer.save(&outcome.merged, &job.output_path, &metadata)?;

        info!(
            "Saved {:?} (replaced: {}, appended: {}, skipped: {})",
            job.output_path, stats.replaced, stats.appended, stats.skipped
        );
        Ok(stats)
    }

    /// Run the whole batch.
    pub fn run(&self) -> Result<ConversionReport> {
        self.run_with(|_| {})
    }

    /// Run the whole batch, calling `on_result` as each configuration
    /// finishes. Results come back in configuration order either way.
    ///
    /// Fails only if the output directory cannot be created or the teacher
    /// cannot be loaded.
    pub fn run_with<F>(&self, on_result: F) -> Result<ConversionReport>
    where
        F: Fn(&ConversionResult) + Sync,
    {
        let teacher = self.load_teacher()?;
        std::fs::create_dir_all(&self.config.output_dir)?;

        let jobs = self.plan();
        let convert = |job: &ConversionJob| {
            let result = self.convert_job(job, &teacher);
            on_result(&result);
            result
        };

        let results: Vec<ConversionResult> = if self.config.parallel {
            jobs.par_iter().map(convert).collect()
        } else {
            jobs.iter().map(convert).collect()
        };

        Ok(ConversionReport {
            teacher_tensors: teacher.len(),
            results,
        })
    }
}

fn provenance(
    config_name: &str,
    teacher_path: &Path,
    student_path: &Path,
    stats: &MergeStats,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("graft.config".to_string(), config_name.to_string()),
        ("graft.teacher".to_string(), teacher_path.display().to_string()),
        ("graft.student".to_string(), student_path.display().to_string()),
        ("graft.replaced".to_string(), stats.replaced.to_string()),
        ("graft.appended".to_string(), stats.appended.to_string()),
        ("graft.skipped".to_string(), stats.skipped.to_string()),
    ])
}
