//! graft CLI - graft distilled student encoders into a teacher checkpoint.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use clap::{Parser, Subcommand};
use graft_core::{ConversionConfig, PrefixSpec};
use graft_merge::{
    classify, extract, BatchConverter, CheckpointLoader, ConversionStatus,
    SafetensorsCheckpointLoader,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "graft")]
#[command(author, version, about = "Graft distilled student encoders into a teacher checkpoint", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge every student configuration into the teacher checkpoint
    Convert {
        /// Path to conversion configuration file (YAML)
        #[arg(short, long)]
        config: Option<String>,

        /// Teacher checkpoint path
        #[arg(long, visible_alias = "sam3-ckpt")]
        teacher_ckpt: Option<PathBuf>,

        /// Directory containing one sub-directory per student configuration
        #[arg(long)]
        student_dir: Option<PathBuf>,

        /// Directory to save merged checkpoints
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Prefix applied to every student key
        #[arg(long)]
        target_prefix: Option<String>,

        /// Prefix of teacher keys replaced by the student (defaults to the target prefix)
        #[arg(long)]
        replace_prefix: Option<String>,

        /// Prefix of teacher keys to drop (repeatable)
        #[arg(long = "skip-prefix")]
        skip_prefixes: Vec<String>,

        /// Comma-separated configuration names (defaults to the built-in list)
        #[arg(long, value_delimiter = ',')]
        configs: Vec<String>,

        /// Convert configurations in parallel
        #[arg(long)]
        parallel: bool,
    },

    /// Show how a checkpoint is laid out and what the extractor finds in it
    Inspect {
        /// Checkpoint path
        checkpoint: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate a sample configuration file
    Init {
        /// Output path for the configuration
        #[arg(short, long, default_value = "graft.yaml")]
        output: String,
    },
}

/// Command-line overrides for a conversion.
#[derive(Debug, Default)]
struct ConvertArgs {
    config: Option<String>,
    teacher_ckpt: Option<PathBuf>,
    student_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    target_prefix: Option<String>,
    replace_prefix: Option<String>,
    skip_prefixes: Vec<String>,
    configs: Vec<String>,
    parallel: bool,
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            config,
            teacher_ckpt,
            student_dir,
            output_dir,
            target_prefix,
            replace_prefix,
            skip_prefixes,
            configs,
            parallel,
        } => {
            let config = resolve_config(ConvertArgs {
                config,
                teacher_ckpt,
                student_dir,
                output_dir,
                target_prefix,
                replace_prefix,
                skip_prefixes,
                configs,
                parallel,
            })?;
            run_conversion(config)?;
        }

        Commands::Inspect { checkpoint, json } => {
            run_inspect(&checkpoint, json)?;
        }

        Commands::Init { output } => {
            let validated_output = validate_output_path(&output, "config output")?;
            generate_sample_config(&validated_output)?;
        }
    }

    Ok(())
}

/// Build the conversion configuration from an optional file plus flags.
/// Flags win over file values.
fn resolve_config(args: ConvertArgs) -> anyhow::Result<ConversionConfig> {
    let mut config = match &args.config {
        Some(path) => ConversionConfig::from_yaml_file(path)?,
        None => {
            let teacher = args
                .teacher_ckpt
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--teacher-ckpt is required without --config"))?;
            let students = args
                .student_dir
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--student-dir is required without --config"))?;
            let output = args
                .output_dir
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--output-dir is required without --config"))?;
            ConversionConfig::new(teacher, students, output)
        }
    };

    if let Some(teacher) = args.teacher_ckpt {
        config.teacher_path = teacher;
    }
    if let Some(students) = args.student_dir {
        config.student_root = students;
    }
    if let Some(output) = args.output_dir {
        config.output_dir = output;
    }
    if let Some(target) = args.target_prefix {
        config.prefixes.target_prefix = target;
    }
    if let Some(replace) = args.replace_prefix {
        config.prefixes.replace_prefix = Some(replace);
    }
    config.prefixes.skip_prefixes.extend(args.skip_prefixes);
    if !args.configs.is_empty() {
        config.config_names = args.configs;
    }
    config.parallel |= args.parallel;

    config.validate()?;
    Ok(config)
}

/// Run a batch conversion with a progress bar.
fn run_conversion(config: ConversionConfig) -> anyhow::Result<()> {
    println!("========================================");
    println!("  graft Batch Conversion");
    println!("========================================");
    println!("Teacher:        {}", config.teacher_path.display());
    println!("Students:       {}", config.student_root.display());
    println!("Output:         {}", config.output_dir.display());
    println!("Target prefix:  {}", config.prefixes.target_prefix);
    println!("Replace prefix: {}", config.prefixes.effective_replace_prefix());
    if !config.prefixes.skip_prefixes.is_empty() {
        println!("Skip prefixes:  {}", config.prefixes.skip_prefixes.join(", "));
    }
    println!("Configurations: {}", config.config_names.len());
    println!("========================================\n");

    let converter = BatchConverter::new(config)?;

    let progress = ProgressBar::new(converter.config().config_names.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let report = converter.run_with(|result| {
        progress.set_message(result.config_name.clone());
        progress.inc(1);
    })?;
    progress.finish_and_clear();

    println!("\n========================================");
    println!("  Conversion Complete!");
    println!("========================================");
    for result in &report.results {
        match &result.status {
            ConversionStatus::Converted { output_path, stats } => println!(
                "{:<10} saved {} (replaced: {}, appended: {}, skipped: {})",
                result.config_name,
                output_path.display(),
                stats.replaced,
                stats.appended,
                stats.skipped
            ),
            ConversionStatus::Missing => println!(
                "{:<10} missing {}",
                result.config_name,
                result.student_path.display()
            ),
            ConversionStatus::Failed(reason) => {
                println!("{:<10} failed: {}", result.config_name, reason)
            }
        }
    }

    let summary = report.summary();
    println!("========================================");
    println!(
        "Converted: {}  Missing: {}  Failed: {}",
        summary.converted, summary.missing, summary.failed
    );
    println!("========================================");

    Ok(())
}

/// What `inspect` reports about a checkpoint.
#[derive(Debug, Serialize)]
struct InspectReport {
    path: String,
    shape: String,
    metadata: BTreeMap<String, String>,
    tensors: Option<usize>,
    total_bytes: Option<usize>,
    dtypes: BTreeMap<String, usize>,
    top_level_prefixes: BTreeMap<String, usize>,
    error: Option<String>,
}

/// Describe a checkpoint's layout and extracted state dict.
fn run_inspect(path: &Path, json: bool) -> anyhow::Result<()> {
    let checkpoint = SafetensorsCheckpointLoader::new().load(path)?;
    let shape = classify(checkpoint.root()).describe();

    let mut report = InspectReport {
        path: checkpoint.source().to_string(),
        shape,
        metadata: checkpoint.metadata().clone(),
        tensors: None,
        total_bytes: None,
        dtypes: BTreeMap::new(),
        top_level_prefixes: BTreeMap::new(),
        error: None,
    };

    match extract(&checkpoint) {
        Ok(state) => {
            report.tensors = Some(state.len());
            report.total_bytes = Some(state.values().map(|t| t.nbytes()).sum());
            for (key, tensor) in &state {
                *report
                    .dtypes
                    .entry(format!("{:?}", tensor.dtype()))
                    .or_default() += 1;
                let head = key.split('.').next().unwrap_or(key).to_string();
                *report.top_level_prefixes.entry(head).or_default() += 1;
            }
        }
        Err(e) => report.error = Some(e.to_string()),
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Checkpoint: {}", report.path);
    println!("Layout:     {}", report.shape);
    for (key, value) in &report.metadata {
        println!("  {key} = {value}");
    }
    match (&report.error, report.tensors, report.total_bytes) {
        (Some(error), _, _) => println!("Extraction failed: {error}"),
        (None, Some(tensors), Some(bytes)) => {
            println!(
                "Tensors:    {} ({:.2} MB)",
                tensors,
                bytes as f64 / (1024.0 * 1024.0)
            );
            for (dtype, count) in &report.dtypes {
                println!("  {dtype:<6} {count}");
            }
            println!("Top-level prefixes:");
            for (prefix, count) in &report.top_level_prefixes {
                println!("  {prefix:<24} {count}");
            }
        }
        _ => {}
    }

    Ok(())
}

/// Write a sample configuration file.
fn generate_sample_config(output: &Path) -> anyhow::Result<()> {
    let mut config = ConversionConfig::new("./checkpoints/sam3.pt", "./students", "./merged");
    config.prefixes = PrefixSpec::with_target("image_encoder");

    std::fs::write(output, config.to_yaml()?)?;
    println!("Sample configuration written to: {}", output.display());
    Ok(())
}

/// Reject output paths that climb out of the working directory.
fn validate_output_path(path: &str, context: &str) -> anyhow::Result<PathBuf> {
    let path = PathBuf::from(path);

    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        anyhow::bail!(
            "Path traversal detected in {}: '{}' contains '..' component. \
             Please use a path within the current directory.",
            context,
            path.display()
        );
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_alone_build_default_config() {
        let config = resolve_config(ConvertArgs {
            teacher_ckpt: Some("sam3.pt".into()),
            student_dir: Some("students".into()),
            output_dir: Some("merged".into()),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(config.config_names.len(), 9);
        assert_eq!(config.prefixes.target_prefix, "image_encoder");
        assert!(!config.parallel);
    }

    #[test]
    fn test_missing_required_flag() {
        let err = resolve_config(ConvertArgs {
            teacher_ckpt: Some("sam3.pt".into()),
            output_dir: Some("merged".into()),
            ..Default::default()
        })
        .unwrap_err();

        assert!(err.to_string().contains("--student-dir"));
    }

    #[test]
    fn test_flags_override_file() {
        let dir = std::env::temp_dir().join(format!("graft-cli-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("graft.yaml");
        std::fs::write(
            &path,
            "teacher_path: a.pt\nstudent_root: s\noutput_dir: o\nconfig_names: [x, y]\n",
        )
        .unwrap();

        let config = resolve_config(ConvertArgs {
            config: Some(path.display().to_string()),
            output_dir: Some("elsewhere".into()),
            target_prefix: Some("backbone".into()),
            skip_prefixes: vec!["tracker".into()],
            configs: vec!["z".into()],
            parallel: true,
            ..Default::default()
        })
        .unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(config.teacher_path, PathBuf::from("a.pt"));
        assert_eq!(config.output_dir, PathBuf::from("elsewhere"));
        assert_eq!(config.prefixes.target_prefix, "backbone");
        assert_eq!(config.prefixes.skip_prefixes, vec!["tracker"]);
        assert_eq!(config.config_names, vec!["z"]);
        assert!(config.parallel);
    }

    #[test]
    fn test_validate_output_path_rejects_traversal() {
        assert!(validate_output_path("../graft.yaml", "config output").is_err());
    }
}
