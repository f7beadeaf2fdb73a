//! Configuration types for graft.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{GraftError, Result};

/// Student variants produced by stage-1 distillation, in conversion order.
pub const DEFAULT_CONFIG_NAMES: [&str; 9] = [
    "es_rv_s", "es_rv_m", "es_rv_l", "es_tv_s", "es_tv_m", "es_tv_l", "es_ev_s", "es_ev_m",
    "es_ev_l",
];

/// Prefix rules controlling how student keys are rewritten and which teacher
/// keys are dropped.
///
/// Values are stored as given; normalization happens at merge time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixSpec {
    /// Prefix applied to every student key.
    #[serde(default = "default_target_prefix")]
    pub target_prefix: String,

    /// Prefix of teacher keys superseded by the student.
    /// Falls back to `target_prefix` when unset.
    #[serde(default)]
    pub replace_prefix: Option<String>,

    /// Prefixes of teacher keys dropped unconditionally.
    #[serde(default)]
    pub skip_prefixes: Vec<String>,
}

fn default_target_prefix() -> String {
    "image_encoder".to_string()
}

impl PrefixSpec {
    /// Rules with the given target prefix and no overrides.
    pub fn with_target(target_prefix: impl Into<String>) -> Self {
        Self {
            target_prefix: target_prefix.into(),
            replace_prefix: None,
            skip_prefixes: Vec::new(),
        }
    }

    /// Set the replace prefix.
    pub fn replace(mut self, prefix: impl Into<String>) -> Self {
        self.replace_prefix = Some(prefix.into());
        self
    }

    /// Add a skip prefix.
    pub fn skip(mut self, prefix: impl Into<String>) -> Self {
        self.skip_prefixes.push(prefix.into());
        self
    }

    /// The replace prefix as given, or the target prefix when unset.
    pub fn effective_replace_prefix(&self) -> &str {
        self.replace_prefix.as_deref().unwrap_or(&self.target_prefix)
    }
}

impl Default for PrefixSpec {
    fn default() -> Self {
        Self::with_target(default_target_prefix())
    }
}

/// Batch conversion configuration, typically loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Teacher checkpoint path.
    pub teacher_path: PathBuf,

    /// Directory holding one sub-directory per student configuration.
    pub student_root: PathBuf,

    /// Directory merged checkpoints are written to.
    pub output_dir: PathBuf,

    /// Configuration names, converted in this order.
    #[serde(default = "default_config_names")]
    pub config_names: Vec<String>,

    /// Student checkpoint file name inside each configuration directory.
    #[serde(default = "default_student_checkpoint")]
    pub student_checkpoint: String,

    /// Extension of merged checkpoint files.
    #[serde(default = "default_output_extension")]
    pub output_extension: String,

    /// Field the merged state dict is nested under in the output.
    #[serde(default = "default_output_wrapper")]
    pub output_wrapper: String,

    /// Prefix rules.
    #[serde(default)]
    pub prefixes: PrefixSpec,

    /// Convert configurations on a thread pool.
    #[serde(default)]
    pub parallel: bool,
}

fn default_config_names() -> Vec<String> {
    DEFAULT_CONFIG_NAMES.iter().map(|s| s.to_string()).collect()
}

fn default_student_checkpoint() -> String {
    "ckpt_epoch_0.pth".to_string()
}

fn default_output_extension() -> String {
    "pt".to_string()
}

fn default_output_wrapper() -> String {
    "model".to_string()
}

impl ConversionConfig {
    /// Configuration with default names, file layout and prefixes.
    pub fn new(
        teacher_path: impl Into<PathBuf>,
        student_root: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            teacher_path: teacher_path.into(),
            student_root: student_root.into(),
            output_dir: output_dir.into(),
            config_names: default_config_names(),
            student_checkpoint: default_student_checkpoint(),
            output_extension: default_output_extension(),
            output_wrapper: default_output_wrapper(),
            prefixes: PrefixSpec::default(),
            parallel: false,
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Student checkpoint path for a configuration.
    pub fn student_path(&self, config_name: &str) -> PathBuf {
        self.student_root
            .join(config_name)
            .join(&self.student_checkpoint)
    }

    /// Output path for a configuration.
    pub fn output_path(&self, config_name: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", config_name, self.output_extension))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        for (field, path) in [
            ("teacher_path", &self.teacher_path),
            ("student_root", &self.student_root),
            ("output_dir", &self.output_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(GraftError::Config(format!("{field} must not be empty")));
            }
        }

        if self.config_names.is_empty() {
            return Err(GraftError::Config(
                "at least one configuration name is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for name in &self.config_names {
            if !is_single_component(name) {
                return Err(GraftError::Config(format!(
                    "configuration name '{name}' must be a single path component"
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(GraftError::Config(format!(
                    "duplicate configuration name '{name}'"
                )));
            }
        }

        if !is_single_component(&self.student_checkpoint) {
            return Err(GraftError::Config(format!(
                "student_checkpoint '{}' must be a file name",
                self.student_checkpoint
            )));
        }

        if self.output_wrapper.is_empty() {
            return Err(GraftError::Config(
                "output_wrapper must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

// Rejects "", ".", "..", absolute paths and anything with a separator.
fn is_single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
teacher_path: sam3.pt
student_root: students
output_dir: merged
"#;

        let config = ConversionConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.config_names.len(), 9);
        assert_eq!(config.config_names[0], "es_rv_s");
        assert_eq!(config.prefixes.target_prefix, "image_encoder");
        assert_eq!(config.prefixes.replace_prefix, None);
        assert_eq!(config.output_wrapper, "model");
        assert!(!config.parallel);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_prefix_overrides() {
        let yaml = r#"
teacher_path: sam3.pt
student_root: students
output_dir: merged
config_names: [es_tv_s]
prefixes:
  target_prefix: backbone.vision
  replace_prefix: backbone
  skip_prefixes: [tracker, "memory."]
parallel: true
"#;

        let config = ConversionConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.prefixes.target_prefix, "backbone.vision");
        assert_eq!(config.prefixes.effective_replace_prefix(), "backbone");
        assert_eq!(config.prefixes.skip_prefixes, vec!["tracker", "memory."]);
        assert!(config.parallel);
    }

    #[test]
    fn test_paths() {
        let config = ConversionConfig::new("t.pt", "/students", "/out");
        assert_eq!(
            config.student_path("es_rv_s"),
            PathBuf::from("/students/es_rv_s/ckpt_epoch_0.pth")
        );
        assert_eq!(config.output_path("es_rv_s"), PathBuf::from("/out/es_rv_s.pt"));
    }

    #[test]
    fn test_replace_prefix_defaults_to_target() {
        let spec = PrefixSpec::with_target("image_encoder");
        assert_eq!(spec.effective_replace_prefix(), "image_encoder");
        let spec = spec.replace("");
        assert_eq!(spec.effective_replace_prefix(), "");
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let mut config = ConversionConfig::new("t.pt", "s", "o");
        config.config_names = vec!["a".into(), "a".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_path_like_names() {
        let mut config = ConversionConfig::new("t.pt", "s", "o");
        config.config_names = vec!["../escape".into()];
        assert!(config.validate().is_err());

        let mut config = ConversionConfig::new("t.pt", "s", "o");
        config.student_checkpoint = "nested/ckpt.pth".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_paths() {
        let config = ConversionConfig::new("", "s", "o");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip_keeps_names() {
        let config = ConversionConfig::new("t.pt", "s", "o");
        let parsed = ConversionConfig::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(parsed.config_names, config.config_names);
        assert_eq!(parsed.prefixes, config.prefixes);
    }
}
