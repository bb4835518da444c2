use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use miette::IntoDiagnostic;
use revmpi_debugger::DebuggerConfig;
use revmpi_debugger::checkpoint::CheckpointMode;

/// Configuration of workers and coordinator.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct RevmpiConfig {
    /// How checkpoints keep memory (`snapshot` or `fork`).
    #[knus(child, default, unwrap(argument, str))]
    pub checkpoint_mode: CheckpointMode,

    /// Spool directory of snapshot checkpoints.
    #[knus(child, unwrap(argument, str))]
    pub checkpoint_dir: Option<PathBuf>,

    /// Outermost function of stack walks.
    #[knus(child, default = "main".to_owned(), unwrap(argument))]
    pub entry_function: String,

    /// Offset applied to source line numbers.
    #[knus(child, default, unwrap(argument))]
    pub line_offset: u64,

    /// Port the coordinator listens on.
    #[knus(child, default = revmpi_proto::DEFAULT_COORDINATOR_PORT, unwrap(argument))]
    pub coordinator_port: u16,

    /// Program starting the workers of a job (e.g. `mpirun`).
    #[knus(child, unwrap(argument))]
    pub launcher: Option<String>,
}

impl RevmpiConfig {
    /// Settings of a traced worker.
    pub fn debugger_config(&self) -> DebuggerConfig {
        let default = DebuggerConfig::default();

        DebuggerConfig {
            checkpoint_mode: self.checkpoint_mode,
            checkpoint_dir: self
                .checkpoint_dir
                .clone()
                .unwrap_or(default.checkpoint_dir),
            entry_function: self.entry_function.clone(),
            line_offset: self.line_offset,
        }
    }
}

/// Parses a configuration, either inline or from a `.kdl` file.
pub fn parse_config(config: &str) -> miette::Result<RevmpiConfig> {
    let path = Path::new(config);

    let config = if let Some((filename, "kdl")) = path
        .file_name()
        .and_then(OsStr::to_str)
        .zip(path.extension().and_then(OsStr::to_str))
    {
        let content = std::fs::read_to_string(path).into_diagnostic()?;
        knus::parse(filename, &content)?
    } else {
        knus::parse("<content>", config)?
    };

    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use revmpi_debugger::checkpoint::CheckpointMode;

    use super::{RevmpiConfig, parse_config};

    #[test]
    fn parse_from_kdl_defaults() {
        let config = knus::parse::<RevmpiConfig>("<content>", "")
            .map_err(miette::Report::new)
            .expect("parse kdl");

        assert_eq!(
            config,
            RevmpiConfig {
                checkpoint_mode: CheckpointMode::Snapshot,
                checkpoint_dir: None,
                entry_function: "main".to_owned(),
                line_offset: 0,
                coordinator_port: 3490,
                launcher: None,
            }
        );

        let debugger = config.debugger_config();
        assert_eq!(debugger.checkpoint_dir, std::env::temp_dir());
    }

    #[test]
    fn parse_from_kdl_all_nodes() {
        let config = knus::parse::<RevmpiConfig>(
            "<content>",
            indoc::indoc! {r#"
                checkpoint-mode "fork"
                checkpoint-dir "/tmp/revmpi"
                entry-function "run"
                line-offset 1
                coordinator-port 4000
                launcher "mpirun"
            "#},
        )
        .map_err(miette::Report::new)
        .expect("parse kdl");

        assert_eq!(
            config,
            RevmpiConfig {
                checkpoint_mode: CheckpointMode::Fork,
                checkpoint_dir: Some(PathBuf::from("/tmp/revmpi")),
                entry_function: "run".to_owned(),
                line_offset: 1,
                coordinator_port: 4000,
                launcher: Some("mpirun".to_owned()),
            }
        );

        let debugger = config.debugger_config();
        assert_eq!(debugger.checkpoint_mode, CheckpointMode::Fork);
        assert_eq!(debugger.line_offset, 1);
        assert_eq!(debugger.entry_function, "run");
    }

    #[test]
    fn unknown_checkpoint_mode_is_rejected() {
        assert!(knus::parse::<RevmpiConfig>("<content>", r#"checkpoint-mode "mmap""#).is_err());
    }

    #[test]
    fn inline_and_file_configs() {
        let config = parse_config("line-offset 1").expect("inline");
        assert_eq!(config.line_offset, 1);

        let dir = tempfile::tempdir().unwrap();

        let path = dir.path().join("revmpi.kdl");
        std::fs::write(&path, "entry-function \"worker_main\"\n").unwrap();

        let config = parse_config(path.to_str().unwrap()).expect("file");
        assert_eq!(config.entry_function, "worker_main");
    }
}
