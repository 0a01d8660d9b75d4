// SPDX-License-Identifier: GPL-3.0-only

//! Server configuration
//!
//! Every option can come from the command line or from a TOML file. Command
//! line values win over file values, which win over built-in defaults.
//! Relative paths in the file are taken relative to the file's directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Parser};
use serde::Deserialize;

use crate::constants::{defaults, lease};
use crate::errors::ConfigError;
use crate::lease::LeasePolicy;
use crate::net::{ListenAddr, parse_listeners};
use crate::pipeline::graph::Framerate;

#[derive(Parser, Debug, Clone)]
#[command(name = "pitv-server")]
#[command(about = "Camera streaming server with leased RTP viewers and rolling recordings")]
#[command(version = env!("GIT_VERSION"))]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(long, default_value = defaults::CONFIG_FILE)]
    pub config: PathBuf,

    /// User database location (CSV file path or file:// URL)
    #[arg(long)]
    pub user_db: Option<String>,

    /// PEM certificate chain for https listeners
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for https listeners
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Directory for the log file; console only when unset
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Create missing log and recording directories
    #[arg(long, action = ArgAction::Set)]
    pub force_mkdirs: Option<bool>,

    /// Listen URL, e.g. http://0.0.0.0:5000 or https://0.0.0.0:5443 (repeatable)
    #[arg(long)]
    pub listen: Vec<String>,

    /// Source element factory replacing the default camera source
    #[arg(long)]
    pub video_source: Option<String>,

    #[arg(long)]
    pub video_width: Option<u32>,

    #[arg(long)]
    pub video_height: Option<u32>,

    #[arg(long)]
    pub video_fps_numerator: Option<i32>,

    #[arg(long)]
    pub video_fps_denominator: Option<i32>,

    /// Directory receiving recording fragments
    #[arg(long)]
    pub recording_path: Option<PathBuf>,

    /// Fragment length in seconds
    #[arg(long)]
    pub recording_segment_duration: Option<u64>,

    /// Recording quota in megabytes; zero or negative disables it
    #[arg(long, allow_negative_numbers = true)]
    pub recording_max_size: Option<i64>,

    /// HTTP path of the lease endpoint
    #[arg(long)]
    pub mount_point: Option<String>,

    #[arg(long)]
    pub max_leases_per_user: Option<usize>,

    /// Run against the in-process media graph instead of the camera
    #[arg(long)]
    pub simulate_graph: bool,
}

/// On-disk configuration; every key is optional
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub user_db: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub force_mkdirs: Option<bool>,
    pub listen: Option<Vec<String>>,
    pub video_source: Option<String>,
    pub video_width: Option<u32>,
    pub video_height: Option<u32>,
    pub video_fps_numerator: Option<i32>,
    pub video_fps_denominator: Option<i32>,
    pub recording_path: Option<PathBuf>,
    pub recording_segment_duration: Option<u64>,
    pub recording_max_size: Option<i64>,
    pub mount_point: Option<String>,
    pub max_leases_per_user: Option<usize>,
}

/// Capture and recording settings consumed by the pipeline engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,
    pub framerate: Framerate,
    pub video_source: Option<String>,
    pub recording_path: PathBuf,
    pub segment_duration: Duration,
    /// Quota in megabytes; zero or negative means unbounded
    pub recording_max_size_mb: i64,
    pub force_mkdirs: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: defaults::VIDEO_WIDTH,
            height: defaults::VIDEO_HEIGHT,
            framerate: Framerate::new(
                defaults::VIDEO_FPS_NUMERATOR,
                defaults::VIDEO_FPS_DENOMINATOR,
            ),
            video_source: None,
            recording_path: PathBuf::from(defaults::RECORDING_PATH),
            segment_duration: Duration::from_secs(defaults::RECORDING_SEGMENT_SECS),
            recording_max_size_mb: defaults::RECORDING_MAX_SIZE_MB,
            force_mkdirs: true,
        }
    }
}

impl PipelineConfig {
    /// Whether moving to `other` needs the graph to be rebuilt
    pub fn requires_rebuild(&self, other: &PipelineConfig) -> bool {
        self.width != other.width
            || self.height != other.height
            || self.framerate != other.framerate
            || self.video_source != other.video_source
            || self.segment_duration != other.segment_duration
    }
}

/// Control plane settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listeners: Vec<ListenAddr>,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub mount_point: String,
    pub user_db: String,
    /// Root of the static file fallback
    pub recording_dir: PathBuf,
}

impl ServerConfig {
    pub fn needs_tls(&self) -> bool {
        self.listeners.iter().any(ListenAddr::is_tls)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub dir: Option<PathBuf>,
    pub level: String,
    pub force_mkdirs: bool,
}

/// Fully resolved settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub pipeline: PipelineConfig,
    pub server: ServerConfig,
    pub lease: LeasePolicy,
    pub logging: LogConfig,
    pub simulate_graph: bool,
    /// Configuration file that was read, if it existed
    pub config_file: Option<PathBuf>,
}

/// Read a TOML configuration file; a missing file is not an error
pub fn read_config_file(path: &Path) -> Result<Option<FileConfig>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file = toml::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(Some(file))
}

fn rebase(base: Option<&Path>, path: PathBuf) -> PathBuf {
    match base {
        Some(base) if path.is_relative() => base.join(path),
        _ => path,
    }
}

fn rebase_location(base: Option<&Path>, location: String) -> String {
    if location.contains("://") {
        return location;
    }
    rebase(base, PathBuf::from(location))
        .to_string_lossy()
        .into_owned()
}

fn validate_mount_point(mount_point: &str) -> Result<(), ConfigError> {
    let reserved = ["/status", "/index.html"];
    if !mount_point.starts_with('/') || mount_point.len() < 2 {
        return Err(ConfigError::Invalid(format!(
            "mount point {mount_point:?} must be an absolute path below /"
        )));
    }
    if reserved.contains(&mount_point) {
        return Err(ConfigError::Invalid(format!(
            "mount point {mount_point} collides with a built-in route"
        )));
    }
    if mount_point.contains(['{', '}', '*']) {
        return Err(ConfigError::Invalid(format!(
            "mount point {mount_point} must not contain route captures"
        )));
    }
    Ok(())
}

impl Settings {
    /// Resolve settings from the command line and the file it points at
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        match read_config_file(&cli.config)? {
            Some(file) => {
                let base = cli
                    .config
                    .parent()
                    .filter(|parent| !parent.as_os_str().is_empty());
                let mut settings = Self::resolve(cli, file, base)?;
                settings.config_file = Some(cli.config.clone());
                Ok(settings)
            }
            None => Self::resolve(cli, FileConfig::default(), None),
        }
    }

    /// Merge command line, file and defaults, then validate
    pub fn resolve(
        cli: &Cli,
        file: FileConfig,
        base: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let force_mkdirs = cli.force_mkdirs.or(file.force_mkdirs).unwrap_or(true);

        let recording_path = cli
            .recording_path
            .clone()
            .or_else(|| file.recording_path.map(|p| rebase(base, p)))
            .unwrap_or_else(|| PathBuf::from(defaults::RECORDING_PATH));

        let pipeline = PipelineConfig {
            width: cli
                .video_width
                .or(file.video_width)
                .unwrap_or(defaults::VIDEO_WIDTH),
            height: cli
                .video_height
                .or(file.video_height)
                .unwrap_or(defaults::VIDEO_HEIGHT),
            framerate: Framerate::new(
                cli.video_fps_numerator
                    .or(file.video_fps_numerator)
                    .unwrap_or(defaults::VIDEO_FPS_NUMERATOR),
                cli.video_fps_denominator
                    .or(file.video_fps_denominator)
                    .unwrap_or(defaults::VIDEO_FPS_DENOMINATOR),
            ),
            video_source: cli.video_source.clone().or(file.video_source),
            recording_path: recording_path.clone(),
            segment_duration: Duration::from_secs(
                cli.recording_segment_duration
                    .or(file.recording_segment_duration)
                    .unwrap_or(defaults::RECORDING_SEGMENT_SECS),
            ),
            recording_max_size_mb: cli
                .recording_max_size
                .or(file.recording_max_size)
                .unwrap_or(defaults::RECORDING_MAX_SIZE_MB),
            force_mkdirs,
        };

        if pipeline.width == 0 || pipeline.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "video size {}x{} must be positive",
                pipeline.width, pipeline.height
            )));
        }
        if pipeline.framerate.numerator <= 0 || pipeline.framerate.denominator <= 0 {
            return Err(ConfigError::Invalid(format!(
                "framerate {} must be positive",
                pipeline.framerate
            )));
        }
        if pipeline.segment_duration.is_zero() {
            return Err(ConfigError::Invalid(
                "recording segment duration must be positive".into(),
            ));
        }

        let listen_urls = if !cli.listen.is_empty() {
            cli.listen.clone()
        } else {
            file.listen
                .unwrap_or_else(|| vec![defaults::LISTEN.to_string()])
        };
        let listeners = parse_listeners(&listen_urls);
        if listeners.is_empty() {
            return Err(ConfigError::Invalid("no valid listen address".into()));
        }

        let mount_point = cli
            .mount_point
            .clone()
            .or(file.mount_point)
            .unwrap_or_else(|| defaults::MOUNT_POINT.to_string());
        validate_mount_point(&mount_point)?;

        let server = ServerConfig {
            listeners,
            tls_cert: cli
                .tls_cert
                .clone()
                .or_else(|| file.tls_cert.map(|p| rebase(base, p)))
                .unwrap_or_else(|| PathBuf::from(defaults::TLS_CERT)),
            tls_key: cli
                .tls_key
                .clone()
                .or_else(|| file.tls_key.map(|p| rebase(base, p)))
                .unwrap_or_else(|| PathBuf::from(defaults::TLS_KEY)),
            mount_point,
            user_db: cli
                .user_db
                .clone()
                .or_else(|| file.user_db.map(|l| rebase_location(base, l)))
                .unwrap_or_else(|| defaults::USER_DB.to_string()),
            recording_dir: recording_path,
        };

        let lease = LeasePolicy {
            max_lease: lease::MAX_LEASE,
            max_leases_per_user: cli
                .max_leases_per_user
                .or(file.max_leases_per_user)
                .unwrap_or(lease::DEFAULT_MAX_LEASES_PER_USER),
        };

        let logging = LogConfig {
            dir: cli
                .log_dir
                .clone()
                .or_else(|| file.log_dir.map(|p| rebase(base, p))),
            level: cli
                .log_level
                .clone()
                .or(file.log_level)
                .unwrap_or_else(|| defaults::LOG_LEVEL.to_string()),
            force_mkdirs,
        };

        Ok(Self {
            pipeline,
            server,
            lease,
            logging,
            simulate_graph: cli.simulate_graph,
            config_file: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("pitv-server").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_apply_without_file_or_flags() {
        let settings = Settings::resolve(&cli(&[]), FileConfig::default(), None).unwrap();
        assert_eq!(settings.pipeline, PipelineConfig::default());
        assert_eq!(settings.server.mount_point, "/camera");
        assert_eq!(settings.server.listeners.len(), 1);
        assert!(!settings.server.needs_tls());
        assert_eq!(settings.lease.max_leases_per_user, 2);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn command_line_wins_over_file() {
        let file: FileConfig = toml::from_str(
            r#"
            video-width = 1920
            video-height = 1080
            mount-point = "/from-file"
            recording-path = "clips"
            "#,
        )
        .unwrap();
        let settings = Settings::resolve(
            &cli(&["--video-width", "1280", "--recording-max-size", "-1"]),
            file,
            Some(Path::new("/etc/pitv")),
        )
        .unwrap();

        assert_eq!(settings.pipeline.width, 1280);
        assert_eq!(settings.pipeline.height, 1080);
        assert_eq!(settings.pipeline.recording_max_size_mb, -1);
        assert_eq!(settings.server.mount_point, "/from-file");
        assert_eq!(
            settings.pipeline.recording_path,
            PathBuf::from("/etc/pitv/clips")
        );
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        assert!(toml::from_str::<FileConfig>("video-depth = 3").is_err());
    }

    #[test]
    fn mount_point_must_not_shadow_builtin_routes() {
        for bad in ["/status", "camera", "/", "/{id}"] {
            assert!(
                Settings::resolve(&cli(&["--mount-point", bad]), FileConfig::default(), None)
                    .is_err(),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn https_listener_requires_tls() {
        let settings = Settings::resolve(
            &cli(&["--listen", "https://0.0.0.0:5443", "--listen", "http://0.0.0.0:5000"]),
            FileConfig::default(),
            None,
        )
        .unwrap();
        assert!(settings.server.needs_tls());
        assert_eq!(settings.server.tls_cert, PathBuf::from("server.crt"));
    }

    #[test]
    fn structural_changes_require_rebuild() {
        let base = PipelineConfig::default();
        let mut quota_only = base.clone();
        quota_only.recording_max_size_mb = 1;
        assert!(!base.requires_rebuild(&quota_only));

        let mut resized = base.clone();
        resized.width = 320;
        assert!(base.requires_rebuild(&resized));
    }
}
