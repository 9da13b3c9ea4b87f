//! Configuration types for vault-walker
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration with validation
//! - Vault address parsing
//! - Ignore rules shared by dump and import

use crate::error::ConfigError;
use crate::output::OutputTarget;
use crate::path;
use crate::walker::retry::{RetryPolicy, DEFAULT_RETRIES};
use clap::{Parser, Subcommand, ValueEnum};
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

/// Maximum reasonable worker count
const MAX_WORKERS: usize = 512;

/// Minimum queue size
const MIN_QUEUE_SIZE: usize = 10;

/// Default Vault address when neither flag nor env var is set
pub const DEFAULT_VAULT_ADDR: &str = "https://127.0.0.1:8200";

/// Default dump destination directory
pub const DEFAULT_DUMP_DIR: &str = "/tmp/vault-dump";

/// Dump file name (without extension) when `-f` is not given
pub const DEFAULT_DUMP_FILENAME: &str = "vault-dump";

/// Seconds the purge danger banner stays up before continuing
pub const DEFAULT_PURGE_PAUSE_SECS: u64 = 10;

/// Regex for parsing Vault addresses
static VAULT_ADDR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // Matches: http(s)://host[:port][/]
    Regex::new(r"^(https?)://([^/:\s]+)(?::(\d+))?/?$").expect("Invalid Vault address regex")
});

/// Concurrent dump, import and purge for Vault KV trees
#[derive(Parser, Debug, Clone)]
#[command(
    name = "vault-walker",
    version,
    about = "Concurrent dump, import and purge for Vault KV trees",
    long_about = "Walks Vault secret trees with a pool of threads.\n\n\
                  dump exports every secret under one or more paths to a JSON file,\n\
                  import writes a dump back (v1 and v2 KV mounts, policies, database configs),\n\
                  purge recursively deletes paths and non-builtin policies.",
    after_help = "EXAMPLES:\n    \
        vault-walker dump -p secret/app,kv/team -d ./backup\n    \
        vault-walker dump -p secret/app -o stdout\n    \
        vault-walker import ./backup/vault-dump.json --retries 10\n    \
        vault-walker --ignore-paths secret/app/tmp import app.json\n    \
        vault-walker purge secret/old,sys/policy --force"
)]
pub struct CliArgs {
    /// Subcommand
    #[command(subcommand)]
    pub command: Command,

    /// Vault server address
    #[arg(long, env = "VAULT_ADDR", default_value = DEFAULT_VAULT_ADDR, global = true, value_name = "URL")]
    pub vault_addr: String,

    /// Vault token
    #[arg(long, env = "VAULT_TOKEN", global = true, hide_env_values = true, value_name = "TOKEN")]
    pub vault_token: Option<String>,

    /// Skip paths ending with any of these suffixes (comma separated)
    #[arg(long, value_delimiter = ',', global = true, value_name = "SUFFIX,...")]
    pub ignore_keys: Vec<String>,

    /// Skip paths starting with any of these prefixes (comma separated)
    #[arg(long, value_delimiter = ',', global = true, value_name = "PREFIX,...")]
    pub ignore_paths: Vec<String>,

    /// Number of worker threads
    #[arg(
        short = 'w',
        long,
        default_value_t = default_workers(),
        global = true,
        value_name = "NUM"
    )]
    pub workers: usize,

    /// Work queue size (controls memory usage)
    #[arg(long, default_value = "1000", global = true, value_name = "NUM")]
    pub queue_size: usize,

    /// HTTP request timeout in seconds
    #[arg(long, default_value = "30", global = true, value_name = "SECS")]
    pub timeout: u64,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Export every secret under one or more paths
    Dump {
        /// Paths to dump (comma separated)
        #[arg(short = 'p', long, value_delimiter = ',', required = true, value_name = "PATH,...")]
        paths: Vec<String>,

        /// Destination directory for file output
        #[arg(short = 'd', long, default_value = DEFAULT_DUMP_DIR, value_name = "DIR")]
        dest: PathBuf,

        /// Output file name without extension
        #[arg(short = 'f', long, default_value = DEFAULT_DUMP_FILENAME, value_name = "NAME")]
        filename: String,

        /// Where to write the result
        #[arg(short = 'o', long, value_enum, default_value = "file")]
        output: OutputKind,
    },

    /// Write a dump file back to Vault
    Import {
        /// Dump file to import
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Retry failed writes indefinitely
        #[arg(long)]
        brute: bool,

        /// Retries per entry after the first attempt
        #[arg(long, default_value_t = DEFAULT_RETRIES, conflicts_with = "brute", value_name = "NUM")]
        retries: u32,

        /// Directory for the failure report
        #[arg(long, default_value = ".", value_name = "DIR")]
        failures_dir: PathBuf,
    },

    /// Recursively delete paths (and policies via sys/policy)
    Purge {
        /// Paths to delete (comma separated)
        #[arg(value_delimiter = ',', required = true, value_name = "PATH,...")]
        paths: Vec<String>,

        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,

        /// Seconds to pause after the warning banner
        #[arg(long, default_value_t = DEFAULT_PURGE_PAUSE_SECS, value_name = "SECS")]
        pause: u64,
    },
}

/// Dump destination kind
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    File,
    Stdout,
}

fn default_workers() -> usize {
    // Vault calls are I/O bound
    num_cpus::get() * 2
}

/// Parsed Vault address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultAddr {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
}

impl VaultAddr {
    /// Parse `http(s)://host[:port]`
    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        let address = address.trim();
        let caps = VAULT_ADDR_REGEX
            .captures(address)
            .ok_or_else(|| ConfigError::InvalidAddress {
                address: address.to_string(),
                reason: "Expected format: http(s)://host[:port]".into(),
            })?;

        let port = match caps.get(3) {
            Some(m) => Some(m.as_str().parse::<u16>().map_err(|_| ConfigError::InvalidAddress {
                address: address.to_string(),
                reason: format!("Invalid port '{}'", m.as_str()),
            })?),
            None => None,
        };

        Ok(Self {
            scheme: caps[1].to_string(),
            host: caps[2].to_string(),
            port,
        })
    }

    /// Base URL without trailing slash
    pub fn base_url(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for VaultAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(p) => write!(f, "{}://{}:{}", self.scheme, self.host, p),
            None => write!(f, "{}://{}", self.scheme, self.host),
        }
    }
}

/// Paths excluded from a run before any remote I/O against them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreRules {
    /// Excluded when the path starts with any of these
    pub path_prefixes: Vec<String>,

    /// Excluded when the path ends with any of these
    pub key_suffixes: Vec<String>,
}

impl IgnoreRules {
    pub fn new(path_prefixes: Vec<String>, key_suffixes: Vec<String>) -> Self {
        let clean = |v: Vec<String>| -> Vec<String> {
            v.into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };
        Self {
            path_prefixes: clean(path_prefixes)
                .iter()
                .map(|p| path::ensure_no_trailing_slash(&path::ensure_no_leading_slash(p)))
                .collect(),
            key_suffixes: clean(key_suffixes),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.path_prefixes.is_empty() && self.key_suffixes.is_empty()
    }

    /// Check if a leaf path is excluded
    pub fn matches(&self, path: &str) -> bool {
        self.matches_prefix(path) || self.key_suffixes.iter().any(|k| path.ends_with(k.as_str()))
    }

    /// Check if a whole branch is excluded (prefix rules only)
    pub fn matches_prefix(&self, path: &str) -> bool {
        self.path_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }
}

/// Connection settings
#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub address: VaultAddr,
    pub token: String,
    pub timeout: Duration,
}

/// Dump settings
#[derive(Debug, Clone)]
pub struct DumpSettings {
    pub roots: Vec<String>,
    pub output: OutputTarget,
}

/// Import settings
#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub input: PathBuf,
    pub retry: RetryPolicy,
    pub failures_dir: PathBuf,
}

/// Purge settings
#[derive(Debug, Clone)]
pub struct PurgeSettings {
    pub roots: Vec<String>,
    pub force: bool,
    pub pause: Duration,
}

/// Operation selected on the command line
#[derive(Debug, Clone)]
pub enum Operation {
    Dump(DumpSettings),
    Import(ImportSettings),
    Purge(PurgeSettings),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Dump(_) => "dump",
            Operation::Import(_) => "import",
            Operation::Purge(_) => "purge",
        }
    }
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub vault: VaultSettings,

    pub operation: Operation,

    /// Ignore rules (always empty for purge)
    pub ignore: IgnoreRules,

    /// Number of worker threads
    pub worker_count: usize,

    /// Work queue capacity
    pub queue_size: usize,

    /// Show progress indicator
    pub show_progress: bool,

    /// Verbose logging
    pub verbose: bool,
}

impl RunConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        let address = VaultAddr::parse(&args.vault_addr)?;

        let token = args
            .vault_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingToken)?
            .to_string();

        // Validate worker count
        if args.workers == 0 || args.workers > MAX_WORKERS {
            return Err(ConfigError::InvalidWorkerCount {
                count: args.workers,
                max: MAX_WORKERS,
            });
        }

        // Validate queue size
        if args.queue_size < MIN_QUEUE_SIZE {
            return Err(ConfigError::InvalidQueueSize {
                size: args.queue_size,
                min: MIN_QUEUE_SIZE,
            });
        }

        let ignore = IgnoreRules::new(args.ignore_paths.clone(), args.ignore_keys.clone());

        let operation = match args.command {
            Command::Dump {
                paths,
                dest,
                filename,
                output,
            } => {
                let roots = clean_paths(&paths)?;
                let output = match output {
                    OutputKind::Stdout => OutputTarget::Stdout,
                    OutputKind::File => {
                        let filename = match path::sanitize(&filename) {
                            f if f.is_empty() => DEFAULT_DUMP_FILENAME.to_string(),
                            f => f,
                        };
                        if dest.as_os_str().is_empty() {
                            return Err(ConfigError::InvalidOutputPath {
                                path: dest,
                                reason: "Destination directory is empty".to_string(),
                            });
                        }
                        OutputTarget::File { dir: dest, filename }
                    }
                };
                Operation::Dump(DumpSettings { roots, output })
            }
            Command::Import {
                file,
                brute,
                retries,
                failures_dir,
            } => {
                if !file.is_file() {
                    return Err(ConfigError::InvalidInput {
                        path: file,
                        reason: "File does not exist".to_string(),
                    });
                }
                let retry = if brute {
                    RetryPolicy::unbounded()
                } else {
                    RetryPolicy::new(retries)
                };
                Operation::Import(ImportSettings {
                    input: file,
                    retry,
                    failures_dir,
                })
            }
            Command::Purge { paths, force, pause } => {
                // ensure we don't silently accept flags we aren't going to honor
                if !args.ignore_keys.is_empty() {
                    return Err(ConfigError::UnsupportedFlag {
                        flag: "ignore-keys",
                        command: "purge",
                    });
                }
                if !args.ignore_paths.is_empty() {
                    return Err(ConfigError::UnsupportedFlag {
                        flag: "ignore-paths",
                        command: "purge",
                    });
                }
                Operation::Purge(PurgeSettings {
                    roots: clean_paths(&paths)?,
                    force,
                    pause: Duration::from_secs(pause),
                })
            }
        };

        Ok(Self {
            vault: VaultSettings {
                address,
                token,
                timeout: Duration::from_secs(args.timeout.max(1)),
            },
            operation,
            ignore,
            worker_count: args.workers,
            queue_size: args.queue_size,
            show_progress: !args.quiet,
            verbose: args.verbose,
        })
    }
}

/// Sanitize user paths, dropping empties
fn clean_paths(paths: &[String]) -> Result<Vec<String>, ConfigError> {
    let roots: Vec<String> = paths
        .iter()
        .map(|p| path::sanitize(p))
        .filter(|p| !p.is_empty())
        .collect();
    if roots.is_empty() {
        return Err(ConfigError::NoPaths);
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> CliArgs {
        let mut full = vec!["vault-walker", "--vault-token", "t0k3n"];
        full.extend_from_slice(argv);
        CliArgs::try_parse_from(full).unwrap()
    }

    #[test]
    fn test_parse_vault_addr() {
        let addr = VaultAddr::parse("https://vault.local:8200").unwrap();
        assert_eq!(addr.scheme, "https");
        assert_eq!(addr.host, "vault.local");
        assert_eq!(addr.port, Some(8200));
        assert_eq!(addr.base_url(), "https://vault.local:8200");

        let addr = VaultAddr::parse("http://10.0.0.5/").unwrap();
        assert_eq!(addr.port, None);
        assert_eq!(addr.to_string(), "http://10.0.0.5");
    }

    #[test]
    fn test_parse_invalid_addr() {
        assert!(VaultAddr::parse("vault.local:8200").is_err());
        assert!(VaultAddr::parse("ftp://vault").is_err());
        assert!(VaultAddr::parse("https://vault:99999").is_err());
    }

    #[test]
    fn test_ignore_rules() {
        let rules = IgnoreRules::new(
            vec!["/secret/tmp/".into(), " ".into()],
            vec!["_old".into()],
        );
        assert_eq!(rules.path_prefixes, vec!["secret/tmp".to_string()]);
        assert!(rules.matches("secret/tmp/a"));
        assert!(rules.matches("secret/app/key_old"));
        assert!(!rules.matches("secret/app/key"));
        assert!(rules.matches_prefix("secret/tmpdir"));
        assert!(!rules.matches_prefix("secret/app/key_old"));
        assert!(IgnoreRules::default().is_empty());
    }

    #[test]
    fn test_dump_config() {
        let args = parse(&["dump", "-p", "/secret/app/, kv/team", "-d", "out"]);
        let config = RunConfig::from_args(args).unwrap();
        let Operation::Dump(dump) = config.operation else {
            panic!("expected dump");
        };
        assert_eq!(dump.roots, vec!["secret/app", "kv/team"]);
        assert_eq!(
            dump.output,
            OutputTarget::File {
                dir: PathBuf::from("out"),
                filename: DEFAULT_DUMP_FILENAME.into()
            }
        );

        let args = parse(&["dump", "-p", "secret/app", "-f", "/teams/app/"]);
        let Operation::Dump(dump) = RunConfig::from_args(args).unwrap().operation else {
            panic!("expected dump");
        };
        assert_eq!(
            dump.output,
            OutputTarget::File {
                dir: PathBuf::from(DEFAULT_DUMP_DIR),
                filename: "teams/app".into()
            }
        );
    }

    #[test]
    fn test_dump_stdout() {
        let args = parse(&["dump", "-p", "secret", "-o", "stdout"]);
        let config = RunConfig::from_args(args).unwrap();
        assert!(matches!(
            config.operation,
            Operation::Dump(DumpSettings {
                output: OutputTarget::Stdout,
                ..
            })
        ));
    }

    #[test]
    fn test_missing_token() {
        let args = CliArgs::try_parse_from(["vault-walker", "--vault-token", " ", "dump", "-p", "secret"]).unwrap();
        assert!(matches!(RunConfig::from_args(args), Err(ConfigError::MissingToken)));
    }

    #[test]
    fn test_purge_rejects_ignore_flags() {
        let args = parse(&["--ignore-keys", "x", "purge", "secret/a"]);
        assert!(matches!(
            RunConfig::from_args(args),
            Err(ConfigError::UnsupportedFlag { flag: "ignore-keys", .. })
        ));

        let args = parse(&["purge", "secret/a,sys/policy", "--force", "--pause", "0"]);
        let config = RunConfig::from_args(args).unwrap();
        let Operation::Purge(purge) = config.operation else {
            panic!("expected purge");
        };
        assert_eq!(purge.roots, vec!["secret/a", "sys/policy"]);
        assert!(purge.force);
        assert_eq!(purge.pause, Duration::ZERO);
    }

    #[test]
    fn test_import_retry_policy() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();

        let config = RunConfig::from_args(parse(&["import", path])).unwrap();
        let Operation::Import(import) = config.operation else {
            panic!("expected import");
        };
        assert_eq!(import.retry.max_attempts, DEFAULT_RETRIES);

        let config = RunConfig::from_args(parse(&["import", path, "--brute"])).unwrap();
        let Operation::Import(import) = config.operation else {
            panic!("expected import");
        };
        assert_eq!(import.retry.max_attempts, 0);

        assert!(matches!(
            RunConfig::from_args(parse(&["import", "/nonexistent/dump.json"])),
            Err(ConfigError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_invalid_workers() {
        let args = parse(&["-w", "0", "dump", "-p", "secret"]);
        assert!(matches!(
            RunConfig::from_args(args),
            Err(ConfigError::InvalidWorkerCount { count: 0, .. })
        ));
    }
}
