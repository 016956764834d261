use clap::Parser;
use std::path::PathBuf;

/// Run merchant backend operations against trusted exchanges
#[derive(Parser, Debug)]
#[command(name = "taler-merchant-backend")]
#[command(about = "Run merchant backend operations against trusted exchanges", long_about = None)]
pub struct CliArgs {
    /// Configuration file (TOML)
    #[arg(long = "config", value_name = "FILE", help = "Path to the TOML configuration file")]
    pub config: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(
        long = "log-level",
        value_name = "LEVEL",
        default_value = "info",
        help = "Log filter: error, warn, info, debug or trace"
    )]
    pub log_level: String,

    /// Override of the exchange timeout from the configuration
    #[arg(
        long = "timeout",
        value_name = "SECS",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds a request may wait on exchanges"
    )]
    pub timeout: Option<u64>,

    /// JSON-lines file with one operation per line
    #[arg(value_name = "REQUESTS", help = "Path to the JSON-lines request file")]
    pub requests: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::defaults(&["program", "--config", "merchant.toml", "requests.jsonl"], "info", None)]
    #[case::debug_level(
        &["program", "--config", "merchant.toml", "--log-level", "debug", "requests.jsonl"],
        "debug",
        None
    )]
    #[case::timeout(
        &["program", "--timeout", "5", "--config", "merchant.toml", "requests.jsonl"],
        "info",
        Some(5)
    )]
    fn test_option_parsing(
        #[case] args: &[&str],
        #[case] log_level: &str,
        #[case] timeout: Option<u64>,
    ) {
        let parsed = CliArgs::try_parse_from(args).unwrap();
        assert_eq!(parsed.config, PathBuf::from("merchant.toml"));
        assert_eq!(parsed.requests, PathBuf::from("requests.jsonl"));
        assert_eq!(parsed.log_level, log_level);
        assert_eq!(parsed.timeout, timeout);
    }

    // Error handling tests
    #[rstest]
    #[case::missing_requests(&["program", "--config", "merchant.toml"])]
    #[case::missing_config(&["program", "requests.jsonl"])]
    #[case::zero_timeout(&["program", "--config", "m.toml", "--timeout", "0", "requests.jsonl"])]
    #[case::bad_timeout(&["program", "--config", "m.toml", "--timeout", "soon", "requests.jsonl"])]
    fn test_parsing_errors(#[case] args: &[&str]) {
        assert!(CliArgs::try_parse_from(args).is_err());
    }
}
