use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Parallel packet-analysis core for traffic measurement")]
pub struct Args {
    /// Path to the YAML configuration file
    #[clap(short = 'c', long = "config", value_name = "FILE")]
    pub config: PathBuf,

    /// Where log output goes
    #[clap(
        value_enum,
        short = 'l',
        long = "log",
        value_name = "MODE",
        default_value_t = LogMode::Terminal
    )]
    pub log_mode: LogMode,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    #[value(name = "terminal", alias = "stderr")]
    Terminal,
    #[value(name = "file")]
    File,
    #[value(name = "syslog")]
    Syslog,
    #[value(name = "disabled", alias = "off", alias = "none")]
    Disabled,
}

impl Display for LogMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let value = self.to_possible_value().unwrap();
        f.write_str(value.get_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_flag_is_mandatory() {
        assert!(Args::try_parse_from(["tracemill"]).is_err());
        assert!(Args::try_parse_from(["tracemill", "-l", "file"]).is_err());
    }

    #[test]
    fn log_mode_defaults_to_terminal() {
        let args = Args::try_parse_from(["tracemill", "-c", "run.yaml"]).unwrap();
        assert_eq!(args.log_mode, LogMode::Terminal);
        assert_eq!(args.config, PathBuf::from("run.yaml"));
    }

    #[test]
    fn log_mode_aliases_are_accepted() {
        for (value, expected) in [
            ("stderr", LogMode::Terminal),
            ("terminal", LogMode::Terminal),
            ("file", LogMode::File),
            ("syslog", LogMode::Syslog),
            ("disabled", LogMode::Disabled),
            ("off", LogMode::Disabled),
            ("none", LogMode::Disabled),
        ] {
            let args = Args::try_parse_from(["tracemill", "-c", "run.yaml", "-l", value]).unwrap();
            assert_eq!(args.log_mode, expected, "logmode {value}");
        }
    }

    #[test]
    fn unknown_log_mode_is_rejected() {
        assert!(Args::try_parse_from(["tracemill", "-c", "run.yaml", "-l", "chartreuse"]).is_err());
    }

    #[test]
    fn unknown_options_are_rejected() {
        assert!(Args::try_parse_from(["tracemill", "-c", "run.yaml", "--frobnicate"]).is_err());
    }
}
