pub(crate) mod command;
pub(crate) mod control;
pub(crate) mod devices;
pub(crate) mod output;
pub(crate) mod ui;
pub(crate) mod update;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;

pub use self::command::{Args, Command, FakeArgs, RunOptions};
pub use self::control::{
    BrightnessArgs, RestartArgs, ScreenAction, ScreenArgs, VariableAction, VariableArgs,
};
pub use self::devices::InfoArgs;
pub use self::update::{KindArg, UpdateArgs};

/// How command results are written to stdout.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Tables and coloured text for people.
    Pretty,
    /// Pretty-printed JSON for scripts.
    Json,
}

/// Log verbosity for the `te` crate's own events.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub(crate) fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// Which transports a fan-out command reaches, as typed on the command line.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, ValueEnum)]
pub enum TargetArg {
    Hid,
    Can,
    #[default]
    All,
}

impl From<TargetArg> for crate::handlers::TargetFilter {
    fn from(value: TargetArg) -> Self {
        match value {
            TargetArg::Hid => Self::Hid,
            TargetArg::Can => Self::Can,
            TargetArg::All => Self::All,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::handlers::TargetFilter;

    #[rstest]
    #[case::error(LogLevel::Error, LevelFilter::ERROR)]
    #[case::info(LogLevel::Info, LevelFilter::INFO)]
    #[case::trace(LogLevel::Trace, LevelFilter::TRACE)]
    fn log_level_maps_to_filter(#[case] level: LogLevel, #[case] expected: LevelFilter) {
        assert_eq!(expected, level.as_level_filter());
    }

    #[rstest]
    #[case::hid(TargetArg::Hid, TargetFilter::Hid)]
    #[case::can(TargetArg::Can, TargetFilter::Can)]
    #[case::all(TargetArg::All, TargetFilter::All)]
    fn target_arg_maps_to_filter(#[case] arg: TargetArg, #[case] expected: TargetFilter) {
        assert_eq!(expected, TargetFilter::from(arg));
    }
}
