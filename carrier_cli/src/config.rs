use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Carrier datagram dispatcher.
///
/// Sends notifications from several engines over shared UDP transports, and answers them.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Config {
    /// Path to the configuration file. The default is `$HOME/.carrier/config.yml`.
    #[arg(long = "config-file", short = 'c', env = "CARRIER_CONFIG")]
    pub config_file: Option<PathBuf>,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Write a starter configuration file with two engines and two targets.
    #[command(name = "init")]
    Init {
        /// Overwrite an existing configuration file.
        #[arg(long = "force", short = 'f', default_value_t = false)]
        force: bool,
    },
    /// List the configured targets, and the engine that serves each one.
    #[command(name = "targets", alias = "ls")]
    Targets,
    /// Send a notification to every configured target and wait for the outcomes.
    #[command(name = "notify", alias = "send")]
    Notify(NotifyCommand),
    /// Echo every datagram received on the configured transports until interrupted.
    #[command(name = "respond", alias = "serve")]
    Respond,
}

#[derive(Debug, Args)]
pub struct NotifyCommand {
    /// The payload to send, as text.
    #[arg(long = "message", short = 'm', default_value = "coldStart", conflicts_with = "hex")]
    pub message: String,
    /// The payload to send, hex encoded.
    #[arg(long = "hex")]
    pub hex: Option<String>,
    /// Timeout applied to targets that do not configure their own, in milliseconds.
    #[arg(long = "timeout", short = 't', default_value_t = 3000)]
    pub timeout_ms: u64,
}

impl NotifyCommand {
    pub fn payload(&self) -> Result<Vec<u8>, hex::FromHexError> {
        match &self.hex {
            Some(h) => hex::decode(h),
            None => Ok(self.message.as_bytes().to_vec()),
        }
    }
}

pub struct GlobalOptions {
    pub config_file: Option<PathBuf>,
}

impl Config {
    pub fn to_parts(self) -> (GlobalOptions, CliCommand) {
        let global = GlobalOptions { config_file: self.config_file };
        (global, self.command)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_notify() {
        let config = Config::parse_from(["carrier", "-c", "/tmp/c.yml", "notify", "--hex", "deadbeef", "-t", "50"]);
        let (global, command) = config.to_parts();
        assert_eq!(global.config_file, Some(PathBuf::from("/tmp/c.yml")));
        match command {
            CliCommand::Notify(cmd) => {
                assert_eq!(cmd.payload().unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
                assert_eq!(cmd.timeout_ms, 50);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn text_payload_by_default() {
        let config = Config::parse_from(["carrier", "notify"]);
        match config.command {
            CliCommand::Notify(cmd) => assert_eq!(cmd.payload().unwrap(), b"coldStart".to_vec()),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
