use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};

pub const USAGE: &str = "\
usage: aq-forecast <command> [options]

commands:
  train    [--entity ID]                  train one entity, or every entity the plan selects
  predict  --entity ID [--as-of RFC3339]  forecast the next horizon
  evaluate [--entity ID] [--now RFC3339]  score elapsed predictions and apply the retrain policy
  plan     [--now RFC3339]                show which entities would train
  status   [--entity ID]                  show model lifecycle per entity
  rollback --entity ID --version VERSION  point current at an older retained version";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Train {
        entity: Option<String>,
    },
    Predict {
        entity: String,
        as_of: Option<DateTime<Utc>>,
    },
    Evaluate {
        entity: Option<String>,
        now: Option<DateTime<Utc>>,
    },
    Plan {
        now: Option<DateTime<Utc>>,
    },
    Status {
        entity: Option<String>,
    },
    Rollback {
        entity: String,
        version: String,
    },
    Help,
}

#[derive(Default)]
struct Flags {
    entity: Option<String>,
    at: Option<DateTime<Utc>>,
    version: Option<String>,
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| anyhow!("invalid timestamp '{raw}': {e}"))
}

fn parse_flags(args: &[String], allowed: &[&str]) -> Result<Flags> {
    let mut flags = Flags::default();
    let mut it = args.iter();
    while let Some(flag) = it.next() {
        let flag = flag.as_str();
        if !allowed.contains(&flag) {
            bail!("unexpected argument '{flag}'\n\n{USAGE}");
        }
        let value = it
            .next()
            .ok_or_else(|| anyhow!("{flag} requires a value"))?;
        match flag {
            "--entity" => flags.entity = Some(value.clone()),
            "--as-of" | "--now" => flags.at = Some(parse_time(value)?),
            _ => flags.version = Some(value.clone()),
        }
    }
    Ok(flags)
}

/// Parse arguments after the program name.
pub fn parse_cli_command(args: &[String]) -> Result<CliCommand> {
    let Some((command, rest)) = args.split_first() else {
        return Ok(CliCommand::Help);
    };
    match command.as_str() {
        "train" => {
            let f = parse_flags(rest, &["--entity"])?;
            Ok(CliCommand::Train { entity: f.entity })
        }
        "predict" => {
            let f = parse_flags(rest, &["--entity", "--as-of"])?;
            let entity = f
                .entity
                .ok_or_else(|| anyhow!("predict requires --entity"))?;
            Ok(CliCommand::Predict {
                entity,
                as_of: f.at,
            })
        }
        "evaluate" => {
            let f = parse_flags(rest, &["--entity", "--now"])?;
            Ok(CliCommand::Evaluate {
                entity: f.entity,
                now: f.at,
            })
        }
        "plan" => {
            let f = parse_flags(rest, &["--now"])?;
            Ok(CliCommand::Plan { now: f.at })
        }
        "status" => {
            let f = parse_flags(rest, &["--entity"])?;
            Ok(CliCommand::Status { entity: f.entity })
        }
        "rollback" => {
            let f = parse_flags(rest, &["--entity", "--version"])?;
            match (f.entity, f.version) {
                (Some(entity), Some(version)) => Ok(CliCommand::Rollback { entity, version }),
                _ => bail!("rollback requires --entity and --version"),
            }
        }
        "help" | "-h" | "--help" => Ok(CliCommand::Help),
        other => bail!("unknown command '{other}'\n\n{USAGE}"),
    }
}
