//! Gatehouse 操作台
//!
//! 入口：初始化日志、加载配置、组装监管器并恢复运行目录，然后从 stdin 读取运维命令。

use std::path::PathBuf;

use anyhow::{bail, Context};
use gatehouse::config::{load_config, AppConfig};
use gatehouse::core::{LaunchRequest, RunSupervisor, SupervisorBuilder};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "commands:
  launch <entity_id> <goal> [--context {json}]
  status <run_id>
  pending <run_id>
  approve <run_id>
  reject <run_id> <feedback>
  abort <run_id>
  history <run_id>
  activity <entity_id>
  current <entity_id>
  help
  quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gatehouse::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    let supervisor = SupervisorBuilder::new(config)
        .build()
        .context("Failed to assemble supervisor")?;
    supervisor
        .restore()
        .await
        .context("Failed to restore run directory")?;

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "quit" | "exit") {
            break;
        }
        if let Err(e) = dispatch(&supervisor, line).await {
            println!("error: {e:#}");
        }
    }
    Ok(())
}

async fn dispatch(supervisor: &RunSupervisor, line: &str) -> anyhow::Result<()> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match command {
        "help" => println!("{HELP}"),
        "launch" => {
            let (entity_id, goal) = rest
                .split_once(' ')
                .context("usage: launch <entity_id> <goal>")?;
            let (goal, context) = split_context(goal)?;
            let run_id = supervisor
                .launch(LaunchRequest {
                    entity_id: entity_id.to_string(),
                    goal,
                    context,
                })
                .await?;
            println!("launched {run_id}");
        }
        "status" => print_json(&supervisor.status(arg(rest)?).await?)?,
        "pending" => print_json(&supervisor.peek_pending(arg(rest)?).await?)?,
        "approve" => print_json(&supervisor.approve(arg(rest)?).await?)?,
        "abort" => print_json(&supervisor.abort(arg(rest)?).await?)?,
        "reject" => {
            let (run_id, feedback) = rest
                .split_once(' ')
                .context("usage: reject <run_id> <feedback>")?;
            let new_run = supervisor.reject(run_id, feedback.trim()).await?;
            println!("branched {new_run}");
        }
        "history" => print_json(&supervisor.history(arg(rest)?).await?)?,
        "activity" => {
            for entry in supervisor.activity(arg(rest)?).await {
                println!(
                    "{} [{}] {}: {}",
                    entry.at.format("%H:%M:%S"),
                    entry.run_id,
                    entry.kind,
                    entry.message
                );
            }
        }
        "current" => match supervisor.current_run(arg(rest)?).await {
            Some(run_id) => println!("{run_id}"),
            None => println!("(none)"),
        },
        other => bail!("unknown command `{other}`, type `help`"),
    }
    Ok(())
}

fn arg(rest: &str) -> anyhow::Result<&str> {
    match rest.split_whitespace().next() {
        Some(a) => Ok(a),
        None => bail!("missing argument"),
    }
}

fn split_context(text: &str) -> anyhow::Result<(String, Map<String, Value>)> {
    let Some((goal, raw)) = text.split_once("--context") else {
        return Ok((text.trim().to_string(), Map::new()));
    };
    let context = match serde_json::from_str::<Value>(raw.trim()).context("invalid --context JSON")? {
        Value::Object(map) => map,
        _ => bail!("--context must be a JSON object"),
    };
    Ok((goal.trim().to_string(), context))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
