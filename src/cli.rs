use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::compiler::{compile_plan, plan, FunctionRegistry, Plan};
use crate::config::Config;
use crate::parser::parse_program;
use crate::simulator::Simulator;
use crate::types::{Program, Role, StatementKind};

#[derive(Parser)]
#[command(name = "fnfig")]
#[command(about = "fnfig - line-oriented workflow definitions", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides FNFIG_CONFIG_PATH)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and plan a workflow file, reporting syntax errors
    Check {
        /// Workflow file
        file: PathBuf,
    },

    /// Print the steps, transitions and required functions of a workflow
    Plan {
        /// Workflow file
        file: PathBuf,

        /// Output format
        #[arg(short = 'f', long = "format", value_enum, default_value = "json")]
        format: PlanFormat,
    },

    /// Dry-run a workflow with placeholder functions
    Simulate {
        /// Workflow file
        file: PathBuf,

        /// Initial result (JSON)
        #[arg(short = 'i', long = "input", default_value = "null")]
        input: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PlanFormat {
    Json,
    Toml,
}

/* ===================== Plan Report ===================== */

#[derive(Debug, Serialize)]
pub struct PlanReport {
    pub version: String,
    pub steps: Vec<StepReport>,
    pub functions: Vec<FunctionReport>,
}

#[derive(Debug, Serialize)]
pub struct StepReport {
    pub name: String,
    pub kind: String,
    pub next: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct FunctionReport {
    pub name: String,
    pub role: Role,
}

impl PlanReport {
    pub fn new(plan: &Plan) -> Self {
        let steps = plan
            .steps
            .iter()
            .map(|step| {
                let kind = match step.statement.as_ref().map(|s| &s.kind) {
                    Some(StatementKind::FunctionCall { .. }) => "call",
                    Some(StatementKind::Wait { .. }) => "wait",
                    Some(StatementKind::WaitUntil { .. }) => "wait_until",
                    Some(StatementKind::Loop { .. }) => "foreach",
                    None => "completed",
                };
                StepReport {
                    name: step.name.clone(),
                    kind: kind.to_string(),
                    next: plan.action_name(step.next).to_string(),
                    reduce: step
                        .fan_out
                        .map(|entry| plan.action_name(entry.reduce).to_string()),
                    retry_seconds: step.retry_seconds(),
                    line: step.statement.as_ref().map(|s| s.line),
                }
            })
            .collect();

        let functions = plan
            .required_functions()
            .into_iter()
            .map(|f| FunctionReport {
                name: f.name,
                role: f.role,
            })
            .collect();

        Self {
            version: plan.version.clone(),
            steps,
            functions,
        }
    }

    pub fn render(&self, format: PlanFormat) -> Result<String> {
        match format {
            PlanFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            PlanFormat::Toml => Ok(toml::to_string_pretty(self)?),
        }
    }
}

/* ===================== Commands ===================== */

/// Load configuration the way the CLI does, for callers that set up logging first
pub fn load_config(path: Option<PathBuf>) -> Result<Config> {
    Config::builder()
        .config_path(path)
        .build()
        .context("Failed to load configuration")
}

/// Run a parsed command line with configuration the caller already loaded
pub async fn run_cli_with_config(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Check { file } => {
            let program = read_program(&file)?;
            let plan = plan(&program)?;
            println!(
                "✓ {}: {} statement(s), {} function(s), version {}",
                file.display(),
                program.len(),
                plan.required_functions().len(),
                short_version(program.version())
            );
        }

        Commands::Plan { file, format } => {
            let program = read_program(&file)?;
            let plan = plan(&program)?;
            println!("{}", PlanReport::new(&plan).render(format)?);
        }

        Commands::Simulate { file, input } => {
            let initial: serde_json::Value =
                serde_json::from_str(&input).context("--input is not valid JSON")?;

            let program = read_program(&file)?;
            let plan = plan(&program)?;
            let registry = FunctionRegistry::stubs(&plan);
            let compiled = compile_plan(&plan, &registry)?;

            let report = Simulator::new(config.simulator)
                .run_traced(&compiled, initial)
                .await?;

            println!("Run {} finished after {} step(s)", report.run_id, report.visits.len());
            for visit in &report.visits {
                println!("  {} | {} | wait {}", visit.started_at, visit.step, visit.wait);
            }
            println!("\nResult:");
            println!("  {}", report.result);
        }
    }

    Ok(())
}

fn read_program(path: &Path) -> Result<Program> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let program =
        parse_program(&source).with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(program)
}

fn short_version(version: &str) -> &str {
    version.get(..12).unwrap_or(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_lines;

    fn sample_plan() -> Plan {
        let program = parse_lines(["init", "foreach items", "combine", "wait 3 until ready"]).unwrap();
        plan(&program).unwrap()
    }

    #[test]
    fn test_parse_plan_command() {
        let cli = Cli::parse_from(["fnfig", "--config", "fnfig.toml", "plan", "flow.fig", "-f", "toml"]);

        assert_eq!(cli.config, Some(PathBuf::from("fnfig.toml")));
        match cli.command {
            Commands::Plan { file, format } => {
                assert_eq!(file, PathBuf::from("flow.fig"));
                assert_eq!(format, PlanFormat::Toml);
            }
            _ => panic!("Expected plan command"),
        }
    }

    #[test]
    fn test_simulate_input_defaults_to_null() {
        let cli = Cli::parse_from(["fnfig", "simulate", "flow.fig"]);
        match cli.command {
            Commands::Simulate { input, .. } => assert_eq!(input, "null"),
            _ => panic!("Expected simulate command"),
        }
    }

    #[test]
    fn test_plan_report_describes_steps() {
        let report = PlanReport::new(&sample_plan());

        let kinds: Vec<&str> = report.steps.iter().map(|s| s.kind.as_str()).collect();
        assert_eq!(kinds, vec!["call", "foreach", "call", "wait_until", "completed"]);

        assert_eq!(report.steps[0].reduce.as_deref(), Some("_func_combine_2"));
        assert_eq!(report.steps[3].retry_seconds, Some(3));
        assert_eq!(report.steps[4].next, "end");
        assert_eq!(report.functions.len(), 4);
    }

    #[test]
    fn test_plan_report_renders_both_formats() {
        let report = PlanReport::new(&sample_plan());

        let json: serde_json::Value =
            serde_json::from_str(&report.render(PlanFormat::Json).unwrap()).unwrap();
        assert_eq!(json["functions"][0]["role"], "fan_out");
        assert_eq!(json["steps"][1]["name"], "_foreach_items_1");

        let toml = report.render(PlanFormat::Toml).unwrap();
        assert!(toml.contains("[[steps]]"));
        assert!(toml.contains("name = \"_wait_3_until_ready_3\""));
    }

    fn write_workflow(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("fnfig-cli-{}.fig", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).expect("write temp workflow");
        path
    }

    #[tokio::test]
    async fn test_commands_use_given_config() {
        let path = write_workflow("init\nforeach items\ncombine\nwait 1\n");
        let mut config = Config::default();
        config.simulator.pause = crate::config::PauseMode::Fixed;
        config.simulator.fixed_pause_ms = 1;

        for command in ["check", "plan", "simulate"] {
            let cli = Cli::parse_from(["fnfig", command, path.to_str().unwrap()]);
            run_cli_with_config(cli, config.clone()).await.unwrap();
        }
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_command_reports_syntax_error() {
        let path = write_workflow("init\nwait abc\n");
        let cli = Cli::parse_from(["fnfig", "check", path.to_str().unwrap()]);

        let err = run_cli_with_config(cli, Config::default()).await.unwrap_err();
        std::fs::remove_file(path).ok();

        assert!(format!("{:#}", err).contains("[wait abc]"));
    }

    #[test]
    fn test_short_version() {
        assert_eq!(short_version("abcdef0123456789"), "abcdef012345");
        assert_eq!(short_version("abc"), "abc");
    }
}
