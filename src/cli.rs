use crate::build::{builder_for, BuildOptions, BuildResult};
use crate::config::project::{BuildSystem, Project};
use crate::config::types::{FuzzError, OutputFormat, RunConfiguration};
use crate::config::validator::validate_config;
use crate::core::coordinator::run_with_cancellation;
use crate::core::supervisor::{default_scratch_root, Supervisor, SupervisorOptions};
use crate::coverage::{CoverageGenerator, CoverageOptions};
use crate::kernel::signal::OsSignals;
use crate::report::handler::{reproducer_paths, ReportHandler};
use crate::sandbox::finder::{InstallDirFinder, ToolFinder};
use crate::sandbox::minijail::MinijailBuilder;
use crate::sandbox::policy::SandboxPolicyBuilder;
use crate::sandbox::wrapper::{exec_wrapped, WRAPPER_SUBCOMMAND};
use crate::utils::duration::parse_duration;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Show raw fuzzer output and debug logs
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a fuzz target and fuzz it
    Run(RunArgs),
    /// Build a fuzz target with coverage instrumentation and write an HTML report
    Coverage(CoverageArgs),
    /// Applies an environment and execs a command; runs inside the sandbox
    #[command(name = WRAPPER_SUBCOMMAND, hide = true)]
    ExecWrapper {
        /// Environment entry as KEY=VALUE
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        #[arg(long)]
        chdir: Option<PathBuf>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

/// Flags shared by `run` and `coverage`.
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Fuzz target name, or its path with --no-build
    pub target: String,
    /// Shell command that builds the fuzz target
    #[arg(long)]
    pub build_command: Option<String>,
    /// Seed corpus directory (repeatable)
    #[arg(short = 's', long = "seeds-dir", value_name = "DIR")]
    pub seeds_dir: Vec<PathBuf>,
    /// Argument forwarded to the fuzz target (repeatable)
    #[arg(long = "fuzz-target-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub fuzz_target_arg: Vec<String>,
    /// Run the target in a sandbox (default: on where supported)
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub sandbox: Option<bool>,
    /// Treat TARGET as an already built executable
    #[arg(long)]
    pub no_build: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    /// Fuzzing dictionary
    #[arg(long, value_name = "FILE")]
    pub dict: Option<PathBuf>,
    /// Argument passed to libFuzzer (repeatable)
    #[arg(long = "engine-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub engine_arg: Vec<String>,
    /// Stop after this long, e.g. 30s, 10m, 2h; 0 runs until stopped
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
    /// Print findings and the summary as JSON lines
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CoverageArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    /// Report path (default: <project>/<target>.coverage.html)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let verbose = cli.verbose;

    if let Err(err) = dispatch(cli) {
        let code = exit_code(&err);
        if !is_silent(&err) {
            report_error(&err, verbose);
        }
        std::process::exit(code);
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .try_init();
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run(args) => run_fuzzing(args, cli.verbose),
        Commands::Coverage(args) => run_coverage(args, cli.verbose),
        Commands::ExecWrapper {
            env,
            chdir,
            command,
        } => {
            exec_wrapped(&env, chdir.as_deref(), &command)?;
            Ok(())
        }
    }
}

/// Process exit status for an error returned by a command.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<FuzzError>()
        .map(FuzzError::exit_code)
        .unwrap_or(1)
}

/// Silent errors were already communicated and print nothing.
pub fn is_silent(err: &anyhow::Error) -> bool {
    err.downcast_ref::<FuzzError>()
        .map(FuzzError::is_silent)
        .unwrap_or(false)
}

fn report_error(err: &anyhow::Error, verbose: bool) {
    eprintln!("Error: {:#}", err);
    if verbose {
        eprintln!("{:?}", err);
    }
}

fn load_project(args: &TargetArgs) -> Result<Project> {
    let cwd = std::env::current_dir().context("cannot determine the working directory")?;
    let mut project = Project::discover(&cwd)?;
    if let Some(command) = &args.build_command {
        project.config.build_command = Some(command.clone());
        project.config.build_system = Some(BuildSystem::Other);
    }
    Ok(project)
}

fn build_target(project: &Project, args: &TargetArgs, options: BuildOptions) -> Result<(String, BuildResult)> {
    if args.no_build {
        let executable = PathBuf::from(&args.target);
        let name = executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| FuzzError::Config(format!("{} is not a file path", args.target)))?;
        return Ok((
            name,
            BuildResult {
                executable,
                runtime_deps: Vec::new(),
                seed_corpus: None,
            },
        ));
    }
    let builder = builder_for(project, options)?;
    let result = builder.build(&args.target)?;
    debug!("{} build produced {}", builder.name(), result.executable.display());
    Ok((args.target.clone(), result))
}

fn sandbox_for(use_sandbox: bool, finder: &Arc<dyn ToolFinder>) -> Option<Box<dyn SandboxPolicyBuilder>> {
    if use_sandbox {
        Some(Box::new(MinijailBuilder::new(Arc::clone(finder))))
    } else {
        None
    }
}

fn run_fuzzing(args: RunArgs, verbose: bool) -> Result<()> {
    let project = load_project(&args.target)?;
    let (name, build) = build_target(&project, &args.target, BuildOptions::default())?;
    let config = run_configuration(&project, &args, &name, build, verbose)?;
    // Only the generated corpus is created on demand.
    if !explicit_seed_dirs(&project, &args.target).is_empty() && !config.primary_seed_dir.is_dir() {
        return Err(FuzzError::Config(format!(
            "seed corpus {} is not a directory",
            config.primary_seed_dir.display()
        ))
        .into());
    }

    let validation = validate_config(&config)?;
    debug!("Configuration valid ({} warning(s))", validation.warnings.len());

    let signals = OsSignals::install()?;
    let finder: Arc<dyn ToolFinder> = Arc::new(InstallDirFinder::from_env()?);
    let mut supervisor = Supervisor::new(
        SupervisorOptions::default(),
        sandbox_for(config.use_sandbox, &finder),
        finder,
    );
    let mut report = ReportHandler::new(config.output_format, verbose);

    let metrics = run_with_cancellation(&mut supervisor, &config, &mut report, &signals)?;
    report.print_final_metrics(&metrics)?;

    if metrics.findings > 0 {
        if config.output_format == OutputFormat::Human {
            for input in reproducer_paths(report.findings()) {
                eprintln!(
                    "Reproduce with: {} {}",
                    config.executable.display(),
                    input.display()
                );
            }
        }
        return Err(FuzzError::FindingsReported {
            count: metrics.findings,
        }
        .into());
    }
    Ok(())
}

/// Layer the flags over the project file into one run configuration.
pub fn run_configuration(
    project: &Project,
    args: &RunArgs,
    target: &str,
    build: BuildResult,
    verbose: bool,
) -> Result<RunConfiguration> {
    // New inputs land in the first seed dir the user named, or in the
    // project's generated corpus when none was named.
    let mut seed_dirs = explicit_seed_dirs(project, &args.target).into_iter();
    let primary = seed_dirs
        .next()
        .unwrap_or_else(|| project.generated_corpus_dir(target));
    let mut config = RunConfiguration::new(build.executable, primary);

    config.additional_seed_dirs = seed_dirs.collect();
    config.additional_seed_dirs.extend(build.seed_corpus);

    config.dictionary = args
        .dict
        .as_deref()
        .map(absolute)
        .or_else(|| project.config.dictionary.clone());

    config.engine_args = project.config.engine_args.clone();
    config.engine_args.extend(args.engine_arg.iter().cloned());
    config.target_args = args.target.fuzz_target_arg.clone();

    config.timeout = match (args.timeout, &project.config.timeout) {
        (Some(t), _) => t,
        (None, Some(text)) => parse_duration(text)?,
        (None, None) => Duration::ZERO,
    };
    config.use_sandbox = args
        .target
        .sandbox
        .or(project.config.sandbox)
        .unwrap_or_else(crate::sandbox::is_supported);
    config.verbose = verbose;
    config.output_format = if args.json || project.config.print_json.unwrap_or(false) {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };
    config.artifact_dir = Some(project.artifact_dir(target));
    config.runtime_deps = build.runtime_deps;
    Ok(config)
}

fn run_coverage(args: CoverageArgs, verbose: bool) -> Result<()> {
    let project = load_project(&args.target)?;
    let (name, build) = build_target(&project, &args.target, BuildOptions::coverage())?;

    let use_sandbox = args
        .target
        .sandbox
        .or(project.config.sandbox)
        .unwrap_or_else(crate::sandbox::is_supported);
    if use_sandbox && !crate::sandbox::is_supported() {
        return Err(FuzzError::UnsupportedPlatform(std::env::consts::OS.to_string()).into());
    }

    let seed_dirs = explicit_seed_dirs(&project, &args.target);
    let options = CoverageOptions {
        target: name,
        seed_dirs,
        target_args: args.target.fuzz_target_arg.clone(),
        use_sandbox,
        verbose,
        output: args.output.as_deref().map(absolute),
    };

    let finder: Arc<dyn ToolFinder> = Arc::new(InstallDirFinder::from_env()?);
    let generator = CoverageGenerator::new(
        project,
        Arc::clone(&finder),
        sandbox_for(use_sandbox, &finder),
        default_scratch_root(),
    );
    let report = generator.generate(&build, &options)?;
    info!("Open {} in a browser to inspect coverage", report.display());
    println!("{}", report.display());
    Ok(())
}

/// Seed dirs from `--seeds-dir`, else from the project file.
fn explicit_seed_dirs(project: &Project, args: &TargetArgs) -> Vec<PathBuf> {
    if args.seeds_dir.is_empty() {
        project.config.seed_corpus_dirs.clone()
    } else {
        args.seeds_dir.iter().map(|d| absolute(d)).collect()
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
