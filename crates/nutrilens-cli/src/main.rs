use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

use nutrilens_core::capture::{DepthMap, SensorFrame, TapPoint, WorldPosition};
use nutrilens_core::config::NutriLensConfig;
use nutrilens_core::food_log::SyncReport;
use nutrilens_core::model::{AnalysisResult, FoodLogEntry, NutritionInsights};
use nutrilens_core::session::TokenStore;
use nutrilens_core::{ErrorKind, Pipeline, PipelineState};

#[derive(Parser)]
#[command(name = "nutrilens", about = "NutriLens: photograph a meal, log its calories", version)]
struct Cli {
    /// Keep the session in memory only (nothing is read from or written to the token file)
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and save the session token
    Login {
        username: String,
        #[arg(short, long)]
        password: String,
    },
    /// Create an account
    Register {
        username: String,
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    /// Forget the saved session
    Logout,
    /// Show the logged-in user
    Whoami,
    /// List the food log, newest first
    Logs {
        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Analyze a meal photo
    Analyze {
        /// JPEG image of the meal
        image: PathBuf,
        /// Raw little-endian f32 depth samples, row-major
        #[arg(long, requires = "width", requires = "height")]
        depth: Option<PathBuf>,
        /// Depth map width in samples
        #[arg(long)]
        width: Option<usize>,
        /// Depth map height in samples
        #[arg(long)]
        height: Option<usize>,
        /// World position of the tapped point as x,y,z
        #[arg(long, value_parser = parse_position, allow_hyphen_values = true)]
        position: Option<WorldPosition>,
        /// Add the result to the food log
        #[arg(long)]
        save: bool,
        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Push entries that have not reached the backend yet
    Sync,
    /// Show this week's nutrition insights
    Insights {
        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("nutrilens_core=warn,nutrilens=warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = NutriLensConfig::load(Some(&std::env::current_dir()?)).unwrap_or_else(|e| {
        eprintln!("{} {e}, using defaults", "warning:".yellow());
        NutriLensConfig::default_config()
    });

    run(cli, config).await
}

async fn run(cli: Cli, mut config: NutriLensConfig) -> Result<()> {
    match cli.command {
        Command::Config => cmd_config(&mut config),
        Command::Register {
            username,
            email,
            password,
        } => {
            let pipeline = open(&config, cli.ephemeral)?;
            cmd_register(&pipeline, &username, &email, &password).await
        }
        Command::Login { username, password } => {
            let pipeline = open(&config, cli.ephemeral)?;
            cmd_login(&pipeline, &username, &password).await
        }
        Command::Logout => {
            let pipeline = open(&config, cli.ephemeral)?;
            pipeline.session().clear();
            println!("{}", "Logged out.".green());
            Ok(())
        }
        Command::Whoami => {
            let pipeline = open(&config, cli.ephemeral)?;
            restore(&pipeline).await?;
            cmd_whoami(&pipeline)
        }
        Command::Logs { json } => {
            let pipeline = open(&config, cli.ephemeral)?;
            restore(&pipeline).await?;
            cmd_logs(&pipeline, json).await
        }
        Command::Analyze {
            image,
            depth,
            width,
            height,
            position,
            save,
            json,
        } => {
            let frame = read_frame(&image, depth.as_deref(), width, height, position)?;
            let pipeline = open(&config, cli.ephemeral)?;
            restore(&pipeline).await?;
            cmd_analyze(&pipeline, &frame, save, json).await
        }
        Command::Sync => {
            let pipeline = open(&config, cli.ephemeral)?;
            restore(&pipeline).await?;
            cmd_sync(&pipeline).await
        }
        Command::Insights { json } => {
            let pipeline = open(&config, cli.ephemeral)?;
            restore(&pipeline).await?;
            cmd_insights(&pipeline, json).await
        }
    }
}

fn open(config: &NutriLensConfig, ephemeral: bool) -> Result<Arc<Pipeline>> {
    let pipeline = if ephemeral {
        Pipeline::from_config_with_tokens(config, TokenStore::memory())
    } else {
        Pipeline::from_config(config)
    }
    .context("failed to set up NutriLens")?;
    Ok(Arc::new(pipeline))
}

/// Adopt the saved token and wait for its identity refresh, so a rejected
/// token is noticed before the command runs.
async fn restore(pipeline: &Arc<Pipeline>) -> Result<()> {
    if let Some(refresh) = pipeline
        .session()
        .restore()
        .context("failed to read saved session")?
    {
        if let Err(e) = refresh.await {
            tracing::warn!(error = %e, "identity refresh did not complete");
        }
    }
    Ok(())
}

// -- Commands --

fn cmd_config(config: &mut NutriLensConfig) -> Result<()> {
    let warnings = config.validate();
    let mut shown = config.clone();
    if shown.analysis.api_key.is_some() {
        shown.analysis.api_key = Some("<redacted>".to_string());
    }
    print!("{}", toml::to_string_pretty(&shown).context("failed to render config")?);
    for w in warnings {
        eprintln!("{} {w}", "warning:".yellow());
    }
    Ok(())
}

async fn cmd_register(
    pipeline: &Arc<Pipeline>,
    username: &str,
    email: &str,
    password: &str,
) -> Result<()> {
    pipeline
        .backend()
        .register(username, email, password)
        .await
        .context("registration failed")?;
    println!("{} {}", "Registered".green(), username.bold());
    cmd_login(pipeline, username, password).await
}

async fn cmd_login(pipeline: &Arc<Pipeline>, username: &str, password: &str) -> Result<()> {
    let refresh = pipeline
        .session()
        .login(username, password)
        .await
        .context("login failed")?;
    if let Err(e) = refresh.await {
        tracing::warn!(error = %e, "identity refresh did not complete");
    }
    match pipeline.session().identity() {
        Some(user) => println!(
            "{} {} {}",
            "Logged in as".green(),
            user.username.bold(),
            format!("(goal {} kcal/day)", user.daily_calorie_goal).dimmed()
        ),
        None => println!("{} {}", "Logged in as".green(), username.bold()),
    }
    Ok(())
}

fn cmd_whoami(pipeline: &Pipeline) -> Result<()> {
    let session = pipeline.session();
    match (session.is_authenticated(), session.identity()) {
        (false, _) => println!("{}", "Not logged in.".yellow()),
        (true, Some(user)) => {
            println!("{}", user.username.bold());
            println!("  {}  {}", "ID:".dimmed(), user.id.to_string().cyan());
            println!("  {}  {} kcal/day", "Goal:".dimmed(), user.daily_calorie_goal);
        }
        (true, None) => println!(
            "{} {}",
            "Logged in".green(),
            "(profile unavailable)".dimmed()
        ),
    }
    Ok(())
}

async fn cmd_logs(pipeline: &Pipeline, json: bool) -> Result<()> {
    let entries = match pipeline.refresh_log().await {
        Ok(entries) => entries,
        Err(e) if e.kind() == Some(ErrorKind::Unauthorized) => {
            bail!("{e}\nRun `nutrilens login` first.");
        }
        Err(e) => {
            eprintln!("{} {e}, showing local entries", "warning:".yellow());
            pipeline.log().entries()
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("{}", "No food logged yet.".dimmed());
        return Ok(());
    }
    for entry in &entries {
        print_entry(entry);
    }
    let total: u64 = entries.iter().map(|e| u64::from(e.calories)).sum();
    println!(
        "{} {}",
        format!("{} entries,", entries.len()).dimmed(),
        format!("{total} kcal").bold()
    );
    Ok(())
}

async fn cmd_analyze(pipeline: &Arc<Pipeline>, frame: &SensorFrame, save: bool, json: bool) -> Result<()> {
    let tap = TapPoint::center();
    if let Some(depth) = frame.depth.as_ref().and_then(|d| d.sample_at(tap)) {
        tracing::info!(depth, "depth at tap");
    }

    pipeline.tap(tap, frame);
    let result = match pipeline.settled().await {
        PipelineState::Ready(result) => result,
        PipelineState::Failed(kind) => return Err(failure(kind)),
        other => bail!("analysis ended in unexpected state {other:?}"),
    };

    if !save {
        if json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            print_result(&result);
        }
        return Ok(());
    }

    pipeline.confirm()?;
    match pipeline.settled().await {
        PipelineState::Committed(entry) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            } else {
                print_result(&result);
                println!("{} {}", "Saved".green(), entry.id.to_string().dimmed());
            }
            Ok(())
        }
        PipelineState::Failed(kind) => {
            if !json {
                print_result(&result);
            }
            eprintln!(
                "{} kept locally; run `nutrilens sync` to retry",
                "Not saved:".yellow()
            );
            Err(failure(kind))
        }
        other => bail!("commit ended in unexpected state {other:?}"),
    }
}

async fn cmd_sync(pipeline: &Pipeline) -> Result<()> {
    let SyncReport { pushed, remaining } = pipeline.sync_pending().await.context("sync failed")?;
    if pushed == 0 && remaining == 0 {
        println!("{}", "Nothing to sync.".dimmed());
    } else {
        println!(
            "{} {}",
            format!("Synced {pushed}").green(),
            format!("({remaining} remaining)").dimmed()
        );
    }
    Ok(())
}

async fn cmd_insights(pipeline: &Pipeline, json: bool) -> Result<()> {
    let insights = pipeline.insights().await.context("insights unavailable")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&insights)?);
    } else {
        print_insights(&insights);
    }
    Ok(())
}

// -- Output --

fn print_result(result: &AnalysisResult) {
    println!(
        "{}  {}",
        result.food_name.bold(),
        format!("{} kcal", result.calories).cyan()
    );
    if !result.narrative.is_empty() {
        println!();
        println!("{}", result.narrative);
    }
}

fn print_entry(entry: &FoodLogEntry) {
    let marker = if entry.synced {
        String::new()
    } else {
        format!(" {}", "(unsynced)".yellow())
    };
    println!(
        "  {}  {:<24} {:>6} kcal{marker}",
        entry.logged_at.format("%Y-%m-%d %H:%M").dimmed(),
        entry.food_name,
        entry.calories
    );
}

fn print_insights(insights: &NutritionInsights) {
    const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    println!("{}", "This week".bold());
    for (day, calories) in DAYS.iter().zip(&insights.weekly_calorie_data) {
        println!("  {}  {calories:>6} kcal", day.dimmed());
    }
    if let [protein, carbs, fat] = insights.nutrient_breakdown.as_slice() {
        println!();
        println!(
            "  {} {protein:.0}  {} {carbs:.0}  {} {fat:.0}",
            "Protein".dimmed(),
            "Carbs".dimmed(),
            "Fat".dimmed()
        );
    }
    if !insights.insights.is_empty() {
        println!();
        for line in &insights.insights {
            println!("  - {line}");
        }
    }
}

fn failure(kind: ErrorKind) -> anyhow::Error {
    match kind {
        ErrorKind::Unauthorized => anyhow::anyhow!("{kind}\nRun `nutrilens login` first."),
        _ => anyhow::anyhow!("{kind}"),
    }
}

// -- Input --

fn read_frame(
    image: &Path,
    depth: Option<&Path>,
    width: Option<usize>,
    height: Option<usize>,
    position: Option<WorldPosition>,
) -> Result<SensorFrame> {
    let image_bytes =
        std::fs::read(image).with_context(|| format!("failed to read {}", image.display()))?;

    let depth = match (depth, width, height) {
        (Some(path), Some(width), Some(height)) => {
            let raw =
                std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            Some(DepthMap {
                width,
                height,
                samples: decode_depth(&raw)?,
            })
        }
        (Some(_), _, _) => bail!("--depth needs --width and --height"),
        _ => None,
    };

    Ok(SensorFrame {
        image: Some(image_bytes),
        depth,
        raycast_hit: position,
    })
}

fn decode_depth(raw: &[u8]) -> Result<Vec<f32>> {
    if raw.len() % 4 != 0 {
        bail!("depth file length {} is not a multiple of 4", raw.len());
    }
    Ok(raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn parse_position(s: &str) -> std::result::Result<WorldPosition, String> {
    let parts: Vec<f32> = s
        .split(',')
        .map(|p| p.trim().parse::<f32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| format!("invalid coordinate: {e}"))?;
    match parts.as_slice() {
        [x, y, z] => Ok(WorldPosition::new(*x, *y, *z)),
        _ => Err(format!("expected x,y,z, got {} values", parts.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_position() {
        assert_eq!(
            parse_position("0.1, -2,3.5").unwrap(),
            WorldPosition::new(0.1, -2.0, 3.5)
        );
        assert!(parse_position("1,2").is_err());
        assert!(parse_position("a,b,c").is_err());
    }

    #[test]
    fn test_decode_depth_le() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&0.5f32.to_le_bytes());
        raw.extend_from_slice(&1.25f32.to_le_bytes());
        assert_eq!(decode_depth(&raw).unwrap(), vec![0.5, 1.25]);
        assert!(decode_depth(&raw[..5]).is_err());
    }

    #[test]
    fn test_read_frame_requires_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("meal.jpg");
        let depth = dir.path().join("depth.bin");
        std::fs::write(&image, [0xFF, 0xD8]).unwrap();
        std::fs::write(&depth, 1.0f32.to_le_bytes()).unwrap();

        let err = read_frame(&image, Some(&depth), Some(1), None, None).unwrap_err();
        assert!(err.to_string().contains("--width and --height"));

        let frame = read_frame(&image, Some(&depth), Some(1), Some(1), None).unwrap();
        assert_eq!(frame.depth.unwrap().samples, vec![1.0]);
    }

    #[test]
    fn test_cli_parses_analyze() {
        let cli = Cli::try_parse_from([
            "nutrilens",
            "analyze",
            "meal.jpg",
            "--position",
            "-1,0,2",
            "--save",
        ])
        .unwrap();
        match cli.command {
            Command::Analyze { position, save, .. } => {
                assert_eq!(position, Some(WorldPosition::new(-1.0, 0.0, 2.0)));
                assert!(save);
            }
            _ => panic!("expected analyze"),
        }
    }
}
