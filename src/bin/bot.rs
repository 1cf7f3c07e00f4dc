use anyhow::Context;
use clap::{Parser, ValueEnum};
use rival_bot::board::ChessRules;
use rival_bot::config::BotConfig;
use rival_bot::orchestrator::Orchestrator;
use rival_bot::scheduler::ChallengeIntent;
use rival_bot::selector::{MaterialSelector, MoveSelector, RandomSelector};
use rival_bot::transport::LichessClient;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(ValueEnum, Debug, Clone, Copy)]
enum SelectorKind {
    Random,
    Material,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Lichess API token with the bot:play scope
    #[arg(long, env = "LICHESS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// JSON configuration file; command line flags override it
    #[arg(short, long)]
    config: Option<String>,

    /// Server base URL
    #[arg(long)]
    api_base: Option<String>,

    /// Maximum number of games played at once
    #[arg(long)]
    max_games: Option<usize>,

    /// Lowest challenger rating accepted
    #[arg(long)]
    min_rating: Option<u32>,

    /// Highest challenger rating accepted
    #[arg(long)]
    max_rating: Option<u32>,

    /// Move selection strategy
    #[arg(long, value_enum, default_value = "material")]
    selector: SelectorKind,

    /// Search depth for the material selector
    #[arg(long, default_value = "3")]
    depth: u32,

    /// Upper bound on thinking time per move, in seconds
    #[arg(long)]
    max_think_secs: Option<u64>,

    /// Challenge these users once capacity allows (repeatable)
    #[arg(long = "challenge")]
    challenges: Vec<String>,

    /// Initial clock for outgoing challenges, in seconds
    #[arg(long, default_value = "180")]
    clock_limit: u32,

    /// Increment for outgoing challenges, in seconds
    #[arg(long, default_value = "2")]
    clock_increment: u32,

    /// Make outgoing challenges rated
    #[arg(long)]
    rated: bool,
}

fn load_config(args: &Args) -> anyhow::Result<BotConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
            BotConfig::from_json(&text)?
        }
        None => BotConfig::default(),
    };
    if let Some(token) = &args.token {
        config.token = token.clone();
    }
    if let Some(api_base) = &args.api_base {
        config.api_base = api_base.clone();
    }
    if let Some(max_games) = args.max_games {
        config.max_concurrent_games = max_games;
        config.filter.max_concurrent_challenges = max_games;
    }
    if let Some(min_rating) = args.min_rating {
        config.filter.min_rating = min_rating;
    }
    if let Some(max_rating) = args.max_rating {
        config.filter.max_rating = max_rating;
    }
    if let Some(secs) = args.max_think_secs {
        config.max_think_time = Some(Duration::from_secs(secs));
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let api = Arc::new(LichessClient::new(&config).context("building HTTP client")?);
    let selector: Arc<dyn MoveSelector> = match args.selector {
        SelectorKind::Random => Arc::new(RandomSelector),
        SelectorKind::Material => Arc::new(MaterialSelector::new(args.depth)),
    };
    info!(
        api_base = %config.api_base,
        max_games = config.max_concurrent_games,
        selector = selector.name(),
        "starting bot"
    );

    let bot = Orchestrator::new(config, api, selector, Arc::new(ChessRules));
    let challenges = bot.challenges();
    for opponent in &args.challenges {
        let intent = ChallengeIntent::new(opponent.as_str(), 0, args.clock_limit, args.clock_increment)
            .rated(args.rated)
            .reason("requested on the command line");
        challenges.send(intent).context("queueing challenge")?;
    }

    bot.run(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received"),
            Err(e) => {
                warn!(error = %e, "cannot listen for interrupts");
                std::future::pending::<()>().await
            }
        }
    })
    .await;
    Ok(())
}
