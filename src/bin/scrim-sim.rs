//! Drives the matchmaking engine end to end against in-memory fakes
//!
//! Useful for demos and for poking at the flows by hand without a hosting
//! provider, a broker or Redis.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use scrim_room::hosting::{HostedMatchStatus, InMemoryHostingApi, StaticServerProbe};
use scrim_room::metrics::MetricsCollector;
use scrim_room::service::{BanResult, EngineDeps, EngineSettings, MatchmakingEngine};
use scrim_room::types::{PlayerId, TEAM_SIZE};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "scrim-sim", version, about = "Simulate scrim-room flows in memory")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue teams and solo players and let the scheduler pair them
    Auto {
        #[arg(long, default_value_t = 1)]
        teams: usize,
        #[arg(long, default_value_t = 7)]
        solos: usize,
        /// Run the map veto for formed matches
        #[arg(long)]
        veto: bool,
    },
    /// Challenge, accept, ready up and ban maps until one is left
    Veto {
        #[arg(long)]
        message: Option<String>,
    },
    /// Start a match, report a result and reconcile it
    Monitor {
        #[arg(long, default_value_t = 16)]
        score1: u32,
        #[arg(long, default_value_t = 12)]
        score2: u32,
        /// Only this many players ever connect
        #[arg(long)]
        connected: Option<usize>,
    },
}

struct Sim {
    engine: MatchmakingEngine,
    hosting: Arc<InMemoryHostingApi>,
    probe: Arc<StaticServerProbe>,
}

impl Sim {
    fn new(auto_match_veto: bool) -> Result<Self> {
        let hosting = Arc::new(InMemoryHostingApi::new());
        let probe = Arc::new(StaticServerProbe::new(TEAM_SIZE * 2));
        let mut deps = EngineDeps::in_memory(Arc::new(MetricsCollector::new()?))?;
        deps.hosting = hosting.clone();
        deps.probe = probe.clone();

        let mut settings = EngineSettings::default();
        settings.formation.auto_match_veto = auto_match_veto;
        // The simulator never waits out the grace window
        settings.connection_grace = std::time::Duration::ZERO;

        Ok(Self {
            engine: MatchmakingEngine::new(deps, settings),
            hosting,
            probe,
        })
    }

    fn team(&self, leader: PlayerId, name: &str) -> Result<u64> {
        let members: Vec<PlayerId> = (leader + 1..leader + TEAM_SIZE as u64).collect();
        let team = self
            .engine
            .create_team(leader, Some(name.to_string()), &members, None)?;
        println!("Created {} (#{}) led by player {}", name, team.id, leader);
        Ok(team.id)
    }
}

async fn run_auto(teams: usize, solos: usize, veto: bool) -> Result<()> {
    let sim = Sim::new(veto)?;

    for index in 0..teams as u64 {
        let leader = 1000 + index * 10;
        sim.team(leader, &format!("Team {}", index + 1))?;
        sim.engine.join_queue_as_team(leader).await?;
    }
    for player in 1..=solos as u64 {
        let joined = sim.engine.join_queue(player).await?;
        if let Some(report) = joined.formation.filter(|r| !r.formed.is_empty()) {
            for formed in &report.formed {
                println!(
                    "Formed {} match for challenge {}: {:?}",
                    formed.kind, formed.challenge.id, formed.hand_off
                );
            }
        }
    }

    let count = sim.engine.queue_count().await;
    println!(
        "Queue after formation: {} players ({} teams, {} solos)",
        count.players, count.teams, count.solos
    );
    for group in sim.engine.queue_snapshot().await {
        println!("  still waiting: {:?}", group.members());
    }
    println!("Hosted matches: {}", sim.hosting.created_matches().len());
    Ok(())
}

async fn run_veto(message: Option<String>) -> Result<()> {
    let sim = Sim::new(false)?;
    sim.team(1, "Alpha")?;
    let bravo = sim.team(11, "Bravo")?;

    let challenge = sim.engine.challenge(1, bravo, message).await?;
    sim.engine.accept(11, challenge.id).await?;
    sim.engine.mark_ready(1, challenge.id).await?;
    let ready = sim.engine.mark_ready(11, challenge.id).await?;
    let Some(mut status) = ready.veto else {
        bail!("veto did not start for challenge {}", challenge.id);
    };

    loop {
        let Some(map) = status.remaining_maps.first().cloned() else {
            bail!("veto ran out of maps");
        };
        let leader = if status.bans.len() % 2 == 0 { 1 } else { 11 };
        println!("Player {} bans {}", leader, map);

        match sim.engine.ban(leader, challenge.id, &map).await? {
            BanResult::Banned(next) => status = next,
            BanResult::MatchStarted {
                final_map,
                game_match,
            } => {
                println!(
                    "Veto done: {} at {}:{} (match {})",
                    final_map, game_match.server_ip, game_match.server_port, game_match.id
                );
                for (_, command) in sim.hosting.rcon_commands() {
                    println!("  rcon: {}", command);
                }
                return Ok(());
            }
            BanResult::StartFailed { final_map, error } => {
                bail!("veto chose {} but the match failed: {}", final_map, error)
            }
            BanResult::TimedOut => bail!("veto timed out"),
        }
    }
}

async fn run_monitor(score1: u32, score2: u32, connected: Option<usize>) -> Result<()> {
    let sim = Sim::new(false)?;
    for player in 1..=(TEAM_SIZE * 2) as u64 {
        sim.engine.join_queue(player).await?;
    }
    let Some((external_id, request)) = sim.hosting.created_matches().into_iter().next() else {
        bail!("no match was started");
    };
    println!("Started hosted match {} ({})", external_id, request.title);

    if let Some(players) = connected {
        sim.probe.set_default_players(players);
        let report = sim.engine.check_connection_timeouts().await?;
        println!(
            "Connection check: {} validated, {} cancelled",
            report.validated, report.cancelled
        );
        if report.cancelled > 0 {
            return Ok(());
        }
    }

    let winner = match score1.cmp(&score2) {
        std::cmp::Ordering::Greater => Some(request.team1_id.clone()),
        std::cmp::Ordering::Less => Some(request.team2_id.clone()),
        std::cmp::Ordering::Equal => None,
    };
    sim.hosting.set_match_status(
        &external_id,
        HostedMatchStatus {
            end_time: Some(chrono::Utc::now()),
            team1_score: score1,
            team2_score: score2,
            winner,
            ..HostedMatchStatus::default()
        },
    );
    let report = sim.engine.reconcile_results().await?;
    println!(
        "Reconciled: {} finished, {} cancelled",
        report.finished, report.cancelled
    );
    for entry in sim.engine.repos().ratings.leaderboard(10)? {
        println!(
            "  team {} rating {:.1} ({} games)",
            entry.team_id, entry.rating.rating, entry.games_played
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with_target(false)
        .init();

    info!("scrim-sim {}", scrim_room::VERSION);
    match args.command {
        Command::Auto { teams, solos, veto } => run_auto(teams, solos, veto).await,
        Command::Veto { message } => run_veto(message).await,
        Command::Monitor {
            score1,
            score2,
            connected,
        } => run_monitor(score1, score2, connected).await,
    }
}
