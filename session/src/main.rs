use clap::{Parser, Subcommand};
use log::{error, info, warn};
use session::config::SessionConfig;
use session::coordinator::{JoinPoll, SessionCoordinator, SessionEvent};
use session::network::UdpTransport;
use session::replication::{ImmediateControl, ReplicationEngine};
use session::transport::Transport;
use shared::{ClientCore, ResourceKind};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

type Session = SessionCoordinator<UdpTransport, ImmediateControl>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Player name shown to the other peers
    #[arg(short = 'n', long, default_value = "player")]
    name: String,

    /// Join as an observer without players
    #[arg(long)]
    observer: bool,

    /// Session password
    #[arg(short = 'p', long)]
    password: Option<String>,

    /// Directory for received and generated resources
    #[arg(short = 'd', long)]
    work_dir: Option<PathBuf>,

    /// Simulation frames per second
    #[arg(short = 'f', long, default_value = "36")]
    fps: u32,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a new session
    Host {
        /// Address to listen on
        #[arg(short = 'b', long, default_value = "0.0.0.0:8080")]
        bind: String,

        /// Session title
        #[arg(short = 't', long, default_value = "Session")]
        title: String,

        /// Skip the lobby and start running immediately
        #[arg(long)]
        no_lobby: bool,

        /// Lobby countdown started when the first client joins
        #[arg(short = 'c', long)]
        countdown: Option<u32>,

        /// Scenario file published to every joiner
        #[arg(short = 's', long)]
        scenario: Option<PathBuf>,

        /// Require hashed resources
        #[arg(long)]
        ranked: bool,
    },
    /// Join a hosted session
    Join {
        /// Host addresses, tried in parallel
        #[arg(required = true)]
        addresses: Vec<String>,

        /// Local address to bind to
        #[arg(short = 'b', long, default_value = "0.0.0.0:0")]
        bind: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = SessionConfig {
        password: args.password.clone(),
        frames_per_second: args.fps.max(1),
        ..SessionConfig::default()
    };
    if let Some(dir) = args.work_dir.clone() {
        config.work_dir = dir;
    }
    let core = if args.observer {
        ClientCore::observer(&args.name)
    } else {
        ClientCore::new(&args.name)
    };

    let mut countdown = None;
    let (mut session, joining) = match args.command {
        Command::Host {
            bind,
            title,
            no_lobby,
            countdown: seconds,
            scenario,
            ranked,
        } => {
            config.title = title;
            config.ranked = ranked;
            if let Some(path) = scenario {
                config.resources.push((path, ResourceKind::Scenario));
            }
            countdown = seconds;

            let transport = UdpTransport::bind(&bind).await?;
            let mut session = Session::new(config, core, transport, ImmediateControl::new());
            session.host_session(!no_lobby, std::time::Instant::now())?;
            (session, false)
        }
        Command::Join { addresses, bind } => {
            let transport = UdpTransport::bind(&bind).await?;
            let mut session = Session::new(config, core, transport, ImmediateControl::new());
            session.join_session(&addresses, args.password, std::time::Instant::now())?;
            (session, true)
        }
    };

    run(&mut session, joining, countdown, args.fps.max(1)).await;
    Ok(())
}

/// Drives the session until it ends or Ctrl+C is pressed
async fn run(session: &mut Session, mut joining: bool, countdown: Option<u32>, fps: u32) {
    let mut frame_timer = interval(Duration::from_secs_f32(1.0 / fps as f32));
    frame_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut execute_timer = interval(Duration::from_secs(1));
    execute_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = frame_timer.tick() => {
                let now = Instant::now().into_std();
                session.engine_mut().advance(1);
                if joining {
                    match session.poll_join(now) {
                        JoinPoll::Pending => {}
                        JoinPoll::PasswordRequired => {
                            error!("The session requires a password, pass it with --password");
                            session.leave();
                            return;
                        }
                        JoinPoll::Joined(outcome) => {
                            info!(
                                "Joined as client {} in {} at tick {}",
                                outcome.client_id, outcome.status.phase, outcome.start_tick
                            );
                            joining = false;
                            begin_playing(session, now);
                        }
                        JoinPoll::Failed(e) => {
                            error!("Join failed: {}", e);
                            return;
                        }
                    }
                } else {
                    session.pump(now);
                }
            }
            _ = execute_timer.tick() => {
                session.execute(Instant::now().into_std());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving the session");
                session.leave();
                return;
            }
        }

        if !handle_events(session, countdown) {
            return;
        }
    }
}

/// Asks the host to activate us; `execute` repeats the request until granted
fn begin_playing<T: Transport, E: ReplicationEngine>(
    session: &mut SessionCoordinator<T, E>,
    now: std::time::Instant,
) {
    session.request_activate(now);
}

/// Logs session events; returns false once the session is over
fn handle_events(session: &mut Session, countdown: Option<u32>) -> bool {
    let now = std::time::Instant::now();
    for event in session.drain_events() {
        match event {
            SessionEvent::ClientJoined { id, name } => {
                info!("{} joined as client {}", name, id);
                if let Some(seconds) = countdown {
                    if session.countdown().is_none() {
                        session.start_countdown(seconds, now);
                    }
                }
            }
            SessionEvent::ClientActivated { id, activated } => {
                info!("Client {} activated: {}", id, activated);
                if activated {
                    session.engine_mut().add_player(id);
                }
            }
            SessionEvent::ReadyCheckPrompt { requested_by } => {
                info!("Client {} asks whether we are ready", requested_by);
                session.answer_ready_check(true);
            }
            SessionEvent::SurrenderOffered => {
                warn!("Vote failed; surrender is available");
            }
            SessionEvent::Terminated { reason } => {
                info!("Session over: {}", reason);
                return false;
            }
            other => info!("{:?}", other),
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use session::memory::MemoryNetwork;
    use tempfile::TempDir;

    #[test]
    fn test_joined_client_gets_activated() {
        let dir = TempDir::new().unwrap();
        let network = MemoryNetwork::new();
        let now = std::time::Instant::now();
        let config = |name: &str| SessionConfig {
            work_dir: dir.path().join(name),
            ..SessionConfig::default()
        };

        let mut host = SessionCoordinator::new(
            config("host"),
            ClientCore::new("host"),
            network.endpoint("host"),
            ImmediateControl::new(),
        );
        host.host_session(true, now).unwrap();
        let mut client = SessionCoordinator::new(
            config("client"),
            ClientCore::new("client"),
            network.endpoint("client"),
            ImmediateControl::new(),
        );
        client.join_session(&["host".to_string()], None, now).unwrap();

        let mut joined = false;
        for _ in 0..20 {
            host.pump(now);
            if let JoinPoll::Joined(_) = client.poll_join(now) {
                joined = true;
                break;
            }
        }
        assert!(joined);
        for _ in 0..10 {
            host.pump(now);
            client.pump(now);
        }

        begin_playing(&mut client, now);
        for _ in 0..10 {
            host.pump(now);
            client.pump(now);
        }
        let id = client.local_id().unwrap();
        assert!(host.registry().find_by_id(id).unwrap().activated);
        assert!(client.registry().local().unwrap().activated);
    }
}
