use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dots_and_boxes::{
    init_logging, BoardSize, CellState, GameProgress, GameState, GreedyPlayer, Line, Player, PeerId,
    RendezvousServer, Session, SessionConfig, SessionEvent, TcpBroker,
};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rendezvous broker peers register with.
    Broker {
        #[arg(long, default_value = "0.0.0.0:9000")]
        bind: String,
    },
    /// Join the broker and play a match against another peer.
    Play {
        #[arg(long, help = "JSON session config file")]
        config: Option<PathBuf>,
        #[arg(long)]
        broker_host: Option<String>,
        #[arg(long)]
        broker_port: Option<u16>,
        #[arg(long)]
        broker_path: Option<String>,
        #[arg(long, default_value = "127.0.0.1", help = "Address other peers dial us on")]
        listen_host: String,
        #[arg(long, help = "Peer id to connect to; omit to wait for a peer")]
        connect: Option<String>,
        #[arg(long, help = "Display name, submitted as soon as the game awaits players")]
        name: Option<String>,
        #[arg(long, default_value = "small", help = "small, medium, large or huge (host only)")]
        size: String,
        #[arg(long, help = "Let the computer pick lines")]
        auto: bool,
        #[arg(long, help = "Fix RNG seed for reproducible automatic play")]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Broker { bind } => {
            let server = RendezvousServer::bind(&bind).await?;
            println!("Broker listening on {}", server.local_addr()?);
            server.run().await?;
        }
        Commands::Play {
            config,
            broker_host,
            broker_port,
            broker_path,
            listen_host,
            connect,
            name,
            size,
            auto,
            seed,
        } => {
            let mut config = match config {
                Some(path) => SessionConfig::from_json_file(path)?,
                None => SessionConfig::default(),
            };
            if let Some(host) = broker_host {
                config.broker.host = host;
            }
            if let Some(port) = broker_port {
                config.broker.port = port;
            }
            if let Some(path) = broker_path {
                config.broker.path = path;
            }
            let size = BoardSize::parse(&size).ok_or_else(|| anyhow::anyhow!("Unknown board size {:?}", size))?;
            let rng = match seed {
                Some(s) => SmallRng::seed_from_u64(s),
                None => SmallRng::from_rng(&mut rand::rng()),
            };
            let name = name.unwrap_or_else(|| "Player".to_string());
            let bot = auto.then(|| GreedyPlayer::new(name.clone(), rng));

            let broker = TcpBroker::register(config.broker.clone(), PeerId::random(), &listen_host).await?;
            let session = Session::start(Arc::new(broker), &config);
            println!("Your peer id: {}", session.peer_id());
            if let Some(remote) = connect {
                session.connect(&remote);
            }
            play(session, name, size, bot).await?;
        }
    }
    Ok(())
}

fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

async fn play(
    mut session: Session,
    name: String,
    size: BoardSize,
    mut bot: Option<GreedyPlayer<SmallRng>>,
) -> anyhow::Result<()> {
    let mut lines = stdin_lines();
    print_help();
    loop {
        tokio::select! {
            event = session.next_event() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Status(status) => println!("Connection: {:?}", status),
                    SessionEvent::Progress(GameProgress::AwaitingPlayers) => {
                        println!("Waiting for players. Submitting name {:?}", name);
                        if let Err(e) = session.submit_player(&name, Some(size)) {
                            println!("Cannot join: {}", e);
                        }
                    }
                    SessionEvent::Progress(GameProgress::Finished) => {
                        print_board(session.state());
                        println!("Game over: {:?}", session.outcome());
                    }
                    SessionEvent::Progress(progress) => println!("Game: {:?}", progress),
                    SessionEvent::StateChanged => {
                        if session.progress() == GameProgress::InProgress && session.is_my_turn() {
                            print_board(session.state());
                            if let Some(bot) = bot.as_mut() {
                                if let Some(line) = bot.choose_line(session.state()) {
                                    println!("Playing {}", line);
                                    let _ = session.claim_line(line);
                                }
                            } else {
                                println!("Your turn");
                            }
                        }
                    }
                    SessionEvent::Chat(message) => println!("[{}] {}", message.sender, message.text),
                    SessionEvent::MoveRejected { line, reason } => println!("Cannot claim {}: {}", line, reason),
                    SessionEvent::Desync(reason) => println!("State desync ({}), resynchronizing", reason),
                    SessionEvent::Error(message) => println!("Error: {}", message),
                }
            }
            line = lines.recv() => {
                let Some(line) = line else { break };
                if !run_command(&mut session, line.trim()) {
                    break;
                }
            }
        }
    }
    session.link().close();
    Ok(())
}

fn print_help() {
    println!("Commands: connect <ID> | h <row> <col> | v <row> <col> | chat <text> | new | board | quit");
}

/// Returns false when the user wants to leave.
fn run_command(session: &mut Session, input: &str) -> bool {
    let (command, rest) = input.split_once(' ').unwrap_or((input, ""));
    match command {
        "" => {}
        "quit" | "exit" => return false,
        "connect" => session.connect(rest),
        "board" => print_board(session.state()),
        "new" => {
            if let Err(e) = session.start_new_game() {
                println!("Cannot start a new game: {}", e);
            }
        }
        "chat" => {
            if let Err(e) = session.send_chat(rest) {
                println!("Chat not sent: {}", e);
            }
        }
        "h" | "v" => match parse_line(command, rest) {
            Some(line) => {
                if let Ok(result) = session.claim_line(line) {
                    println!("Claimed {} (closed {})", line, result.closed);
                }
            }
            None => println!("Usage: {} <row> <col>", command),
        },
        _ => print_help(),
    }
    true
}

fn parse_line(kind: &str, rest: &str) -> Option<Line> {
    let mut parts = rest.split_whitespace();
    let row: usize = parts.next()?.parse().ok()?;
    let col: usize = parts.next()?.parse().ok()?;
    match kind {
        "h" => Some(Line::h(row, col)),
        "v" => Some(Line::v(row, col)),
        _ => None,
    }
}

fn print_board(state: &GameState) {
    let board = &state.board;
    let n = board.dimension();
    for row in 0..=n {
        let mut dots = String::new();
        for col in 0..n {
            dots.push('+');
            dots.push_str(if board.h_lines[row][col] { "---" } else { "   " });
        }
        dots.push('+');
        println!("{}", dots);
        if row == n {
            break;
        }
        let mut cells = String::new();
        for col in 0..=n {
            cells.push(if board.v_lines[row][col] { '|' } else { ' ' });
            if col < n {
                cells.push_str(match board.cells[row][col] {
                    CellState::Free => "   ",
                    CellState::HostOwned => " H ",
                    CellState::JoinedOwned => " J ",
                });
            }
        }
        println!("{}", cells);
    }
    if let (Some(host), Some(joined)) = (&state.players.host, &state.players.joined) {
        println!("{}: {}  {}: {}", host.name, host.score, joined.name, joined.score);
    }
}
