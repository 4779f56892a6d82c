use std::sync::Arc;

use dots_and_boxes::{
    BoardSize, GameProgress, GameState, GreedyPlayer, MemoryNetwork, Player, Role, Session, SessionConfig,
    SessionEvent,
};
use rand::{rngs::SmallRng, SeedableRng};
use serde_json::json;
use tokio::time::{timeout, Duration};

async fn run_player<P: Player>(
    mut session: Session,
    mut player: P,
    size: BoardSize,
) -> anyhow::Result<(Session, u32)> {
    let mut claims = 0;
    while let Some(event) = session.next_event().await {
        match event {
            SessionEvent::Progress(GameProgress::AwaitingPlayers) => {
                session
                    .submit_player(player.name(), Some(size))
                    .map_err(|e| anyhow::anyhow!(e))?;
            }
            SessionEvent::Progress(GameProgress::Finished) => return Ok((session, claims)),
            SessionEvent::StateChanged if session.is_my_turn() => {
                let line = player
                    .choose_line(session.state())
                    .ok_or_else(|| anyhow::anyhow!("no free line on my turn"))?;
                session.claim_line(line).map_err(|e| anyhow::anyhow!(e))?;
                claims += 1;
            }
            SessionEvent::Desync(reason) => return Err(anyhow::anyhow!("state desync: {}", reason)),
            _ => {}
        }
    }
    Err(anyhow::anyhow!("session ended before the game finished"))
}

fn summary(state: &GameState, role: Role, claims: u32) -> serde_json::Value {
    let player = state.players.get(role);
    json!({
        "name": player.map(|p| p.name.clone()),
        "score": state.score(role),
        "claims": claims,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 && args.len() != 4 {
        eprintln!("Usage: {} <seed1> <seed2> [small|medium|large|huge]", args[0]);
        std::process::exit(1);
    }
    let seed1: u64 = args[1].parse()?;
    let seed2: u64 = args[2].parse()?;
    let size = match args.get(3) {
        Some(name) => BoardSize::parse(name).ok_or_else(|| anyhow::anyhow!("unknown board size {}", name))?,
        None => BoardSize::Small,
    };

    let network = MemoryNetwork::new();
    let config = SessionConfig::default();
    let host = Session::start(Arc::new(network.register_random()), &config);
    let joined = Session::start(Arc::new(network.register_random()), &config);
    joined.connect(host.peer_id().as_str());

    let p1 = GreedyPlayer::new("Host", SmallRng::seed_from_u64(seed1));
    let p2 = GreedyPlayer::new("Joined", SmallRng::seed_from_u64(seed2));

    let ((host, host_claims), (joined, joined_claims)) = timeout(
        Duration::from_secs(30),
        async { tokio::try_join!(run_player(host, p1, size), run_player(joined, p2, size)) },
    )
    .await
    .map_err(|_| anyhow::anyhow!("simulation timed out"))??;

    let state = host.state();
    let winner = match host.outcome().and_then(|o| o.winner()) {
        Some(role) => role.to_string(),
        None => "draw".to_string(),
    };

    let result = json!({
        "size": size,
        "moves": state.move_count(),
        "host": summary(state, Role::Host, host_claims),
        "joined": summary(state, Role::Joined, joined_claims),
        "winner": winner,
        "converged": host.state() == joined.state(),
    });

    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}
