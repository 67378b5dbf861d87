use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use cardlink_p2p::game::{Action, CardGame, Colour, GameState, Seat};
use cardlink_p2p::{
    crypto, ControlSignal, Event, EventBus, HandshakeError, HostHandshake, HostReplicator,
    JoinHandshake, JoinerReplicator, LinkEventKind, Member, PeerIdentity, Received, RoomManager,
    UdpConfig, UdpTransport,
};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "cardlink", version, about = "Host or join a local card game without a server")]
struct Cli {
    /// Name shown to the other players.
    #[arg(long, env = "CARDLINK_NAME", default_value = "Player", global = true)]
    name: String,

    /// Local address to bind sockets on.
    #[arg(long, env = "CARDLINK_BIND", default_value = "0.0.0.0", global = true)]
    bind: IpAddr,

    /// Addresses to advertise instead of the detected LAN address.
    #[arg(long, env = "CARDLINK_ADVERTISE", value_delimiter = ',', global = true)]
    advertise: Vec<IpAddr>,

    /// Seconds a new link may take to open before it is given up.
    #[arg(long, env = "CARDLINK_CONNECT_TIMEOUT_SECS", default_value_t = 120, global = true)]
    connect_timeout_secs: u64,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Open a room and hand out invitations.
    Host {
        /// Joiners the room accepts besides the host.
        #[arg(long, env = "CARDLINK_CAPACITY", default_value_t = 3)]
        capacity: usize,

        /// Shuffle seed, random when omitted.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Join a room with an invitation token.
    Join {
        /// Only accept invitations for this room tag.
        #[arg(long, env = "CARDLINK_ROOM")]
        room: Option<String>,

        /// Invitation token; read from stdin when omitted.
        token: Option<String>,
    },
}

/// One line typed at the prompt.
#[derive(Debug, PartialEq)]
enum Input {
    Token(String),
    Start,
    Play { index: usize, colour: Option<Colour> },
    Draw,
    Status,
    Help,
    Quit,
}

fn parse_input(line: &str) -> Result<Option<Input>, String> {
    let mut words = line.split_whitespace();
    let Some(first) = words.next() else {
        return Ok(None);
    };
    let input = match first.to_ascii_lowercase().as_str() {
        "start" => Input::Start,
        "draw" | "d" => Input::Draw,
        "status" | "s" => Input::Status,
        "help" | "?" => Input::Help,
        "quit" | "exit" | "q" => Input::Quit,
        "play" | "p" => {
            let index = words
                .next()
                .ok_or("usage: play <card> [colour]")?
                .parse::<usize>()
                .map_err(|_| "card must be a number from your hand".to_string())?;
            let colour = words.next().map(str::parse::<Colour>).transpose()?;
            Input::Play { index, colour }
        }
        _ => Input::Token(line.trim().to_string()),
    };
    Ok(Some(input))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cardlink=info,cardlink_p2p=info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let transport = UdpTransport::new(UdpConfig {
        bind_ip: cli.bind,
        port: 0,
        advertise: cli.advertise.clone(),
    });
    let identity = PeerIdentity::generate(&cli.name)?;
    info!(id = %identity.id, name = %identity.display_name, "identity created");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let timeout = Duration::from_secs(cli.connect_timeout_secs);
    match cli.command {
        Mode::Host { capacity, seed } => {
            host(transport, identity, capacity, seed, timeout, &mut stdin).await
        }
        Mode::Join { room, token } => {
            join(transport, identity, room, timeout, token, &mut stdin).await
        }
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

async fn host(
    transport: UdpTransport,
    identity: PeerIdentity,
    capacity: usize,
    seed: Option<u64>,
    connect_timeout: Duration,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> anyhow::Result<()> {
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let (link_tx, mut link_events) = mpsc::unbounded_channel();

    let handshake = HostHandshake::new(transport, identity.clone(), crypto::room_tag()?);
    let mut room = RoomManager::open(handshake, capacity, bus.clone(), link_tx).await?;
    let mut replicator = HostReplicator::new(CardGame, bus);
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    println!("Room {} is open. Paste answer tokens here; type `help` for commands.", room.tag());

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                let input = match parse_input(&line) {
                    Ok(Some(input)) => input,
                    Ok(None) => continue,
                    Err(e) => {
                        println!("{e}");
                        continue;
                    }
                };
                match input {
                    Input::Token(token) => match room.apply_joiner_answer(&token).await {
                        Ok(peer) => println!(
                            "{} joined ({}/{})",
                            peer.display_name,
                            room.len(),
                            room.capacity()
                        ),
                        Err(e) => println!("Answer not accepted: {e}"),
                    },
                    Input::Start => {
                        let host_seat = Seat::new(&identity.id, &identity.display_name);
                        let seats: Vec<Seat> = std::iter::once(host_seat)
                            .chain(
                                room.members()
                                    .iter()
                                    .map(|m| Seat::new(m.id(), &m.identity().display_name)),
                            )
                            .collect();
                        let state = GameState::deal(&seats, seed.unwrap_or_else(rand::random));
                        let seat_map = seats
                            .iter()
                            .enumerate()
                            .skip(1)
                            .map(|(i, s)| (s.id.clone(), i));
                        let links = room.members().iter().map(Member::link);
                        if let Err(e) = replicator.start_game(state, seat_map, links) {
                            println!("Could not start the game: {e}");
                            continue;
                        }
                        print_table(replicator.state(), 0);
                    }
                    Input::Play { index, colour } => {
                        let Some(turn) = replicator.state().map(|s| s.turn) else {
                            println!("No game yet, type `start`.");
                            continue;
                        };
                        let action = Action::Play { turn, card_index: index, colour };
                        let links = room.members().iter().map(Member::link);
                        if let Err(e) = replicator.apply_local(0, &action, links) {
                            println!("{e}");
                        }
                        print_table(replicator.state(), 0);
                    }
                    Input::Draw => {
                        let Some(turn) = replicator.state().map(|s| s.turn) else {
                            println!("No game yet, type `start`.");
                            continue;
                        };
                        let links = room.members().iter().map(Member::link);
                        if let Err(e) = replicator.apply_local(0, &Action::Draw { turn }, links) {
                            println!("{e}");
                        }
                        print_table(replicator.state(), 0);
                    }
                    Input::Status => {
                        let info = room.info();
                        println!(
                            "Room {}: {}/{} joined",
                            info.tag,
                            info.members.len(),
                            info.capacity
                        );
                        for member in room.members() {
                            println!(
                                "  {} ({:?}, since {})",
                                member.identity().display_name,
                                member.link().state(),
                                member.joined_at().format("%H:%M:%S")
                            );
                        }
                        match room.invitation() {
                            Some(invitation) => println!("Invitation:\n{}", invitation.token),
                            None => println!("Room is full."),
                        }
                        print_table(replicator.state(), 0);
                    }
                    Input::Help => print_help(true),
                    Input::Quit => break,
                }
            }
            Some(event) = link_events.recv() => {
                if !room.owns(&event) {
                    debug!(
                        peer = %event.peer_id,
                        link = event.link_id,
                        "event from a replaced link"
                    );
                    continue;
                }
                if let LinkEventKind::Message(bytes) = &event.kind {
                    let links = room.members().iter().map(Member::link);
                    match replicator.receive_action(&event.peer_id, bytes, links) {
                        Ok(_) => print_table(replicator.state(), 0),
                        Err(e) => {
                            debug!(peer = %event.peer_id, error = %e, "inbound envelope dropped")
                        }
                    }
                    continue;
                }
                if let Err(e) = room.handle_link_event(&event).await {
                    warn!(peer = %event.peer_id, error = %e, "link event not applied");
                }
                // A late opener has missed the last push.
                if event.kind == LinkEventKind::Open && replicator.state().is_some() {
                    if let Err(e) = replicator.broadcast(room.members().iter().map(Member::link)) {
                        warn!(error = %e, "snapshot not sent");
                    }
                }
            }
            _ = sweep.tick() => {
                if let Err(e) = room.expire_connecting(connect_timeout).await {
                    warn!(error = %e, "expiring stuck links failed");
                }
                room.ensure_invitation().await;
            }
            event = events.recv() => match event {
                Ok(event) => report(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event log lagging")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    room.close();
    info!("host shutting down");
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<Event>) {
    loop {
        match events.recv().await {
            Ok(event) => report(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event log lagging")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn report(event: &Event) {
    match event {
        Event::InvitationReady { room_tag, token } => {
            println!("\nInvitation for room {room_tag} ({} chars):\n{token}\n", token.len());
        }
        Event::InvitationCleared { room_tag } => info!(room = %room_tag, "invitation cleared"),
        Event::PeerJoined { display_name, .. } => info!(name = %display_name, "peer joined"),
        Event::PeerLeft { peer_id, .. } => info!(peer = %peer_id, "peer left"),
        Event::RoomFull { capacity, .. } => {
            println!("Room is full ({capacity} joiners). Type `start` to deal.")
        }
        Event::LinkOpened { peer_id } => info!(peer = %peer_id, "link open"),
        Event::LinkClosed { peer_id } => warn!(peer = %peer_id, "link closed"),
        Event::ConnectionTimeout { peer_id } => warn!(peer = ?peer_id, "connection timed out"),
        Event::DecodeError { reason } => {
            println!("That token could not be read ({reason}). Ask for a fresh one.")
        }
        Event::StaleAnswer { .. } => {
            println!("That answer is for an older invitation. Have them scan the current one.")
        }
        Event::GameStarted { players } => info!(players, "game started"),
        Event::ActionRejected { peer_id, reason } => {
            info!(peer = %peer_id, %reason, "action rejected")
        }
    }
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

async fn join(
    transport: UdpTransport,
    identity: PeerIdentity,
    room: Option<String>,
    timeout: Duration,
    token: Option<String>,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> anyhow::Result<()> {
    let bus = EventBus::default();
    tokio::spawn(log_events(bus.subscribe()));
    let mut handshake = JoinHandshake::new(transport, identity.clone()).with_events(bus);
    if let Some(room) = room {
        handshake = handshake.expect_room(room);
    }
    let (link_tx, mut link_events) = mpsc::unbounded_channel();

    let mut offer = token;
    let answer = loop {
        let token = match offer.take() {
            Some(token) => token,
            None => {
                println!("Paste the invitation token:");
                match stdin.next_line().await? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => line,
                    None => return Ok(()),
                }
            }
        };
        match handshake.accept_offer(token.trim(), link_tx.clone()).await {
            Ok(answer) => break answer,
            // Reported on the bus.
            Err(HandshakeError::Decode(_) | HandshakeError::Invalid(_)) => {}
            Err(e @ (HandshakeError::RoomTagMismatch { .. }
            | HandshakeError::TokenReplayed
            | HandshakeError::UnexpectedRole { .. })) => println!("{e}"),
            Err(e) => return Err(e).context("could not answer the invitation"),
        }
    };

    let host_name = handshake
        .host()
        .map(|h| h.display_name.clone())
        .unwrap_or_default();
    println!("\nGive this answer to {host_name}:\n{answer}\n");
    println!("Waiting up to {}s for the host...", timeout.as_secs());

    match handshake.wait_open(timeout).await {
        Ok(_) => println!("Connected to {host_name}."),
        Err(HandshakeError::ConnectionTimeout(waited)) => {
            bail!(
                "the host did not connect within {}s; ask for a fresh invitation",
                waited.as_secs()
            )
        }
        Err(e) => return Err(e).context("connection failed"),
    }
    let link = handshake
        .take_link()
        .context("link disappeared after opening")?;

    let mut replicator = JoinerReplicator::<GameState, Action>::new();
    let (control_tx, mut control) = mpsc::unbounded_channel();
    replicator.on_control(control_tx);

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                let input = match parse_input(&line) {
                    Ok(Some(input)) => input,
                    Ok(None) => continue,
                    Err(e) => {
                        println!("{e}");
                        continue;
                    }
                };
                let state = replicator.state();
                let seat = state.and_then(|s| s.seat_of(&identity.id));
                let action = match (input, state) {
                    (Input::Quit, _) => break,
                    (Input::Help, _) => {
                        print_help(false);
                        continue;
                    }
                    (Input::Status, state) => {
                        print_table(state, seat.unwrap_or(0));
                        continue;
                    }
                    (Input::Play { index, colour }, Some(state)) => Action::Play {
                        turn: state.turn,
                        card_index: index,
                        colour,
                    },
                    (Input::Draw, Some(state)) => Action::Draw { turn: state.turn },
                    (Input::Play { .. } | Input::Draw, None) => {
                        println!("The game has not started yet.");
                        continue;
                    }
                    (Input::Start | Input::Token(_), _) => {
                        println!("Only the host can do that.");
                        continue;
                    }
                };
                if let Err(e) = replicator.send_action(&link, &action) {
                    warn!(error = %e, "action not sent");
                }
            }
            Some(event) = link_events.recv() => match event.kind {
                LinkEventKind::Message(bytes) => match replicator.on_message(&bytes) {
                    Ok(Received::Snapshot) => {
                        let seat = replicator
                            .state()
                            .and_then(|s| s.seat_of(&identity.id))
                            .unwrap_or(0);
                        print_table(replicator.state(), seat);
                    }
                    Ok(Received::Control) => {}
                    Err(e) => debug!(error = %e, "envelope dropped"),
                },
                LinkEventKind::Closed => {
                    println!("The host closed the connection.");
                    break;
                }
                LinkEventKind::Open => {}
            },
            Some(signal) = control.recv() => {
                info!(tag = %signal.tag, "control signal");
                if signal.tag == ControlSignal::START {
                    println!("The game is starting.");
                }
            }
        }
    }

    link.close();
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_help(host: bool) {
    if host {
        println!("  <answer token>     add the player who sent it");
        println!("  start              deal and start the game");
    }
    println!("  play <n> [colour]  play card n from your hand");
    println!("  draw               draw a card and pass");
    println!("  status             show the table");
    println!("  quit               leave");
}

fn print_table(state: Option<&GameState>, seat: usize) {
    let Some(state) = state else {
        return;
    };
    if let Some(winner) = state.winner {
        println!("\n{} wins!", state.players[winner].name);
        return;
    }
    let top = state
        .top_card()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".into());
    println!("\nTurn {}: {} on top, {} in play", state.turn, top, state.active_colour);
    for (i, player) in state.players.iter().enumerate() {
        let marker = if i == state.current { '>' } else { ' ' };
        println!("{marker} {} ({} cards)", player.name, player.hand.len());
    }
    if let Some(me) = state.players.get(seat) {
        let hand: Vec<String> = me
            .hand
            .iter()
            .enumerate()
            .map(|(i, c)| format!("[{i}] {c}"))
            .collect();
        println!("Your hand: {}", hand.join("  "));
        if state.current == seat {
            println!("Your turn.");
        }
    }
}
