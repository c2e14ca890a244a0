use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use bytes::{Buf, BufMut};
use clap::Parser;
use clap_derive::Parser;
use padlink::application::{ApplicationRouter, MessageContext, NetworkApplication};
use padlink::buf::BufExt;
use padlink::config::NetworkMetrics;
use padlink::connection::{ConnectionRecord, PeerId};
use padlink::control_messages::{DestinationCode, LeaveReason};
use padlink::engine::{Engine, Reliability};
use padlink::error::{EndReason, NetworkError};
use padlink::routing::Destination;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::Instant;
use tracing::{info, Level};

const GAMEPAD_STATE: u16 = 0x100;
const BUTTON_EVENT: u16 = 0x101;

#[derive(Parser)]
struct Args {
    bind_address: String,

    /// run as a client of this server; runs as a server if omitted
    #[clap(long)]
    server: Option<String>,

    #[clap(long, default_value = "node")]
    name: String,

    /// interval between gamepad state updates
    #[clap(long, default_value_t = 100)]
    tick_millis: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

/// simulated input device
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
struct GamepadState {
    buttons: u16,
    left_stick: (i16, i16),
    right_stick: (i16, i16),
}

impl GamepadState {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.buttons);
        buf.put_i16(self.left_stick.0);
        buf.put_i16(self.left_stick.1);
        buf.put_i16(self.right_stick.0);
        buf.put_i16(self.right_stick.1);
    }

    fn deser(buf: &mut &[u8]) -> anyhow::Result<GamepadState> {
        if buf.remaining() < 10 {
            bail!("gamepad state needs 10 bytes, got {}", buf.remaining());
        }
        Ok(GamepadState {
            buttons: buf.get_u16(),
            left_stick: (buf.get_i16(), buf.get_i16()),
            right_stick: (buf.get_i16(), buf.get_i16()),
        })
    }

    /// moves the sticks in circles and presses a different button every couple of ticks
    fn simulate(tick: u64) -> GamepadState {
        let angle = tick as f64 / 10.0;
        let x = (angle.cos() * i16::MAX as f64) as i16;
        let y = (angle.sin() * i16::MAX as f64) as i16;
        GamepadState {
            buttons: 1 << ((tick / 20) % 16),
            left_stick: (x, y),
            right_stick: (y, x),
        }
    }
}

struct InputSyncApp {
    router: ApplicationRouter,
}

impl InputSyncApp {
    fn new() -> anyhow::Result<InputSyncApp> {
        let mut router = ApplicationRouter::new();
        router.register(GAMEPAD_STATE, |_engine: &mut Engine, ctx: &MessageContext, body: &mut &[u8]| {
            let state = GamepadState::deser(body)?;
            info!("gamepad state from {:?}: {:?}", ctx.sender, state);
            Ok(())
        })?;
        router.register(BUTTON_EVENT, |_engine: &mut Engine, ctx: &MessageContext, body: &mut &[u8]| {
            let buttons = body.try_read_u16()?;
            info!("buttons changed on {:?}: {:016b}", ctx.sender, buttons);
            Ok(())
        })?;
        Ok(InputSyncApp { router })
    }
}

impl NetworkApplication for InputSyncApp {
    fn on_network_connected(&mut self, engine: &mut Engine) {
        info!("connected as {:?}", engine.name());
    }

    fn on_network_client_connected(&mut self, engine: &mut Engine, peer: PeerId) {
        let name = engine.peer(peer).map(|r| r.name().to_string()).unwrap_or_default();
        info!("{:?} ({}) joined", peer, name);
    }

    fn on_network_client_timed_out(&mut self, _engine: &mut Engine, peer: PeerId, record: &ConnectionRecord) {
        info!("{:?} ({}) timed out", peer, record.name());
    }

    fn on_network_client_disconnected(&mut self, _engine: &mut Engine, peer: PeerId, record: &ConnectionRecord, reason: LeaveReason) {
        info!("{:?} ({}) left: {:?}", peer, record.name(), reason);
    }

    fn on_network_closed(&mut self, _engine: &mut Engine, reason: EndReason) {
        info!("network closed: {:?}", reason);
    }

    fn parse_application_message(&mut self, engine: &mut Engine, ctx: &MessageContext, body: &mut &[u8]) -> bool {
        self.router.dispatch(engine, ctx, body)
    }
}

enum LoopEvent {
    Interrupted,
    Polled(Result<(), NetworkError>),
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let bind_address: SocketAddr = args.bind_address.parse()?;
    let socket = Box::new(UdpSocket::bind(bind_address).await?);
    let metrics = Arc::new(NetworkMetrics::default());

    let mut engine = match &args.server {
        Some(server) => Engine::client(socket, server.parse()?, args.name.clone(), metrics)?,
        None => Engine::server(socket, args.name.clone(), metrics)?,
    };
    let mut app = InputSyncApp::new()?;

    let tick_interval = Duration::from_millis(args.tick_millis);
    let mut last_tick = Instant::now();
    let mut tick = 0u64;
    let mut previous = GamepadState::default();
    let mut interrupted = false;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let event = select! {
            _ = &mut ctrl_c, if !interrupted => LoopEvent::Interrupted,
            result = engine.poll(&mut app) => LoopEvent::Polled(result),
        };

        match event {
            LoopEvent::Interrupted => {
                interrupted = true;
                if engine.is_server() {
                    engine.close();
                }
                else {
                    engine.disconnect(LeaveReason::Quit)?;
                }
                continue;
            }
            LoopEvent::Polled(Ok(())) => {}
            LoopEvent::Polled(Err(NetworkError::Ended { reason })) => {
                info!("session ended: {:?}", reason);
                return Ok(());
            }
            LoopEvent::Polled(Err(e)) => return Err(e.into()),
        }

        if interrupted || last_tick.elapsed() < tick_interval {
            continue;
        }
        last_tick = Instant::now();
        tick += 1;

        let state = GamepadState::simulate(tick);
        let mut datagram = engine.datagram(Destination::Code(DestinationCode::All))?;
        datagram.write_message(GAMEPAD_STATE, Reliability::Unreliable, |buf| state.ser(buf))?;
        if state.buttons != previous.buttons {
            datagram.write_message(BUTTON_EVENT, Reliability::Reliable, |buf| buf.put_u16(state.buttons))?;
        }
        datagram.send()?;
        previous = state;
    }
}
