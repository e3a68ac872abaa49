use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use tracing::{debug, info, warn};

use nearby_bridge::{
    AdvertiserEvent, BridgeConfig, BrowserEvent, Dispatcher, Environment, LoopbackNetwork,
    PeerIdentity, PeerState, SendMode, ServiceDescriptor, Session, SessionEvent,
};

#[derive(Parser)]
#[clap(name = "mpc-demo")]
#[clap(about = "Two in-process devices discover each other, connect and exchange a message")]
struct Args {
    /// Service type both devices advertise and browse for
    #[clap(long, default_value = "mpc-demo")]
    service_type: String,

    /// Display name of the advertising device
    #[clap(long, default_value = "host")]
    host_name: String,

    /// Display name of the browsing device
    #[clap(long, default_value = "guest")]
    guest_name: String,

    /// Message the guest sends once connected
    #[clap(long, default_value = "hello from the guest")]
    message: String,

    /// Seconds to wait before giving up
    #[clap(long, default_value = "5")]
    timeout: u64,

    /// Enable verbose logging
    #[clap(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Device {
    Host,
    Guest,
}

#[derive(Debug)]
enum Action {
    Advertiser(AdvertiserEvent),
    Browser(BrowserEvent),
    Session(Device, SessionEvent),
}

struct State {
    env: Environment<Device>,
    host_session: Option<Session>,
    invited: bool,
    message: Bytes,
}

enum Flow {
    Continue,
    Done(Bytes),
}

impl State {
    fn reduce(&mut self, action: Action) -> Result<Flow> {
        match action {
            Action::Advertiser(AdvertiserEvent::InvitationReceived(from, context, responder)) => {
                info!(%from, context = ?context, "invitation received");
                // Created may still be queued behind the invitation.
                let session = self
                    .host_session
                    .clone()
                    .or_else(|| self.env.session.session(&Device::Host));
                match session {
                    Some(session) => responder.accept(&session)?,
                    None => responder.decline()?,
                }
            }
            Action::Advertiser(AdvertiserEvent::FailedToStart(error))
            | Action::Browser(BrowserEvent::FailedToStart(error)) => {
                warn!(%error, "service failed to start");
            }
            Action::Advertiser(AdvertiserEvent::CreationFailed(error))
            | Action::Browser(BrowserEvent::CreationFailed(error)) => bail!(error),
            Action::Browser(BrowserEvent::FoundPeer(peer, info)) => {
                info!(%peer, ?info, "found peer");
                if !self.invited {
                    self.invited = true;
                    self.env.invite_peer_default(
                        &Device::Guest,
                        &peer,
                        &Device::Guest,
                        Some(Bytes::from_static(b"join me")),
                    );
                }
            }
            Action::Browser(BrowserEvent::LostPeer(peer)) => info!(%peer, "lost peer"),
            Action::Session(device, SessionEvent::Created(session)) => {
                debug!(?device, session = session.id(), "session ready");
                if device == Device::Host {
                    self.host_session = Some(session);
                }
            }
            Action::Session(device, SessionEvent::PeerStateChanged(peer, state)) => {
                info!(?device, %peer, ?state, "peer state changed");
                if device == Device::Guest && state == PeerState::Connected {
                    self.env.session.send(
                        &Device::Guest,
                        self.message.clone(),
                        &[peer],
                        SendMode::Reliable,
                    );
                }
            }
            Action::Session(Device::Host, SessionEvent::DataReceived(from, data)) => {
                info!(%from, bytes = data.len(), "message received");
                return Ok(Flow::Done(data));
            }
            Action::Session(_, SessionEvent::CreationFailed(error)) => bail!(error),
            Action::Session(device, other) => debug!(?device, event = ?other, "ignored"),
        }
        Ok(Flow::Continue)
    }
}

async fn run(dispatcher: &mut Dispatcher<Action>, state: &mut State) -> Result<Bytes> {
    while let Some(action) = dispatcher.next_action().await {
        if let Flow::Done(data) = state.reduce(action)? {
            return Ok(data);
        }
    }
    bail!("dispatcher closed")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .init();

    let host = PeerIdentity::new(args.host_name.clone())?;
    let guest = PeerIdentity::new(args.guest_name.clone())?;
    let host_descriptor =
        ServiceDescriptor::host_derived(&args.service_type, &args.host_name, "dev")?;
    let guest_descriptor =
        ServiceDescriptor::host_derived(&args.service_type, &args.guest_name, "dev")?;

    let network = LoopbackNetwork::new();
    let env: Environment<Device> = Environment::new(Arc::new(network), BridgeConfig::default());

    let mut dispatcher = Dispatcher::new();
    dispatcher.subscribe(env.session.create(Device::Host, host.clone()), |e| {
        Action::Session(Device::Host, e)
    });
    dispatcher.subscribe(env.session.create(Device::Guest, guest.clone()), |e| {
        Action::Session(Device::Guest, e)
    });
    dispatcher.subscribe(
        env.advertiser.create(Device::Host, host, host_descriptor),
        Action::Advertiser,
    );
    dispatcher.subscribe(
        env.browser.create(Device::Guest, guest, guest_descriptor),
        Action::Browser,
    );
    env.advertiser.start_advertising(&Device::Host);
    env.browser.start_browsing(&Device::Guest);

    let mut state = State {
        env: env.clone(),
        host_session: None,
        invited: false,
        message: Bytes::from(args.message.into_bytes()),
    };

    let received = tokio::time::timeout(
        Duration::from_secs(args.timeout),
        run(&mut dispatcher, &mut state),
    )
    .await
    .context("devices did not connect in time")??;

    info!(message = %String::from_utf8_lossy(&received), "exchange complete");
    env.advertiser.stop_advertising(&Device::Host);
    env.browser.stop_browsing(&Device::Guest);
    Ok(())
}
