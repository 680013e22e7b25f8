//! Dial a local listener repeatedly and watch cached sessions skip key agreement.
//!
//! A listener and a dialer run in the same process, each with its own [LinkManager] and
//! [SessionRegistry]. The dialer connects `--rounds` times, sends a message on every link and
//! waits for the echo. Only the first link runs a full handshake: every later link resumes the
//! session cached by the first (until `--lifetime` elapses).
//!
//! # Usage
//!
//! ```sh
//! cargo run --release --bin loopback -- --rounds 5 --lifetime 60
//! ```

use clap::{value_parser, Arg, ArgAction, Command};
use commonware_link::{Authentity, Config, LinkManager, SessionRegistry};
use commonware_runtime::{
    tokio, Listener as _, Metrics as _, Network as _, Runner as _, Spawner as _,
};
use rand::{rngs::OsRng, RngCore};
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tracing::{error, info, Level};

/// Unique namespace to avoid message replay attacks.
const APPLICATION_NAMESPACE: &[u8] = b"_COMMONWARE_LINK_LOOPBACK";

/// Size of the message echoed on every link.
const MESSAGE_SIZE: usize = 32;

fn main() {
    // Parse arguments
    let matches = Command::new("commonware-link-loopback")
        .about("dial a local listener and resume cached sessions")
        .arg(
            Arg::new("port")
                .long("port")
                .required(false)
                .default_value("3030")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("rounds")
                .long("rounds")
                .required(false)
                .default_value("3")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("lifetime")
                .long("lifetime")
                .required(false)
                .help("seconds a session may be resumed")
                .default_value("1800")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("unsafe-resume")
                .long("unsafe-resume")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag("verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_line_number(true)
        .with_file(true)
        .init();

    let port = *matches.get_one::<u16>("port").expect("port has a default");
    let rounds = *matches.get_one::<u32>("rounds").expect("rounds has a default");
    let lifetime = *matches
        .get_one::<u64>("lifetime")
        .expect("lifetime has a default");
    let mut config = Config::recommended(APPLICATION_NAMESPACE);
    config.token_lifetime = Duration::from_secs(lifetime);
    config.safe_resume = !matches.get_flag("unsafe-resume");
    info!(port, rounds, lifetime, safe_resume = config.safe_resume, "loaded config");

    // Start runtime
    let executor = tokio::Runner::default();
    executor.start(|context| async move {
        // Create managers
        let dialer_registry = SessionRegistry::new(context.with_label("dialer"), &config);
        let listener_registry = SessionRegistry::new(context.with_label("listener"), &config);
        let dialer = LinkManager::new(config.clone(), Arc::new(dialer_registry));
        let listener = Arc::new(LinkManager::new(config, Arc::new(listener_registry)));
        let dialer_identity = Authentity::new(&mut OsRng);
        let listener_identity = Arc::new(Authentity::new(&mut OsRng));
        info!(dialer = %dialer_identity.identity(), listener = %listener_identity.identity(), "generated identities");

        // Start listener
        let address = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port);
        let mut socket = context
            .bind(address)
            .await
            .expect("failed to bind listener");
        info!(%address, "listening");
        context.with_label("server").spawn({
            let listener = listener.clone();
            let listener_identity = listener_identity.clone();
            move |context| async move {
                loop {
                    let (remote, sink, stream) = match socket.accept().await {
                        Ok(connection) => connection,
                        Err(err) => {
                            error!(?err, "failed to accept connection");
                            continue;
                        }
                    };
                    let listener = listener.clone();
                    let local = listener_identity.clone();
                    context.with_label("link").spawn(move |_| async move {
                        let link = listener.link(sink, stream);
                        let mut channel =
                            match listener.accept_incoming(&mut OsRng, &local, link).await {
                                Ok(channel) => channel,
                                Err(err) => {
                                    error!(?err, %remote, "failed to accept link");
                                    return;
                                }
                            };
                        info!(peer = %channel.peer(), %remote, "accepted link");
                        let mut msg = [0u8; MESSAGE_SIZE];
                        if let Err(err) = channel.recv(&mut msg).await {
                            error!(?err, "failed to receive message");
                            return;
                        }
                        if let Err(err) = channel.send(&msg).await {
                            error!(?err, "failed to echo message");
                        }
                    });
                }
            }
        });

        // Dial the listener
        for round in 0..rounds {
            let before = dialer.metrics().resumes.get();
            let (sink, stream) = match context.dial(address).await {
                Ok(connection) => connection,
                Err(err) => {
                    error!(?err, round, "failed to connect");
                    continue;
                }
            };
            let link = dialer.link(sink, stream);
            let mut channel = match dialer
                .create_outgoing(
                    &mut OsRng,
                    &dialer_identity,
                    listener_identity.identity(),
                    link,
                )
                .await
            {
                Ok(channel) => channel,
                Err(err) => {
                    error!(?err, round, "failed to create link");
                    continue;
                }
            };
            let resumed = dialer.metrics().resumes.get() > before;

            let mut msg = [0u8; MESSAGE_SIZE];
            OsRng.fill_bytes(&mut msg);
            let mut echo = [0u8; MESSAGE_SIZE];
            let result = async {
                channel.send(&msg).await?;
                channel.recv(&mut echo).await
            }
            .await;
            match result {
                Ok(()) if echo == msg => info!(round, resumed, "received echo"),
                Ok(()) => error!(round, resumed, "echo did not match"),
                Err(err) => error!(?err, round, resumed, "failed to exchange message"),
            }
            channel.close();
        }

        // Report metrics
        println!("{}", context.encode());
    });
}
