//! # Session synchronization for lockstep multiplayer games
//!
//! Every peer of a lockstep game runs the same deterministic simulation and
//! only exchanges control input. This crate keeps the peers in agreement
//! about everything around that simulation: who is in the session, which
//! phase the session is in and at which control tick every peer switches
//! phase, which resources each peer must hold before it can simulate, and
//! the governance decisions (votes, ready checks, the lobby countdown) that
//! steer the session.
//!
//! ## Architecture
//!
//! One peer hosts. Clients connect to the host and the host relays between
//! clients, so every decision is sequenced by a single peer.
//!
//! The [`coordinator::SessionCoordinator`] is synchronous and sans-IO. It
//! talks to the network through the [`transport::Transport`] seam and to
//! the simulation through [`replication::ReplicationEngine`]. A driver calls
//! `pump` whenever packets may have arrived, `execute` about once per
//! second, and drains [`coordinator::SessionEvent`]s for the user interface.
//!
//! ## Status barrier
//!
//! A phase change is announced by the host with a target control tick.
//! Each peer halts at that tick, acknowledges it, and the host broadcasts
//! the final acknowledgement once everyone has arrived. Acks proposing a
//! later tick move the whole barrier forward.
//!
//! ## Module Organization
//!
//! - `client_registry`: session membership and per-client barrier state
//! - `status`: the barrier itself and its diagnostics
//! - `resource`: chunked, hashed resource distribution
//! - `vote`, `ready_check`, `countdown`: governance state machines
//! - `league`: non-blocking league and master-server reporting
//! - `streaming`: compressed live upload of the session record
//! - `network`: UDP transport over tokio tasks
//! - `memory`: in-process transport for tests and local play
//! - `reliable`: acknowledged, ordered delivery shared by both transports
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use session::config::SessionConfig;
//! use session::coordinator::SessionCoordinator;
//! use session::network::UdpTransport;
//! use session::replication::ImmediateControl;
//! use shared::ClientCore;
//! use std::time::Instant;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = UdpTransport::bind("0.0.0.0:8080").await?;
//!     let mut session = SessionCoordinator::new(
//!         SessionConfig::default(),
//!         ClientCore::new("host"),
//!         transport,
//!         ImmediateControl::new(),
//!     );
//!     session.host_session(true, Instant::now())?;
//!     session.execute(Instant::now());
//!     for event in session.drain_events() {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod client_registry;
pub mod config;
pub mod coordinator;
pub mod countdown;
pub mod error;
pub mod league;
pub mod memory;
pub mod network;
pub mod reliable;
pub mod ready_check;
pub mod replication;
pub mod resource;
pub mod status;
pub mod streaming;
pub mod transport;
pub mod vote;

pub use config::SessionConfig;
pub use coordinator::{JoinOutcome, JoinPoll, Role, SessionCoordinator, SessionEvent, Teardown};
pub use error::SessionError;
