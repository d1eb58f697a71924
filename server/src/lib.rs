//! # Game Server Library
//!
//! Authoritative backend for the persistent space-trading game. Many
//! independent clients issue concurrent actions — move, trade, fight, pay —
//! against shared entities held in the persistence gateway. Request
//! handlers are stateless: every operation loads a fresh snapshot, computes
//! the next state, and commits it with a conditional update, so all
//! concurrency hazards live in the store rather than in process memory.
//!
//! ## Core Responsibilities
//!
//! ### Combat Resolution (`combat`)
//! Owns the encounter state machine: action intake with per-round
//! readiness, synchronous resolution when a round completes or its
//! deadline passes, toll payment against garrison registries, and the
//! encounter-creation path that engages arriving ships.
//!
//! ### Trading (`trading`)
//! Validates trades against ship and port snapshots, prices them through
//! the shared curves, and commits with compare-and-swap on the port row
//! version — bounded retries with jittered exponential backoff, then a
//! compensated ship commit.
//!
//! ### Movement (`movement`)
//! The two-phase hyperspace transition: a predicate-guarded departure that
//! at most one concurrent request can win, an unlocked transit wait, and
//! an unconditional arrival that may hand the ship straight to the combat
//! engine.
//!
//! ## Architecture Design
//!
//! ### Conditional updates over locks
//! Handlers never hold a lock across a request. The gateway's
//! `update_if_version` / `update_if` primitives make every commit a
//! single atomic step; a zero-row outcome tells the caller a concurrent
//! writer won and the engines decide whether to retry (trading) or
//! surface the conflict (combat, movement).
//!
//! ### Compensated sagas over transactions
//! Cross-entity effects (port then ship, toll then encounter) are
//! two-step commits with explicit best-effort compensation on the second
//! step's failure. Compensation failures are logged and never retried in
//! a loop.
//!
//! ### Background sweeps
//! A periodic sweeper force-resolves combat rounds whose deadline passed
//! with missing actions and finalizes hyperspace transits whose arrival
//! task died with its process.
//!
//! ## Module Organization
//!
//! - `gateway` — versioned entity tables with conditional updates
//! - `events` — scoped event bus consumed by the network layer
//! - `access` — authorization and rate-limit gates, applied pre-engine
//! - `map` — sector adjacency collaborator
//! - `retry` — bounded backoff with an injectable jitter source
//! - `combat`, `trading`, `movement` — the three engines
//! - `directory` — connected character sessions
//! - `network` — UDP transport, request dispatch, event routing

pub mod access;
pub mod combat;
pub mod directory;
pub mod events;
pub mod gateway;
pub mod map;
pub mod movement;
pub mod network;
pub mod retry;
pub mod trading;
pub mod util;
