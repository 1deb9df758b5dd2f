//! Lottery coordination service for a fixed set of betting agencies.
//!
//! Agencies connect over TCP, submit their bets in batches, and signal when
//! they are done; once every agency has finished, the draw settles and each
//! one is answered with the documents of its own winning bets. The crate
//! splits along those seams:
//!
//! - [`cli`] declares the command-line surface of the server and client
//!   modes.
//! - [`bet`] defines the wagering record both sides share and its
//!   bet-string form.
//! - [`protocol`] reads and writes the two-line header/body wire messages.
//! - [`store`] owns the append-only bet log behind one exclusive lock.
//! - [`draw`] holds the all-agencies rendezvous that settles the draw.
//! - [`server`] accepts connections and drives the per-agency session.
//! - [`client`] streams an agency's bet file in and prints its winners.
//!
//! The binary stays a thin shell over these modules, and the test suites
//! link against the library to drive sessions and frames directly.

pub mod bet;
pub mod cli;
pub mod client;
pub mod draw;
pub mod protocol;
pub mod server;
pub mod store;
