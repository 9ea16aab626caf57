//! Worker RPC transport
//!
//! - [`RpcTransport`]: handshake, request ids, concurrency cap, routing
//! - [`TurnHandle`]: caller side of one turn, with its event mailbox
//! - [`CompletionJoin`]: result/final-message join with a grace window

mod join;
mod state;
mod transport;
mod turn;

pub use join::{CompletionJoin, JoinStep};
pub use transport::RpcTransport;
pub use turn::{ChatTurn, CollectedTurn, TurnEvent, TurnHandle, TurnOutcome};
