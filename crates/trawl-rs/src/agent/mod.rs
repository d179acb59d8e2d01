//! Agent runtime: the research loop and its supporting modules.
//!
//! - [`researcher::Researcher`] — the top-level state machine. Start here.
//! - [`dispatch`] — one handler per action variant (search, visit, reflect,
//!   coding) plus answer-reference enrichment.
//! - [`state`] — the mutable session state every handler operates on.

pub mod dispatch;
pub mod researcher;
pub mod state;

pub use researcher::{Researcher, ResearcherOptions, ResearchOutcome};
pub use state::{AgentState, GateVector};
