pub mod turn_archive;
pub mod utils;

pub use turn_archive::{InMemoryTurnArchiveRepository, PgTurnArchiveRepository, TurnArchiveRepository};
